use super::retry::RetryPolicy;
use crate::error::EngineError;
use crate::models::{Bar, Direction, Quote, Symbol, Timeframe, Trade};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub balance: f64,
    pub equity: f64,
    pub timestamp: DateTime<Utc>,
}

/// Market order with attached protective levels
///
/// `client_id` is stable across retries so the endpoint can drop duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_id: Uuid,
    pub symbol: Symbol,
    pub direction: Direction,
    pub size: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub accepted: bool,
    pub ticket: Option<String>,
    pub fill_price: Option<f64>,
    #[serde(default)]
    pub filled_size: f64,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseRequest {
    pub trade_id: Uuid,
    pub ticket: Option<String>,
    pub symbol: Symbol,
    pub direction: Direction,
    pub size: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub price: f64,
    pub size: f64,
    pub timestamp: DateTime<Utc>,
}

/// Position the broker currently holds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub ticket: String,
    /// `OrderRequest::client_id` of the order that opened it, when the endpoint kept it
    #[serde(default)]
    pub client_id: Option<Uuid>,
    pub symbol: Symbol,
    pub direction: Direction,
    pub size: f64,
    pub entry_price: f64,
}

impl BrokerPosition {
    pub fn belongs_to(&self, trade: &Trade) -> bool {
        self.client_id == Some(trade.id) || trade.broker_ticket.as_deref() == Some(self.ticket.as_str())
    }
}

/// Source of bars and quotes
#[async_trait]
pub trait MarketData: Send + Sync {
    /// Most recent `count` bars, oldest first
    async fn fetch_bars(&self, symbol: Symbol, timeframe: Timeframe, count: usize)
        -> Result<Vec<Bar>>;

    async fn quote(&self, symbol: Symbol) -> Result<Quote>;
}

/// Order execution endpoint
#[async_trait]
pub trait OrderExecutor: Send + Sync {
    async fn account(&self) -> Result<AccountInfo>;

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderResult>;

    async fn close_trade(&self, request: &CloseRequest) -> Result<Fill>;

    async fn open_positions(&self) -> Result<Vec<BrokerPosition>>;

    /// Exit fill of a position the broker already closed on its own, e.g. a
    /// server-side stop. `None` while the position is open or unknown.
    async fn closed_fill(&self, request: &CloseRequest) -> Result<Option<Fill>>;
}

/// Every broker call the engine makes, each wrapped in the retry policy
#[derive(Clone)]
pub struct BrokerGateway {
    market: Arc<dyn MarketData>,
    executor: Arc<dyn OrderExecutor>,
    policy: RetryPolicy,
}

impl BrokerGateway {
    pub fn new(
        market: Arc<dyn MarketData>,
        executor: Arc<dyn OrderExecutor>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            market,
            executor,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn fetch_bars(
        &self,
        symbol: Symbol,
        timeframe: Timeframe,
        count: usize,
    ) -> std::result::Result<Vec<Bar>, EngineError> {
        let operation = format!("fetch_bars {} {}", symbol, timeframe);
        self.policy
            .execute(&operation, || self.market.fetch_bars(symbol, timeframe, count))
            .await
    }

    pub async fn quote(&self, symbol: Symbol) -> std::result::Result<Quote, EngineError> {
        let operation = format!("quote {}", symbol);
        self.policy
            .execute(&operation, || self.market.quote(symbol))
            .await
    }

    pub async fn account(&self) -> std::result::Result<AccountInfo, EngineError> {
        self.policy
            .execute("account", || self.executor.account())
            .await
    }

    pub async fn place_order(
        &self,
        order: &OrderRequest,
    ) -> std::result::Result<OrderResult, EngineError> {
        let operation = format!("place_order {}", order.symbol);
        self.policy
            .execute(&operation, || self.executor.place_order(order))
            .await
    }

    pub async fn close_trade(
        &self,
        request: &CloseRequest,
    ) -> std::result::Result<Fill, EngineError> {
        let operation = format!("close_trade {}", request.trade_id);
        self.policy
            .execute(&operation, || self.executor.close_trade(request))
            .await
    }

    pub async fn open_positions(&self) -> std::result::Result<Vec<BrokerPosition>, EngineError> {
        self.policy
            .execute("open_positions", || self.executor.open_positions())
            .await
    }

    pub async fn closed_fill(
        &self,
        request: &CloseRequest,
    ) -> std::result::Result<Option<Fill>, EngineError> {
        let operation = format!("closed_fill {}", request.trade_id);
        self.policy
            .execute(&operation, || self.executor.closed_fill(request))
            .await
    }
}
