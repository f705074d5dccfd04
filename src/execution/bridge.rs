use super::broker::{
    AccountInfo, BrokerPosition, CloseRequest, Fill, MarketData, OrderExecutor, OrderRequest,
    OrderResult,
};
use crate::config::BrokerConfig;
use crate::models::{Bar, Quote, Symbol, Timeframe};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{Quota, RateLimiter};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::num::NonZeroU32;
use std::sync::Arc;

const API_KEY_HEADER: &str = "X-API-Key";

type BridgeRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

#[derive(Debug, Deserialize)]
struct BarDto {
    timestamp: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    volume: f64,
}

#[derive(Debug, Deserialize)]
struct QuoteDto {
    bid: f64,
    ask: f64,
    timestamp: DateTime<Utc>,
}

/// Client for the HTTP/JSON bridge in front of the trading terminal
///
/// Retries live in the gateway's `RetryPolicy`; this client makes exactly one
/// request per call. All clones share the rate limiter.
#[derive(Clone)]
pub struct BridgeClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    rate_limiter: Arc<BridgeRateLimiter>,
}

impl BridgeClient {
    pub fn new(config: &BrokerConfig) -> Self {
        let rpm = NonZeroU32::new(config.requests_per_minute.max(1)).unwrap_or(NonZeroU32::MIN);
        Self {
            client: Client::new(),
            base_url: config.bridge_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            rate_limiter: Arc::new(RateLimiter::direct(Quota::per_minute(rpm))),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn position_id(close: &CloseRequest) -> String {
        close
            .ticket
            .clone()
            .unwrap_or_else(|| close.trade_id.to_string())
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        self.send_optional(request)
            .await?
            .ok_or_else(|| "bridge returned 404 Not Found".into())
    }

    /// Like `send`, with 404 meaning "no such resource" rather than an error
    async fn send_optional<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<Option<T>> {
        self.rate_limiter.until_ready().await;

        let request = match &self.api_key {
            Some(key) => request.header(API_KEY_HEADER, key),
            None => request,
        };
        let response = request.send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("bridge returned {}: {}", status, body).into());
        }

        Ok(Some(response.json::<T>().await?))
    }
}

#[async_trait]
impl MarketData for BridgeClient {
    async fn fetch_bars(&self, symbol: Symbol, timeframe: Timeframe, count: usize) -> Result<Vec<Bar>> {
        let request = self.client.get(self.url("/bars")).query(&[
            ("symbol", symbol.as_str().to_string()),
            ("timeframe", timeframe.as_str().to_string()),
            ("count", count.to_string()),
        ]);
        let mut raw: Vec<BarDto> = self.send(request).await?;
        raw.sort_by_key(|b| b.timestamp);

        tracing::debug!("Fetched {} {} bars for {}", raw.len(), timeframe, symbol);

        Ok(raw
            .into_iter()
            .map(|b| Bar {
                symbol,
                timeframe,
                timestamp: b.timestamp,
                open: b.open,
                high: b.high,
                low: b.low,
                close: b.close,
                volume: b.volume,
            })
            .collect())
    }

    async fn quote(&self, symbol: Symbol) -> Result<Quote> {
        let request = self
            .client
            .get(self.url("/quote"))
            .query(&[("symbol", symbol.as_str())]);
        let raw: QuoteDto = self.send(request).await?;

        if raw.bid <= 0.0 || raw.ask < raw.bid {
            return Err(format!("invalid quote for {}: bid {} ask {}", symbol, raw.bid, raw.ask).into());
        }

        Ok(Quote {
            symbol,
            bid: raw.bid,
            ask: raw.ask,
            timestamp: raw.timestamp,
        })
    }
}

#[async_trait]
impl OrderExecutor for BridgeClient {
    async fn account(&self) -> Result<AccountInfo> {
        self.send(self.client.get(self.url("/account"))).await
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderResult> {
        let request = self.client.post(self.url("/orders")).json(order);
        self.send(request).await
    }

    async fn close_trade(&self, close: &CloseRequest) -> Result<Fill> {
        let id = Self::position_id(close);
        let request = self
            .client
            .post(self.url(&format!("/positions/{}/close", id)))
            .json(close);
        self.send(request).await
    }

    async fn open_positions(&self) -> Result<Vec<BrokerPosition>> {
        self.send(self.client.get(self.url("/positions"))).await
    }

    async fn closed_fill(&self, close: &CloseRequest) -> Result<Option<Fill>> {
        let id = Self::position_id(close);
        let request = self.client.get(self.url(&format!("/positions/{}/fill", id)));
        self.send_optional(request).await
    }
}
