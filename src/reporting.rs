use crate::models::Trade;
use crate::risk::{ChallengeConfig, RiskState};
use crate::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Challenge standing at the end of a trading day
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComplianceStatus {
    Compliant,
    DailyLossBreached,
    Halted,
    TargetReached,
}

impl ComplianceStatus {
    /// Worst condition wins: a halt outranks a daily breach, which outranks a passed target
    pub fn evaluate(state: &RiskState, config: &ChallengeConfig) -> Self {
        if state.is_halted()
            || state.total_drawdown_pct() >= config.max_total_drawdown_pct
            || state.loss_from_initial_pct() >= config.max_loss_from_initial_pct
        {
            ComplianceStatus::Halted
        } else if state.daily_loss_pct() >= config.max_daily_loss_pct
            || state.daily_trailing_drawdown_pct() >= config.max_daily_trailing_drawdown_pct
        {
            ComplianceStatus::DailyLossBreached
        } else if state.profit_pct() >= config.profit_target_pct {
            ComplianceStatus::TargetReached
        } else {
            ComplianceStatus::Compliant
        }
    }
}

/// End-of-day summary handed to the reporting sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySummary {
    pub date: NaiveDate,
    pub realized_pnl: f64,
    pub equity: f64,
    /// Fraction of peak equity
    pub drawdown_pct: f64,
    /// Fraction of start-of-day equity
    pub daily_loss_pct: f64,
    pub trade_count: u32,
    pub compliance_status: ComplianceStatus,
    pub profitable: bool,
    /// Distinct days with at least one trade, challenge to date
    pub trading_days: u32,
    pub profitable_days: u32,
}

/// Consumer of engine reports; rendering and storage are its business
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn daily_summary(&self, summary: &DailySummary) -> Result<()>;

    async fn trade_closed(&self, trade: &Trade) -> Result<()>;
}

/// Writes reports to the tracing log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReportSink;

#[async_trait]
impl ReportSink for LogReportSink {
    async fn daily_summary(&self, summary: &DailySummary) -> Result<()> {
        tracing::info!(
            "📊 {} | P&L {:.2} | equity {:.2} | DD {:.2}% | daily loss {:.2}% | {} trades | {:?} | days {} ({} profitable)",
            summary.date,
            summary.realized_pnl,
            summary.equity,
            summary.drawdown_pct * 100.0,
            summary.daily_loss_pct * 100.0,
            summary.trade_count,
            summary.compliance_status,
            summary.trading_days,
            summary.profitable_days
        );
        Ok(())
    }

    async fn trade_closed(&self, trade: &Trade) -> Result<()> {
        if let Some(exit) = &trade.exit {
            tracing::info!(
                trade_id = %trade.id,
                "📒 {} {} {} -> {} ({}): {:.2}",
                trade.direction,
                trade.symbol,
                trade.entry_price,
                exit.exit_price,
                exit.reason,
                exit.realized_pnl
            );
        }
        Ok(())
    }
}

/// Fans reports out to several sinks; one failing sink does not stop the others
#[derive(Default)]
pub struct ReportFanout {
    sinks: Vec<Box<dyn ReportSink>>,
}

impl ReportFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Box<dyn ReportSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl ReportSink for ReportFanout {
    async fn daily_summary(&self, summary: &DailySummary) -> Result<()> {
        for sink in &self.sinks {
            if let Err(e) = sink.daily_summary(summary).await {
                tracing::warn!("Report sink failed on daily summary: {}", e);
            }
        }
        Ok(())
    }

    async fn trade_closed(&self, trade: &Trade) -> Result<()> {
        for sink in &self.sinks {
            if let Err(e) = sink.trade_closed(trade).await {
                tracing::warn!("Report sink failed on trade {}: {}", trade.id, e);
            }
        }
        Ok(())
    }
}
