use crate::models::Trade;
use crate::reporting::{DailySummary, ReportSink};
use crate::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};

/// Postgres journal of closed trades and daily summaries
pub struct PostgresJournal {
    pool: PgPool,
}

/// Store prices and P&L as NUMERIC; f64 never touches the column
fn decimal(value: f64) -> Result<Decimal> {
    Ok(Decimal::try_from(value)?)
}

fn to_f64(value: Decimal) -> Result<f64> {
    Ok(value.to_string().parse()?)
}

impl PostgresJournal {
    /// Connect to Postgres and run pending migrations
    ///
    /// # Arguments
    /// * `database_url` - Postgres connection URL
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        // Run migrations
        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres journal");

        Ok(Self { pool })
    }

    /// Upsert a closed trade; open trades are ignored
    pub async fn save_trade(&self, trade: &Trade) -> Result<()> {
        let Some(exit) = &trade.exit else {
            return Ok(());
        };

        sqlx::query(
            r#"
            INSERT INTO trades (
                id, symbol, direction, size, entry_price, stop_loss, take_profit,
                risk_amount, opened_at, exit_price, closed_at, close_reason,
                realized_pnl, broker_ticket
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO UPDATE SET
                exit_price = EXCLUDED.exit_price,
                closed_at = EXCLUDED.closed_at,
                close_reason = EXCLUDED.close_reason,
                realized_pnl = EXCLUDED.realized_pnl
            "#,
        )
        .bind(trade.id)
        .bind(trade.symbol.as_str())
        .bind(trade.direction.to_string())
        .bind(decimal(trade.size)?)
        .bind(decimal(trade.entry_price)?)
        .bind(decimal(trade.stop_loss)?)
        .bind(decimal(trade.take_profit)?)
        .bind(decimal(trade.risk_amount)?)
        .bind(trade.opened_at)
        .bind(decimal(exit.exit_price)?)
        .bind(exit.closed_at)
        .bind(exit.reason.to_string())
        .bind(decimal(exit.realized_pnl)?)
        .bind(trade.broker_ticket.as_deref())
        .execute(&self.pool)
        .await?;

        tracing::debug!("Journaled trade {} ({})", trade.id, trade.symbol);

        Ok(())
    }

    pub async fn save_summary(&self, summary: &DailySummary) -> Result<()> {
        let status = serde_json::to_value(summary.compliance_status)?
            .as_str()
            .unwrap_or_default()
            .to_string();

        sqlx::query(
            r#"
            INSERT INTO daily_summaries (
                day, realized_pnl, equity, drawdown_pct, daily_loss_pct, trade_count,
                compliance_status, profitable, trading_days, profitable_days
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (day) DO UPDATE SET
                realized_pnl = EXCLUDED.realized_pnl,
                equity = EXCLUDED.equity,
                drawdown_pct = EXCLUDED.drawdown_pct,
                daily_loss_pct = EXCLUDED.daily_loss_pct,
                trade_count = EXCLUDED.trade_count,
                compliance_status = EXCLUDED.compliance_status,
                profitable = EXCLUDED.profitable,
                trading_days = EXCLUDED.trading_days,
                profitable_days = EXCLUDED.profitable_days,
                updated_at = NOW()
            "#,
        )
        .bind(summary.date)
        .bind(decimal(summary.realized_pnl)?)
        .bind(decimal(summary.equity)?)
        .bind(decimal(summary.drawdown_pct)?)
        .bind(decimal(summary.daily_loss_pct)?)
        .bind(summary.trade_count as i32)
        .bind(status)
        .bind(summary.profitable)
        .bind(summary.trading_days as i32)
        .bind(summary.profitable_days as i32)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Realized P&L summed over every journaled trade
    pub async fn total_realized_pnl(&self) -> Result<f64> {
        let row = sqlx::query("SELECT COALESCE(SUM(realized_pnl), 0) AS total FROM trades")
            .fetch_one(&self.pool)
            .await?;
        let total: Decimal = row.get("total");
        to_f64(total)
    }
}

#[async_trait]
impl ReportSink for PostgresJournal {
    async fn daily_summary(&self, summary: &DailySummary) -> Result<()> {
        self.save_summary(summary).await
    }

    async fn trade_closed(&self, trade: &Trade) -> Result<()> {
        self.save_trade(trade).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CloseReason, Direction, Symbol, TradeExit, TradeState};
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn test_decimal_conversion() {
        let d = decimal(2031.45).unwrap();
        assert!((to_f64(d).unwrap() - 2031.45).abs() < 1e-9);
        assert!(decimal(f64::NAN).is_err());
    }

    #[tokio::test]
    #[ignore] // Requires Postgres running
    async fn test_journal_trade() {
        let url = std::env::var("DATABASE_URL").unwrap();
        let journal = PostgresJournal::new(&url).await.unwrap();
        let trade = Trade {
            id: Uuid::new_v4(),
            symbol: Symbol::XauUsd,
            direction: Direction::Long,
            entry_price: 2000.0,
            stop_loss: 1990.0,
            take_profit: 2015.0,
            size: 0.1,
            opened_at: Utc::now(),
            state: TradeState::Closed,
            risk_amount: 100.0,
            value_per_point: 100.0,
            broker_ticket: None,
            exit: Some(TradeExit {
                exit_price: 2015.0,
                closed_at: Utc::now(),
                reason: CloseReason::TakeProfit,
                realized_pnl: 150.0,
            }),
        };
        let before = journal.total_realized_pnl().await.unwrap();
        journal.save_trade(&trade).await.unwrap();
        let after = journal.total_realized_pnl().await.unwrap();
        assert!((after - before - 150.0).abs() < 1e-6);
    }
}
