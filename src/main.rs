use anyhow::Context;
use chrono::{Datelike, Duration, Utc};
use clap::{Parser, Subcommand};
use metalsbot::backtest::PaperSession;
use metalsbot::config::AppConfig;
use metalsbot::db::PostgresJournal;
use metalsbot::engine::{self, TradingEngine};
use metalsbot::execution::{BridgeClient, BrokerGateway};
use metalsbot::models::Timeframe;
use metalsbot::persistence::{
    EngineSnapshot, FileStateStore, MemoryStateStore, RedisStateStore, StateStore,
};
use metalsbot::reporting::{LogReportSink, ReportFanout, ReportSink};
use metalsbot::scheduler::{self, ClockAlignedTicker};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "metalsbot", about = "Gold/silver prop-challenge trading engine")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Trade live through the HTTP bridge
    Run,
    /// Replay synthetic markets through the full engine
    Paper {
        #[arg(long, default_value_t = 5)]
        days: i64,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Print the persisted risk state and open trades
    Status,
    /// Clear a drawdown halt in the persisted state
    ResetHalt,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref()).context("loading configuration")?;
    setup_logging(&config);

    match cli.command {
        Command::Run => run_live(&config).await,
        Command::Paper { days, seed } => {
            if let Some(seed) = seed {
                config.paper.seed = seed;
            }
            run_paper(&config, days).await
        }
        Command::Status => status(&config).await,
        Command::ResetHalt => {
            let store = open_store(&config).await?;
            let cleared =
                engine::reset_halt(store.as_ref(), Arc::new(config.challenge_config()), Utc::now())
                    .await?;
            if cleared {
                println!("✅ Drawdown halt cleared");
            } else {
                println!("No halt was set");
            }
            Ok(())
        }
    }
}

fn setup_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.telemetry.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn StateStore>> {
    match &config.storage.redis_url {
        Some(url) => {
            let store = RedisStateStore::new(url)
                .await
                .map_err(|e| anyhow::anyhow!("connecting to Redis: {}", e))?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(FileStateStore::new(config.storage.state_file.clone()))),
    }
}

async fn open_reports(config: &AppConfig) -> Arc<dyn ReportSink> {
    let mut fanout = ReportFanout::new().with(Box::new(LogReportSink));

    if let Some(url) = &config.storage.database_url {
        match PostgresJournal::new(url).await {
            Ok(journal) => {
                tracing::info!("Postgres journal enabled");
                fanout = fanout.with(Box::new(journal));
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to connect to Postgres ({}), continuing without journal",
                    e
                );
            }
        }
    }
    Arc::new(fanout)
}

async fn run_live(config: &AppConfig) -> anyhow::Result<()> {
    tracing::info!("🚀 metalsbot starting ({:?})", config.challenge.challenge_type);

    let bridge = Arc::new(BridgeClient::new(&config.broker));
    let gateway = BrokerGateway::new(bridge.clone(), bridge, config.retry.clone());
    let store = open_store(config).await?;
    let reports = open_reports(config).await;

    let mut engine = TradingEngine::new(config, gateway, store, reports, Utc::now().date_naive());
    engine.restore().await?;
    tracing::info!("Strategy: {}", engine.strategy_name());

    let mut ticker = ClockAlignedTicker::new(Timeframe::M15, config.engine.tick_offset_secs);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("\n⚠️  Received Ctrl+C, shutting down...");
            Ok(())
        }
        result = scheduler::run(&mut ticker, &mut engine) => {
            let ticks = result?;
            tracing::info!("Evaluation loop ended after {} ticks", ticks);
            Ok(())
        }
    }
}

async fn run_paper(config: &AppConfig, days: i64) -> anyhow::Result<()> {
    // Start on the most recent Monday so a full week is replayed first
    let today = Utc::now().date_naive();
    let monday = today - Duration::days(i64::from(today.weekday().num_days_from_monday()));
    let start = monday
        .and_hms_opt(0, 0, 0)
        .map(|t| t.and_utc())
        .context("building paper start time")?;

    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let mut session = PaperSession::new(
        config,
        start,
        days,
        store.clone(),
        Arc::new(LogReportSink),
    )
    .await;

    let mut ticks = session.ticks();
    let count = scheduler::run(&mut ticks, &mut session).await?;

    let snapshot = session.engine().snapshot(Utc::now());
    let closed: Vec<_> = session.engine().book().closed_trades().collect();
    let wins = closed
        .iter()
        .filter(|t| t.exit.as_ref().is_some_and(|e| e.realized_pnl > 0.0))
        .count();

    println!("\n╔═══════════════════════════════════════════════════════╗");
    println!("║              PAPER SESSION SUMMARY                    ║");
    println!("╚═══════════════════════════════════════════════════════╝\n");
    println!("Ticks:           {}", count);
    println!("Closed trades:   {} ({} winners)", closed.len(), wins);
    println!("Open trades:     {}", snapshot.open_trades.len());
    print_risk(&snapshot);
    Ok(())
}

async fn status(config: &AppConfig) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let snapshot = store
        .load()
        .await
        .map_err(|e| anyhow::anyhow!("loading state: {}", e))?;

    match snapshot {
        None => println!("No saved state"),
        Some(snapshot) => {
            println!("Saved at:        {}", snapshot.saved_at);
            if let Some(tick) = snapshot.last_tick {
                println!("Last tick:       {}", tick);
            }
            print_risk(&snapshot);
            for trade in &snapshot.open_trades {
                println!(
                    "  {} {} {} x{} @ {:.4} SL {:.4} TP {:.4} since {}",
                    trade.id,
                    trade.direction,
                    trade.symbol,
                    trade.size,
                    trade.entry_price,
                    trade.stop_loss,
                    trade.take_profit,
                    trade.opened_at
                );
            }
        }
    }
    Ok(())
}

fn print_risk(snapshot: &EngineSnapshot) {
    let risk = &snapshot.risk;
    println!("Balance:         {:.2}", risk.account_balance);
    println!("Equity:          {:.2} (peak {:.2})", risk.equity, risk.peak_equity);
    println!("Drawdown:        {:.2}%", risk.total_drawdown_pct() * 100.0);
    println!("Daily loss:      {:.2}%", risk.daily_loss_pct() * 100.0);
    println!("Profit:          {:.2}%", risk.profit_pct() * 100.0);
    println!(
        "Trading days:    {} ({} profitable)",
        risk.trading_days.len(),
        risk.profitable_days
    );
    println!("Open trades:     {}", risk.open_trade_count);
    match &risk.halt {
        Some(halt) => println!(
            "Status:          🛑 HALTED at {} ({:.2}% drawdown)",
            halt.at,
            halt.drawdown_pct * 100.0
        ),
        None => println!("Status:          active"),
    }
}
