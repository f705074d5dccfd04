use crate::engine::{TickReport, TradingEngine};
use crate::error::EngineError;
use crate::models::Timeframe;
use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Utc};
use std::collections::VecDeque;

/// Produces evaluation times; `None` ends the loop
#[async_trait]
pub trait TickSource: Send {
    async fn next_tick(&mut self) -> Option<DateTime<Utc>>;
}

/// Whatever runs on each tick
#[async_trait]
pub trait TickHandler: Send {
    async fn on_tick(&mut self, at: DateTime<Utc>) -> Result<TickReport, EngineError>;
}

#[async_trait]
impl TickHandler for TradingEngine {
    async fn on_tick(&mut self, at: DateTime<Utc>) -> Result<TickReport, EngineError> {
        TradingEngine::on_tick(self, at).await
    }
}

/// Wall-clock ticks a fixed offset after each bar close (XX:00:30, XX:15:30, ...)
#[derive(Debug, Clone)]
pub struct ClockAlignedTicker {
    period: Duration,
    offset: Duration,
}

impl ClockAlignedTicker {
    pub fn new(timeframe: Timeframe, offset_secs: u64) -> Self {
        Self {
            period: timeframe.duration(),
            offset: Duration::seconds(offset_secs as i64),
        }
    }

    /// First tick strictly after `now`
    pub fn next_boundary(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let floor = now.duration_trunc(self.period).unwrap_or(now);
        let candidate = floor + self.offset;
        if candidate > now {
            candidate
        } else {
            candidate + self.period
        }
    }
}

#[async_trait]
impl TickSource for ClockAlignedTicker {
    async fn next_tick(&mut self) -> Option<DateTime<Utc>> {
        let now = Utc::now();
        let target = self.next_boundary(now);
        let wait = (target - now).to_std().unwrap_or_default();
        tracing::debug!("⏰ Next tick at {} (in {}s)", target, wait.as_secs());
        tokio::time::sleep(wait).await;
        Some(target)
    }
}

/// Precomputed ticks, returned immediately; used to replay history
#[derive(Debug, Clone, Default)]
pub struct ReplayTicks {
    ticks: VecDeque<DateTime<Utc>>,
}

impl ReplayTicks {
    pub fn new(ticks: impl IntoIterator<Item = DateTime<Utc>>) -> Self {
        Self {
            ticks: ticks.into_iter().collect(),
        }
    }

    /// Every `step` from `start` (inclusive) to `end` (exclusive)
    pub fn every(start: DateTime<Utc>, end: DateTime<Utc>, step: Duration) -> Self {
        let mut ticks = VecDeque::new();
        let mut at = start;
        while at < end && step > Duration::zero() {
            ticks.push_back(at);
            at += step;
        }
        Self { ticks }
    }

    pub fn remaining(&self) -> usize {
        self.ticks.len()
    }
}

#[async_trait]
impl TickSource for ReplayTicks {
    async fn next_tick(&mut self) -> Option<DateTime<Utc>> {
        self.ticks.pop_front()
    }
}

/// Drive `handler` from `source` until the source ends
///
/// Returns the number of ticks run. Only operational errors stop the loop.
pub async fn run<S, H>(source: &mut S, handler: &mut H) -> Result<u64, EngineError>
where
    S: TickSource + ?Sized,
    H: TickHandler + ?Sized,
{
    let mut ticks = 0u64;
    while let Some(at) = source.next_tick().await {
        match handler.on_tick(at).await {
            Ok(report) => {
                ticks += 1;
                if !report.opened.is_empty() || !report.closed.is_empty() {
                    tracing::info!(
                        "Tick {}: {} opened, {} closed",
                        at,
                        report.opened.len(),
                        report.closed.len()
                    );
                }
            }
            Err(e) if e.is_operational() => {
                tracing::error!("❌ Stopping evaluation loop: {}", e);
                return Err(e);
            }
            Err(e) => {
                ticks += 1;
                tracing::warn!("Tick {} failed: {}", at, e);
            }
        }
    }
    tracing::info!("Tick source exhausted after {} ticks", ticks);
    Ok(ticks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, h, m, s).unwrap()
    }

    #[test]
    fn test_next_boundary_with_offset() {
        let ticker = ClockAlignedTicker::new(Timeframe::M15, 30);
        assert_eq!(ticker.next_boundary(at(10, 0, 0)), at(10, 0, 30));
        assert_eq!(ticker.next_boundary(at(10, 0, 30)), at(10, 15, 30));
        assert_eq!(ticker.next_boundary(at(10, 7, 12)), at(10, 15, 30));
        assert_eq!(ticker.next_boundary(at(23, 59, 59)), Utc.with_ymd_and_hms(2024, 3, 6, 0, 0, 30).unwrap());
    }

    #[tokio::test]
    async fn test_replay_ticks() {
        let mut ticks = ReplayTicks::every(at(10, 0, 30), at(11, 0, 30), Duration::minutes(15));
        assert_eq!(ticks.remaining(), 4);
        assert_eq!(ticks.next_tick().await, Some(at(10, 0, 30)));
        assert_eq!(ticks.next_tick().await, Some(at(10, 15, 30)));
    }

    struct Scripted {
        seen: Vec<DateTime<Utc>>,
        fail_at: Option<usize>,
        fatal: bool,
    }

    #[async_trait]
    impl TickHandler for Scripted {
        async fn on_tick(&mut self, at: DateTime<Utc>) -> Result<TickReport, EngineError> {
            self.seen.push(at);
            if self.fail_at == Some(self.seen.len()) {
                if self.fatal {
                    return Err(EngineError::ConnectivityLost {
                        consecutive_failures: 20,
                    });
                }
                return Err(EngineError::Store("disk full".to_string()));
            }
            let report = TickReport {
                at,
                opened: Vec::new(),
                closed: Vec::new(),
                skipped: Vec::new(),
                daily_summary: None,
                broker_failures: 0,
                degraded: false,
                halted: false,
            };
            Ok(report)
        }
    }

    #[tokio::test]
    async fn test_run_survives_non_operational_errors() {
        let mut source = ReplayTicks::every(at(10, 0, 30), at(11, 0, 30), Duration::minutes(15));
        let mut handler = Scripted {
            seen: Vec::new(),
            fail_at: Some(2),
            fatal: false,
        };
        let ticks = tokio_test::assert_ok!(run(&mut source, &mut handler).await);
        assert_eq!(ticks, 4);
        assert_eq!(handler.seen.len(), 4);
    }

    #[tokio::test]
    async fn test_run_stops_on_connectivity_loss() {
        let mut source = ReplayTicks::every(at(10, 0, 30), at(11, 0, 30), Duration::minutes(15));
        let mut handler = Scripted {
            seen: Vec::new(),
            fail_at: Some(2),
            fatal: true,
        };
        let err = tokio_test::assert_err!(run(&mut source, &mut handler).await);
        assert!(err.is_operational());
        assert_eq!(handler.seen.len(), 2);
        assert_eq!(source.remaining(), 2);
    }
}
