use super::{signals::SignalConfig, Strategy, TimeframeSnapshots};
use crate::error::EngineError;
use crate::indicators::{IndicatorConfig, IndicatorSnapshot};
use crate::models::{Direction, Signal, Symbol, Timeframe, TimeframeAlignment};
use chrono::{DateTime, Utc};

/// Top-down strategy for XAU/XAG
///
/// - H4 sets the trend bias (EMA fast vs slow, price vs key support/resistance)
/// - H1 must fire an entry trigger in the bias direction
///   (MACD histogram cross, RSI leaving an extreme, close outside a Bollinger band)
/// - M15 confirms timing and may veto, never flip
///
/// Any ambiguity at any layer produces a NONE signal.
#[derive(Debug, Clone)]
pub struct MultiTimeframeStrategy {
    config: SignalConfig,
    indicators: IndicatorConfig,
}

/// Outcome of the H1 trigger layer
struct Trigger {
    direction: Direction,
    fired: Vec<&'static str>,
}

impl MultiTimeframeStrategy {
    pub fn new(config: SignalConfig, indicators: IndicatorConfig) -> Self {
        Self { config, indicators }
    }

    /// Full evaluation; `Err` carries why no direction could be decided
    pub fn evaluate(
        &self,
        symbol: Symbol,
        snapshots: &TimeframeSnapshots,
        at: DateTime<Utc>,
        alignment: &mut TimeframeAlignment,
    ) -> Result<Signal, EngineError> {
        let h4 = require(symbol, snapshots, Timeframe::H4)?;
        let h1 = require(symbol, snapshots, Timeframe::H1)?;
        let m15 = require(symbol, snapshots, Timeframe::M15)?;

        let bias = self.trend_bias(h4);
        alignment.h4_bias = bias;
        if bias.is_flat() {
            return Err(EngineError::AmbiguousSignal {
                symbol,
                reason: "H4 trend ambiguous".to_string(),
            });
        }

        let trigger = self.entry_trigger(symbol, h1)?;
        alignment.h1_trigger = trigger.direction;
        if trigger.direction.is_flat() {
            return Ok(Signal::none(
                symbol,
                at,
                alignment.clone(),
                format!("H4 {} bias, no H1 trigger", bias),
            ));
        }
        if trigger.direction != bias {
            return Err(EngineError::AmbiguousSignal {
                symbol,
                reason: format!("H1 trigger {} disagrees with H4 bias {}", trigger.direction, bias),
            });
        }

        if let Some(veto) = self.timing_veto(m15, bias) {
            return Ok(Signal::none(
                symbol,
                at,
                alignment.clone(),
                format!("M15 veto: {}", veto),
            ));
        }
        alignment.m15_confirmed = true;

        let strength = self.strength(h4, &trigger, m15, bias);
        if strength < self.config.min_strength {
            return Ok(Signal::none(
                symbol,
                at,
                alignment.clone(),
                format!("strength {:.2} below {:.2}", strength, self.config.min_strength),
            ));
        }

        Ok(Signal {
            symbol,
            direction: bias,
            strength,
            alignment: alignment.clone(),
            timestamp: at,
            atr: Some(h1.atr),
            reference_price: Some(m15.close),
            rationale: format!(
                "H4 {} trend, H1 {}, M15 confirmed",
                bias,
                trigger.fired.join("+")
            ),
        })
    }

    /// LONG: fast EMA above slow and price above the key support cluster.
    /// SHORT: the mirror image. Anything else is NONE.
    fn trend_bias(&self, h4: &IndicatorSnapshot) -> Direction {
        let support = h4.levels.key_support();
        let resistance = h4.levels.key_resistance();

        let long = h4.ema.fast > h4.ema.slow && support.map_or(false, |s| h4.close > s.price);
        let short =
            h4.ema.fast < h4.ema.slow && resistance.map_or(false, |r| h4.close < r.price);

        match (long, short) {
            (true, false) => Direction::Long,
            (false, true) => Direction::Short,
            _ => Direction::Flat,
        }
    }

    fn entry_trigger(&self, symbol: Symbol, h1: &IndicatorSnapshot) -> Result<Trigger, EngineError> {
        let mut long = Vec::new();
        let mut short = Vec::new();

        if let Some(prev) = h1.prev_macd {
            if prev.histogram <= 0.0 && h1.macd.histogram > 0.0 {
                long.push("MACD cross");
            } else if prev.histogram >= 0.0 && h1.macd.histogram < 0.0 {
                short.push("MACD cross");
            }
        }

        if let Some(prev) = h1.prev_rsi {
            if prev < self.config.rsi_oversold && h1.rsi >= self.config.rsi_oversold {
                long.push("RSI exit oversold");
            } else if prev > self.config.rsi_overbought && h1.rsi <= self.config.rsi_overbought {
                short.push("RSI exit overbought");
            }
        }

        if h1.close < h1.bollinger.lower {
            long.push("Bollinger reversion");
        } else if h1.close > h1.bollinger.upper {
            short.push("Bollinger reversion");
        }

        match (long.is_empty(), short.is_empty()) {
            (true, true) => Ok(Trigger {
                direction: Direction::Flat,
                fired: Vec::new(),
            }),
            (false, true) => Ok(Trigger {
                direction: Direction::Long,
                fired: long,
            }),
            (true, false) => Ok(Trigger {
                direction: Direction::Short,
                fired: short,
            }),
            (false, false) => Err(EngineError::AmbiguousSignal {
                symbol,
                reason: format!(
                    "H1 triggers conflict: long [{}] vs short [{}]",
                    long.join(", "),
                    short.join(", ")
                ),
            }),
        }
    }

    fn timing_veto(&self, m15: &IndicatorSnapshot, direction: Direction) -> Option<String> {
        if m15.close <= 0.0 || m15.atr / m15.close < self.config.min_volatility_pct {
            return Some(format!("volatility too low (ATR {:.4})", m15.atr));
        }
        let range = m15.high - m15.low;
        if range > m15.atr * self.config.max_range_atr_multiple {
            return Some(format!(
                "bar range {:.4} exceeds {:.1} ATR",
                range, self.config.max_range_atr_multiple
            ));
        }
        if (m15.close - m15.ema.fast) * direction.sign() < 0.0 {
            return Some("price on the wrong side of the fast EMA".to_string());
        }
        None
    }

    /// Weighted score in [0, 1]
    ///
    /// trend: EMA separation in H4 ATRs, saturating at `trend_saturation_atr`
    /// trigger: share of H1 triggers that fired
    /// timing: M15 distance from the fast EMA in M15 ATRs, capped at 1
    fn strength(
        &self,
        h4: &IndicatorSnapshot,
        trigger: &Trigger,
        m15: &IndicatorSnapshot,
        direction: Direction,
    ) -> f64 {
        let trend = if h4.atr > 0.0 {
            ((h4.ema.fast - h4.ema.slow).abs() / (h4.atr * self.config.trend_saturation_atr))
                .min(1.0)
        } else {
            0.0
        };
        let trigger_score = trigger.fired.len() as f64 / 3.0;
        let timing = if m15.atr > 0.0 {
            ((m15.close - m15.ema.fast) * direction.sign() / m15.atr).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let c = &self.config;
        let total = c.trend_weight + c.trigger_weight + c.timing_weight;
        if total <= 0.0 {
            return 0.0;
        }
        ((c.trend_weight * trend + c.trigger_weight * trigger_score + c.timing_weight * timing)
            / total)
            .clamp(0.0, 1.0)
    }
}

impl Default for MultiTimeframeStrategy {
    fn default() -> Self {
        Self::new(SignalConfig::default(), IndicatorConfig::default())
    }
}

fn require(
    symbol: Symbol,
    snapshots: &TimeframeSnapshots,
    timeframe: Timeframe,
) -> Result<&IndicatorSnapshot, EngineError> {
    snapshots
        .get(timeframe)
        .ok_or_else(|| EngineError::DataUnavailable {
            symbol,
            timeframe,
            reason: "no indicator snapshot".to_string(),
        })
}

impl Strategy for MultiTimeframeStrategy {
    fn generate_signal(
        &self,
        symbol: Symbol,
        snapshots: &TimeframeSnapshots,
        at: DateTime<Utc>,
    ) -> Signal {
        let mut alignment = TimeframeAlignment::empty();
        match self.evaluate(symbol, snapshots, at, &mut alignment) {
            Ok(signal) => {
                if signal.direction.is_flat() {
                    tracing::debug!(%symbol, "No signal: {}", signal.rationale);
                } else {
                    tracing::info!(
                        %symbol,
                        "📈 {} signal, strength {:.2}: {}",
                        signal.direction,
                        signal.strength,
                        signal.rationale
                    );
                }
                signal
            }
            Err(e) => {
                tracing::debug!(%symbol, "No signal: {}", e);
                Signal::none(symbol, at, alignment, e.to_string())
            }
        }
    }

    fn name(&self) -> &str {
        "MultiTimeframeStrategy"
    }

    fn min_bars_required(&self) -> usize {
        self.indicators.min_bars()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::{BollingerBands, EmaSet, Macd, PriceLevel, SupportResistance};
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 10, 0, 0).unwrap()
    }

    /// Neutral snapshot: flat EMAs, mid-band close, RSI 50, no MACD cross
    fn snapshot(timeframe: Timeframe, close: f64) -> IndicatorSnapshot {
        IndicatorSnapshot {
            symbol: Symbol::XauUsd,
            timeframe,
            bar_time: at(),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            rsi: 50.0,
            macd: Macd {
                line: 0.5,
                signal: 0.4,
                histogram: 0.1,
            },
            bollinger: BollingerBands {
                upper: close + 20.0,
                middle: close,
                lower: close - 20.0,
            },
            ema: EmaSet {
                fast: close,
                slow: close,
                trend: close,
            },
            atr: 4.0,
            levels: SupportResistance {
                supports: vec![PriceLevel {
                    price: close - 30.0,
                    touches: 2,
                }],
                resistances: vec![PriceLevel {
                    price: close + 30.0,
                    touches: 2,
                }],
                reference_price: close,
            },
            prev_rsi: Some(50.0),
            prev_macd: Some(Macd {
                line: 0.5,
                signal: 0.4,
                histogram: 0.1,
            }),
        }
    }

    fn uptrend_h4() -> IndicatorSnapshot {
        let mut h4 = snapshot(Timeframe::H4, 2000.0);
        h4.ema.fast = 1995.0;
        h4.ema.slow = 1985.0;
        h4.atr = 10.0;
        h4
    }

    fn downtrend_h4() -> IndicatorSnapshot {
        let mut h4 = snapshot(Timeframe::H4, 2000.0);
        h4.ema.fast = 2005.0;
        h4.ema.slow = 2015.0;
        h4.atr = 10.0;
        h4
    }

    fn long_trigger_h1() -> IndicatorSnapshot {
        let mut h1 = snapshot(Timeframe::H1, 2000.0);
        h1.prev_macd = Some(Macd {
            line: -0.2,
            signal: 0.0,
            histogram: -0.2,
        });
        h1.macd = Macd {
            line: 0.3,
            signal: 0.1,
            histogram: 0.2,
        };
        h1
    }

    fn short_trigger_h1() -> IndicatorSnapshot {
        let mut h1 = snapshot(Timeframe::H1, 2000.0);
        h1.prev_macd = Some(Macd {
            line: 0.2,
            signal: 0.0,
            histogram: 0.2,
        });
        h1.macd = Macd {
            line: -0.3,
            signal: -0.1,
            histogram: -0.2,
        };
        h1
    }

    fn m15_above_ema() -> IndicatorSnapshot {
        let mut m15 = snapshot(Timeframe::M15, 2000.0);
        m15.ema.fast = 1998.0;
        m15.atr = 2.0;
        m15
    }

    fn triple(h4: IndicatorSnapshot, h1: IndicatorSnapshot, m15: IndicatorSnapshot) -> TimeframeSnapshots {
        TimeframeSnapshots {
            h4: Some(h4),
            h1: Some(h1),
            m15: Some(m15),
        }
    }

    #[test]
    fn test_all_layers_agree_long() {
        let strategy = MultiTimeframeStrategy::default();
        let signal = strategy.generate_signal(
            Symbol::XauUsd,
            &triple(uptrend_h4(), long_trigger_h1(), m15_above_ema()),
            at(),
        );

        assert_eq!(signal.direction, Direction::Long);
        assert!(signal.alignment.m15_confirmed);
        assert_eq!(signal.atr, Some(4.0));
        assert_eq!(signal.reference_price, Some(2000.0));
        // trend 10/(10*2)=0.5, trigger 1/3, timing 1.0
        let expected = (0.5 * 0.5 + 0.3 / 3.0 + 0.2 * 1.0) / 1.0;
        assert!((signal.strength - expected).abs() < 1e-9);
    }

    #[test]
    fn test_h4_and_h1_disagree_is_none() {
        let strategy = MultiTimeframeStrategy::default();
        let cases = [
            (uptrend_h4(), short_trigger_h1()),
            (downtrend_h4(), long_trigger_h1()),
        ];
        for (h4, h1) in cases {
            for m15 in [m15_above_ema(), snapshot(Timeframe::M15, 2000.0)] {
                let signal = strategy.generate_signal(Symbol::XauUsd, &triple(h4.clone(), h1.clone(), m15), at());
                assert_eq!(signal.direction, Direction::Flat);
                assert!(signal.rationale.contains("disagrees"));
            }
        }
    }

    #[test]
    fn test_ambiguous_trend_blocks() {
        let strategy = MultiTimeframeStrategy::default();
        // Uptrending EMAs but price below the key support cluster
        let mut h4 = uptrend_h4();
        h4.levels.supports = vec![PriceLevel {
            price: 2010.0,
            touches: 3,
        }];
        let signal = strategy.generate_signal(
            Symbol::XauUsd,
            &triple(h4, long_trigger_h1(), m15_above_ema()),
            at(),
        );
        assert_eq!(signal.direction, Direction::Flat);
        assert_eq!(signal.alignment.h4_bias, Direction::Flat);
    }

    #[test]
    fn test_conflicting_h1_triggers_are_none() {
        let strategy = MultiTimeframeStrategy::default();
        let mut h1 = long_trigger_h1();
        // MACD says long, close above the upper band says short
        h1.close = 2025.0;
        let signal = strategy.generate_signal(
            Symbol::XauUsd,
            &triple(uptrend_h4(), h1, m15_above_ema()),
            at(),
        );
        assert_eq!(signal.direction, Direction::Flat);
        assert!(signal.rationale.contains("conflict"));
    }

    #[test]
    fn test_m15_vetoes_but_never_flips() {
        let strategy = MultiTimeframeStrategy::default();

        let mut quiet = m15_above_ema();
        quiet.atr = 0.1;
        let mut shock = m15_above_ema();
        shock.high = 2010.0;
        shock.low = 1990.0;
        let mut against = m15_above_ema();
        against.ema.fast = 2003.0;

        for m15 in [quiet, shock, against] {
            let signal = strategy.generate_signal(
                Symbol::XauUsd,
                &triple(uptrend_h4(), long_trigger_h1(), m15),
                at(),
            );
            assert_eq!(signal.direction, Direction::Flat);
            assert!(!signal.alignment.m15_confirmed);
            assert_eq!(signal.alignment.h4_bias, Direction::Long);
        }
    }

    #[test]
    fn test_missing_timeframe_is_none() {
        let strategy = MultiTimeframeStrategy::default();
        let snapshots = TimeframeSnapshots {
            h4: Some(uptrend_h4()),
            h1: None,
            m15: Some(m15_above_ema()),
        };
        let signal = strategy.generate_signal(Symbol::XauUsd, &snapshots, at());
        assert_eq!(signal.direction, Direction::Flat);
        assert!(signal.rationale.contains("data unavailable"));
    }

    #[test]
    fn test_rsi_and_band_triggers_short() {
        let strategy = MultiTimeframeStrategy::default();
        let mut h1 = snapshot(Timeframe::H1, 2000.0);
        h1.prev_rsi = Some(74.0);
        h1.rsi = 68.0;

        let mut m15 = snapshot(Timeframe::M15, 2000.0);
        m15.ema.fast = 2001.0;
        m15.atr = 2.0;

        let signal = strategy.generate_signal(Symbol::XauUsd, &triple(downtrend_h4(), h1, m15), at());
        assert_eq!(signal.direction, Direction::Short);
        assert!(signal.rationale.contains("RSI exit overbought"));
    }
}
