//! Trailing-stop math and state. Single source of truth — every call site
//! that needs an exit threshold routes through here.
//!
//! The threshold is the most conservative of the percent-of-extreme and
//! ATR-distance candidates, clamped into the configured stop band around the
//! entry price. Close to the hard market close the trailing percent tightens
//! by a configured factor.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrailSide {
    Long,
    /// Also used for inverse-ETF proxies of short exposure.
    Short,
}

/// Inputs for one threshold computation.
#[derive(Debug, Clone)]
pub struct TrailInputs {
    pub side: TrailSide,
    pub entry_price: f64,
    /// Highest price seen since entry (long) or lowest (short).
    pub peak_or_trough: f64,
    pub trail_pct: f64,
    pub atr: Option<f64>,
    pub atr_mult: Option<f64>,
    pub min_stop_pct: Option<f64>,
    pub max_stop_pct: Option<f64>,
}

/// Tighten the trailing percent when within the hard-close buffer.
pub fn tightened_trail_pct(
    trail_pct: f64,
    seconds_to_hard_close: i64,
    hard_close_buffer_sec: i64,
    tighten_factor: f64,
) -> f64 {
    if seconds_to_hard_close >= 0 && seconds_to_hard_close <= hard_close_buffer_sec {
        trail_pct * tighten_factor
    } else {
        trail_pct
    }
}

/// Compute the exit threshold price.
///
/// Long: candidates are `peak·(1−pct)` and `peak − atr·mult`; the higher
/// (earlier-exiting) wins, clamped into `[entry·(1−max), entry·(1−min)]`.
/// Short mirrors with the trough and the band above entry.
pub fn compute_exit_threshold(inputs: &TrailInputs) -> Option<f64> {
    let extreme = inputs.peak_or_trough;
    if inputs.entry_price <= 0.0 || extreme <= 0.0 {
        return None;
    }
    match inputs.side {
        TrailSide::Long => {
            let mut threshold = extreme * (1.0 - inputs.trail_pct);
            if let (Some(atr), Some(mult)) = (inputs.atr, inputs.atr_mult) {
                let atr_candidate = extreme - atr * mult;
                threshold = threshold.max(atr_candidate);
            }
            if let Some(max_stop) = inputs.max_stop_pct {
                threshold = threshold.max(inputs.entry_price * (1.0 - max_stop));
            }
            if let Some(min_stop) = inputs.min_stop_pct {
                threshold = threshold.min(inputs.entry_price * (1.0 - min_stop));
            }
            Some(threshold)
        }
        TrailSide::Short => {
            let mut threshold = extreme * (1.0 + inputs.trail_pct);
            if let (Some(atr), Some(mult)) = (inputs.atr, inputs.atr_mult) {
                let atr_candidate = extreme + atr * mult;
                threshold = threshold.min(atr_candidate);
            }
            if let Some(max_stop) = inputs.max_stop_pct {
                threshold = threshold.min(inputs.entry_price * (1.0 + max_stop));
            }
            if let Some(min_stop) = inputs.min_stop_pct {
                threshold = threshold.max(inputs.entry_price * (1.0 + min_stop));
            }
            Some(threshold)
        }
    }
}

pub fn should_exit(side: TrailSide, current_price: f64, threshold: f64) -> bool {
    match side {
        TrailSide::Long => current_price <= threshold,
        TrailSide::Short => current_price >= threshold,
    }
}

/// Peak/trough tracker carried per open position.
#[derive(Debug, Clone)]
pub struct TrailingStopState {
    pub side: TrailSide,
    pub pct: f64,
    pub peak: f64,
    pub trough: f64,
    pub active: bool,
}

impl TrailingStopState {
    pub fn new(side: TrailSide, pct: f64) -> Self {
        TrailingStopState {
            side,
            pct,
            peak: 0.0,
            trough: f64::INFINITY,
            active: true,
        }
    }

    pub fn register_tick(&mut self, price: f64) {
        if !self.active {
            return;
        }
        match self.side {
            TrailSide::Long => {
                if price > self.peak {
                    self.peak = price;
                }
            }
            TrailSide::Short => {
                if price < self.trough {
                    self.trough = price;
                }
            }
        }
    }

    pub fn extreme(&self) -> Option<f64> {
        match self.side {
            TrailSide::Long if self.peak > 0.0 => Some(self.peak),
            TrailSide::Short if self.trough.is_finite() => Some(self.trough),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close_to(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_long_percent_of_peak() {
        let t = compute_exit_threshold(&TrailInputs {
            side: TrailSide::Long,
            entry_price: 100.0,
            peak_or_trough: 110.0,
            trail_pct: 0.02,
            atr: None,
            atr_mult: None,
            min_stop_pct: None,
            max_stop_pct: None,
        })
        .unwrap();
        assert!(close_to(t, 107.8));
    }

    #[test]
    fn test_long_atr_candidate_wins_when_tighter() {
        let t = compute_exit_threshold(&TrailInputs {
            side: TrailSide::Long,
            entry_price: 100.0,
            peak_or_trough: 110.0,
            trail_pct: 0.05, // pct candidate 104.5
            atr: Some(0.5),
            atr_mult: Some(2.0), // atr candidate 109.0
            min_stop_pct: None,
            max_stop_pct: None,
        })
        .unwrap();
        assert!(close_to(t, 109.0));
    }

    #[test]
    fn test_long_clamped_into_stop_band() {
        // Peak far above entry: pct stop would sit above entry·(1−min)
        let t = compute_exit_threshold(&TrailInputs {
            side: TrailSide::Long,
            entry_price: 100.0,
            peak_or_trough: 150.0,
            trail_pct: 0.01, // candidate 148.5
            atr: None,
            atr_mult: None,
            min_stop_pct: Some(0.005),
            max_stop_pct: Some(0.10),
        })
        .unwrap();
        assert!(close_to(t, 99.5), "got {}", t);

        // Deep drawdown stop floored at entry·(1−max)
        let t = compute_exit_threshold(&TrailInputs {
            side: TrailSide::Long,
            entry_price: 100.0,
            peak_or_trough: 100.0,
            trail_pct: 0.5, // candidate 50
            atr: None,
            atr_mult: None,
            min_stop_pct: Some(0.005),
            max_stop_pct: Some(0.10),
        })
        .unwrap();
        assert!(close_to(t, 90.0), "got {}", t);
    }

    #[test]
    fn test_short_mirror() {
        let t = compute_exit_threshold(&TrailInputs {
            side: TrailSide::Short,
            entry_price: 100.0,
            peak_or_trough: 90.0,
            trail_pct: 0.02,
            atr: None,
            atr_mult: None,
            min_stop_pct: None,
            max_stop_pct: None,
        })
        .unwrap();
        assert!(close_to(t, 91.8));
        assert!(should_exit(TrailSide::Short, 92.0, t));
        assert!(!should_exit(TrailSide::Short, 91.0, t));
    }

    #[test]
    fn test_tighten_near_close() {
        assert!(close_to(tightened_trail_pct(0.02, 100, 150, 0.5), 0.01));
        assert!(close_to(tightened_trail_pct(0.02, 500, 150, 0.5), 0.02));
        assert!(close_to(tightened_trail_pct(0.02, -5, 150, 0.5), 0.02));
    }

    #[test]
    fn test_state_tracks_extremes() {
        let mut s = TrailingStopState::new(TrailSide::Long, 0.02);
        assert_eq!(s.extreme(), None);
        s.register_tick(100.0);
        s.register_tick(105.0);
        s.register_tick(103.0);
        assert_eq!(s.extreme(), Some(105.0));

        let mut s = TrailingStopState::new(TrailSide::Short, 0.02);
        s.register_tick(100.0);
        s.register_tick(95.0);
        s.register_tick(97.0);
        assert_eq!(s.extreme(), Some(95.0));
    }

    #[test]
    fn test_degenerate_inputs() {
        assert!(
            compute_exit_threshold(&TrailInputs {
                side: TrailSide::Long,
                entry_price: 0.0,
                peak_or_trough: 10.0,
                trail_pct: 0.02,
                atr: None,
                atr_mult: None,
                min_stop_pct: None,
                max_stop_pct: None,
            })
            .is_none()
        );
    }
}
