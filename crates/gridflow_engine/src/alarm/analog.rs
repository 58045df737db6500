//! Analog threshold evaluation with deadband hysteresis.

use gridflow_protocol::AnalogParams;

/// Threshold level a value currently sits at. Ordered by severity within a
/// side; `RateOfChange` is tracked separately by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlarmLevel {
    #[default]
    Normal,
    Low,
    LowLow,
    High,
    HighHigh,
    RateOfChange,
}

impl AlarmLevel {
    pub fn condition_tag(&self) -> &'static str {
        match self {
            AlarmLevel::Normal => "normal",
            AlarmLevel::Low => "low",
            AlarmLevel::LowLow => "low_low",
            AlarmLevel::High => "high",
            AlarmLevel::HighHigh => "high_high",
            AlarmLevel::RateOfChange => "rate_of_change",
        }
    }

    /// Severity rank; higher is worse.
    fn rank(&self) -> u8 {
        match self {
            AlarmLevel::Normal => 0,
            AlarmLevel::Low | AlarmLevel::High => 1,
            AlarmLevel::LowLow | AlarmLevel::HighHigh => 2,
            AlarmLevel::RateOfChange => 1,
        }
    }

    pub fn is_alarm(&self) -> bool {
        !matches!(self, AlarmLevel::Normal)
    }
}

/// Threshold the level was entered at, used for event enrichment.
pub fn threshold_for(params: &AnalogParams, level: AlarmLevel) -> Option<f64> {
    match level {
        AlarmLevel::HighHigh => params.high_high,
        AlarmLevel::High => params.high,
        AlarmLevel::Low => params.low,
        AlarmLevel::LowLow => params.low_low,
        _ => None,
    }
}

/// Raw level for `v` ignoring hysteresis, worst level first.
fn candidate(params: &AnalogParams, v: f64) -> AlarmLevel {
    if let Some(hh) = params.high_high {
        if v >= hh {
            return AlarmLevel::HighHigh;
        }
    }
    if let Some(ll) = params.low_low {
        if v <= ll {
            return AlarmLevel::LowLow;
        }
    }
    if let Some(h) = params.high {
        if v >= h {
            return AlarmLevel::High;
        }
    }
    if let Some(l) = params.low {
        if v <= l {
            return AlarmLevel::Low;
        }
    }
    AlarmLevel::Normal
}

/// True when `v` has retreated from `level`'s threshold by at least the
/// deadband.
fn retreated(params: &AnalogParams, level: AlarmLevel, v: f64) -> bool {
    let d = params.deadband.max(0.0);
    match level {
        AlarmLevel::HighHigh => params.high_high.is_some_and(|t| v <= t - d),
        AlarmLevel::High => params.high.is_some_and(|t| v <= t - d),
        AlarmLevel::Low => params.low.is_some_and(|t| v >= t + d),
        AlarmLevel::LowLow => params.low_low.is_some_and(|t| v >= t + d),
        _ => true,
    }
}

/// Compute the new level given the previous one, applying deadband
/// hysteresis on the way back to less severe levels.
pub fn evaluate(params: &AnalogParams, v: f64, prev: AlarmLevel) -> AlarmLevel {
    let cand = candidate(params, v);
    if cand == prev {
        return prev;
    }
    if cand.rank() > prev.rank() {
        // Worsening always takes effect immediately.
        return cand;
    }
    // Improving: hold the previous level until the value clears its
    // threshold by the deadband.
    if retreated(params, prev, v) {
        cand
    } else {
        prev
    }
}

/// Rate-of-change violation: units per second over the sample gap.
pub fn rate_exceeded(params: &AnalogParams, v: f64, prev_v: f64, dt_secs: f64) -> bool {
    match params.rate_of_change {
        Some(limit) if dt_secs > 0.0 => ((v - prev_v).abs() / dt_secs) > limit,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params_high(high: f64, deadband: f64) -> AnalogParams {
        AnalogParams { high: Some(high), deadband, ..Default::default() }
    }

    #[test]
    fn fires_at_threshold_clears_past_deadband() {
        let p = params_high(80.0, 2.0);
        // 50 -> normal
        let l = evaluate(&p, 50.0, AlarmLevel::Normal);
        assert_eq!(l, AlarmLevel::Normal);
        // 85 -> high
        let l = evaluate(&p, 85.0, l);
        assert_eq!(l, AlarmLevel::High);
        // 81 -> still above threshold, stays high
        let l = evaluate(&p, 81.0, l);
        assert_eq!(l, AlarmLevel::High);
        // 79 -> inside the deadband, still held
        let l = evaluate(&p, 79.0, l);
        assert_eq!(l, AlarmLevel::High);
        // 77 -> cleared (80 - 2 = 78)
        let l = evaluate(&p, 77.0, l);
        assert_eq!(l, AlarmLevel::Normal);
    }

    #[test]
    fn escalates_high_to_high_high() {
        let p = AnalogParams {
            high: Some(80.0),
            high_high: Some(95.0),
            deadband: 2.0,
            ..Default::default()
        };
        let l = evaluate(&p, 85.0, AlarmLevel::Normal);
        assert_eq!(l, AlarmLevel::High);
        let l = evaluate(&p, 97.0, l);
        assert_eq!(l, AlarmLevel::HighHigh);
        // Dropping below hh but above hh - deadband holds HH.
        let l = evaluate(&p, 94.0, l);
        assert_eq!(l, AlarmLevel::HighHigh);
        // Below hh - deadband drops to High (still above h).
        let l = evaluate(&p, 92.0, l);
        assert_eq!(l, AlarmLevel::High);
    }

    #[test]
    fn low_side_is_symmetric() {
        let p = AnalogParams { low: Some(10.0), deadband: 1.0, ..Default::default() };
        let l = evaluate(&p, 9.0, AlarmLevel::Normal);
        assert_eq!(l, AlarmLevel::Low);
        let l = evaluate(&p, 10.5, l);
        assert_eq!(l, AlarmLevel::Low);
        let l = evaluate(&p, 11.5, l);
        assert_eq!(l, AlarmLevel::Normal);
    }

    #[test]
    fn zero_deadband_clears_below_threshold() {
        let p = params_high(80.0, 0.0);
        let l = evaluate(&p, 85.0, AlarmLevel::Normal);
        assert_eq!(l, AlarmLevel::High);
        let l = evaluate(&p, 79.9, l);
        assert_eq!(l, AlarmLevel::Normal);
    }

    #[test]
    fn rate_of_change_is_per_second() {
        let p = AnalogParams { rate_of_change: Some(5.0), ..Default::default() };
        // 20 units over 2 seconds = 10/s > 5/s.
        assert!(rate_exceeded(&p, 40.0, 20.0, 2.0));
        // 20 units over 10 seconds = 2/s.
        assert!(!rate_exceeded(&p, 40.0, 20.0, 10.0));
        // Irregular (event-driven) gap.
        assert!(rate_exceeded(&p, 21.0, 20.0, 0.1));
        // Degenerate dt never fires.
        assert!(!rate_exceeded(&p, 40.0, 20.0, 0.0));
    }
}
