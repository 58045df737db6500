//! Suppression policies.
//!
//! Rules carry a JSON policy with two families: time windows (maintenance
//! hours) and condition gates (another rule open, or a named gate point
//! true). The gate checks need engine context and are resolved by the
//! caller; this module owns parsing and the time-window math.

use chrono::{DateTime, Datelike, NaiveTime, Utc};
use gridflow_protocol::RuleId;
use serde::{Deserialize, Serialize};

/// Parsed suppression policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SuppressionPolicy {
    /// Active-suppression windows in UTC.
    #[serde(default)]
    pub windows: Vec<TimeWindow>,
    /// Suppress while this rule has an open occurrence.
    #[serde(default)]
    pub while_rule_active: Option<RuleId>,
    /// Suppress while this point (by name) is true.
    #[serde(default)]
    pub while_gate_point: Option<String>,
}

/// A weekly recurring window. `days` use 0 = Monday .. 6 = Sunday; an empty
/// list means every day. Windows may wrap midnight (`start > end`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    #[serde(default)]
    pub days: Vec<u8>,
    /// "HH:MM"
    pub start: String,
    /// "HH:MM"
    pub end: String,
}

impl SuppressionPolicy {
    pub fn parse(raw: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(raw.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
            && self.while_rule_active.is_none()
            && self.while_gate_point.is_none()
    }

    /// True when `now` falls inside any configured window.
    pub fn window_active(&self, now: DateTime<Utc>) -> bool {
        self.windows.iter().any(|w| w.contains(now))
    }
}

impl TimeWindow {
    fn contains(&self, now: DateTime<Utc>) -> bool {
        let (Some(start), Some(end)) = (parse_hhmm(&self.start), parse_hhmm(&self.end)) else {
            return false;
        };
        let time = now.time();
        let today = now.weekday().num_days_from_monday() as u8;

        if start <= end {
            self.day_matches(today) && time >= start && time < end
        } else {
            // Wraps midnight: evening side belongs to `today`, morning side
            // to the day the window started.
            let yesterday = (today + 6) % 7;
            (self.day_matches(today) && time >= start)
                || (self.day_matches(yesterday) && time < end)
        }
    }

    fn day_matches(&self, day: u8) -> bool {
        self.days.is_empty() || self.days.contains(&day)
    }
}

fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    let (h, m) = s.split_once(':')?;
    NaiveTime::from_hms_opt(h.parse().ok()?, m.parse().ok()?, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(rfc3339: &str) -> DateTime<Utc> {
        rfc3339.parse().unwrap()
    }

    #[test]
    fn parses_full_policy() {
        let raw = serde_json::json!({
            "windows": [{"days": [0, 1, 2, 3, 4], "start": "08:00", "end": "17:00"}],
            "while_rule_active": 12,
            "while_gate_point": "maintenance_mode"
        });
        let policy = SuppressionPolicy::parse(&raw).unwrap();
        assert_eq!(policy.windows.len(), 1);
        assert_eq!(policy.while_rule_active, Some(RuleId::new(12)));
        assert_eq!(policy.while_gate_point.as_deref(), Some("maintenance_mode"));
    }

    #[test]
    fn window_matches_weekday_hours() {
        let policy = SuppressionPolicy {
            windows: vec![TimeWindow {
                days: vec![0, 1, 2, 3, 4],
                start: "08:00".into(),
                end: "17:00".into(),
            }],
            ..Default::default()
        };
        // 2026-03-02 is a Monday.
        assert!(policy.window_active(at("2026-03-02T09:30:00Z")));
        assert!(!policy.window_active(at("2026-03-02T17:00:00Z")));
        assert!(!policy.window_active(at("2026-03-02T07:59:00Z")));
        // Saturday is outside the day list.
        assert!(!policy.window_active(at("2026-03-07T09:30:00Z")));
    }

    #[test]
    fn window_wrapping_midnight() {
        let policy = SuppressionPolicy {
            windows: vec![TimeWindow { days: vec![], start: "22:00".into(), end: "06:00".into() }],
            ..Default::default()
        };
        assert!(policy.window_active(at("2026-03-02T23:00:00Z")));
        assert!(policy.window_active(at("2026-03-03T05:00:00Z")));
        assert!(!policy.window_active(at("2026-03-03T12:00:00Z")));
    }

    #[test]
    fn empty_policy_never_windows() {
        let policy = SuppressionPolicy::default();
        assert!(policy.is_empty());
        assert!(!policy.window_active(Utc::now()));
    }

    #[test]
    fn malformed_times_never_match() {
        let policy = SuppressionPolicy {
            windows: vec![TimeWindow { days: vec![], start: "25:99".into(), end: "xx".into() }],
            ..Default::default()
        };
        assert!(!policy.window_active(Utc::now()));
    }
}
