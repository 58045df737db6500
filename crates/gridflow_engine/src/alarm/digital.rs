//! Digital trigger evaluation.

use gridflow_protocol::DigitalTrigger;

/// What a digital sample means for the rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigitalOutcome {
    /// Enter (or stay in) the fired state with this condition tag.
    Fire(&'static str),
    /// Leave the fired state.
    Clear,
    /// Fire and clear in one step (`on_change`).
    Pulse(&'static str),
    /// No transition.
    None,
}

/// Evaluate one digital sample against the previous one.
pub fn evaluate(trigger: DigitalTrigger, s: bool, prev: Option<bool>) -> DigitalOutcome {
    match trigger {
        DigitalTrigger::OnTrue => {
            if s {
                DigitalOutcome::Fire("on_true")
            } else {
                DigitalOutcome::Clear
            }
        }
        DigitalTrigger::OnFalse => {
            if !s {
                DigitalOutcome::Fire("on_false")
            } else {
                DigitalOutcome::Clear
            }
        }
        DigitalTrigger::OnChange => match prev {
            Some(p) if p != s => DigitalOutcome::Pulse("on_change"),
            _ => DigitalOutcome::None,
        },
        DigitalTrigger::OnRising => match (prev, s) {
            (Some(false), true) => DigitalOutcome::Fire("on_rising"),
            (_, false) => DigitalOutcome::Clear,
            _ => DigitalOutcome::None,
        },
        DigitalTrigger::OnFalling => match (prev, s) {
            (Some(true), false) => DigitalOutcome::Fire("on_falling"),
            (_, true) => DigitalOutcome::Clear,
            _ => DigitalOutcome::None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn on_rising_sequence() {
        // false, false, true, true, false -> one fire, one clear.
        let seq = [false, false, true, true, false];
        let mut prev = None;
        let mut outcomes = Vec::new();
        for s in seq {
            outcomes.push(evaluate(DigitalTrigger::OnRising, s, prev));
            prev = Some(s);
        }
        assert_eq!(
            outcomes,
            vec![
                DigitalOutcome::Clear,
                DigitalOutcome::Clear,
                DigitalOutcome::Fire("on_rising"),
                DigitalOutcome::None,
                DigitalOutcome::Clear,
            ]
        );
    }

    #[test]
    fn on_true_is_level_sensitive() {
        assert_eq!(evaluate(DigitalTrigger::OnTrue, true, None), DigitalOutcome::Fire("on_true"));
        assert_eq!(
            evaluate(DigitalTrigger::OnTrue, true, Some(true)),
            DigitalOutcome::Fire("on_true")
        );
        assert_eq!(evaluate(DigitalTrigger::OnTrue, false, Some(true)), DigitalOutcome::Clear);
    }

    #[test]
    fn on_change_pulses_both_edges() {
        assert_eq!(evaluate(DigitalTrigger::OnChange, true, Some(false)), DigitalOutcome::Pulse("on_change"));
        assert_eq!(evaluate(DigitalTrigger::OnChange, false, Some(true)), DigitalOutcome::Pulse("on_change"));
        assert_eq!(evaluate(DigitalTrigger::OnChange, true, Some(true)), DigitalOutcome::None);
        // First sample has no previous state to change from.
        assert_eq!(evaluate(DigitalTrigger::OnChange, true, None), DigitalOutcome::None);
    }

    #[test]
    fn on_falling_is_the_converse_of_rising() {
        assert_eq!(
            evaluate(DigitalTrigger::OnFalling, false, Some(true)),
            DigitalOutcome::Fire("on_falling")
        );
        assert_eq!(evaluate(DigitalTrigger::OnFalling, true, Some(false)), DigitalOutcome::Clear);
        assert_eq!(evaluate(DigitalTrigger::OnFalling, false, Some(false)), DigitalOutcome::None);
    }
}
