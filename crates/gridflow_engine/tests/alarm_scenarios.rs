//! Alarm engine scenarios driven end-to-end over the in-memory store.

use chrono::{Duration as ChronoDuration, Utc};
use gridflow_engine::{AlarmEngine, CurrentValueStore, PointMeta, VirtualPointEngine};
use gridflow_protocol::{
    AlarmState, BadReason, DigitalTrigger, PointId, PointRef, Quality, Severity, TenantId, Value,
};
use gridflow_test_utils as tu;
use std::sync::Arc;

fn engine_with_rules(rules: Vec<gridflow_protocol::AlarmRule>) -> (AlarmEngine, Arc<tu::MemoryStore>) {
    let store = Arc::new(tu::MemoryStore::new());
    let engine = AlarmEngine::new(store.clone());
    for rule in rules {
        engine.install_rule(rule).unwrap();
    }
    (engine, store)
}

fn meta(point: i64, name: &str) -> PointMeta {
    PointMeta {
        point: PointRef::DataPoint(PointId::new(point)),
        tenant: TenantId::new(1),
        name: name.into(),
        device_id: None,
        location: None,
        group: None,
    }
}

#[tokio::test]
async fn analog_high_threshold_with_deadband() {
    // Rule: target=dp#100, H=80.0, deadband=2.0, severity=high.
    let (engine, store) = engine_with_rules(vec![tu::high_rule(1, 100, 80.0, 2.0)]);
    let current = CurrentValueStore::new();
    let t0 = Utc::now();

    // T=0s: 50 -> nothing.
    let events = engine
        .evaluate_batch(&[tu::float_reading_at(100, 50.0, t0)], &current)
        .await;
    assert!(events.is_empty());

    // T=1s: 85 -> one active event.
    let events = engine
        .evaluate_batch(&[tu::float_reading_at(100, 85.0, t0 + ChronoDuration::seconds(1))], &current)
        .await;
    assert_eq!(events.len(), 1);
    let fired = &events[0];
    assert_eq!(fired.state, AlarmState::Active);
    assert_eq!(fired.severity, Severity::High);
    assert_eq!(fired.trigger_value, Value::Float(85.0));
    assert_eq!(fired.threshold_value, Some(80.0));
    assert_eq!(fired.trigger_condition, "high");

    // T=2s: 81 -> inside the deadband, no events.
    let events = engine
        .evaluate_batch(&[tu::float_reading_at(100, 81.0, t0 + ChronoDuration::seconds(2))], &current)
        .await;
    assert!(events.is_empty());

    // T=3s: 77 -> cleared with the clearing value.
    let events = engine
        .evaluate_batch(&[tu::float_reading_at(100, 77.0, t0 + ChronoDuration::seconds(3))], &current)
        .await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].state, AlarmState::Cleared);
    assert_eq!(events[0].cleared_value, Some(Value::Float(77.0)));

    // Durable record: one occurrence, cleared, cleared_at >= occurred_at.
    let occs = store.occurrences_for_rule(gridflow_protocol::RuleId::new(1));
    assert_eq!(occs.len(), 1);
    assert_eq!(occs[0].state, AlarmState::Cleared);
    assert!(occs[0].cleared_at.unwrap() >= occs[0].occurred_at);
}

#[tokio::test]
async fn digital_on_rising_fires_once_and_clears() {
    let (engine, store) = engine_with_rules(vec![tu::digital_rule(2, 200, DigitalTrigger::OnRising)]);
    let current = CurrentValueStore::new();

    let sequence = [false, false, true, true, false];
    let mut all_events = Vec::new();
    for s in sequence {
        let events = engine.evaluate_batch(&[tu::bool_reading(200, s)], &current).await;
        all_events.extend(events);
    }

    assert_eq!(all_events.len(), 2);
    assert_eq!(all_events[0].state, AlarmState::Active);
    assert_eq!(all_events[0].trigger_condition, "on_rising");
    assert_eq!(all_events[1].state, AlarmState::Cleared);

    let occs = store.occurrences_for_rule(gridflow_protocol::RuleId::new(2));
    assert_eq!(occs.len(), 1);
}

#[tokio::test]
async fn virtual_point_feeds_alarm() {
    // vp#10 = dp#1 + dp#2, rule H=100 on the virtual point.
    let (engine, _store) = engine_with_rules(vec![tu::vp_high_rule(3, 10, 100.0)]);
    let vp_engine = VirtualPointEngine::new();
    vp_engine.register(tu::sum_vp(10, 1, 2)).unwrap();
    let current = CurrentValueStore::new();

    let batch = vec![tu::float_reading(1, 60.0), tu::float_reading(2, 45.0)];
    let mut merged = batch.clone();
    let derived = vp_engine.compute_for_batch(&batch, &current);
    assert_eq!(derived.len(), 1);
    assert_eq!(derived[0].point, PointRef::VirtualPoint(gridflow_protocol::VirtualPointId::new(10)));
    assert_eq!(derived[0].value, Value::Float(105.0));
    merged.extend(derived);

    let events = engine.evaluate_batch(&merged, &current).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].state, AlarmState::Active);
    assert_eq!(events[0].trigger_value, Value::Float(105.0));
}

#[tokio::test]
async fn script_rule_binds_points_by_name() {
    let (engine, _store) =
        engine_with_rules(vec![tu::script_rule(4, 1, "tempC > 80 && pressureBar > 5")]);
    engine.set_point_meta(vec![meta(1, "tempC"), meta(2, "pressureBar")]);
    let current = CurrentValueStore::new();

    // {tempC: 85, pressureBar: 6} -> active.
    let events = engine
        .evaluate_batch(&[tu::float_reading(1, 85.0), tu::float_reading(2, 6.0)], &current)
        .await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].state, AlarmState::Active);
    assert_eq!(events[0].trigger_condition, "script");

    // {tempC: 85, pressureBar: 4} -> cleared.
    let events = engine
        .evaluate_batch(&[tu::float_reading(1, 85.0), tu::float_reading(2, 4.0)], &current)
        .await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].state, AlarmState::Cleared);
}

#[tokio::test]
async fn latched_rule_holds_until_acknowledged() {
    let mut rule = tu::high_rule(5, 100, 80.0, 2.0);
    rule.latched = true;
    let (engine, store) = engine_with_rules(vec![rule]);
    let current = CurrentValueStore::new();

    let events = engine.evaluate_batch(&[tu::float_reading(100, 90.0)], &current).await;
    assert_eq!(events.len(), 1);
    let occurrence_id = events[0].occurrence_id;

    // Condition recovers; latched alarm stays open, no clear event.
    let events = engine.evaluate_batch(&[tu::float_reading(100, 50.0)], &current).await;
    assert!(events.is_empty());
    assert_eq!(store.occurrence(occurrence_id).unwrap().state, AlarmState::Active);

    // Acknowledgement releases the latch: ack event, then clear event.
    let events = engine.acknowledge(occurrence_id, "operator", Some("seen".into())).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].state, AlarmState::Acknowledged);
    assert_eq!(events[1].state, AlarmState::Cleared);
    assert_eq!(store.occurrence(occurrence_id).unwrap().state, AlarmState::Cleared);
}

#[tokio::test]
async fn one_open_occurrence_per_rule() {
    let (engine, store) = engine_with_rules(vec![tu::high_rule(6, 100, 80.0, 2.0)]);
    let current = CurrentValueStore::new();

    // Repeatedly over threshold: still one occurrence.
    for v in [85.0, 86.0, 90.0, 99.0] {
        engine.evaluate_batch(&[tu::float_reading(100, v)], &current).await;
    }
    let occs = store.occurrences_for_rule(gridflow_protocol::RuleId::new(6));
    assert_eq!(occs.len(), 1);
    assert!(occs[0].state.is_open());

    // Clear and re-fire: a second occurrence, first one closed.
    engine.evaluate_batch(&[tu::float_reading(100, 50.0)], &current).await;
    engine.evaluate_batch(&[tu::float_reading(100, 95.0)], &current).await;
    let occs = store.occurrences_for_rule(gridflow_protocol::RuleId::new(6));
    assert_eq!(occs.len(), 2);
    let open: Vec<_> = occs.iter().filter(|o| o.state.is_open()).collect();
    assert_eq!(open.len(), 1);
}

#[tokio::test]
async fn suppression_gate_point_mutes_notifications() {
    let mut rule = tu::high_rule(7, 100, 80.0, 2.0);
    rule.suppression = Some(serde_json::json!({ "while_gate_point": "maintenance_mode" }));
    let (engine, store) = engine_with_rules(vec![rule]);
    engine.set_point_meta(vec![meta(100, "temp"), meta(50, "maintenance_mode")]);
    let current = CurrentValueStore::new();

    // Gate true: firing records a suppressed occurrence, publishes nothing.
    let batch = vec![tu::bool_reading(50, true), tu::float_reading(100, 90.0)];
    let events = engine.evaluate_batch(&batch, &current).await;
    assert!(events.is_empty());
    let occs = store.occurrences_for_rule(gridflow_protocol::RuleId::new(7));
    assert_eq!(occs.len(), 1);
    assert_eq!(occs[0].state, AlarmState::Suppressed);

    // Gate drops while the condition still holds: back to active, announced.
    let batch = vec![tu::bool_reading(50, false), tu::float_reading(100, 91.0)];
    let events = engine.evaluate_batch(&batch, &current).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].state, AlarmState::Active);
}

#[tokio::test]
async fn quality_rule_fires_on_bad_quality() {
    let mut rule = tu::high_rule(8, 100, 0.0, 0.0);
    rule.params = gridflow_protocol::RuleParams::Quality;
    let (engine, _store) = engine_with_rules(vec![rule]);
    let current = CurrentValueStore::new();

    let mut bad = tu::float_reading(100, 0.0);
    bad.quality = Quality::Bad(BadReason::ScriptError);
    let events = engine.evaluate_batch(&[bad], &current).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].state, AlarmState::Active);
    assert_eq!(events[0].trigger_condition, "quality");

    let events = engine.evaluate_batch(&[tu::float_reading(100, 1.0)], &current).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].state, AlarmState::Cleared);
}

#[tokio::test]
async fn persist_failure_still_publishes() {
    let (engine, store) = engine_with_rules(vec![tu::high_rule(9, 100, 80.0, 2.0)]);
    let current = CurrentValueStore::new();

    // All retry attempts fail; the event must still come out.
    store.fail_next_persists(10);
    let events = engine.evaluate_batch(&[tu::float_reading(100, 99.0)], &current).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].state, AlarmState::Active);
    assert!(store.occurrences_for_rule(gridflow_protocol::RuleId::new(9)).is_empty());
}

#[tokio::test]
async fn rate_of_change_is_per_second_of_dt() {
    let mut rule = tu::high_rule(10, 100, f64::MAX, 0.0);
    rule.params = gridflow_protocol::RuleParams::Analog(gridflow_protocol::AnalogParams {
        rate_of_change: Some(5.0),
        ..Default::default()
    });
    let (engine, _store) = engine_with_rules(vec![rule]);
    let current = CurrentValueStore::new();
    let t0 = Utc::now();

    // Polled feed: 2 s apart, 20 units -> 10 units/s > 5.
    engine.evaluate_batch(&[tu::float_reading_at(100, 20.0, t0)], &current).await;
    let events = engine
        .evaluate_batch(&[tu::float_reading_at(100, 40.0, t0 + ChronoDuration::seconds(2))], &current)
        .await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].trigger_condition, "rate_of_change");

    // Slow drift clears it.
    let events = engine
        .evaluate_batch(&[tu::float_reading_at(100, 41.0, t0 + ChronoDuration::seconds(12))], &current)
        .await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].state, AlarmState::Cleared);
}

#[tokio::test]
async fn event_json_roundtrip_preserves_fields() {
    let (engine, _store) = engine_with_rules(vec![tu::high_rule(11, 100, 80.0, 2.0)]);
    let current = CurrentValueStore::new();
    let events = engine.evaluate_batch(&[tu::float_reading(100, 99.0)], &current).await;
    let json = serde_json::to_string(&events[0]).unwrap();
    let back: gridflow_protocol::AlarmEvent = serde_json::from_str(&json).unwrap();
    assert_eq!(back, events[0]);
}

#[tokio::test]
async fn pulse_rule_fires_and_clears_in_one_batch() {
    let (engine, store) =
        engine_with_rules(vec![tu::digital_rule(12, 200, DigitalTrigger::OnChange)]);
    let current = CurrentValueStore::new();

    engine.evaluate_batch(&[tu::bool_reading(200, false)], &current).await;
    let events = engine.evaluate_batch(&[tu::bool_reading(200, true)], &current).await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].state, AlarmState::Active);
    assert_eq!(events[1].state, AlarmState::Cleared);

    // The pulse closed its occurrence in the store too.
    let occs = store.occurrences_for_rule(gridflow_protocol::RuleId::new(12));
    assert_eq!(occs.len(), 1);
    assert_eq!(occs[0].state, AlarmState::Cleared);

    // The next change pulses again.
    let events = engine.evaluate_batch(&[tu::bool_reading(200, false)], &current).await;
    assert_eq!(events.len(), 2);
}

#[tokio::test]
async fn compound_rule_follows_member_occurrences() {
    let mut compound = tu::high_rule(30, 0, 0.0, 0.0);
    compound.target = gridflow_protocol::AlarmTarget::Group("plant".into());
    compound.params = gridflow_protocol::RuleParams::Compound {
        require_all: true,
        rules: vec![gridflow_protocol::RuleId::new(31), gridflow_protocol::RuleId::new(32)],
    };
    let (engine, _store) = engine_with_rules(vec![
        compound,
        tu::high_rule(31, 100, 80.0, 0.0),
        tu::high_rule(32, 101, 80.0, 0.0),
    ]);
    let current = CurrentValueStore::new();

    // Only one member open: no compound event.
    let events = engine.evaluate_batch(&[tu::float_reading(100, 90.0)], &current).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].rule_id, gridflow_protocol::RuleId::new(31));

    // Both open: the compound fires too.
    let events = engine.evaluate_batch(&[tu::float_reading(101, 95.0)], &current).await;
    let compound_fired: Vec<_> = events
        .iter()
        .filter(|e| e.rule_id == gridflow_protocol::RuleId::new(30))
        .collect();
    assert_eq!(compound_fired.len(), 1);
    assert_eq!(compound_fired[0].trigger_condition, "compound");

    // One member clears: require_all no longer holds, the compound clears.
    let events = engine.evaluate_batch(&[tu::float_reading(100, 10.0)], &current).await;
    let compound_cleared: Vec<_> = events
        .iter()
        .filter(|e| e.rule_id == gridflow_protocol::RuleId::new(30))
        .collect();
    assert_eq!(compound_cleared.len(), 1);
    assert_eq!(compound_cleared[0].state, AlarmState::Cleared);
}

#[tokio::test]
async fn repeated_fires_escalate_severity() {
    // Severity medium escalates to high on the third fire inside the window.
    let mut rule = tu::high_rule(33, 100, 80.0, 0.0);
    rule.severity = Severity::Medium;
    let (engine, _store) = engine_with_rules(vec![rule]);
    let current = CurrentValueStore::new();

    let mut severities = Vec::new();
    for _ in 0..3 {
        let fired = engine.evaluate_batch(&[tu::float_reading(100, 90.0)], &current).await;
        severities.push(fired[0].severity);
        engine.evaluate_batch(&[tu::float_reading(100, 10.0)], &current).await;
    }
    assert_eq!(severities[0], Severity::Medium);
    assert_eq!(severities[1], Severity::Medium);
    assert_eq!(severities[2], Severity::High);
}

#[tokio::test]
async fn operator_suppression_quiets_a_rule_for_the_duration() {
    let (engine, store) = engine_with_rules(vec![tu::high_rule(34, 100, 80.0, 2.0)]);
    let current = CurrentValueStore::new();

    engine
        .suppress_rule(gridflow_protocol::RuleId::new(34), std::time::Duration::from_secs(3_600))
        .await
        .unwrap();

    // Fires while suppressed: recorded, not announced.
    let events = engine.evaluate_batch(&[tu::float_reading(100, 95.0)], &current).await;
    assert!(events.is_empty());
    let occs = store.occurrences_for_rule(gridflow_protocol::RuleId::new(34));
    assert_eq!(occs.len(), 1);
    assert_eq!(occs[0].state, AlarmState::Suppressed);

    // Clearing while suppressed publishes the cleared event.
    let events = engine.evaluate_batch(&[tu::float_reading(100, 10.0)], &current).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].state, AlarmState::Cleared);
}

#[tokio::test]
async fn shelve_then_clear() {
    let (engine, store) = engine_with_rules(vec![tu::high_rule(35, 100, 80.0, 2.0)]);
    let current = CurrentValueStore::new();

    let events = engine.evaluate_batch(&[tu::float_reading(100, 95.0)], &current).await;
    let occurrence_id = events[0].occurrence_id;

    let event = engine.shelve_occurrence(occurrence_id).await.unwrap();
    assert_eq!(event.state, AlarmState::Shelved);
    assert_eq!(store.occurrence(occurrence_id).unwrap().state, AlarmState::Shelved);

    // Shelved occurrences may still clear.
    let event = engine.clear_occurrence(occurrence_id, None, None).await.unwrap();
    assert_eq!(event.state, AlarmState::Cleared);
}

#[tokio::test]
async fn timestamped_value_evaluation_is_quality_gated() {
    let (engine, _store) = engine_with_rules(vec![tu::high_rule(13, 100, 80.0, 2.0)]);
    let current = CurrentValueStore::new();

    // A bad-quality 99 must not trip the analog threshold.
    let mut tv = tu::float_reading(100, 99.0);
    tv.quality = Quality::Bad(BadReason::CommFailure);
    let events = engine.evaluate_batch(&[tv], &current).await;
    assert!(events.is_empty());
}

#[tokio::test]
async fn operator_clear_closes_unlatched_manual_alarm() {
    let mut rule = tu::high_rule(14, 100, 80.0, 2.0);
    rule.auto_clear = false;
    let (engine, store) = engine_with_rules(vec![rule]);
    let current = CurrentValueStore::new();

    let events = engine.evaluate_batch(&[tu::float_reading(100, 95.0)], &current).await;
    let occurrence_id = events[0].occurrence_id;

    // Recovery alone does not close it (auto_clear=false).
    engine.evaluate_batch(&[tu::float_reading(100, 10.0)], &current).await;
    assert!(store.occurrence(occurrence_id).unwrap().state.is_open());

    let event = engine
        .clear_occurrence(occurrence_id, Some(Value::Float(10.0)), Some("manual".into()))
        .await
        .unwrap();
    assert_eq!(event.state, AlarmState::Cleared);
    assert_eq!(store.occurrence(occurrence_id).unwrap().state, AlarmState::Cleared);

    let timestamped = store.occurrence(occurrence_id).unwrap();
    assert!(timestamped.cleared_at.unwrap() >= timestamped.occurred_at);
}
