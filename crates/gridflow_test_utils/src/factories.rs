//! Factories for the domain objects tests keep constructing.

use chrono::{DateTime, Utc};
use gridflow_protocol::{
    AccessMode, AlarmOccurrence, AlarmRule, AlarmState, AlarmTarget, AnalogParams,
    ConnectionConfig, DataPoint, Device, DeviceId, DigitalTrigger, InputBinding, ModbusTcpParams,
    OccurrenceId, PointAddress, PointId, PointRef, Protocol, Quality, RegisterType, RuleId,
    RuleParams, Severity, TenantId, TimestampedValue, TriggerMode, Value, ValueType, VirtualInput,
    VirtualPoint, VirtualPointId, VirtualScope,
};

pub const TENANT: TenantId = TenantId::new(1);

pub fn modbus_device(id: i64) -> Device {
    Device {
        id: DeviceId::new(id),
        tenant_id: TENANT,
        name: format!("device-{id}"),
        protocol: Protocol::ModbusTcp,
        connection: ConnectionConfig::ModbusTcp(ModbusTcpParams {
            host: "127.0.0.1".into(),
            port: 502,
            unit_id: 1,
            response_timeout_ms: 1_000,
            byte_timeout_ms: 200,
            inter_frame_delay_ms: 0,
            offline_threshold: 3,
            max_group_gap: 8,
            max_registers_per_group: 120,
        }),
        enabled: true,
        location: None,
    }
}

pub fn float_point(id: i64, device: i64, name: &str) -> DataPoint {
    DataPoint {
        id: PointId::new(id),
        device_id: DeviceId::new(device),
        tenant_id: TENANT,
        name: name.into(),
        address: PointAddress::Modbus {
            slave_id: 1,
            register_type: RegisterType::Holding,
            address: id as u16,
        },
        value_type: ValueType::Float,
        unit: None,
        scale_factor: 1.0,
        scale_offset: 0.0,
        min_value: None,
        max_value: None,
        poll_interval_ms: 1_000,
        access: AccessMode::ReadWrite,
        cov: false,
    }
}

pub fn bool_point(id: i64, device: i64, name: &str) -> DataPoint {
    DataPoint {
        value_type: ValueType::Bool,
        address: PointAddress::Modbus {
            slave_id: 1,
            register_type: RegisterType::Coil,
            address: id as u16,
        },
        ..float_point(id, device, name)
    }
}

/// Analog rule with a single high threshold.
pub fn high_rule(id: i64, point: i64, high: f64, deadband: f64) -> AlarmRule {
    AlarmRule {
        id: RuleId::new(id),
        tenant_id: TENANT,
        name: format!("rule-{id}"),
        target: AlarmTarget::DataPoint(PointId::new(point)),
        params: RuleParams::Analog(AnalogParams {
            high: Some(high),
            deadband,
            ..Default::default()
        }),
        severity: Severity::High,
        priority: 0,
        message_template: None,
        auto_acknowledge: false,
        auto_ack_timeout_secs: None,
        auto_clear: true,
        latched: false,
        suppression: None,
        notification_channels: Vec::new(),
        enabled: true,
        template_id: None,
    }
}

pub fn digital_rule(id: i64, point: i64, trigger: DigitalTrigger) -> AlarmRule {
    AlarmRule {
        target: AlarmTarget::DataPoint(PointId::new(point)),
        params: RuleParams::Digital { trigger },
        severity: Severity::Medium,
        ..high_rule(id, point, 0.0, 0.0)
    }
}

pub fn script_rule(id: i64, point: i64, condition: &str) -> AlarmRule {
    AlarmRule {
        target: AlarmTarget::DataPoint(PointId::new(point)),
        params: RuleParams::Script { condition: condition.into(), message_script: None },
        ..high_rule(id, point, 0.0, 0.0)
    }
}

/// Rule targeting a virtual point.
pub fn vp_high_rule(id: i64, vp: i64, high: f64) -> AlarmRule {
    AlarmRule {
        target: AlarmTarget::VirtualPoint(VirtualPointId::new(vp)),
        ..high_rule(id, 0, high, 0.0)
    }
}

/// `vp = a + b` over two data points.
pub fn sum_vp(id: i64, a: i64, b: i64) -> VirtualPoint {
    VirtualPoint {
        id: VirtualPointId::new(id),
        tenant_id: TENANT,
        scope: VirtualScope::Global,
        name: format!("vp-{id}"),
        formula: "a + b".into(),
        value_type: ValueType::Float,
        unit: Some("kW".into()),
        inputs: vec![
            VirtualInput { name: "a".into(), binding: InputBinding::DataPoint { id: PointId::new(a) } },
            VirtualInput { name: "b".into(), binding: InputBinding::DataPoint { id: PointId::new(b) } },
        ],
        trigger: TriggerMode::OnChange,
        cache_ttl_ms: 5_000,
        enabled: true,
    }
}

pub fn float_reading(point: i64, value: f64) -> TimestampedValue {
    TimestampedValue::new(
        PointRef::DataPoint(PointId::new(point)),
        TENANT,
        Value::Float(value),
        Quality::Good,
    )
}

pub fn float_reading_at(point: i64, value: f64, ts: DateTime<Utc>) -> TimestampedValue {
    float_reading(point, value).with_source_timestamp(ts)
}

pub fn bool_reading(point: i64, value: bool) -> TimestampedValue {
    TimestampedValue::new(
        PointRef::DataPoint(PointId::new(point)),
        TENANT,
        Value::Bool(value),
        Quality::Good,
    )
}

pub fn active_occurrence(rule: i64) -> AlarmOccurrence {
    AlarmOccurrence {
        id: OccurrenceId::new(0),
        rule_id: RuleId::new(rule),
        tenant_id: TENANT,
        occurred_at: Utc::now(),
        trigger_value: Value::Float(99.0),
        condition: "high".into(),
        message: "test alarm".into(),
        severity: Severity::High,
        state: AlarmState::Active,
        acknowledged_at: None,
        acknowledged_by: None,
        ack_comment: None,
        cleared_at: None,
        cleared_value: None,
        clear_comment: None,
        context: serde_json::json!({}),
    }
}
