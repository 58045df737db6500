//! Canonical domain model: devices, points, virtual points, alarm rules and
//! occurrences. Loaded from the relational store and cached in memory; the
//! store serialises the enum-shaped fields as JSON columns.

use crate::ids::{DeviceId, OccurrenceId, PointId, PointRef, RuleId, TenantId, VirtualPointId};
use crate::types::Protocol;
use crate::value::{Value, ValueType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Devices
// ============================================================================

/// A field device and how to reach it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub tenant_id: TenantId,
    pub name: String,
    pub protocol: Protocol,
    pub connection: ConnectionConfig,
    pub enabled: bool,
    pub location: Option<String>,
}

/// Protocol-specific connection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "transport")]
pub enum ConnectionConfig {
    ModbusTcp(ModbusTcpParams),
    ModbusRtu(ModbusRtuParams),
    Bacnet(BacnetParams),
    Mqtt(MqttParams),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModbusTcpParams {
    pub host: String,
    #[serde(default = "default_modbus_port")]
    pub port: u16,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    /// Overall response timeout per request.
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// Max time between two bytes of one response.
    #[serde(default = "default_byte_timeout_ms")]
    pub byte_timeout_ms: u64,
    #[serde(default)]
    pub inter_frame_delay_ms: u64,
    /// Consecutive timeouts before the slave is demoted offline.
    #[serde(default = "default_offline_threshold")]
    pub offline_threshold: u32,
    #[serde(default = "default_max_gap")]
    pub max_group_gap: u16,
    #[serde(default = "default_max_registers")]
    pub max_registers_per_group: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModbusRtuParams {
    pub serial_port: String,
    #[serde(default = "default_baud")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default)]
    pub parity: SerialParity,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// Minimum quiet time after every exchange on the shared bus.
    #[serde(default = "default_inter_frame_delay_ms")]
    pub inter_frame_delay_ms: u64,
    #[serde(default = "default_offline_threshold")]
    pub offline_threshold: u32,
    #[serde(default = "default_max_gap")]
    pub max_group_gap: u16,
    #[serde(default = "default_max_registers")]
    pub max_registers_per_group: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SerialParity {
    #[default]
    None,
    Even,
    Odd,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacnetParams {
    /// Local UDP bind address, e.g. "0.0.0.0:47808".
    #[serde(default = "default_bacnet_bind")]
    pub bind: String,
    /// Broadcast address for Who-Is.
    pub broadcast: String,
    /// BACnet device instance this gridflow device maps to. When absent,
    /// the worker reads from the first device discovery finds.
    #[serde(default)]
    pub device_instance: Option<u32>,
    #[serde(default = "default_discovery_interval_secs")]
    pub discovery_interval_secs: u64,
    /// Inclusive device-instance range probed by Who-Is keep-alives.
    #[serde(default)]
    pub device_range: Option<(u32, u32)>,
    #[serde(default = "default_cov_lifetime_secs")]
    pub cov_lifetime_secs: u32,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttParams {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u16,
    #[serde(default)]
    pub last_will: Option<LastWill>,
    /// Enables the priority publish queue, circuit breaker, offline buffer,
    /// duplicate filter and broker failover.
    #[serde(default)]
    pub production_mode: bool,
    #[serde(default)]
    pub backup_brokers: Vec<String>,
    pub subscriptions: Vec<MqttSubscription>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastWill {
    pub topic: String,
    pub payload: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
}

/// Binds a topic pattern to the data points its payloads feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttSubscription {
    pub topic: String,
    #[serde(default)]
    pub qos: u8,
    /// Dotted path into the JSON payload; empty selects the root value.
    #[serde(default)]
    pub json_path: String,
    pub data_points: Vec<PointId>,
}

fn default_modbus_port() -> u16 {
    502
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_unit_id() -> u8 {
    1
}
fn default_response_timeout_ms() -> u64 {
    1_000
}
fn default_byte_timeout_ms() -> u64 {
    200
}
fn default_inter_frame_delay_ms() -> u64 {
    5
}
fn default_offline_threshold() -> u32 {
    3
}
fn default_max_gap() -> u16 {
    8
}
fn default_max_registers() -> u16 {
    120
}
fn default_baud() -> u32 {
    9600
}
fn default_data_bits() -> u8 {
    8
}
fn default_stop_bits() -> u8 {
    1
}
fn default_bacnet_bind() -> String {
    "0.0.0.0:47808".to_string()
}
fn default_discovery_interval_secs() -> u64 {
    300
}
fn default_cov_lifetime_secs() -> u32 {
    600
}
fn default_keep_alive_secs() -> u16 {
    30
}

// ============================================================================
// Data points
// ============================================================================

/// Modbus register class, selecting the function code used to read it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterType {
    Coil,
    DiscreteInput,
    Holding,
    Input,
}

impl RegisterType {
    pub fn is_writable(&self) -> bool {
        matches!(self, RegisterType::Coil | RegisterType::Holding)
    }
}

/// BACnet object classes the collector enumerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BacnetObjectType {
    AnalogInput,
    AnalogOutput,
    AnalogValue,
    BinaryInput,
    BinaryOutput,
    BinaryValue,
    MultiStateInput,
    MultiStateOutput,
    MultiStateValue,
}

impl BacnetObjectType {
    /// BACnet object-type number per the standard object table.
    pub fn type_number(&self) -> u16 {
        match self {
            BacnetObjectType::AnalogInput => 0,
            BacnetObjectType::AnalogOutput => 1,
            BacnetObjectType::AnalogValue => 2,
            BacnetObjectType::BinaryInput => 3,
            BacnetObjectType::BinaryOutput => 4,
            BacnetObjectType::BinaryValue => 5,
            BacnetObjectType::MultiStateInput => 13,
            BacnetObjectType::MultiStateOutput => 14,
            BacnetObjectType::MultiStateValue => 19,
        }
    }

    pub fn from_type_number(n: u16) -> Option<Self> {
        Some(match n {
            0 => BacnetObjectType::AnalogInput,
            1 => BacnetObjectType::AnalogOutput,
            2 => BacnetObjectType::AnalogValue,
            3 => BacnetObjectType::BinaryInput,
            4 => BacnetObjectType::BinaryOutput,
            5 => BacnetObjectType::BinaryValue,
            13 => BacnetObjectType::MultiStateInput,
            14 => BacnetObjectType::MultiStateOutput,
            19 => BacnetObjectType::MultiStateValue,
            _ => return None,
        })
    }

    pub fn is_binary(&self) -> bool {
        matches!(
            self,
            BacnetObjectType::BinaryInput | BacnetObjectType::BinaryOutput | BacnetObjectType::BinaryValue
        )
    }
}

/// Where a point lives inside its device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "proto")]
pub enum PointAddress {
    Modbus {
        slave_id: u8,
        register_type: RegisterType,
        address: u16,
    },
    Bacnet {
        object_type: BacnetObjectType,
        instance: u32,
    },
    Mqtt {
        /// Concrete topic the value arrives on (informational; routing is
        /// done through the device's subscription bindings).
        topic: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

impl AccessMode {
    pub fn readable(&self) -> bool {
        matches!(self, AccessMode::Read | AccessMode::ReadWrite)
    }

    pub fn writable(&self) -> bool {
        matches!(self, AccessMode::Write | AccessMode::ReadWrite)
    }
}

/// A named scalar on a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub id: PointId,
    pub device_id: DeviceId,
    pub tenant_id: TenantId,
    pub name: String,
    pub address: PointAddress,
    pub value_type: ValueType,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default = "default_scale_factor")]
    pub scale_factor: f64,
    #[serde(default)]
    pub scale_offset: f64,
    #[serde(default)]
    pub min_value: Option<f64>,
    #[serde(default)]
    pub max_value: Option<f64>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    pub access: AccessMode,
    /// BACnet: subscribe for change-of-value notifications instead of polling.
    #[serde(default)]
    pub cov: bool,
}

fn default_scale_factor() -> f64 {
    1.0
}
fn default_poll_interval_ms() -> u64 {
    1_000
}

impl DataPoint {
    /// True when `v` violates the configured range.
    pub fn out_of_range(&self, v: &Value) -> bool {
        let Some(n) = v.as_f64() else { return false };
        if let Some(min) = self.min_value {
            if n < min {
                return true;
            }
        }
        if let Some(max) = self.max_value {
            if n > max {
                return true;
            }
        }
        false
    }
}

// ============================================================================
// Virtual points
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VirtualScope {
    Global,
    Site,
    Device,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    #[default]
    OnChange,
    Periodic,
    Manual,
}

/// What a formula input name is bound to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "source")]
pub enum InputBinding {
    DataPoint { id: PointId },
    VirtualPoint { id: VirtualPointId },
    Constant { value: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualInput {
    /// Variable name the formula refers to.
    pub name: String,
    pub binding: InputBinding,
}

/// A derived point computed from other points via a formula.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualPoint {
    pub id: VirtualPointId,
    pub tenant_id: TenantId,
    pub scope: VirtualScope,
    pub name: String,
    pub formula: String,
    pub value_type: ValueType,
    #[serde(default)]
    pub unit: Option<String>,
    pub inputs: Vec<VirtualInput>,
    #[serde(default)]
    pub trigger: TriggerMode,
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_cache_ttl_ms() -> u64 {
    5_000
}
fn default_true() -> bool {
    true
}

impl VirtualPoint {
    /// Point refs this virtual point depends on (constants excluded).
    pub fn dependencies(&self) -> impl Iterator<Item = PointRef> + '_ {
        self.inputs.iter().filter_map(|input| match input.binding {
            InputBinding::DataPoint { id } => Some(PointRef::DataPoint(id)),
            InputBinding::VirtualPoint { id } => Some(PointRef::VirtualPoint(id)),
            InputBinding::Constant { .. } => None,
        })
    }
}

// ============================================================================
// Alarm rules
// ============================================================================

/// Severity, ordered worst-first: critical > high > medium > low > info.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl Severity {
    pub fn name(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Info => "info",
        }
    }

    /// One step worse, saturating at critical. Used by escalation policies.
    pub fn escalated(&self) -> Severity {
        match self {
            Severity::Critical | Severity::High => Severity::Critical,
            Severity::Medium => Severity::High,
            Severity::Low => Severity::Medium,
            Severity::Info => Severity::Low,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "medium" => Severity::Medium,
            "low" => Severity::Low,
            "info" => Severity::Info,
            other => return Err(format!("unknown severity: {other}")),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmState {
    Active,
    Acknowledged,
    Cleared,
    Suppressed,
    Shelved,
    Inactive,
}

impl AlarmState {
    /// Allowed occurrence state transitions. `Cleared` and `Inactive` are
    /// terminal for an occurrence.
    pub fn can_transition_to(&self, next: AlarmState) -> bool {
        use AlarmState::*;
        matches!(
            (self, next),
            (Active, Acknowledged)
                | (Active, Cleared)
                | (Active, Suppressed)
                | (Active, Shelved)
                | (Acknowledged, Cleared)
                | (Suppressed, Active)
                | (Suppressed, Cleared)
                | (Shelved, Active)
                | (Shelved, Cleared)
        )
    }

    /// States that count against the one-open-occurrence-per-rule invariant.
    pub fn is_open(&self) -> bool {
        !matches!(self, AlarmState::Cleared | AlarmState::Inactive)
    }

    pub fn name(&self) -> &'static str {
        match self {
            AlarmState::Active => "active",
            AlarmState::Acknowledged => "acknowledged",
            AlarmState::Cleared => "cleared",
            AlarmState::Suppressed => "suppressed",
            AlarmState::Shelved => "shelved",
            AlarmState::Inactive => "inactive",
        }
    }
}

impl std::fmt::Display for AlarmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for AlarmState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "active" => AlarmState::Active,
            "acknowledged" => AlarmState::Acknowledged,
            "cleared" => AlarmState::Cleared,
            "suppressed" => AlarmState::Suppressed,
            "shelved" => AlarmState::Shelved,
            "inactive" => AlarmState::Inactive,
            other => return Err(format!("unknown alarm state: {other}")),
        })
    }
}

/// What a rule watches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "target_type", content = "target")]
pub enum AlarmTarget {
    Device(DeviceId),
    DataPoint(PointId),
    VirtualPoint(VirtualPointId),
    Group(String),
}

impl AlarmTarget {
    pub fn type_name(&self) -> &'static str {
        match self {
            AlarmTarget::Device(_) => "device",
            AlarmTarget::DataPoint(_) => "data_point",
            AlarmTarget::VirtualPoint(_) => "virtual_point",
            AlarmTarget::Group(_) => "group",
        }
    }
}

/// Digital edge/level trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigitalTrigger {
    OnTrue,
    OnFalse,
    OnChange,
    OnRising,
    OnFalling,
}

/// Analog thresholds. All four levels optional; deadband applies on the way
/// back to normal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AnalogParams {
    #[serde(default)]
    pub high_high: Option<f64>,
    #[serde(default)]
    pub high: Option<f64>,
    #[serde(default)]
    pub low: Option<f64>,
    #[serde(default)]
    pub low_low: Option<f64>,
    #[serde(default)]
    pub deadband: f64,
    /// Units per second; compared against `|v - v_prev| / dt`.
    #[serde(default)]
    pub rate_of_change: Option<f64>,
}

/// Type-specific rule parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum RuleParams {
    Analog(AnalogParams),
    Digital { trigger: DigitalTrigger },
    Script {
        condition: String,
        #[serde(default)]
        message_script: Option<String>,
    },
    /// Fires while the target's quality reports a communication failure.
    Communication,
    /// Fires while the target's quality is bad for any reason.
    Quality,
    /// Fires when the referenced rules are simultaneously open.
    Compound {
        #[serde(default)]
        require_all: bool,
        rules: Vec<RuleId>,
    },
}

impl RuleParams {
    pub fn type_name(&self) -> &'static str {
        match self {
            RuleParams::Analog(_) => "analog",
            RuleParams::Digital { .. } => "digital",
            RuleParams::Script { .. } => "script",
            RuleParams::Communication => "communication",
            RuleParams::Quality => "quality",
            RuleParams::Compound { .. } => "compound",
        }
    }
}

/// A user-defined alarm rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmRule {
    pub id: RuleId,
    pub tenant_id: TenantId,
    pub name: String,
    pub target: AlarmTarget,
    pub params: RuleParams,
    pub severity: Severity,
    /// Lower is more important; used for occurrence ordering in views.
    #[serde(default)]
    pub priority: i32,
    /// Template with `{point}`, `{value}`, `{threshold}`, `{condition}`
    /// placeholders.
    #[serde(default)]
    pub message_template: Option<String>,
    #[serde(default)]
    pub auto_acknowledge: bool,
    #[serde(default)]
    pub auto_ack_timeout_secs: Option<u64>,
    #[serde(default = "default_true")]
    pub auto_clear: bool,
    #[serde(default)]
    pub latched: bool,
    /// Raw suppression policy; parsed by the alarm engine.
    #[serde(default)]
    pub suppression: Option<serde_json::Value>,
    #[serde(default)]
    pub notification_channels: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub template_id: Option<i64>,
}

// ============================================================================
// Alarm occurrences
// ============================================================================

/// A concrete instance of an alarm firing. Created by the alarm engine and
/// persisted; at most one open occurrence exists per rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmOccurrence {
    pub id: OccurrenceId,
    pub rule_id: RuleId,
    pub tenant_id: TenantId,
    pub occurred_at: DateTime<Utc>,
    pub trigger_value: Value,
    /// Tag of the condition that fired, e.g. "high", "on_rising".
    pub condition: String,
    pub message: String,
    pub severity: Severity,
    pub state: AlarmState,
    #[serde(default)]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub acknowledged_by: Option<String>,
    #[serde(default)]
    pub ack_comment: Option<String>,
    #[serde(default)]
    pub cleared_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cleared_value: Option<Value>,
    #[serde(default)]
    pub clear_comment: Option<String>,
    /// JSON snapshot of evaluation context at fire time.
    #[serde(default)]
    pub context: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_worst_first() {
        assert!(Severity::Critical < Severity::High);
        assert!(Severity::High < Severity::Info);
        assert_eq!(Severity::Low.escalated(), Severity::Medium);
        assert_eq!(Severity::Critical.escalated(), Severity::Critical);
    }

    #[test]
    fn state_machine_rejects_terminal_exits() {
        assert!(AlarmState::Active.can_transition_to(AlarmState::Acknowledged));
        assert!(AlarmState::Acknowledged.can_transition_to(AlarmState::Cleared));
        assert!(AlarmState::Suppressed.can_transition_to(AlarmState::Active));
        assert!(!AlarmState::Cleared.can_transition_to(AlarmState::Active));
        assert!(!AlarmState::Inactive.can_transition_to(AlarmState::Active));
        assert!(!AlarmState::Acknowledged.can_transition_to(AlarmState::Active));
    }

    #[test]
    fn open_states() {
        assert!(AlarmState::Active.is_open());
        assert!(AlarmState::Suppressed.is_open());
        assert!(!AlarmState::Cleared.is_open());
    }

    #[test]
    fn out_of_range_check() {
        let dp = DataPoint {
            id: PointId::new(1),
            device_id: DeviceId::new(1),
            tenant_id: TenantId::new(1),
            name: "temp".into(),
            address: PointAddress::Modbus {
                slave_id: 1,
                register_type: RegisterType::Holding,
                address: 0,
            },
            value_type: ValueType::Float,
            unit: None,
            scale_factor: 1.0,
            scale_offset: 0.0,
            min_value: Some(-40.0),
            max_value: Some(120.0),
            poll_interval_ms: 1_000,
            access: AccessMode::Read,
            cov: false,
        };
        assert!(!dp.out_of_range(&Value::Float(21.0)));
        assert!(dp.out_of_range(&Value::Float(150.0)));
        assert!(dp.out_of_range(&Value::Float(-41.0)));
    }

    #[test]
    fn rule_params_json_shape() {
        let params = RuleParams::Analog(AnalogParams {
            high: Some(80.0),
            deadband: 2.0,
            ..Default::default()
        });
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["type"], "analog");
        assert_eq!(json["high"], 80.0);
        let back: RuleParams = serde_json::from_value(json).unwrap();
        assert_eq!(back, params);
    }
}
