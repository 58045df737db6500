//! Core types and wire codecs for the gridflow telemetry collector.
//!
//! Everything the crates agree on lives here: canonical ids, the tagged value
//! union, pipeline message types, the domain model, published event shapes,
//! shared defaults, and the byte codecs for the three field protocols
//! (Modbus TCP/RTU, BACnet/IP, MQTT v3.1.1).

pub mod bacnet;
pub mod defaults;
pub mod error;
pub mod events;
pub mod ids;
pub mod model;
pub mod modbus;
pub mod mqtt;
pub mod types;
pub mod value;

pub use error::{ModbusExceptionKind, ProtocolError};
pub use events::{channels, AlarmEvent, ValueChangedEvent};
pub use ids::{
    DeviceId, OccurrenceId, PointId, PointRef, RuleId, TenantId, VirtualPointId,
};
pub use model::{
    AccessMode, AlarmOccurrence, AlarmRule, AlarmState, AlarmTarget, AnalogParams,
    BacnetObjectType, BacnetParams, ConnectionConfig, DataPoint, Device, DigitalTrigger,
    InputBinding, LastWill, ModbusRtuParams, ModbusTcpParams, MqttParams, MqttSubscription,
    PointAddress, RegisterType, RuleParams, SerialParity, Severity, TriggerMode, VirtualInput,
    VirtualPoint, VirtualScope,
};
pub use types::{
    ChangeFlags, DeviceDataMessage, Priority, Protocol, TimestampedValue,
};
pub use value::{BadReason, Quality, Value, ValueType};
