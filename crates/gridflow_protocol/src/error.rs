//! Protocol-layer error taxonomy.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised by the wire codecs and transports.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("connect failure: {0}")]
    ConnectFailure(String),

    #[error("read timed out after {0} ms")]
    ReadTimeout(u64),

    #[error("write timed out after {0} ms")]
    WriteTimeout(u64),

    #[error("frame too short: need {expected} bytes, got {got}")]
    FrameTooShort { expected: usize, got: usize },

    #[error("frame error: {0}")]
    FrameError(String),

    #[error("CRC mismatch: computed {computed:#06x}, received {received:#06x}")]
    CrcMismatch { computed: u16, received: u16 },

    #[error("modbus exception from slave {slave}: {exception}")]
    ModbusException { slave: u8, exception: ModbusExceptionKind },

    #[error("unexpected function code: sent {sent:#04x}, got {got:#04x}")]
    FunctionMismatch { sent: u8, got: u8 },

    #[error("transaction id mismatch: sent {sent}, got {got}")]
    TransactionMismatch { sent: u16, got: u16 },

    #[error("unsupported packet type: {0:#04x}")]
    UnsupportedPacket(u8),

    #[error("malformed packet: {0}")]
    Malformed(String),

    #[error("decode failure: {0}")]
    Decode(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Modbus exception taxonomy: the on-wire exception codes plus the
/// transport-level failures that share their handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModbusExceptionKind {
    IllegalFunction,
    IllegalAddress,
    IllegalValue,
    SlaveBusy,
    SlaveFailure,
    Timeout,
    FrameError,
}

impl ModbusExceptionKind {
    /// Map the on-wire exception code.
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => ModbusExceptionKind::IllegalFunction,
            0x02 => ModbusExceptionKind::IllegalAddress,
            0x03 => ModbusExceptionKind::IllegalValue,
            0x05 | 0x06 => ModbusExceptionKind::SlaveBusy,
            _ => ModbusExceptionKind::SlaveFailure,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ModbusExceptionKind::IllegalFunction => "illegal_function",
            ModbusExceptionKind::IllegalAddress => "illegal_address",
            ModbusExceptionKind::IllegalValue => "illegal_value",
            ModbusExceptionKind::SlaveBusy => "slave_busy",
            ModbusExceptionKind::SlaveFailure => "slave_failure",
            ModbusExceptionKind::Timeout => "timeout",
            ModbusExceptionKind::FrameError => "frame_error",
        }
    }
}

impl std::fmt::Display for ModbusExceptionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl ProtocolError {
    /// True for failures that should advance a slave's consecutive-timeout
    /// counter.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ProtocolError::ReadTimeout(_)
                | ProtocolError::WriteTimeout(_)
                | ProtocolError::ModbusException {
                    exception: ModbusExceptionKind::Timeout,
                    ..
                }
        )
    }
}
