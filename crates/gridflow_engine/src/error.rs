//! Engine error taxonomy.

use gridflow_protocol::{RuleId, VirtualPointId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid rule {rule}: {reason}")]
    InvalidRule { rule: RuleId, reason: String },

    #[error("rule {0} not found")]
    RuleNotFound(RuleId),

    #[error("occurrence {0} not found")]
    OccurrenceNotFound(i64),

    #[error("invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("virtual point {vp}: dependency cycle through {via}")]
    DependencyCycle { vp: VirtualPointId, via: VirtualPointId },

    #[error("virtual point {vp}: {reason}")]
    InvalidVirtualPoint { vp: VirtualPointId, reason: String },

    #[error("script error: {0}")]
    Script(#[from] gridflow_script::ScriptError),

    #[error("store error: {0}")]
    Store(#[from] gridflow_db::StoreError),

    #[error("sink error: {0}")]
    Sink(#[from] gridflow_sinks::SinkError),
}
