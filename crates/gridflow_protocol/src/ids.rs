//! Canonical identifiers used across the system.
//!
//! Newtypes over integers so a device id can never be handed to an API that
//! wants a point id. All ids are assigned by the relational store.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord, Default,
        )]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            pub const fn new(value: i64) -> Self {
                Self(value)
            }

            pub const fn as_i64(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for i64 {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

define_id!(
    /// A tenant (site owner) in the multi-tenant store.
    TenantId
);
define_id!(
    /// A physical field device (PLC, meter, controller).
    DeviceId
);
define_id!(
    /// A data point: one named scalar on a device.
    PointId
);
define_id!(
    /// A derived (virtual) point computed from other points.
    VirtualPointId
);
define_id!(
    /// An alarm rule.
    RuleId
);
define_id!(
    /// A concrete alarm occurrence. Monotonic per store.
    OccurrenceId
);

/// Identifies the target a pipeline value belongs to.
///
/// Virtual points share the value pipeline with real data points; the two id
/// spaces are kept distinct so a rule on `data_point#5` never matches
/// `virtual_point#5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum PointRef {
    DataPoint(PointId),
    VirtualPoint(VirtualPointId),
}

impl PointRef {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::DataPoint(id) => id.as_i64(),
            Self::VirtualPoint(id) => id.as_i64(),
        }
    }
}

impl fmt::Display for PointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DataPoint(id) => write!(f, "dp#{id}"),
            Self::VirtualPoint(id) => write!(f, "vp#{id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_serde_is_transparent() {
        let id = PointId::new(42);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "42");
        let back: PointId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn point_ref_distinguishes_id_spaces() {
        let dp = PointRef::DataPoint(PointId::new(5));
        let vp = PointRef::VirtualPoint(VirtualPointId::new(5));
        assert_ne!(dp, vp);
        assert_eq!(dp.as_i64(), vp.as_i64());
    }
}
