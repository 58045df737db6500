//! Polling-group construction for Modbus workers.
//!
//! Contiguous runs of the same `(slave, register type)` are merged into one
//! protocol request as long as the address gap and total span stay within
//! the device's limits and the points poll at the same interval. Group
//! creation is deterministic: same point list, same groups.

use gridflow_protocol::{DataPoint, PointAddress, PointId, RegisterType, TenantId, ValueType};
use std::time::Duration;

/// One point inside a group.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupPoint {
    pub id: PointId,
    pub tenant_id: TenantId,
    /// Register offset from the group's start address.
    pub offset: u16,
    pub value_type: ValueType,
    pub scale_factor: f64,
    pub scale_offset: f64,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
}

/// A contiguous register range read in one request.
#[derive(Debug, Clone, PartialEq)]
pub struct PollGroup {
    pub slave_id: u8,
    pub register_type: RegisterType,
    pub start: u16,
    pub count: u16,
    pub interval: Duration,
    pub points: Vec<GroupPoint>,
}

/// Build polling groups from a device's point list.
///
/// Points without a Modbus address are skipped (they belong to other
/// transports on mixed devices).
pub fn build_groups(points: &[DataPoint], max_gap: u16, max_span: u16) -> Vec<PollGroup> {
    let mut addressable: Vec<(&DataPoint, u8, RegisterType, u16)> = points
        .iter()
        .filter_map(|p| match p.address {
            PointAddress::Modbus { slave_id, register_type, address } => {
                Some((p, slave_id, register_type, address))
            }
            _ => None,
        })
        .collect();
    addressable.sort_by_key(|(p, slave, reg, addr)| (*slave, *reg, *addr, p.id));

    let max_span = max_span.max(1);
    let mut groups: Vec<PollGroup> = Vec::new();
    for (point, slave, reg, addr) in addressable {
        let interval = Duration::from_millis(point.poll_interval_ms.max(1));
        let mergeable = groups.last().is_some_and(|g| {
            let end = g.start + g.count; // first address past the group
            g.slave_id == slave
                && g.register_type == reg
                && g.interval == interval
                && addr >= end
                && addr - end <= max_gap
                && addr - g.start < max_span
        });
        if mergeable {
            let group = groups.last_mut().unwrap_or_else(|| unreachable!());
            group.count = addr - group.start + 1;
            group.points.push(group_point(point, addr - group.start));
        } else {
            groups.push(PollGroup {
                slave_id: slave,
                register_type: reg,
                start: addr,
                count: 1,
                interval,
                points: vec![group_point(point, 0)],
            });
        }
    }
    groups
}

/// Decode one 16-bit register for a point: declared type, then scaling,
/// then range check.
pub fn decode_register(gp: &GroupPoint, raw: u16) -> (gridflow_protocol::Value, gridflow_protocol::Quality) {
    use gridflow_protocol::{BadReason, Quality, Value};
    let value = match gp.value_type {
        ValueType::Bool => Value::Bool(raw != 0),
        ValueType::Int => Value::Int(i64::from(raw)),
        ValueType::Float => Value::Float(f64::from(raw)),
        ValueType::Text => Value::Text(raw.to_string()),
    };
    let scaled = value.scaled(gp.scale_factor, gp.scale_offset);
    let quality = match scaled.as_f64() {
        Some(n) => {
            let below = gp.min_value.is_some_and(|min| n < min);
            let above = gp.max_value.is_some_and(|max| n > max);
            if below || above {
                Quality::Bad(BadReason::OutOfRange)
            } else {
                Quality::Good
            }
        }
        None => Quality::Good,
    };
    (scaled, quality)
}

/// Decode one coil/discrete-input bit for a point.
pub fn decode_bit(gp: &GroupPoint, bit: bool) -> (gridflow_protocol::Value, gridflow_protocol::Quality) {
    use gridflow_protocol::{Quality, Value};
    let value = match gp.value_type {
        ValueType::Bool => Value::Bool(bit),
        ValueType::Int => Value::Int(i64::from(bit)),
        ValueType::Float => Value::Float(f64::from(u8::from(bit))),
        ValueType::Text => Value::Text(bit.to_string()),
    };
    (value, Quality::Good)
}

fn group_point(point: &DataPoint, offset: u16) -> GroupPoint {
    GroupPoint {
        id: point.id,
        tenant_id: point.tenant_id,
        offset,
        value_type: point.value_type,
        scale_factor: point.scale_factor,
        scale_offset: point.scale_offset,
        min_value: point.min_value,
        max_value: point.max_value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridflow_protocol::{AccessMode, DeviceId};

    fn point(id: i64, slave: u8, reg: RegisterType, addr: u16, interval_ms: u64) -> DataPoint {
        DataPoint {
            id: PointId::new(id),
            device_id: DeviceId::new(1),
            tenant_id: TenantId::new(1),
            name: format!("p{id}"),
            address: PointAddress::Modbus { slave_id: slave, register_type: reg, address: addr },
            value_type: ValueType::Float,
            unit: None,
            scale_factor: 1.0,
            scale_offset: 0.0,
            min_value: None,
            max_value: None,
            poll_interval_ms: interval_ms,
            access: AccessMode::Read,
            cov: false,
        }
    }

    #[test]
    fn adjacent_points_merge() {
        let points = vec![
            point(1, 1, RegisterType::Holding, 10, 1000),
            point(2, 1, RegisterType::Holding, 11, 1000),
            point(3, 1, RegisterType::Holding, 13, 1000),
        ];
        let groups = build_groups(&points, 8, 120);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].start, 10);
        assert_eq!(groups[0].count, 4);
        assert_eq!(groups[0].points.len(), 3);
        assert_eq!(groups[0].points[2].offset, 3);
    }

    #[test]
    fn gap_over_limit_splits() {
        let points = vec![
            point(1, 1, RegisterType::Holding, 0, 1000),
            point(2, 1, RegisterType::Holding, 20, 1000),
        ];
        let groups = build_groups(&points, 8, 120);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn span_limit_splits() {
        let points: Vec<DataPoint> =
            (0..10).map(|i| point(i, 1, RegisterType::Holding, (i as u16) * 2, 1000)).collect();
        let groups = build_groups(&points, 8, 10);
        assert!(groups.len() > 1);
        for g in &groups {
            assert!(g.count <= 10);
        }
    }

    #[test]
    fn slave_and_register_type_partition() {
        let points = vec![
            point(1, 1, RegisterType::Holding, 0, 1000),
            point(2, 2, RegisterType::Holding, 1, 1000),
            point(3, 1, RegisterType::Input, 2, 1000),
            point(4, 1, RegisterType::Coil, 3, 1000),
        ];
        let groups = build_groups(&points, 8, 120);
        assert_eq!(groups.len(), 4);
    }

    #[test]
    fn differing_intervals_split() {
        let points = vec![
            point(1, 1, RegisterType::Holding, 0, 1000),
            point(2, 1, RegisterType::Holding, 1, 5000),
        ];
        let groups = build_groups(&points, 8, 120);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn construction_is_deterministic() {
        let mut points = vec![
            point(3, 1, RegisterType::Holding, 13, 1000),
            point(1, 1, RegisterType::Holding, 10, 1000),
            point(2, 1, RegisterType::Holding, 11, 1000),
        ];
        let a = build_groups(&points, 8, 120);
        points.reverse();
        let b = build_groups(&points, 8, 120);
        assert_eq!(a, b);
    }

    #[test]
    fn non_modbus_points_are_skipped() {
        let mut p = point(1, 1, RegisterType::Holding, 0, 1000);
        p.address = PointAddress::Mqtt { topic: "a/b".into() };
        assert!(build_groups(&[p], 8, 120).is_empty());
    }
}
