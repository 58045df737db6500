//! SQLite implementation of the store contract.
//!
//! Raw parameterised SQL over an sqlx pool. Enum-shaped columns are stored
//! as JSON (`target`, `params`, `address`, ...) or as plain name strings
//! (`severity`, `state`); timestamps are RFC3339 TEXT.

use crate::error::{Result, StoreError};
use crate::schema;
use crate::store::{OccurrenceFilter, OccurrenceUpdate, RelationalStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gridflow_protocol::{
    AccessMode, AlarmOccurrence, AlarmRule, AlarmState, AlarmTarget, ConnectionConfig, DataPoint,
    Device, DeviceId, OccurrenceId, PointAddress, PointId, Protocol, RuleId, RuleParams, Severity,
    TenantId, TriggerMode, ValueType, VirtualInput, VirtualPoint, VirtualPointId, VirtualScope,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, Row, SqlitePool};
use std::str::FromStr;
use tracing::info;

/// SQLite-backed relational store.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) and bootstrap the schema.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true);
        // In-memory databases are per-connection; give them a single one so
        // every query sees the same schema.
        let max_connections = if url.contains(":memory:") { 1 } else { 8 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        schema::init_schema(&pool).await?;
        info!("Connected to store: {url}");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Seeding (used by tests and the admin surface)
    // ------------------------------------------------------------------

    pub async fn upsert_device(&self, device: &Device) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO gf_devices (id, tenant_id, name, protocol, connection, enabled, location)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                tenant_id = excluded.tenant_id,
                name = excluded.name,
                protocol = excluded.protocol,
                connection = excluded.connection,
                enabled = excluded.enabled,
                location = excluded.location
            "#,
        )
        .bind(device.id.as_i64())
        .bind(device.tenant_id.as_i64())
        .bind(&device.name)
        .bind(device.protocol.name())
        .bind(serde_json::to_string(&device.connection)?)
        .bind(device.enabled)
        .bind(&device.location)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_datapoint(&self, point: &DataPoint) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO gf_data_points
                (id, device_id, tenant_id, name, address, value_type, unit,
                 scale_factor, scale_offset, min_value, max_value,
                 poll_interval_ms, access, cov)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                device_id = excluded.device_id,
                tenant_id = excluded.tenant_id,
                name = excluded.name,
                address = excluded.address,
                value_type = excluded.value_type,
                unit = excluded.unit,
                scale_factor = excluded.scale_factor,
                scale_offset = excluded.scale_offset,
                min_value = excluded.min_value,
                max_value = excluded.max_value,
                poll_interval_ms = excluded.poll_interval_ms,
                access = excluded.access,
                cov = excluded.cov
            "#,
        )
        .bind(point.id.as_i64())
        .bind(point.device_id.as_i64())
        .bind(point.tenant_id.as_i64())
        .bind(&point.name)
        .bind(serde_json::to_string(&point.address)?)
        .bind(json_name(&point.value_type)?)
        .bind(&point.unit)
        .bind(point.scale_factor)
        .bind(point.scale_offset)
        .bind(point.min_value)
        .bind(point.max_value)
        .bind(point.poll_interval_ms as i64)
        .bind(json_name(&point.access)?)
        .bind(point.cov)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_virtualpoint(&self, vp: &VirtualPoint) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO gf_virtual_points
                (id, tenant_id, scope, name, formula, value_type, unit, inputs,
                 trigger_mode, cache_ttl_ms, enabled)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                tenant_id = excluded.tenant_id,
                scope = excluded.scope,
                name = excluded.name,
                formula = excluded.formula,
                value_type = excluded.value_type,
                unit = excluded.unit,
                inputs = excluded.inputs,
                trigger_mode = excluded.trigger_mode,
                cache_ttl_ms = excluded.cache_ttl_ms,
                enabled = excluded.enabled
            "#,
        )
        .bind(vp.id.as_i64())
        .bind(vp.tenant_id.as_i64())
        .bind(json_name(&vp.scope)?)
        .bind(&vp.name)
        .bind(&vp.formula)
        .bind(json_name(&vp.value_type)?)
        .bind(&vp.unit)
        .bind(serde_json::to_string(&vp.inputs)?)
        .bind(json_name(&vp.trigger)?)
        .bind(vp.cache_ttl_ms as i64)
        .bind(vp.enabled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_rule(&self, rule: &AlarmRule) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO gf_alarm_rules
                (id, tenant_id, name, target, params, severity, priority,
                 message_template, auto_acknowledge, auto_ack_timeout_secs,
                 auto_clear, latched, suppression, notification_channels,
                 enabled, template_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                tenant_id = excluded.tenant_id,
                name = excluded.name,
                target = excluded.target,
                params = excluded.params,
                severity = excluded.severity,
                priority = excluded.priority,
                message_template = excluded.message_template,
                auto_acknowledge = excluded.auto_acknowledge,
                auto_ack_timeout_secs = excluded.auto_ack_timeout_secs,
                auto_clear = excluded.auto_clear,
                latched = excluded.latched,
                suppression = excluded.suppression,
                notification_channels = excluded.notification_channels,
                enabled = excluded.enabled,
                template_id = excluded.template_id
            "#,
        )
        .bind(rule.id.as_i64())
        .bind(rule.tenant_id.as_i64())
        .bind(&rule.name)
        .bind(serde_json::to_string(&rule.target)?)
        .bind(serde_json::to_string(&rule.params)?)
        .bind(rule.severity.name())
        .bind(rule.priority)
        .bind(&rule.message_template)
        .bind(rule.auto_acknowledge)
        .bind(rule.auto_ack_timeout_secs.map(|v| v as i64))
        .bind(rule.auto_clear)
        .bind(rule.latched)
        .bind(rule.suppression.as_ref().map(serde_json::Value::to_string))
        .bind(serde_json::to_string(&rule.notification_channels)?)
        .bind(rule.enabled)
        .bind(rule.template_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Serialise a unit-variant enum to its snake_case name (no quotes).
fn json_name<T: serde::Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_value(value)?;
    json.as_str()
        .map(str::to_string)
        .ok_or_else(|| StoreError::corrupt("expected string-shaped enum"))
}

fn parse_json_name<T: serde::de::DeserializeOwned>(name: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(name.to_string())).map_err(Into::into)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::corrupt(format!("timestamp {raw:?}: {e}")))
}

// ============================================================================
// Row models
// ============================================================================

#[derive(FromRow)]
struct DeviceRow {
    id: i64,
    tenant_id: i64,
    name: String,
    protocol: String,
    connection: String,
    enabled: bool,
    location: Option<String>,
}

impl TryFrom<DeviceRow> for Device {
    type Error = StoreError;

    fn try_from(row: DeviceRow) -> Result<Device> {
        let protocol: Protocol = parse_json_name(&row.protocol)?;
        let connection: ConnectionConfig = serde_json::from_str(&row.connection)?;
        Ok(Device {
            id: DeviceId::new(row.id),
            tenant_id: TenantId::new(row.tenant_id),
            name: row.name,
            protocol,
            connection,
            enabled: row.enabled,
            location: row.location,
        })
    }
}

#[derive(FromRow)]
struct DataPointRow {
    id: i64,
    device_id: i64,
    tenant_id: i64,
    name: String,
    address: String,
    value_type: String,
    unit: Option<String>,
    scale_factor: f64,
    scale_offset: f64,
    min_value: Option<f64>,
    max_value: Option<f64>,
    poll_interval_ms: i64,
    access: String,
    cov: bool,
}

impl TryFrom<DataPointRow> for DataPoint {
    type Error = StoreError;

    fn try_from(row: DataPointRow) -> Result<DataPoint> {
        let address: PointAddress = serde_json::from_str(&row.address)?;
        let value_type: ValueType = parse_json_name(&row.value_type)?;
        let access: AccessMode = parse_json_name(&row.access)?;
        Ok(DataPoint {
            id: PointId::new(row.id),
            device_id: DeviceId::new(row.device_id),
            tenant_id: TenantId::new(row.tenant_id),
            name: row.name,
            address,
            value_type,
            unit: row.unit,
            scale_factor: row.scale_factor,
            scale_offset: row.scale_offset,
            min_value: row.min_value,
            max_value: row.max_value,
            poll_interval_ms: row.poll_interval_ms.max(0) as u64,
            access,
            cov: row.cov,
        })
    }
}

#[derive(FromRow)]
struct VirtualPointRow {
    id: i64,
    tenant_id: i64,
    scope: String,
    name: String,
    formula: String,
    value_type: String,
    unit: Option<String>,
    inputs: String,
    trigger_mode: String,
    cache_ttl_ms: i64,
    enabled: bool,
}

impl TryFrom<VirtualPointRow> for VirtualPoint {
    type Error = StoreError;

    fn try_from(row: VirtualPointRow) -> Result<VirtualPoint> {
        let inputs: Vec<VirtualInput> = serde_json::from_str(&row.inputs)?;
        let scope: VirtualScope = parse_json_name(&row.scope)?;
        let value_type: ValueType = parse_json_name(&row.value_type)?;
        let trigger: TriggerMode = parse_json_name(&row.trigger_mode)?;
        Ok(VirtualPoint {
            id: VirtualPointId::new(row.id),
            tenant_id: TenantId::new(row.tenant_id),
            scope,
            name: row.name,
            formula: row.formula,
            value_type,
            unit: row.unit,
            inputs,
            trigger,
            cache_ttl_ms: row.cache_ttl_ms.max(0) as u64,
            enabled: row.enabled,
        })
    }
}

#[derive(FromRow)]
struct RuleRow {
    id: i64,
    tenant_id: i64,
    name: String,
    target: String,
    params: String,
    severity: String,
    priority: i32,
    message_template: Option<String>,
    auto_acknowledge: bool,
    auto_ack_timeout_secs: Option<i64>,
    auto_clear: bool,
    latched: bool,
    suppression: Option<String>,
    notification_channels: String,
    enabled: bool,
    template_id: Option<i64>,
}

impl TryFrom<RuleRow> for AlarmRule {
    type Error = StoreError;

    fn try_from(row: RuleRow) -> Result<AlarmRule> {
        let target: AlarmTarget = serde_json::from_str(&row.target)?;
        let params: RuleParams = serde_json::from_str(&row.params)?;
        let severity = Severity::from_str(&row.severity).map_err(StoreError::corrupt)?;
        let suppression = row
            .suppression
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        Ok(AlarmRule {
            id: RuleId::new(row.id),
            tenant_id: TenantId::new(row.tenant_id),
            name: row.name,
            target,
            params,
            severity,
            priority: row.priority,
            message_template: row.message_template,
            auto_acknowledge: row.auto_acknowledge,
            auto_ack_timeout_secs: row.auto_ack_timeout_secs.map(|v| v.max(0) as u64),
            auto_clear: row.auto_clear,
            latched: row.latched,
            suppression,
            notification_channels: serde_json::from_str(&row.notification_channels)?,
            enabled: row.enabled,
            template_id: row.template_id,
        })
    }
}

#[derive(FromRow)]
struct OccurrenceRow {
    id: i64,
    rule_id: i64,
    tenant_id: i64,
    occurred_at: String,
    trigger_value: String,
    condition: String,
    message: String,
    severity: String,
    state: String,
    acknowledged_at: Option<String>,
    acknowledged_by: Option<String>,
    ack_comment: Option<String>,
    cleared_at: Option<String>,
    cleared_value: Option<String>,
    clear_comment: Option<String>,
    context: String,
}

impl TryFrom<OccurrenceRow> for AlarmOccurrence {
    type Error = StoreError;

    fn try_from(row: OccurrenceRow) -> Result<AlarmOccurrence> {
        Ok(AlarmOccurrence {
            id: OccurrenceId::new(row.id),
            rule_id: RuleId::new(row.rule_id),
            tenant_id: TenantId::new(row.tenant_id),
            occurred_at: parse_ts(&row.occurred_at)?,
            trigger_value: serde_json::from_str(&row.trigger_value)?,
            condition: row.condition,
            message: row.message,
            severity: Severity::from_str(&row.severity).map_err(StoreError::corrupt)?,
            state: AlarmState::from_str(&row.state).map_err(StoreError::corrupt)?,
            acknowledged_at: row.acknowledged_at.as_deref().map(parse_ts).transpose()?,
            acknowledged_by: row.acknowledged_by,
            ack_comment: row.ack_comment,
            cleared_at: row.cleared_at.as_deref().map(parse_ts).transpose()?,
            cleared_value: row.cleared_value.as_deref().map(serde_json::from_str).transpose()?,
            clear_comment: row.clear_comment,
            context: serde_json::from_str(&row.context)?,
        })
    }
}

// ============================================================================
// Store contract
// ============================================================================

#[async_trait]
impl RelationalStore for SqliteStore {
    async fn list_active_devices(&self, tenant: Option<TenantId>) -> Result<Vec<Device>> {
        let rows: Vec<DeviceRow> = match tenant {
            Some(tenant) => {
                sqlx::query_as(
                    "SELECT * FROM gf_devices WHERE enabled = 1 AND tenant_id = ? ORDER BY id",
                )
                .bind(tenant.as_i64())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as("SELECT * FROM gf_devices WHERE enabled = 1 ORDER BY id")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(Device::try_from).collect()
    }

    async fn load_device(&self, id: DeviceId) -> Result<Device> {
        let row: Option<DeviceRow> = sqlx::query_as("SELECT * FROM gf_devices WHERE id = ?")
            .bind(id.as_i64())
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or_else(|| StoreError::not_found(format!("device {id}")))?
            .try_into()
    }

    async fn load_datapoints(&self, device_id: DeviceId) -> Result<Vec<DataPoint>> {
        let rows: Vec<DataPointRow> =
            sqlx::query_as("SELECT * FROM gf_data_points WHERE device_id = ? ORDER BY id")
                .bind(device_id.as_i64())
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(DataPoint::try_from).collect()
    }

    async fn load_rules(&self, tenant: TenantId) -> Result<Vec<AlarmRule>> {
        let rows: Vec<RuleRow> =
            sqlx::query_as("SELECT * FROM gf_alarm_rules WHERE tenant_id = ? ORDER BY id")
                .bind(tenant.as_i64())
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(AlarmRule::try_from).collect()
    }

    async fn load_virtualpoints(&self, tenant: TenantId) -> Result<Vec<VirtualPoint>> {
        let rows: Vec<VirtualPointRow> =
            sqlx::query_as("SELECT * FROM gf_virtual_points WHERE tenant_id = ? ORDER BY id")
                .bind(tenant.as_i64())
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(VirtualPoint::try_from).collect()
    }

    async fn persist_occurrence(&self, occ: &AlarmOccurrence) -> Result<OccurrenceId> {
        let result = sqlx::query(
            r#"
            INSERT INTO gf_alarm_occurrences
                (rule_id, tenant_id, occurred_at, trigger_value, condition,
                 message, severity, state, acknowledged_at, acknowledged_by,
                 ack_comment, cleared_at, cleared_value, clear_comment, context)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(occ.rule_id.as_i64())
        .bind(occ.tenant_id.as_i64())
        .bind(occ.occurred_at.to_rfc3339())
        .bind(serde_json::to_string(&occ.trigger_value)?)
        .bind(&occ.condition)
        .bind(&occ.message)
        .bind(occ.severity.name())
        .bind(occ.state.name())
        .bind(occ.acknowledged_at.map(|ts| ts.to_rfc3339()))
        .bind(&occ.acknowledged_by)
        .bind(&occ.ack_comment)
        .bind(occ.cleared_at.map(|ts| ts.to_rfc3339()))
        .bind(occ.cleared_value.as_ref().map(serde_json::to_string).transpose()?)
        .bind(&occ.clear_comment)
        .bind(occ.context.to_string())
        .execute(&self.pool)
        .await?;
        Ok(OccurrenceId::new(result.last_insert_rowid()))
    }

    async fn update_occurrence_state(
        &self,
        id: OccurrenceId,
        state: AlarmState,
        fields: OccurrenceUpdate,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE gf_alarm_occurrences
            SET state = ?,
                acknowledged_at = COALESCE(?, acknowledged_at),
                acknowledged_by = COALESCE(?, acknowledged_by),
                ack_comment = COALESCE(?, ack_comment),
                cleared_at = COALESCE(?, cleared_at),
                cleared_value = COALESCE(?, cleared_value),
                clear_comment = COALESCE(?, clear_comment)
            WHERE id = ?
            "#,
        )
        .bind(state.name())
        .bind(fields.acknowledged_at.map(|ts| ts.to_rfc3339()))
        .bind(&fields.acknowledged_by)
        .bind(&fields.ack_comment)
        .bind(fields.cleared_at.map(|ts| ts.to_rfc3339()))
        .bind(fields.cleared_value.as_ref().map(serde_json::to_string).transpose()?)
        .bind(&fields.clear_comment)
        .bind(id.as_i64())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(format!("occurrence {id}")));
        }
        Ok(())
    }

    async fn load_active_occurrences(
        &self,
        filter: &OccurrenceFilter,
    ) -> Result<Vec<AlarmOccurrence>> {
        let rows: Vec<OccurrenceRow> = sqlx::query_as(
            r#"
            SELECT * FROM gf_alarm_occurrences
            WHERE state = 'active' AND acknowledged_at IS NULL
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        apply_occurrence_filter(rows, filter)
    }

    async fn load_open_occurrences(
        &self,
        filter: &OccurrenceFilter,
    ) -> Result<Vec<AlarmOccurrence>> {
        let rows: Vec<OccurrenceRow> = sqlx::query_as(
            r#"
            SELECT * FROM gf_alarm_occurrences
            WHERE state NOT IN ('cleared', 'inactive')
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        apply_occurrence_filter(rows, filter)
    }
}

fn apply_occurrence_filter(
    rows: Vec<OccurrenceRow>,
    filter: &OccurrenceFilter,
) -> Result<Vec<AlarmOccurrence>> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let occ = AlarmOccurrence::try_from(row)?;
        if let Some(tenant) = filter.tenant {
            if occ.tenant_id != tenant {
                continue;
            }
        }
        if let Some(min) = filter.min_severity {
            // Severity orders worst-first; "at least min" means <= min.
            if occ.severity > min {
                continue;
            }
        }
        if let Some(since) = filter.since {
            if occ.occurred_at < since {
                continue;
            }
        }
        out.push(occ);
        if let Some(limit) = filter.limit {
            if out.len() >= limit {
                break;
            }
        }
    }
    Ok(out)
}

/// Count occurrences per state, for the statistics surface.
pub async fn occurrence_state_counts(pool: &SqlitePool) -> Result<Vec<(String, i64)>> {
    let rows = sqlx::query(
        "SELECT state, COUNT(*) AS n FROM gf_alarm_occurrences GROUP BY state ORDER BY state",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| (row.get::<String, _>("state"), row.get::<i64, _>("n")))
        .collect())
}
