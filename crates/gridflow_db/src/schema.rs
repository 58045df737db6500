//! Schema bootstrap.
//!
//! Idempotent DDL executed at startup. Anything beyond this (migrations,
//! admin CRUD) belongs to the external management surface.

use crate::error::Result;
use sqlx::SqlitePool;

const DDL: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS gf_devices (
        id INTEGER PRIMARY KEY,
        tenant_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        protocol TEXT NOT NULL,
        connection TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        location TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS gf_data_points (
        id INTEGER PRIMARY KEY,
        device_id INTEGER NOT NULL REFERENCES gf_devices(id),
        tenant_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        address TEXT NOT NULL,
        value_type TEXT NOT NULL,
        unit TEXT,
        scale_factor REAL NOT NULL DEFAULT 1.0,
        scale_offset REAL NOT NULL DEFAULT 0.0,
        min_value REAL,
        max_value REAL,
        poll_interval_ms INTEGER NOT NULL DEFAULT 1000,
        access TEXT NOT NULL DEFAULT 'read',
        cov INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_gf_data_points_device
        ON gf_data_points(device_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS gf_virtual_points (
        id INTEGER PRIMARY KEY,
        tenant_id INTEGER NOT NULL,
        scope TEXT NOT NULL DEFAULT 'global',
        name TEXT NOT NULL,
        formula TEXT NOT NULL,
        value_type TEXT NOT NULL,
        unit TEXT,
        inputs TEXT NOT NULL,
        trigger_mode TEXT NOT NULL DEFAULT 'on_change',
        cache_ttl_ms INTEGER NOT NULL DEFAULT 5000,
        enabled INTEGER NOT NULL DEFAULT 1
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS gf_alarm_rules (
        id INTEGER PRIMARY KEY,
        tenant_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        target TEXT NOT NULL,
        params TEXT NOT NULL,
        severity TEXT NOT NULL,
        priority INTEGER NOT NULL DEFAULT 0,
        message_template TEXT,
        auto_acknowledge INTEGER NOT NULL DEFAULT 0,
        auto_ack_timeout_secs INTEGER,
        auto_clear INTEGER NOT NULL DEFAULT 1,
        latched INTEGER NOT NULL DEFAULT 0,
        suppression TEXT,
        notification_channels TEXT NOT NULL DEFAULT '[]',
        enabled INTEGER NOT NULL DEFAULT 1,
        template_id INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS gf_alarm_occurrences (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        rule_id INTEGER NOT NULL REFERENCES gf_alarm_rules(id),
        tenant_id INTEGER NOT NULL,
        occurred_at TEXT NOT NULL,
        trigger_value TEXT NOT NULL,
        condition TEXT NOT NULL,
        message TEXT NOT NULL,
        severity TEXT NOT NULL,
        state TEXT NOT NULL,
        acknowledged_at TEXT,
        acknowledged_by TEXT,
        ack_comment TEXT,
        cleared_at TEXT,
        cleared_value TEXT,
        clear_comment TEXT,
        context TEXT NOT NULL DEFAULT '{}'
    )
    "#,
    // One open occurrence per rule, enforced at the storage layer as well.
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_gf_occurrence_open_rule
        ON gf_alarm_occurrences(rule_id)
        WHERE state NOT IN ('cleared', 'inactive')
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_gf_occurrence_state
        ON gf_alarm_occurrences(state, tenant_id)
    "#,
];

/// Create all tables and indexes if missing.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    for stmt in DDL {
        sqlx::query(stmt).execute(pool).await?;
    }
    Ok(())
}
