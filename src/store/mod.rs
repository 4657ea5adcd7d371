//! Row-level operations on the persisted flow graph.
//!
//! Write-path functions take `&mut SqliteConnection` so the ingestor can
//! compose them inside a single per-line transaction. Read helpers shared by
//! the query and diagnostics services take the pool.

use chrono::{NaiveDateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};

use crate::config::Config;
use crate::errors::AppError;
use crate::models::{Application, CrossReference, FluxInstance, FluxType, LogEntry, STATUS_ACTIF};

/// Idempotently create the configured flux types and applications.
pub async fn init_catalog(pool: &SqlitePool, config: &Config) -> Result<(), AppError> {
    let mut tx = pool.begin().await?;

    for (flux_name, flux_config) in &config.flux_types {
        sqlx::query(
            "INSERT INTO flux_types (name, description) VALUES (?, ?)
             ON CONFLICT (name) DO NOTHING",
        )
        .bind(flux_name)
        .bind(&flux_config.description)
        .execute(&mut *tx)
        .await?;

        let flux_type = find_flux_type_by_name(&mut tx, flux_name)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("flux type {flux_name}")))?;

        for app_name in flux_config.applications.keys() {
            sqlx::query(
                "INSERT INTO applications (name, flux_type_id) VALUES (?, ?)
                 ON CONFLICT (name, flux_type_id) DO NOTHING",
            )
            .bind(app_name)
            .bind(flux_type.id)
            .execute(&mut *tx)
            .await?;
        }
    }

    tx.commit().await?;
    Ok(())
}

pub async fn find_flux_type_by_name(
    conn: &mut SqliteConnection,
    name: &str,
) -> Result<Option<FluxType>, AppError> {
    let row = sqlx::query_as::<_, FluxType>("SELECT * FROM flux_types WHERE name = ?")
        .bind(name)
        .fetch_optional(conn)
        .await?;
    Ok(row)
}

pub async fn find_application(
    conn: &mut SqliteConnection,
    name: &str,
    flux_type_id: i64,
) -> Result<Option<Application>, AppError> {
    let row = sqlx::query_as::<_, Application>(
        "SELECT * FROM applications WHERE name = ? AND flux_type_id = ?",
    )
    .bind(name)
    .bind(flux_type_id)
    .fetch_optional(conn)
    .await?;
    Ok(row)
}

/// Find the instance identified by `(flux_type_id, reference)`.
pub async fn find_flux_instance(
    conn: &mut SqliteConnection,
    flux_type_id: i64,
    reference: &str,
) -> Result<Option<FluxInstance>, AppError> {
    let row = sqlx::query_as::<_, FluxInstance>(
        "SELECT * FROM flux_instances WHERE flux_type_id = ? AND reference = ?",
    )
    .bind(flux_type_id)
    .bind(reference)
    .fetch_optional(conn)
    .await?;
    Ok(row)
}

/// Find an instance by reference across all flow types (oldest first).
pub async fn find_flux_instance_by_reference(
    conn: &mut SqliteConnection,
    reference: &str,
) -> Result<Option<FluxInstance>, AppError> {
    let row = sqlx::query_as::<_, FluxInstance>(
        "SELECT * FROM flux_instances WHERE reference = ? ORDER BY id LIMIT 1",
    )
    .bind(reference)
    .fetch_optional(conn)
    .await?;
    Ok(row)
}

/// Insert a new instance with status `ACTIF`.
pub async fn create_flux_instance(
    conn: &mut SqliteConnection,
    flux_type_id: i64,
    reference: &str,
    parent_id: Option<i64>,
) -> Result<FluxInstance, AppError> {
    let now = Utc::now();
    let row = sqlx::query_as::<_, FluxInstance>(
        "INSERT INTO flux_instances (flux_type_id, reference, status, created_at, updated_at, parent_id)
         VALUES (?, ?, ?, ?, ?, ?)
         RETURNING *",
    )
    .bind(flux_type_id)
    .bind(reference)
    .bind(STATUS_ACTIF)
    .bind(now)
    .bind(now)
    .bind(parent_id)
    .fetch_one(conn)
    .await?;
    Ok(row)
}

pub async fn touch_flux_instance(
    conn: &mut SqliteConnection,
    flux_instance_id: i64,
) -> Result<(), AppError> {
    sqlx::query("UPDATE flux_instances SET updated_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(flux_instance_id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Bind a parent to an instance. The caller guarantees the instance has no
/// parent yet.
pub async fn set_parent(
    conn: &mut SqliteConnection,
    flux_instance_id: i64,
    parent_id: i64,
) -> Result<(), AppError> {
    sqlx::query("UPDATE flux_instances SET parent_id = ?, updated_at = ? WHERE id = ?")
        .bind(parent_id)
        .bind(Utc::now())
        .bind(flux_instance_id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Walk the parent chain upwards from `start_id` and report whether
/// `needle_id` appears in it.
pub async fn is_ancestor(
    conn: &mut SqliteConnection,
    start_id: i64,
    needle_id: i64,
) -> Result<bool, AppError> {
    let mut current = Some(start_id);
    while let Some(id) = current {
        if id == needle_id {
            return Ok(true);
        }
        current = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT parent_id FROM flux_instances WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .flatten();
    }
    Ok(false)
}

pub async fn insert_log_entry(
    conn: &mut SqliteConnection,
    flux_instance_id: i64,
    application_id: i64,
    log_type: &str,
    timestamp: NaiveDateTime,
    raw_log: &str,
    parsed_data: &str,
) -> Result<i64, AppError> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO log_entries (flux_instance_id, application_id, log_type, timestamp, raw_log, parsed_data, processed_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         RETURNING id",
    )
    .bind(flux_instance_id)
    .bind(application_id)
    .bind(log_type)
    .bind(timestamp)
    .bind(raw_log)
    .bind(parsed_data)
    .bind(Utc::now())
    .fetch_one(conn)
    .await?;
    Ok(id)
}

pub async fn cross_reference_exists(
    conn: &mut SqliteConnection,
    source_flux_id: i64,
    target_flux_id: i64,
    reference_field: &str,
    reference_value: &str,
) -> Result<bool, AppError> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM cross_references
         WHERE source_flux_id = ? AND target_flux_id = ?
           AND reference_field = ? AND reference_value = ?",
    )
    .bind(source_flux_id)
    .bind(target_flux_id)
    .bind(reference_field)
    .bind(reference_value)
    .fetch_one(conn)
    .await?;
    Ok(count > 0)
}

pub async fn insert_cross_reference(
    conn: &mut SqliteConnection,
    source_flux_id: i64,
    target_flux_id: i64,
    reference_field: &str,
    reference_value: &str,
) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO cross_references
             (source_flux_id, target_flux_id, reference_field, reference_value, created_at)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(source_flux_id)
    .bind(target_flux_id)
    .bind(reference_field)
    .bind(reference_value)
    .bind(Utc::now())
    .execute(conn)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Read helpers shared by the query and diagnostics services
// ---------------------------------------------------------------------------

pub async fn get_flux_instance_by_reference(
    pool: &SqlitePool,
    reference: &str,
) -> Result<Option<FluxInstance>, AppError> {
    let row = sqlx::query_as::<_, FluxInstance>(
        "SELECT * FROM flux_instances WHERE reference = ? ORDER BY id LIMIT 1",
    )
    .bind(reference)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn get_flux_instance_by_id(
    pool: &SqlitePool,
    id: i64,
) -> Result<Option<FluxInstance>, AppError> {
    let row = sqlx::query_as::<_, FluxInstance>("SELECT * FROM flux_instances WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn get_flux_type(pool: &SqlitePool, id: i64) -> Result<Option<FluxType>, AppError> {
    let row = sqlx::query_as::<_, FluxType>("SELECT * FROM flux_types WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// Logs of an instance, sorted by `(timestamp, id)`.
pub async fn get_logs_for_instance(
    pool: &SqlitePool,
    flux_instance_id: i64,
) -> Result<Vec<LogEntry>, AppError> {
    let rows = sqlx::query_as::<_, LogEntry>(
        "SELECT * FROM log_entries WHERE flux_instance_id = ? ORDER BY timestamp, id",
    )
    .bind(flux_instance_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Direct children of an instance, sorted by reference.
pub async fn get_children(
    pool: &SqlitePool,
    flux_instance_id: i64,
) -> Result<Vec<FluxInstance>, AppError> {
    let rows = sqlx::query_as::<_, FluxInstance>(
        "SELECT * FROM flux_instances WHERE parent_id = ? ORDER BY reference",
    )
    .bind(flux_instance_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn get_outgoing_cross_references(
    pool: &SqlitePool,
    flux_instance_id: i64,
) -> Result<Vec<CrossReference>, AppError> {
    let rows = sqlx::query_as::<_, CrossReference>(
        "SELECT * FROM cross_references WHERE source_flux_id = ? ORDER BY id",
    )
    .bind(flux_instance_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn get_incoming_cross_references(
    pool: &SqlitePool,
    flux_instance_id: i64,
) -> Result<Vec<CrossReference>, AppError> {
    let rows = sqlx::query_as::<_, CrossReference>(
        "SELECT * FROM cross_references WHERE target_flux_id = ? ORDER BY id",
    )
    .bind(flux_instance_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
