//! Row structs for the persisted flow graph entities.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

/// Status given to every instance the core creates. The column is free-form
/// text; the core itself never writes any other value.
pub const STATUS_ACTIF: &str = "ACTIF";

/// One configured flow type, created idempotently at startup.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct FluxType {
    pub id: i64,
    pub name: String,
    pub description: String,
}

/// A named producer of logs within a flow type.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Application {
    pub id: i64,
    pub name: String,
    pub flux_type_id: i64,
}

/// One tracked business transaction, identified by `(flux_type_id, reference)`.
///
/// `parent_id` links sub-flows to the flow that spawned them; it is set at
/// most once and never overwritten.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct FluxInstance {
    pub id: i64,
    pub flux_type_id: i64,
    pub reference: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub parent_id: Option<i64>,
}

/// A single ingested log line attached to a flow instance.
///
/// `timestamp` is the instant parsed out of the line (naive UTC, as emitted
/// by the source applications); `processed_at` is when ingestion happened.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct LogEntry {
    pub id: i64,
    pub flux_instance_id: i64,
    pub application_id: i64,
    pub log_type: String,
    pub timestamp: NaiveDateTime,
    pub raw_log: String,
    pub parsed_data: String,
    pub processed_at: DateTime<Utc>,
}

/// Directed edge between two flow instances, labeled by the field that
/// carried the reference. The tuple
/// `(source_flux_id, target_flux_id, reference_field, reference_value)`
/// is unique.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct CrossReference {
    pub id: i64,
    pub source_flux_id: i64,
    pub target_flux_id: i64,
    pub reference_field: String,
    pub reference_value: String,
    pub created_at: DateTime<Utc>,
}
