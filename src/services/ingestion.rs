//! Ingestion pipeline: applies parsed records to the flow graph.
//!
//! Each line is processed inside a single transaction covering instance
//! resolution, the log entry, cross-references and sub-flow handling; any
//! failure rolls the whole line back. Batch modes (file, JSON) count
//! totals and never abort on a per-line failure.

use serde::Serialize;
use serde_json::{json, Value};
use sqlx::{SqliteConnection, SqlitePool};
use tokio::io::AsyncBufReadExt;

use crate::catalog::Catalog;
use crate::errors::AppError;
use crate::models::FluxInstance;
use crate::parser::{self, ParsedLog};
use crate::store;

/// Stage name by which a parent flow declares its children.
pub const STAGE_CREATION_ENFANTS: &str = "CREATION_ENFANTS";
/// Stage name by which a child flow references its parent.
pub const STAGE_TRAITEMENT_ENFANT: &str = "TRAITEMENT_ENFANT";

/// Payload field holding the comma-separated child references.
const FIELD_ENFANTS_IDS: &str = "enfants_ids";
/// Payload field holding the parent reference.
const FIELD_PARENT_REF: &str = "parent_ref";

/// Summary of a file ingestion run.
#[derive(Debug, Default, Serialize)]
pub struct FileStats {
    pub total_lines: usize,
    pub processed_lines: usize,
    pub failed_lines: usize,
}

/// Summary of a JSON ingestion run.
#[derive(Debug, Default, Serialize)]
pub struct JsonStats {
    pub total_entries: usize,
    pub processed_entries: usize,
    pub failed_entries: usize,
}

/// Parse and ingest one raw line. Returns whether the line was applied.
///
/// A parse miss, a rejection (no usable reference, unknown flow type or
/// application) and a store failure all count as `false`; the two latter are
/// logged and fully rolled back.
pub async fn process_line(
    pool: &SqlitePool,
    catalog: &Catalog,
    line: &str,
    force_flux: Option<&str>,
    force_app: Option<&str>,
) -> bool {
    let Some(parsed) = parser::parse_line(catalog, line, force_flux, force_app) else {
        return false;
    };

    match ingest(pool, &parsed).await {
        Ok(()) => {
            tracing::debug!(
                flux = %parsed.flux_type,
                application = %parsed.application,
                "line ingested"
            );
            true
        }
        Err(e) => {
            tracing::error!(error = %e, line = %parsed.raw_log, "line ingestion failed");
            false
        }
    }
}

/// Apply a parsed record to the store within one transaction.
pub async fn ingest(pool: &SqlitePool, parsed: &ParsedLog) -> Result<(), AppError> {
    let mut tx = pool.begin().await?;

    // 1. Resolve flow type and application.
    let flux_type = store::find_flux_type_by_name(&mut tx, &parsed.flux_type)
        .await?
        .ok_or_else(|| AppError::Rejected(format!("unknown flux type {}", parsed.flux_type)))?;
    let application = store::find_application(&mut tx, &parsed.application, flux_type.id)
        .await?
        .ok_or_else(|| {
            AppError::Rejected(format!(
                "unknown application {}/{}",
                parsed.flux_type, parsed.application
            ))
        })?;

    // 2. Resolve the flow instance by main reference.
    let main_reference = main_reference(parsed)
        .ok_or_else(|| AppError::Rejected("no main reference in identifier fields".into()))?;
    let flux_instance = match store::find_flux_instance(&mut tx, flux_type.id, main_reference)
        .await?
    {
        Some(instance) => instance,
        None => store::create_flux_instance(&mut tx, flux_type.id, main_reference, None).await?,
    };

    // 3. Append the log entry.
    let parsed_data = serde_json::to_string(&json!({
        "identifier_fields": parsed.identifier_fields,
        "payload_fields": parsed.payload_fields,
        "reference_links": parsed.reference_links,
    }))?;
    store::insert_log_entry(
        &mut tx,
        flux_instance.id,
        application.id,
        &parsed.log_type,
        parsed.timestamp,
        &parsed.raw_log,
        &parsed_data,
    )
    .await?;
    store::touch_flux_instance(&mut tx, flux_instance.id).await?;

    // 4. Cross-references.
    handle_cross_references(&mut tx, &flux_instance, parsed).await?;

    // 5. Sub-flows.
    handle_sub_flows(&mut tx, &flux_instance, parsed).await?;

    tx.commit().await?;
    Ok(())
}

/// First non-empty identifier field, in pattern declaration order.
fn main_reference(parsed: &ParsedLog) -> Option<&str> {
    parsed
        .identifier_fields
        .values()
        .find(|value| !value.is_empty())
        .map(String::as_str)
}

/// Create missing cross-reference targets and the directed edges.
async fn handle_cross_references(
    conn: &mut SqliteConnection,
    source: &FluxInstance,
    parsed: &ParsedLog,
) -> Result<(), AppError> {
    for (ref_field, ref_value) in &parsed.reference_links {
        if ref_value.is_empty() {
            continue;
        }

        // Any flow type may own the reference; unseen targets are created
        // with the source's flow type so the edge can exist already.
        let target = match store::find_flux_instance_by_reference(&mut *conn, ref_value).await? {
            Some(instance) => instance,
            None => {
                let created =
                    store::create_flux_instance(&mut *conn, source.flux_type_id, ref_value, None)
                        .await?;
                tracing::debug!(reference = %ref_value, "cross-reference target auto-created");
                created
            }
        };

        if target.id == source.id {
            continue;
        }
        if !store::cross_reference_exists(&mut *conn, source.id, target.id, ref_field, ref_value)
            .await?
        {
            store::insert_cross_reference(&mut *conn, source.id, target.id, ref_field, ref_value)
                .await?;
            tracing::debug!(
                source = %source.reference,
                target = %target.reference,
                field = %ref_field,
                "cross-reference created"
            );
        }
    }
    Ok(())
}

/// Maintain the parent/child tree for the two sub-flow stage conventions.
async fn handle_sub_flows(
    conn: &mut SqliteConnection,
    flux_instance: &FluxInstance,
    parsed: &ParsedLog,
) -> Result<(), AppError> {
    if parsed.log_type == STAGE_CREATION_ENFANTS {
        let enfants_ids = parsed
            .payload_fields
            .get(FIELD_ENFANTS_IDS)
            .map(String::as_str)
            .unwrap_or("");

        for child_ref in split_child_ids(enfants_ids) {
            // Creation is add-only: an existing instance keeps its current
            // parent (or lack of one).
            if store::find_flux_instance(&mut *conn, flux_instance.flux_type_id, child_ref)
                .await?
                .is_some()
            {
                continue;
            }
            store::create_flux_instance(
                &mut *conn,
                flux_instance.flux_type_id,
                child_ref,
                Some(flux_instance.id),
            )
            .await?;
        }
    } else if parsed.log_type == STAGE_TRAITEMENT_ENFANT {
        let parent_ref = parsed
            .payload_fields
            .get(FIELD_PARENT_REF)
            .map(String::as_str)
            .unwrap_or("");
        if parent_ref.is_empty() || flux_instance.parent_id.is_some() {
            return Ok(());
        }

        if let Some(parent) = store::find_flux_instance_by_reference(&mut *conn, parent_ref).await?
        {
            if parent.id == flux_instance.id {
                return Ok(());
            }
            // Refuse a binding that would make the instance its own ancestor.
            if store::is_ancestor(&mut *conn, parent.id, flux_instance.id).await? {
                tracing::warn!(
                    child = %flux_instance.reference,
                    parent = %parent.reference,
                    "parent binding skipped, would create a cycle"
                );
                return Ok(());
            }
            store::set_parent(&mut *conn, flux_instance.id, parent.id).await?;
        }
    }
    Ok(())
}

/// Split a comma-separated child id list, trimming whitespace and dropping
/// empty tokens.
fn split_child_ids(raw: &str) -> Vec<&str> {
    raw.split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .collect()
}

/// Ingest a log file line by line.
pub async fn process_file(
    pool: &SqlitePool,
    catalog: &Catalog,
    path: &str,
) -> Result<FileStats, AppError> {
    let file = tokio::fs::File::open(path).await?;
    let mut lines = tokio::io::BufReader::new(file).lines();
    let mut stats = FileStats::default();

    while let Some(line) = lines.next_line().await? {
        stats.total_lines += 1;
        if process_line(pool, catalog, &line, None, None).await {
            stats.processed_lines += 1;
        } else {
            stats.failed_lines += 1;
        }

        if stats.total_lines % 1000 == 0 {
            tracing::info!(lines = stats.total_lines, "file ingestion progress");
        }
    }

    tracing::info!(
        total = stats.total_lines,
        processed = stats.processed_lines,
        failed = stats.failed_lines,
        "file ingestion finished"
    );
    Ok(stats)
}

/// Ingest a JSON document: an array of records carrying the raw line in
/// `message` or `_source.message` (Elasticsearch export shape).
pub async fn process_json(
    pool: &SqlitePool,
    catalog: &Catalog,
    raw: &str,
) -> Result<JsonStats, AppError> {
    let data: Value = serde_json::from_str(raw)?;
    let entries = match data {
        Value::Array(entries) => entries,
        _ => {
            return Err(AppError::Rejected(
                "JSON input must be an array of log records".into(),
            ))
        }
    };

    let mut stats = JsonStats::default();
    for entry in &entries {
        stats.total_entries += 1;

        let message = extract_message(entry);
        if !message.is_empty() && process_line(pool, catalog, message, None, None).await {
            stats.processed_entries += 1;
        } else {
            stats.failed_entries += 1;
        }
    }

    tracing::info!(
        total = stats.total_entries,
        processed = stats.processed_entries,
        failed = stats.failed_entries,
        "JSON ingestion finished"
    );
    Ok(stats)
}

/// Pull the raw line out of a JSON record: `message`, falling back to
/// `_source.message`.
fn extract_message(entry: &Value) -> &str {
    let direct = entry.get("message").and_then(Value::as_str).unwrap_or("");
    if !direct.is_empty() {
        return direct;
    }
    entry
        .pointer("/_source/message")
        .and_then(Value::as_str)
        .unwrap_or("")
}
