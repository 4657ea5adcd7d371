//! Incompleteness diagnostics and stage-coverage statistics.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};

use crate::catalog::Catalog;
use crate::errors::AppError;
use crate::models::FluxInstance;
use crate::store;

/// One top-level flow instance missing at least one required stage.
#[derive(Debug, Serialize)]
pub struct IncompleteFlow {
    pub reference: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub age_hours: f64,
    pub missing_stages: Vec<String>,
    pub missing_required_stages: Vec<String>,
    pub present_stages: Vec<String>,
    pub required_stages: Vec<String>,
    pub optional_stages: Vec<String>,
    pub last_activity: Option<NaiveDateTime>,
    pub last_log_type: Option<String>,
    pub children_count: i64,
    pub completion_rate: f64,
}

/// Incomplete flows, keyed by flow type. Types with no incomplete instance
/// are omitted.
pub type IncompleteReport = BTreeMap<String, Vec<IncompleteFlow>>;

/// Flows that have not yet emitted every required stage.
///
/// Only top-level instances are analyzed; sub-flows inherit their parent's
/// lifecycle. `max_age_hours` restricts the report to recently created
/// instances.
pub async fn incomplete_flows(
    pool: &SqlitePool,
    catalog: &Catalog,
    max_age_hours: Option<i64>,
) -> Result<IncompleteReport, AppError> {
    let now = Utc::now();
    let cutoff = max_age_hours.map(|hours| now - Duration::hours(hours));
    let mut report = IncompleteReport::new();

    for (flux_name, meta) in catalog.flux_types() {
        if meta.required_steps.is_empty() {
            continue;
        }

        let mut conn = pool.acquire().await?;
        let Some(flux_type) = store::find_flux_type_by_name(&mut conn, flux_name).await? else {
            continue;
        };
        drop(conn);

        let instances = fetch_top_level_instances(pool, flux_type.id, cutoff).await?;
        let mut incomplete: Vec<IncompleteFlow> = Vec::new();

        for instance in instances {
            let logs = store::get_logs_for_instance(pool, instance.id).await?;
            let present: BTreeSet<&str> = logs.iter().map(|log| log.log_type.as_str()).collect();

            let missing_required: Vec<String> = meta
                .required_steps
                .iter()
                .filter(|stage| !present.contains(stage.as_str()))
                .cloned()
                .collect();
            if missing_required.is_empty() {
                continue;
            }

            let missing_stages: Vec<String> = meta
                .required_steps
                .iter()
                .chain(&meta.optional_steps)
                .filter(|stage| !present.contains(stage.as_str()))
                .cloned()
                .collect();

            let age_hours = (now - instance.created_at).num_seconds() as f64 / 3600.0;
            let children_count = count_children(pool, instance.id).await?;
            let completion_rate = completion_rate(meta.required_steps.len(), missing_required.len());
            let last = logs.last();

            incomplete.push(IncompleteFlow {
                reference: instance.reference,
                status: instance.status,
                created_at: instance.created_at,
                updated_at: instance.updated_at,
                age_hours: round2(age_hours),
                missing_stages,
                missing_required_stages: missing_required,
                present_stages: present.iter().map(|s| s.to_string()).collect(),
                required_stages: meta.required_steps.clone(),
                optional_stages: meta.optional_steps.clone(),
                last_activity: last.map(|log| log.timestamp),
                last_log_type: last.map(|log| log.log_type.clone()),
                children_count,
                completion_rate,
            });
        }

        // Oldest first.
        incomplete.sort_by(|a, b| {
            b.age_hours
                .partial_cmp(&a.age_hours)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        if !incomplete.is_empty() {
            report.insert(flux_name.to_string(), incomplete);
        }
    }

    Ok(report)
}

/// Completion over required stages only, one decimal. An empty requirement
/// set counts as complete.
fn completion_rate(total_required: usize, missing_required: usize) -> f64 {
    if total_required == 0 {
        return 100.0;
    }
    let completed = (total_required - missing_required) as f64;
    round1(completed / total_required as f64 * 100.0)
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

async fn fetch_top_level_instances(
    pool: &SqlitePool,
    flux_type_id: i64,
    cutoff: Option<DateTime<Utc>>,
) -> Result<Vec<FluxInstance>, AppError> {
    let rows = match cutoff {
        Some(cutoff) => {
            sqlx::query_as::<_, FluxInstance>(
                "SELECT * FROM flux_instances
                 WHERE flux_type_id = ? AND parent_id IS NULL AND created_at >= ?
                 ORDER BY id",
            )
            .bind(flux_type_id)
            .bind(cutoff)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, FluxInstance>(
                "SELECT * FROM flux_instances
                 WHERE flux_type_id = ? AND parent_id IS NULL
                 ORDER BY id",
            )
            .bind(flux_type_id)
            .fetch_all(pool)
            .await?
        }
    };
    Ok(rows)
}

async fn count_children(pool: &SqlitePool, flux_instance_id: i64) -> Result<i64, AppError> {
    let count =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM flux_instances WHERE parent_id = ?")
            .bind(flux_instance_id)
            .fetch_one(pool)
            .await?;
    Ok(count)
}

// ---------------------------------------------------------------------------
// Stage-coverage statistics
// ---------------------------------------------------------------------------

/// Coverage of one stage within a flow type.
#[derive(Debug, Serialize)]
pub struct StageBucket {
    /// Distinct flow instances that contain the stage.
    pub count: i64,
    /// Share of the type's instances, one decimal.
    pub percentage: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub references: Option<Vec<String>>,
}

/// Per-type stage analysis, partitioned by the configured stage roles.
#[derive(Debug, Serialize)]
pub struct TypeStageAnalysis {
    pub total_instances: i64,
    pub required: BTreeMap<String, StageBucket>,
    pub optional: BTreeMap<String, StageBucket>,
    pub other: BTreeMap<String, StageBucket>,
}

/// Global statistics over the flow graph.
#[derive(Debug, Serialize)]
pub struct StatsReport {
    pub flux_by_type: BTreeMap<String, i64>,
    pub flux_by_status: BTreeMap<String, i64>,
    pub stage_analysis: BTreeMap<String, TypeStageAnalysis>,
    pub global_stage_frequency: BTreeMap<String, i64>,
    pub flows_with_cross_references: i64,
    pub flows_with_children: i64,
}

#[derive(FromRow)]
struct NameCount {
    name: String,
    count: i64,
}

/// Compute the statistics report. `include_details` adds, per stage bucket,
/// the references of the flows present in it.
pub async fn stats(
    pool: &SqlitePool,
    catalog: &Catalog,
    include_details: bool,
) -> Result<StatsReport, AppError> {
    let flux_by_type = fetch_name_counts(
        pool,
        "SELECT ft.name AS name, COUNT(fi.id) AS count
         FROM flux_types ft
         LEFT JOIN flux_instances fi ON fi.flux_type_id = ft.id
         GROUP BY ft.name",
    )
    .await?;

    let flux_by_status = fetch_name_counts(
        pool,
        "SELECT status AS name, COUNT(*) AS count FROM flux_instances GROUP BY status",
    )
    .await?;

    let global_stage_frequency = fetch_name_counts(
        pool,
        "SELECT log_type AS name, COUNT(*) AS count FROM log_entries GROUP BY log_type",
    )
    .await?;

    let mut stage_analysis = BTreeMap::new();
    for (flux_name, meta) in catalog.flux_types() {
        let mut conn = pool.acquire().await?;
        let Some(flux_type) = store::find_flux_type_by_name(&mut conn, flux_name).await? else {
            continue;
        };
        drop(conn);

        let total_instances = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM flux_instances WHERE flux_type_id = ?",
        )
        .bind(flux_type.id)
        .fetch_one(pool)
        .await?;

        let stage_counts = sqlx::query_as::<_, NameCount>(
            "SELECT le.log_type AS name, COUNT(DISTINCT le.flux_instance_id) AS count
             FROM log_entries le
             JOIN flux_instances fi ON fi.id = le.flux_instance_id
             WHERE fi.flux_type_id = ?
             GROUP BY le.log_type",
        )
        .bind(flux_type.id)
        .fetch_all(pool)
        .await?;

        let mut analysis = TypeStageAnalysis {
            total_instances,
            required: BTreeMap::new(),
            optional: BTreeMap::new(),
            other: BTreeMap::new(),
        };

        for stage in stage_counts {
            let references = if include_details {
                Some(fetch_stage_references(pool, flux_type.id, &stage.name).await?)
            } else {
                None
            };
            let percentage = if total_instances > 0 {
                round1(stage.count as f64 / total_instances as f64 * 100.0)
            } else {
                0.0
            };
            let bucket = StageBucket {
                count: stage.count,
                percentage,
                references,
            };

            let target = if meta.required_steps.contains(&stage.name) {
                &mut analysis.required
            } else if meta.optional_steps.contains(&stage.name) {
                &mut analysis.optional
            } else {
                &mut analysis.other
            };
            target.insert(stage.name, bucket);
        }

        stage_analysis.insert(flux_name.to_string(), analysis);
    }

    let flows_with_cross_references = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(DISTINCT source_flux_id) FROM cross_references",
    )
    .fetch_one(pool)
    .await?;

    let flows_with_children = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(DISTINCT parent_id) FROM flux_instances WHERE parent_id IS NOT NULL",
    )
    .fetch_one(pool)
    .await?;

    Ok(StatsReport {
        flux_by_type,
        flux_by_status,
        stage_analysis,
        global_stage_frequency,
        flows_with_cross_references,
        flows_with_children,
    })
}

async fn fetch_name_counts(
    pool: &SqlitePool,
    sql: &str,
) -> Result<BTreeMap<String, i64>, AppError> {
    let rows = sqlx::query_as::<_, NameCount>(sql).fetch_all(pool).await?;
    Ok(rows.into_iter().map(|row| (row.name, row.count)).collect())
}

/// Distinct references of the flows of one type that contain a stage.
async fn fetch_stage_references(
    pool: &SqlitePool,
    flux_type_id: i64,
    log_type: &str,
) -> Result<Vec<String>, AppError> {
    let rows = sqlx::query_scalar::<_, String>(
        "SELECT DISTINCT fi.reference
         FROM flux_instances fi
         JOIN log_entries le ON le.flux_instance_id = fi.id
         WHERE fi.flux_type_id = ? AND le.log_type = ?
         ORDER BY fi.reference",
    )
    .bind(flux_type_id)
    .bind(log_type)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
