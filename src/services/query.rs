//! Read-side views over the flow graph: single-flux details with sub-flow
//! parent resolution, and the transitive closure over cross-references.

use std::collections::HashSet;
use std::collections::VecDeque;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{FromRow, SqlitePool};

use crate::errors::AppError;
use crate::models::FluxInstance;
use crate::store;

/// Core fields of a flow instance as rendered to the caller.
#[derive(Debug, Serialize)]
pub struct FluxCore {
    pub id: i64,
    pub reference: String,
    pub status: String,
    pub flux_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One log entry of the rendered view.
#[derive(Debug, Serialize)]
pub struct LogView {
    pub timestamp: NaiveDateTime,
    pub application: String,
    pub log_type: String,
    pub raw_log: String,
    pub parsed_data: Value,
}

/// One outgoing cross-reference of the rendered view.
#[derive(Debug, Serialize, FromRow)]
pub struct CrossRefView {
    pub target_reference: String,
    pub reference_field: String,
    pub reference_value: String,
}

/// One direct child of the rendered view.
#[derive(Debug, Serialize)]
pub struct ChildView {
    pub reference: String,
    pub status: String,
}

/// The joined view of one flow instance.
#[derive(Debug, Serialize)]
pub struct FluxView {
    pub flux: FluxCore,
    pub logs: Vec<LogView>,
    pub cross_references: Vec<CrossRefView>,
    pub children: Vec<ChildView>,
}

/// Sub-flow indication attached to a query whose requested reference is a
/// child: the parent is the primary subject and this block surfaces the
/// child's own state.
#[derive(Debug, Serialize)]
pub struct SubflowInfo {
    pub is_subflow: bool,
    pub requested_reference: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subflow_details: Option<SubflowDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subflow_logs: Option<Vec<LogView>>,
}

/// Own state of the requested sub-flow.
#[derive(Debug, Serialize)]
pub struct SubflowDetails {
    pub id: i64,
    pub reference: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of `get_flux_details`.
#[derive(Debug, Serialize)]
pub struct FluxDetails {
    #[serde(flatten)]
    pub view: FluxView,
    pub subflow_info: SubflowInfo,
}

/// One directed connection of the closure.
#[derive(Debug, Serialize, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub struct Connection {
    pub source_reference: String,
    pub target_reference: String,
    pub reference_field: String,
    pub reference_value: String,
}

/// Aggregate facts about the closure's connections.
#[derive(Debug, Serialize)]
pub struct ConnectionSummary {
    pub total_connections: usize,
    /// Unordered pairs with edges in both directions, each pair sorted.
    pub bidirectional_pairs: Vec<[String; 2]>,
}

/// Result of `get_all_linked_flows`.
#[derive(Debug, Serialize)]
pub struct LinkedFlows {
    pub start_reference: String,
    pub flows: Vec<FluxView>,
    pub connections: Vec<Connection>,
    pub summary: ConnectionSummary,
    pub subflow_info: SubflowInfo,
}

/// Details of the flux identified by `reference`.
///
/// When the reference names a sub-flow, the parent becomes the primary
/// subject and `subflow_info` carries the child's own state and logs.
pub async fn get_flux_details(
    pool: &SqlitePool,
    reference: &str,
) -> Result<Option<FluxDetails>, AppError> {
    let Some(requested) = store::get_flux_instance_by_reference(pool, reference).await? else {
        return Ok(None);
    };

    let (primary, subflow_info) = resolve_primary(pool, &requested).await?;
    let view = build_flux_view(pool, &primary).await?;

    Ok(Some(FluxDetails { view, subflow_info }))
}

/// The transitive closure over outgoing and incoming cross-references,
/// starting from the flux identified as in `get_flux_details`.
pub async fn get_all_linked_flows(
    pool: &SqlitePool,
    reference: &str,
) -> Result<Option<LinkedFlows>, AppError> {
    let Some(requested) = store::get_flux_instance_by_reference(pool, reference).await? else {
        return Ok(None);
    };

    let (start, subflow_info) = resolve_primary(pool, &requested).await?;

    // Breadth-first over both edge directions; the visited set terminates
    // cycles.
    let mut visited: HashSet<i64> = HashSet::new();
    let mut queue: VecDeque<i64> = VecDeque::new();
    let mut reachable: Vec<FluxInstance> = Vec::new();
    visited.insert(start.id);
    queue.push_back(start.id);

    while let Some(id) = queue.pop_front() {
        let Some(instance) = store::get_flux_instance_by_id(pool, id).await? else {
            continue;
        };

        let mut neighbor_ids: Vec<i64> = Vec::new();
        for edge in store::get_outgoing_cross_references(pool, id).await? {
            neighbor_ids.push(edge.target_flux_id);
        }
        for edge in store::get_incoming_cross_references(pool, id).await? {
            neighbor_ids.push(edge.source_flux_id);
        }
        neighbor_ids.sort_unstable();

        for neighbor in neighbor_ids {
            if visited.insert(neighbor) {
                queue.push_back(neighbor);
            }
        }
        reachable.push(instance);
    }

    // Directed connections among the closure, deduplicated and sorted.
    let mut connections: Vec<Connection> = Vec::new();
    for instance in &reachable {
        for edge in store::get_outgoing_cross_references(pool, instance.id).await? {
            let Some(target) = store::get_flux_instance_by_id(pool, edge.target_flux_id).await?
            else {
                continue;
            };
            connections.push(Connection {
                source_reference: instance.reference.clone(),
                target_reference: target.reference,
                reference_field: edge.reference_field,
                reference_value: edge.reference_value,
            });
        }
    }
    connections.sort();
    connections.dedup();

    let summary = summarize_connections(&connections);

    let mut flows = Vec::with_capacity(reachable.len());
    for instance in &reachable {
        flows.push(build_flux_view(pool, instance).await?);
    }
    flows.sort_by(|a, b| a.flux.reference.cmp(&b.flux.reference));

    Ok(Some(LinkedFlows {
        start_reference: start.reference.clone(),
        flows,
        connections,
        summary,
        subflow_info,
    }))
}

/// Resolve the primary subject of a query: the parent when the requested
/// instance is a sub-flow (falling back to the instance itself if the parent
/// row is missing), otherwise the instance.
async fn resolve_primary(
    pool: &SqlitePool,
    requested: &FluxInstance,
) -> Result<(FluxInstance, SubflowInfo), AppError> {
    if let Some(parent_id) = requested.parent_id {
        if let Some(parent) = store::get_flux_instance_by_id(pool, parent_id).await? {
            let subflow_logs = fetch_logs(pool, requested.id).await?;
            let info = SubflowInfo {
                is_subflow: true,
                requested_reference: requested.reference.clone(),
                subflow_details: Some(SubflowDetails {
                    id: requested.id,
                    reference: requested.reference.clone(),
                    status: requested.status.clone(),
                    created_at: requested.created_at,
                    updated_at: requested.updated_at,
                }),
                parent_reference: Some(parent.reference.clone()),
                subflow_logs: Some(subflow_logs),
            };
            return Ok((parent, info));
        }
    }

    let info = SubflowInfo {
        is_subflow: false,
        requested_reference: requested.reference.clone(),
        subflow_details: None,
        parent_reference: None,
        subflow_logs: None,
    };
    Ok((requested.clone(), info))
}

/// Assemble the joined view of one instance.
async fn build_flux_view(
    pool: &SqlitePool,
    instance: &FluxInstance,
) -> Result<FluxView, AppError> {
    let flux_type = store::get_flux_type(pool, instance.flux_type_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("flux type id {}", instance.flux_type_id)))?;

    let logs = fetch_logs(pool, instance.id).await?;
    let cross_references = fetch_cross_ref_views(pool, instance.id).await?;
    let children = store::get_children(pool, instance.id)
        .await?
        .into_iter()
        .map(|child| ChildView {
            reference: child.reference,
            status: child.status,
        })
        .collect();

    Ok(FluxView {
        flux: FluxCore {
            id: instance.id,
            reference: instance.reference.clone(),
            status: instance.status.clone(),
            flux_type: flux_type.name,
            created_at: instance.created_at,
            updated_at: instance.updated_at,
        },
        logs,
        cross_references,
        children,
    })
}

#[derive(FromRow)]
struct LogRow {
    timestamp: NaiveDateTime,
    application: String,
    log_type: String,
    raw_log: String,
    parsed_data: String,
}

/// Logs of an instance joined with the emitting application, sorted by
/// `(timestamp, id)`.
async fn fetch_logs(pool: &SqlitePool, flux_instance_id: i64) -> Result<Vec<LogView>, AppError> {
    let rows = sqlx::query_as::<_, LogRow>(
        r#"
        SELECT le.timestamp, a.name AS application, le.log_type, le.raw_log, le.parsed_data
        FROM log_entries le
        JOIN applications a ON a.id = le.application_id
        WHERE le.flux_instance_id = ?
        ORDER BY le.timestamp, le.id
        "#,
    )
    .bind(flux_instance_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| LogView {
            timestamp: row.timestamp,
            application: row.application,
            log_type: row.log_type,
            raw_log: row.raw_log,
            parsed_data: serde_json::from_str(&row.parsed_data).unwrap_or_default(),
        })
        .collect())
}

/// Outgoing cross-references joined with the target reference, sorted by
/// `(target reference, field)`.
async fn fetch_cross_ref_views(
    pool: &SqlitePool,
    flux_instance_id: i64,
) -> Result<Vec<CrossRefView>, AppError> {
    let rows = sqlx::query_as::<_, CrossRefView>(
        r#"
        SELECT t.reference AS target_reference, cr.reference_field, cr.reference_value
        FROM cross_references cr
        JOIN flux_instances t ON t.id = cr.target_flux_id
        WHERE cr.source_flux_id = ?
        ORDER BY t.reference, cr.reference_field
        "#,
    )
    .bind(flux_instance_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Count connections and collect the unordered pairs linked in both
/// directions (any fields).
fn summarize_connections(connections: &[Connection]) -> ConnectionSummary {
    let directed: HashSet<(&str, &str)> = connections
        .iter()
        .map(|c| (c.source_reference.as_str(), c.target_reference.as_str()))
        .collect();

    let mut pairs: Vec<[String; 2]> = Vec::new();
    for (source, target) in &directed {
        if source < target && directed.contains(&(*target, *source)) {
            pairs.push([source.to_string(), target.to_string()]);
        }
    }
    pairs.sort();

    ConnectionSummary {
        total_connections: connections.len(),
        bidirectional_pairs: pairs,
    }
}
