//! End-to-end tests for the ingestion pipeline and the query/diagnostics
//! views, against a fresh in-memory store per test.

use sqlx::SqlitePool;

use fluxtrace::catalog::Catalog;
use fluxtrace::config::Config;
use fluxtrace::db;
use fluxtrace::services::{diagnostics, ingestion, query};
use fluxtrace::store;

const CONFIG_YAML: &str = r#"
flux_types:
  COMMANDE:
    description: "Order lifecycle"
    required_steps:
      - COMMANDE_RECU
      - VALIDATION_COMMANDE
      - LIVRAISON_CREEE
    optional_steps:
      - CREATION_ENFANTS
    applications:
      Frontend:
        patterns:
          COMMANDE_RECU:
            regex: '\[(?P<timestamp>[^\]]+)\] COMMANDE_RECU (?P<commande_id>\S+) client=(?P<client>\S+)(?: articles=\[(?P<articles>[^\]]*)\])?'
            timestamp_format: '%Y-%m-%d %H:%M:%S'
            identifier_fields: [commande_id]
            payload_fields: [client, articles]
      Backend:
        patterns:
          VALIDATION_COMMANDE:
            regex: '\[(?P<timestamp>[^\]]+)\] VALIDATION_COMMANDE (?P<commande_id>\S+) → ordre=(?P<ordre>\S+) status=(?P<status>\S+)'
            timestamp_format: '%Y-%m-%d %H:%M:%S'
            identifier_fields: [commande_id]
            payload_fields: [status]
            reference_links: [ordre]
          CREATION_ENFANTS:
            regex: '\[(?P<timestamp>[^\]]+)\] CREATION_ARTICLES (?P<commande_id>\S+) enfants_ids=(?P<enfants_ids>.+)$'
            timestamp_format: '%Y-%m-%d %H:%M:%S'
            identifier_fields: [commande_id]
            payload_fields: [enfants_ids]
          TRAITEMENT_ENFANT:
            regex: '\[(?P<timestamp>[^\]]+)\] TRAITEMENT_ARTICLE (?P<article_id>\S+) parent=(?P<parent_ref>\S+)(?: stock=(?P<stock>\S+))?'
            timestamp_format: '%Y-%m-%d %H:%M:%S'
            identifier_fields: [article_id]
            payload_fields: [parent_ref, stock]
      Livraison:
        patterns:
          LIVRAISON_CREEE:
            regex: '\[(?P<timestamp>[^\]]+)\] LIVRAISON_CREEE (?P<commande_id>\S+) → livraison=(?P<livraison>\S+)'
            timestamp_format: '%Y-%m-%d %H:%M:%S'
            identifier_fields: [commande_id]
            payload_fields: []
            reference_links: [livraison]
"#;

const LINE_RECU: &str =
    "[2024-01-15 10:30:00] COMMANDE_RECU CMD_001 client=CLI_123 articles=[ART_001, ART_002]";
const LINE_VALIDATION: &str =
    "[2024-01-15 10:30:05] VALIDATION_COMMANDE CMD_001 → ordre=ORD_001 status=VALIDE";
const LINE_ENFANTS: &str =
    "[2024-01-15 10:30:10] CREATION_ARTICLES CMD_001 enfants_ids=ART_001, ART_002";

async fn setup() -> (SqlitePool, Catalog) {
    let config = Config::from_yaml(CONFIG_YAML).unwrap();
    let catalog = Catalog::from_config(&config).unwrap();
    let pool = db::create_pool("sqlite::memory:", false).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    store::init_catalog(&pool, &config).await.unwrap();
    (pool, catalog)
}

async fn count(pool: &SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn ingest(pool: &SqlitePool, catalog: &Catalog, line: &str) {
    assert!(
        ingestion::process_line(pool, catalog, line, None, None).await,
        "line should be processed: {line}"
    );
}

#[tokio::test]
async fn first_line_creates_one_instance_and_one_log() {
    let (pool, catalog) = setup().await;
    ingest(&pool, &catalog, LINE_RECU).await;

    assert_eq!(count(&pool, "flux_instances").await, 1);
    assert_eq!(count(&pool, "log_entries").await, 1);
    assert_eq!(count(&pool, "cross_references").await, 0);

    let instance = store::get_flux_instance_by_reference(&pool, "CMD_001")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(instance.status, "ACTIF");
    assert!(instance.parent_id.is_none());
}

#[tokio::test]
async fn cross_reference_auto_creates_target_with_source_flow_type() {
    let (pool, catalog) = setup().await;
    ingest(&pool, &catalog, LINE_RECU).await;
    ingest(&pool, &catalog, LINE_VALIDATION).await;

    let source = store::get_flux_instance_by_reference(&pool, "CMD_001")
        .await
        .unwrap()
        .unwrap();
    let target = store::get_flux_instance_by_reference(&pool, "ORD_001")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(target.flux_type_id, source.flux_type_id);
    assert_eq!(target.status, "ACTIF");

    let edges = store::get_outgoing_cross_references(&pool, source.id)
        .await
        .unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].target_flux_id, target.id);
    assert_eq!(edges[0].reference_field, "ordre");
    assert_eq!(edges[0].reference_value, "ORD_001");
}

#[tokio::test]
async fn linked_flows_closure_spans_the_cross_reference() {
    let (pool, catalog) = setup().await;
    ingest(&pool, &catalog, LINE_RECU).await;
    ingest(&pool, &catalog, LINE_VALIDATION).await;

    let linked = query::get_all_linked_flows(&pool, "CMD_001")
        .await
        .unwrap()
        .unwrap();

    let references: Vec<&str> = linked
        .flows
        .iter()
        .map(|view| view.flux.reference.as_str())
        .collect();
    assert_eq!(references, vec!["CMD_001", "ORD_001"]);
    assert_eq!(linked.summary.total_connections, 1);
    assert!(linked.summary.bidirectional_pairs.is_empty());
    assert!(!linked.subflow_info.is_subflow);

    // The closure is the same when entered from the target side.
    let from_target = query::get_all_linked_flows(&pool, "ORD_001")
        .await
        .unwrap()
        .unwrap();
    let target_refs: Vec<&str> = from_target
        .flows
        .iter()
        .map(|view| view.flux.reference.as_str())
        .collect();
    assert_eq!(target_refs, references);
}

#[tokio::test]
async fn incomplete_flow_reports_missing_required_stage() {
    let (pool, catalog) = setup().await;
    ingest(&pool, &catalog, LINE_RECU).await;
    ingest(&pool, &catalog, LINE_VALIDATION).await;

    let report = diagnostics::incomplete_flows(&pool, &catalog, None)
        .await
        .unwrap();
    let flows = &report["COMMANDE"];

    let cmd = flows
        .iter()
        .find(|flow| flow.reference == "CMD_001")
        .expect("CMD_001 should be incomplete");
    assert_eq!(cmd.missing_required_stages, vec!["LIVRAISON_CREEE"]);
    assert_eq!(cmd.completion_rate, 66.7);
    assert!(cmd.present_stages.contains(&"COMMANDE_RECU".to_string()));
    assert_eq!(cmd.last_log_type.as_deref(), Some("VALIDATION_COMMANDE"));
}

#[tokio::test]
async fn children_are_created_and_subflow_queries_resolve_the_parent() {
    let (pool, catalog) = setup().await;
    ingest(&pool, &catalog, LINE_RECU).await;
    ingest(&pool, &catalog, LINE_VALIDATION).await;
    ingest(&pool, &catalog, LINE_ENFANTS).await;

    let parent = store::get_flux_instance_by_reference(&pool, "CMD_001")
        .await
        .unwrap()
        .unwrap();
    let children = store::get_children(&pool, parent.id).await.unwrap();
    let child_refs: Vec<&str> = children.iter().map(|c| c.reference.as_str()).collect();
    assert_eq!(child_refs, vec!["ART_001", "ART_002"]);

    let details = query::get_flux_details(&pool, "ART_001")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(details.view.flux.reference, "CMD_001");
    assert!(details.subflow_info.is_subflow);
    assert_eq!(
        details.subflow_info.parent_reference.as_deref(),
        Some("CMD_001")
    );
    assert_eq!(details.subflow_info.requested_reference, "ART_001");

    let report = diagnostics::incomplete_flows(&pool, &catalog, None)
        .await
        .unwrap();
    let cmd = report["COMMANDE"]
        .iter()
        .find(|flow| flow.reference == "CMD_001")
        .unwrap();
    assert_eq!(cmd.children_count, 2);
    assert_eq!(cmd.missing_required_stages, vec!["LIVRAISON_CREEE"]);

    // Children are excluded from the incompleteness analysis.
    assert!(report["COMMANDE"]
        .iter()
        .all(|flow| flow.reference != "ART_001"));
}

#[tokio::test]
async fn replay_adds_logs_but_nothing_else() {
    let (pool, catalog) = setup().await;
    let lines = [LINE_RECU, LINE_VALIDATION, LINE_ENFANTS];

    for line in lines {
        ingest(&pool, &catalog, line).await;
    }
    let instances = count(&pool, "flux_instances").await;
    let logs = count(&pool, "log_entries").await;
    let edges = count(&pool, "cross_references").await;

    for line in lines {
        ingest(&pool, &catalog, line).await;
    }
    assert_eq!(count(&pool, "flux_instances").await, instances);
    assert_eq!(count(&pool, "cross_references").await, edges);
    assert_eq!(count(&pool, "log_entries").await, logs * 2);
}

#[tokio::test]
async fn ingestion_order_does_not_change_the_graph() {
    let forward = [LINE_RECU, LINE_VALIDATION, LINE_ENFANTS];
    let backward = [LINE_ENFANTS, LINE_VALIDATION, LINE_RECU];

    let mut shapes = Vec::new();
    for permutation in [forward, backward] {
        let (pool, catalog) = setup().await;
        for line in permutation {
            ingest(&pool, &catalog, line).await;
        }

        let linked = query::get_all_linked_flows(&pool, "CMD_001")
            .await
            .unwrap()
            .unwrap();
        let references: Vec<String> = linked
            .flows
            .iter()
            .map(|view| view.flux.reference.clone())
            .collect();
        let children: Vec<String> = linked
            .flows
            .iter()
            .flat_map(|view| view.children.iter().map(|c| c.reference.clone()))
            .collect();
        shapes.push((references, children, linked.connections.clone()));
    }

    assert_eq!(shapes[0], shapes[1]);
}

#[tokio::test]
async fn self_reference_creates_no_edge() {
    let (pool, catalog) = setup().await;
    ingest(
        &pool,
        &catalog,
        "[2024-01-15 10:30:05] VALIDATION_COMMANDE CMD_SELF → ordre=CMD_SELF status=VALIDE",
    )
    .await;

    assert_eq!(count(&pool, "cross_references").await, 0);
    assert_eq!(count(&pool, "flux_instances").await, 1);
}

#[tokio::test]
async fn late_parent_binding_sets_parent_once() {
    let (pool, catalog) = setup().await;
    ingest(&pool, &catalog, LINE_RECU).await;
    ingest(
        &pool,
        &catalog,
        "[2024-01-15 10:31:00] TRAITEMENT_ARTICLE ART_010 parent=CMD_001 stock=DISPONIBLE",
    )
    .await;

    let parent = store::get_flux_instance_by_reference(&pool, "CMD_001")
        .await
        .unwrap()
        .unwrap();
    let child = store::get_flux_instance_by_reference(&pool, "ART_010")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(child.parent_id, Some(parent.id));

    // A second parent claim never overwrites the first.
    ingest(
        &pool,
        &catalog,
        "[2024-01-15 10:32:00] COMMANDE_RECU CMD_OTHER client=CLI_001",
    )
    .await;
    ingest(
        &pool,
        &catalog,
        "[2024-01-15 10:33:00] TRAITEMENT_ARTICLE ART_010 parent=CMD_OTHER",
    )
    .await;
    let child = store::get_flux_instance_by_reference(&pool, "ART_010")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(child.parent_id, Some(parent.id));
}

#[tokio::test]
async fn parent_binding_never_creates_a_cycle() {
    let (pool, catalog) = setup().await;

    // FLUX_A references FLUX_B before FLUX_B exists: no binding happens.
    ingest(
        &pool,
        &catalog,
        "[2024-01-15 10:30:00] TRAITEMENT_ARTICLE FLUX_A parent=FLUX_B",
    )
    .await;
    // FLUX_B now binds to FLUX_A.
    ingest(
        &pool,
        &catalog,
        "[2024-01-15 10:30:01] TRAITEMENT_ARTICLE FLUX_B parent=FLUX_A",
    )
    .await;
    // Binding FLUX_A under FLUX_B would close the loop; it must be skipped.
    ingest(
        &pool,
        &catalog,
        "[2024-01-15 10:30:02] TRAITEMENT_ARTICLE FLUX_A parent=FLUX_B",
    )
    .await;

    let a = store::get_flux_instance_by_reference(&pool, "FLUX_A")
        .await
        .unwrap()
        .unwrap();
    let b = store::get_flux_instance_by_reference(&pool, "FLUX_B")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(b.parent_id, Some(a.id));
    assert_eq!(a.parent_id, None);
}

#[tokio::test]
async fn existing_instance_is_not_reparented_by_child_creation() {
    let (pool, catalog) = setup().await;
    // ART_001 exists as a top-level instance first.
    ingest(
        &pool,
        &catalog,
        "[2024-01-15 10:29:00] TRAITEMENT_ARTICLE ART_001 parent=MISSING",
    )
    .await;
    ingest(&pool, &catalog, LINE_RECU).await;
    ingest(&pool, &catalog, LINE_ENFANTS).await;

    let art = store::get_flux_instance_by_reference(&pool, "ART_001")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(art.parent_id, None);

    // ART_002 did not exist and becomes a child.
    let parent = store::get_flux_instance_by_reference(&pool, "CMD_001")
        .await
        .unwrap()
        .unwrap();
    let art2 = store::get_flux_instance_by_reference(&pool, "ART_002")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(art2.parent_id, Some(parent.id));
}

#[tokio::test]
async fn rejected_and_unknown_lines_leave_no_state() {
    let (pool, catalog) = setup().await;

    assert!(!ingestion::process_line(&pool, &catalog, "", None, None).await);
    assert!(!ingestion::process_line(&pool, &catalog, "not a log line", None, None).await);
    // Matches a regex but the timestamp is not a real date.
    assert!(
        !ingestion::process_line(
            &pool,
            &catalog,
            "[2024-13-45 25:99:99] COMMANDE_RECU CMD_BAD client=CLI_001",
            None,
            None
        )
        .await
    );

    assert_eq!(count(&pool, "flux_instances").await, 0);
    assert_eq!(count(&pool, "log_entries").await, 0);
}

#[tokio::test]
async fn process_file_counts_lines() {
    use std::io::Write;

    let (pool, catalog) = setup().await;
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "{LINE_RECU}").unwrap();
    writeln!(file, "garbage line").unwrap();
    writeln!(file, "{LINE_VALIDATION}").unwrap();
    file.flush().unwrap();

    let stats = ingestion::process_file(&pool, &catalog, file.path().to_str().unwrap())
        .await
        .unwrap();
    assert_eq!(stats.total_lines, 3);
    assert_eq!(stats.processed_lines, 2);
    assert_eq!(stats.failed_lines, 1);
}

#[tokio::test]
async fn process_json_extracts_messages_from_both_shapes() {
    let (pool, catalog) = setup().await;
    let payload = serde_json::json!([
        {"message": LINE_RECU},
        {"_source": {"message": LINE_VALIDATION}},
        {"message": ""},
        {"other": "no message at all"},
    ])
    .to_string();

    let stats = ingestion::process_json(&pool, &catalog, &payload)
        .await
        .unwrap();
    assert_eq!(stats.total_entries, 4);
    assert_eq!(stats.processed_entries, 2);
    assert_eq!(stats.failed_entries, 2);
    assert_eq!(count(&pool, "log_entries").await, 2);
}

#[tokio::test]
async fn stats_report_counts_stages_and_relations() {
    let (pool, catalog) = setup().await;
    ingest(&pool, &catalog, LINE_RECU).await;
    ingest(&pool, &catalog, LINE_VALIDATION).await;
    ingest(&pool, &catalog, LINE_ENFANTS).await;

    let report = diagnostics::stats(&pool, &catalog, true).await.unwrap();

    // CMD_001 plus the auto-created ORD_001 and two children.
    assert_eq!(report.flux_by_type["COMMANDE"], 4);
    assert_eq!(report.flux_by_status["ACTIF"], 4);
    assert_eq!(report.flows_with_cross_references, 1);
    assert_eq!(report.flows_with_children, 1);
    assert_eq!(report.global_stage_frequency["COMMANDE_RECU"], 1);

    let analysis = &report.stage_analysis["COMMANDE"];
    assert_eq!(analysis.total_instances, 4);
    let recu = &analysis.required["COMMANDE_RECU"];
    assert_eq!(recu.count, 1);
    assert_eq!(recu.percentage, 25.0);
    assert_eq!(recu.references.as_deref(), Some(&["CMD_001".to_string()][..]));
    let enfants = &analysis.optional["CREATION_ENFANTS"];
    assert_eq!(enfants.count, 1);
}

#[tokio::test]
async fn forced_selectors_are_honored_end_to_end() {
    let (pool, catalog) = setup().await;

    assert!(
        ingestion::process_line(&pool, &catalog, LINE_RECU, None, Some("Frontend")).await
    );
    // The only matching pattern belongs to Frontend.
    assert!(
        !ingestion::process_line(&pool, &catalog, LINE_RECU, None, Some("Backend")).await
    );
    assert!(
        !ingestion::process_line(&pool, &catalog, LINE_RECU, Some("INCONNU"), None).await
    );
}

#[tokio::test]
async fn unknown_reference_yields_not_found() {
    let (pool, _catalog) = setup().await;
    assert!(query::get_flux_details(&pool, "NOPE").await.unwrap().is_none());
    assert!(query::get_all_linked_flows(&pool, "NOPE")
        .await
        .unwrap()
        .is_none());
}
