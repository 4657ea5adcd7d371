use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fluxtrace::catalog::Catalog;
use fluxtrace::config::Config;
use fluxtrace::db;
use fluxtrace::parser;
use fluxtrace::services::{diagnostics, ingestion, query};
use fluxtrace::store;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Multi-application log flow tracker.
#[derive(Debug, Parser)]
#[command(name = "fluxtrace", version, about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Ingest a log file line by line.
    ProcessFile {
        /// Path to the log file.
        file: String,
    },
    /// Ingest a single log line.
    ProcessLine {
        /// The raw log line.
        line: String,
        /// Force a specific flow type.
        #[arg(short = 'f', long)]
        flux_type: Option<String>,
        /// Force a specific application.
        #[arg(short = 'a', long)]
        application: Option<String>,
    },
    /// Ingest JSON log records from a file or stdin.
    ProcessJson {
        /// JSON file (stdin when omitted).
        #[arg(short, long)]
        file: Option<String>,
    },
    /// Parse a line against the catalog without storing anything.
    ParseTest {
        /// The raw log line.
        line: String,
        /// Force a specific flow type.
        #[arg(short = 'f', long)]
        flux_type: Option<String>,
        /// Force a specific application.
        #[arg(short = 'a', long)]
        application: Option<String>,
    },
    /// Show a flux and every flow linked to it through cross-references.
    GetFlux {
        /// Reference of the flux.
        reference: String,
        /// Emit JSON instead of the human-readable rendering.
        #[arg(long)]
        json: bool,
    },
    /// Enumerate the configured flow types, applications and stages.
    ListConfig,
    /// Report top-level flows missing required stages.
    IncompleteFlows {
        /// Only consider flows created within the last H hours.
        #[arg(long)]
        max_age_hours: Option<i64>,
        /// Emit JSON instead of the human-readable rendering.
        #[arg(long)]
        json: bool,
    },
    /// Show flow graph statistics.
    Stats {
        /// Emit JSON instead of the human-readable rendering.
        #[arg(long)]
        json: bool,
        /// Enumerate the flow references behind each stage count.
        #[arg(long)]
        details: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "fluxtrace=info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact(),
        )
        .init();

    let cli = Cli::parse();
    let code = run(cli).await?;
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = Config::from_file(&cli.config)?;
    let catalog = Catalog::from_config(&config)?;

    // The catalog-only commands never touch the database.
    match &cli.command {
        Command::ParseTest {
            line,
            flux_type,
            application,
        } => {
            return Ok(cmd_parse_test(
                &catalog,
                line,
                flux_type.as_deref(),
                application.as_deref(),
            ));
        }
        Command::ListConfig => {
            cmd_list_config(&catalog);
            return Ok(0);
        }
        _ => {}
    }

    let pool = db::create_pool(&config.database.url, config.database.echo).await?;
    db::run_migrations(&pool).await?;
    store::init_catalog(&pool, &config).await?;

    match cli.command {
        Command::ProcessFile { file } => {
            let stats = ingestion::process_file(&pool, &catalog, &file).await?;
            println!("Results:");
            println!("  - total lines:     {}", stats.total_lines);
            println!("  - processed lines: {}", stats.processed_lines);
            println!("  - failed lines:    {}", stats.failed_lines);
            if stats.failed_lines > 0 && stats.total_lines > 0 {
                let rate = stats.processed_lines as f64 / stats.total_lines as f64 * 100.0;
                println!("  - success rate:    {rate:.1}%");
            }
            Ok(0)
        }
        Command::ProcessLine {
            line,
            flux_type,
            application,
        } => {
            let ok = ingestion::process_line(
                &pool,
                &catalog,
                &line,
                flux_type.as_deref(),
                application.as_deref(),
            )
            .await;
            if ok {
                println!("Line processed");
                Ok(0)
            } else {
                println!("Line rejected");
                Ok(1)
            }
        }
        Command::ProcessJson { file } => {
            let raw = match file {
                Some(path) => std::fs::read_to_string(path)?,
                None => std::io::read_to_string(std::io::stdin())?,
            };
            let stats = ingestion::process_json(&pool, &catalog, &raw).await?;
            println!("Results:");
            println!("  - total entries:     {}", stats.total_entries);
            println!("  - processed entries: {}", stats.processed_entries);
            println!("  - failed entries:    {}", stats.failed_entries);
            Ok(0)
        }
        Command::GetFlux { reference, json } => cmd_get_flux(&pool, &reference, json).await,
        Command::IncompleteFlows {
            max_age_hours,
            json,
        } => {
            let report = diagnostics::incomplete_flows(&pool, &catalog, max_age_hours).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else if report.is_empty() {
                println!("No incomplete flows");
            } else {
                for (flux_type, flows) in &report {
                    println!("Incomplete flows for {flux_type}:");
                    for flow in flows {
                        println!(
                            "  - {} (age: {:.2}h, completion: {:.1}%, missing required: {})",
                            flow.reference,
                            flow.age_hours,
                            flow.completion_rate,
                            flow.missing_required_stages.join(", ")
                        );
                        if flow.children_count > 0 {
                            println!("    children: {}", flow.children_count);
                        }
                    }
                }
            }
            Ok(0)
        }
        Command::Stats { json, details } => {
            let report = diagnostics::stats(&pool, &catalog, details).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                render_stats(&report);
            }
            Ok(0)
        }
        Command::ParseTest { .. } | Command::ListConfig => unreachable!(),
    }
}

fn cmd_parse_test(
    catalog: &Catalog,
    line: &str,
    flux_type: Option<&str>,
    application: Option<&str>,
) -> i32 {
    match parser::parse_line(catalog, line, flux_type, application) {
        Some(parsed) => {
            println!("Line parsed:");
            println!("  flux:        {}", parsed.flux_type);
            println!("  application: {}", parsed.application);
            println!("  stage:       {}", parsed.log_type);
            println!("  timestamp:   {}", parsed.timestamp);
            println!("  identifiers: {:?}", parsed.identifier_fields);
            println!("  payload:     {:?}", parsed.payload_fields);
            if !parsed.reference_links.is_empty() {
                println!("  references:  {:?}", parsed.reference_links);
            }
            0
        }
        None => {
            println!("Line not recognized");
            1
        }
    }
}

fn cmd_list_config(catalog: &Catalog) {
    println!("=== Configured flows ===");
    for (flux_name, meta) in catalog.flux_types() {
        println!();
        println!("Flow: {flux_name}");
        if !meta.description.is_empty() {
            println!("  description: {}", meta.description);
        }
        if !meta.required_steps.is_empty() {
            println!("  required stages: {}", meta.required_steps.join(", "));
        }
        if !meta.optional_steps.is_empty() {
            println!("  optional stages: {}", meta.optional_steps.join(", "));
        }

        let view = catalog.view_flux(flux_name).unwrap_or_default();
        let mut current_app = "";
        for (_, app_name, stage_name, _) in view {
            if app_name != current_app {
                println!("  application: {app_name}");
                current_app = app_name;
            }
            println!("    - {stage_name}");
        }
    }
}

async fn cmd_get_flux(
    pool: &sqlx::SqlitePool,
    reference: &str,
    json: bool,
) -> anyhow::Result<i32> {
    let Some(linked) = query::get_all_linked_flows(pool, reference).await? else {
        println!("Flux '{reference}' not found");
        return Ok(1);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&linked)?);
        return Ok(0);
    }

    let info = &linked.subflow_info;
    if info.is_subflow {
        println!(
            "=== Sub-flow {} (parent flow: {}) ===",
            info.requested_reference,
            linked.start_reference
        );
        if let Some(details) = &info.subflow_details {
            println!("  status:  {}", details.status);
            println!("  created: {}", details.created_at);
            println!("  updated: {}", details.updated_at);
        }
        if let Some(logs) = &info.subflow_logs {
            if !logs.is_empty() {
                println!("  own logs ({}):", logs.len());
                for log in logs {
                    println!("    [{}] {}/{}", log.timestamp, log.application, log.log_type);
                }
            }
        }
        println!();
        println!("Showing the parent flow: {}", linked.start_reference);
    } else {
        println!("=== Flux {} ===", linked.start_reference);
    }

    for view in &linked.flows {
        println!();
        println!(
            "Flux {} [{}] ({})",
            view.flux.reference, view.flux.status, view.flux.flux_type
        );
        println!("  created: {}", view.flux.created_at);
        println!("  updated: {}", view.flux.updated_at);

        if !view.logs.is_empty() {
            println!("  logs ({}):", view.logs.len());
            for (i, log) in view.logs.iter().enumerate() {
                println!(
                    "    {}. [{}] {}/{}",
                    i + 1,
                    log.timestamp,
                    log.application,
                    log.log_type
                );
            }
        }
        if !view.cross_references.is_empty() {
            println!("  cross-references ({}):", view.cross_references.len());
            for reference in &view.cross_references {
                println!(
                    "    → {} ({})",
                    reference.target_reference, reference.reference_field
                );
            }
        }
        if !view.children.is_empty() {
            println!("  sub-flows ({}):", view.children.len());
            for child in &view.children {
                let marker = if info.is_subflow && child.reference == info.requested_reference {
                    " ← (requested)"
                } else {
                    ""
                };
                println!("    - {} ({}){marker}", child.reference, child.status);
            }
        }
    }

    println!();
    println!("Connections: {}", linked.summary.total_connections);
    for connection in &linked.connections {
        println!(
            "  {} → {} ({}={})",
            connection.source_reference,
            connection.target_reference,
            connection.reference_field,
            connection.reference_value
        );
    }
    if !linked.summary.bidirectional_pairs.is_empty() {
        println!("Bidirectional pairs:");
        for [a, b] in &linked.summary.bidirectional_pairs {
            println!("  {a} ↔ {b}");
        }
    }

    Ok(0)
}

fn render_stats(report: &diagnostics::StatsReport) {
    println!("=== Flow statistics ===");
    println!();
    println!("Instances per flow type:");
    for (name, count) in &report.flux_by_type {
        println!("  {name}: {count}");
    }
    println!();
    println!("Instances per status:");
    for (status, count) in &report.flux_by_status {
        println!("  {status}: {count}");
    }

    for (flux_type, analysis) in &report.stage_analysis {
        println!();
        println!(
            "Stage coverage for {flux_type} ({} instances):",
            analysis.total_instances
        );
        for (label, buckets) in [
            ("required", &analysis.required),
            ("optional", &analysis.optional),
            ("other", &analysis.other),
        ] {
            for (stage, bucket) in buckets {
                println!(
                    "  [{label}] {stage}: {} ({:.1}%)",
                    bucket.count, bucket.percentage
                );
                if let Some(references) = &bucket.references {
                    println!("      {}", references.join(", "));
                }
            }
        }
    }

    println!();
    println!("Stage frequency (all flows):");
    for (stage, count) in &report.global_stage_frequency {
        println!("  {stage}: {count}");
    }
    println!();
    println!(
        "Flows with cross-references: {}",
        report.flows_with_cross_references
    );
    println!("Flows with children: {}", report.flows_with_children);
}
