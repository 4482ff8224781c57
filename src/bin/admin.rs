use std::collections::VecDeque;
use std::sync::Arc;

use tracerx_coordinator::auth::ApiKeyValidator;
use tracerx_coordinator::coordinator::{Coordinator, CoordinatorConfig};
use tracerx_coordinator::metrics::MetricsRegistry;
use tracerx_coordinator::server::{build_collaborators, Backend, ServerConfig};

fn print_help() {
    eprintln!(
        "\
tracerx-admin

USAGE:
  tracerx-admin <command> [options]

COMMANDS:
  migrate                         Run database migrations
  pending                         List provenance events not yet acknowledged
  batch <batch-id>                Show a batch record and its provenance events
  reconcile                       Run one reconciliation pass
  generate-key                    Generate an API key and its SHA-256 hash

COMMON OPTIONS:
  --database-url <postgres_url>    (defaults to env DATABASE_URL)

pending OPTIONS:
  --limit <n>                     (default: 100)
"
    );
}

fn require_database_url(database_url: Option<String>) -> anyhow::Result<String> {
    database_url
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .ok_or_else(|| anyhow::anyhow!("missing --database-url (or env DATABASE_URL)"))
}

/// Parse the options shared by every command; returns (database_url, limit, positional).
fn parse_options(
    args: &mut VecDeque<String>,
) -> anyhow::Result<Option<(Option<String>, usize, Vec<String>)>> {
    let mut database_url: Option<String> = None;
    let mut limit: usize = 100;
    let mut positional = Vec::new();

    while let Some(arg) = args.pop_front() {
        match arg.as_str() {
            "--database-url" => {
                database_url = Some(
                    args.pop_front()
                        .ok_or_else(|| anyhow::anyhow!("missing value for --database-url"))?,
                );
            }
            "--limit" => {
                let raw = args
                    .pop_front()
                    .ok_or_else(|| anyhow::anyhow!("missing value for --limit"))?;
                limit = raw.parse()?;
            }
            "-h" | "--help" => {
                print_help();
                return Ok(None);
            }
            other if other.starts_with("--") => anyhow::bail!("unexpected argument: {other}"),
            other => positional.push(other.to_string()),
        }
    }

    Ok(Some((database_url, limit, positional)))
}

/// Coordinator over the Postgres audit log and document store.
async fn connect(database_url: Option<String>) -> anyhow::Result<Coordinator> {
    let mut config = ServerConfig::from_env()?;
    config.backend = Backend::Postgres;
    config.database_url = Some(require_database_url(database_url)?);
    config.migrate_on_startup = false;

    let collaborators = build_collaborators(&config).await?;
    Ok(Coordinator::new(
        collaborators,
        CoordinatorConfig::from_env(),
        Arc::new(MetricsRegistry::new()),
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args: VecDeque<String> = std::env::args().skip(1).collect();
    let Some(command) = args.pop_front() else {
        print_help();
        return Ok(());
    };

    if matches!(command.as_str(), "-h" | "--help" | "help") {
        print_help();
        return Ok(());
    }

    let Some((database_url, limit, positional)) = parse_options(&mut args)? else {
        return Ok(());
    };

    match command.as_str() {
        "migrate" => {
            let database_url = require_database_url(database_url)?;
            let pool = tracerx_coordinator::infra::postgres::connect(&database_url, 5).await?;
            tracerx_coordinator::migrations::run_postgres(&pool).await?;
            println!("ok: migrations applied");
            Ok(())
        }
        "pending" => {
            let coordinator = connect(database_url).await?;
            let events = coordinator.recorder.unresolved(limit).await?;
            for event in &events {
                println!("{}", serde_json::to_string(event)?);
            }
            eprintln!("{} unresolved event(s)", events.len());
            Ok(())
        }
        "batch" => {
            let batch_id = positional
                .first()
                .ok_or_else(|| anyhow::anyhow!("batch requires a <batch-id>"))?;
            let coordinator = connect(database_url).await?;

            let record = coordinator
                .uploads
                .batch(batch_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("batch not found: {batch_id}"))?;
            let events = coordinator
                .recorder
                .events_for(&record.subject_key())
                .await?;

            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "batch": record,
                    "events": events,
                }))?
            );
            Ok(())
        }
        "reconcile" => {
            let coordinator = connect(database_url).await?;
            let report = coordinator.reconciler.run_once().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        "generate-key" => {
            let (key, hash) = ApiKeyValidator::generate_key();
            println!("key:  {key}");
            println!("hash: {hash}");
            Ok(())
        }
        other => {
            print_help();
            anyhow::bail!("unknown command: {other}")
        }
    }
}
