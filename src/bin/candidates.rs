use clap::{Parser, Subcommand};
use reldisco::db::Db;
use reldisco::evaluation::EvaluationOutcome;
use reldisco::{Config, RelationDiscoveryEngine};
use std::path::Path;
use anyhow::{Context, Result};

#[derive(Parser, Debug)]
#[command(name = "candidates")]
#[command(about = "Inspect and decide relation candidates")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List candidates, best match quality first
    List {
        /// Only candidates whose source or target type matches
        #[arg(short = 't', long)]
        entity_type: Option<String>,

        /// Only candidates with this status (new, undecided, accepted, rejected)
        #[arg(short, long)]
        status: Option<String>,
    },
    /// Show one candidate with its recent operations
    Show {
        relation_id: String,

        /// Number of audit entries to print
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
    /// Accept a candidate and materialise its edges
    Accept { relation_id: String },
    /// Reject a candidate and remove its edges
    Reject { relation_id: String },
    /// Lift a manual rejection
    Unreject { relation_id: String },
    /// Evaluate one candidate with the confidence oracle
    Evaluate {
        relation_id: String,

        /// Evaluate even if the skip policy says otherwise
        #[arg(short, long)]
        force: bool,
    },
    /// Reconcile graph edges with the candidate's decision
    Sync { relation_id: String },
    /// Prune candidates not seen by the last completed run
    Cleanup,
    /// Print the current heuristics version
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load()?;
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or("RUST_LOG", &config.reldisco.log_level)
    ).init();

    Db::new(config.db_path())
        .migrate(Path::new("migrations"))
        .await
        .context("Failed to migrate candidate database")?;
    let engine = RelationDiscoveryEngine::from_config(&config)?;
    let accept = config.evaluation.acceptance_threshold;
    let reject = config.evaluation.rejection_threshold;

    match args.command {
        Command::List { entity_type, status } => {
            let candidates = engine.candidates().await?;
            let shown: Vec<_> = candidates
                .iter()
                .filter(|c| {
                    entity_type.as_deref().map_or(true, |t| {
                        c.heuristic.entity_a_type == t || c.heuristic.entity_b_type == t
                    })
                })
                .filter(|c| {
                    status
                        .as_deref()
                        .map_or(true, |s| c.status(accept, reject).starts_with(s))
                })
                .collect();

            if shown.is_empty() {
                println!("No candidates found.");
                return Ok(());
            }

            println!("{:-<120}", "");
            println!(
                "{:<12} {:<45} {:>7} {:>8} {:>6} {:<20} {:<18}",
                "ID", "Relation", "Count", "Quality", "Conf", "Name", "Status"
            );
            println!("{:-<120}", "");
            for c in &shown {
                let h = &c.heuristic;
                let relation = format!(
                    "{}.{} -> {}.{}",
                    h.entity_a_type, h.entity_a_property, h.entity_b_type, h.entity_b_idkey_property
                );
                let confidence = c
                    .confidence()
                    .map(|v| format!("{:.2}", v))
                    .unwrap_or_else(|| "-".to_string());
                let name = if c.evaluation.is_some() { c.relation_name() } else { "-".to_string() };
                println!(
                    "{:<12} {:<45} {:>7} {:>8.2} {:>6} {:<20} {:<18}",
                    &c.relation_id[..12.min(c.relation_id.len())],
                    relation,
                    h.count,
                    h.deep_match_quality,
                    confidence,
                    name,
                    c.status(accept, reject)
                );
            }
            println!("{:-<120}", "");
            println!("{} of {} candidates", shown.len(), candidates.len());
        }
        Command::Show { relation_id, limit } => {
            let relation_id = resolve_id(&engine, &relation_id).await?;
            let candidate = engine
                .candidate(&relation_id)
                .await?
                .with_context(|| format!("Relation candidate not found: {}", relation_id))?;
            println!("{}", serde_json::to_string_pretty(&candidate)?);

            let operations = engine.operations(&relation_id, limit).await?;
            if !operations.is_empty() {
                println!("\nRecent operations:");
                for op in operations {
                    let outcome = if op.success {
                        "ok".to_string()
                    } else {
                        format!("failed: {}", op.error_message.unwrap_or_default())
                    };
                    println!("  {} {:<9} by {:<10} {}", op.timestamp, op.operation_type, op.actor, outcome);
                }
            }
        }
        Command::Accept { relation_id } => {
            let relation_id = resolve_id(&engine, &relation_id).await?;
            engine.accept(&relation_id).await?;
            println!("Accepted {}", relation_id);
        }
        Command::Reject { relation_id } => {
            let relation_id = resolve_id(&engine, &relation_id).await?;
            engine.reject(&relation_id).await?;
            println!("Rejected {}", relation_id);
        }
        Command::Unreject { relation_id } => {
            let relation_id = resolve_id(&engine, &relation_id).await?;
            engine.unreject(&relation_id).await?;
            println!("Un-rejected {}", relation_id);
        }
        Command::Evaluate { relation_id, force } => {
            let relation_id = resolve_id(&engine, &relation_id).await?;
            match engine.evaluate(&relation_id, force).await? {
                EvaluationOutcome::Skipped(reason) => println!("Skipped: {}", reason),
                EvaluationOutcome::Evaluated { confidence, accepted } => println!(
                    "Confidence {:.2} ({})",
                    confidence,
                    if accepted { "accepted" } else { "not accepted" }
                ),
                EvaluationOutcome::Failed(error) => println!("Evaluation failed: {}", error),
            }
        }
        Command::Sync { relation_id } => {
            let relation_id = resolve_id(&engine, &relation_id).await?;
            println!("{:?}", engine.sync(&relation_id).await?);
        }
        Command::Cleanup => {
            let summary = engine.cleanup().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Version => match engine.get_heuristics_version().await? {
            Some(version) => println!("{}", version),
            None => println!("No heuristics run recorded"),
        },
    }

    Ok(())
}

/// Accept a unique id prefix, as printed by `list`.
async fn resolve_id(engine: &RelationDiscoveryEngine, prefix: &str) -> Result<String> {
    let matches: Vec<String> = engine
        .candidates()
        .await?
        .into_iter()
        .map(|c| c.relation_id)
        .filter(|id| id.starts_with(prefix))
        .collect();
    match matches.as_slice() {
        [id] => Ok(id.clone()),
        [] => anyhow::bail!("Relation candidate not found: {}", prefix),
        _ => anyhow::bail!("Ambiguous id prefix {} ({} candidates)", prefix, matches.len()),
    }
}
