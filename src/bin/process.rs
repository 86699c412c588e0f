use clap::Parser;
use reldisco::db::Db;
use reldisco::{Config, FullRunOptions, RelationDiscoveryEngine};
use std::path::Path;
use std::time::Instant;
use anyhow::{Context, Result};

#[derive(Parser, Debug)]
#[command(name = "process")]
#[command(about = "Run a full relation discovery pass: heuristics, cleanup, evaluation, sync")]
struct Args {
    /// Only run the heuristics pass (no oracle calls)
    #[arg(long)]
    skip_eval: bool,

    /// Re-evaluate every candidate, ignoring the skip policy
    #[arg(short, long)]
    force: bool,

    /// Keep candidates not seen by this pass
    #[arg(long)]
    no_cleanup: bool,

    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load()?;
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or("RUST_LOG", &config.reldisco.log_level)
    ).init();

    log::info!("Candidate database: {}", config.db_path().display());
    log::info!("Graph database: {}", config.graph_db_path().display());

    let migrations_dir = Path::new("migrations");
    Db::new(config.db_path()).migrate(migrations_dir).await
        .context("Failed to migrate candidate database")?;
    if config.graph_db_path() != config.db_path() {
        Db::new(config.graph_db_path()).migrate(migrations_dir).await
            .context("Failed to migrate graph database")?;
    }

    let engine = RelationDiscoveryEngine::from_config(&config)?;
    let options = FullRunOptions {
        evaluate: !args.skip_eval,
        force: args.force,
        cleanup: !args.no_cleanup,
    };

    let start = Instant::now();
    let summary = engine.run_full(options).await?;
    let elapsed = start.elapsed();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("\n=== Reldisco Run {} ===\n", summary.version);
    let h = &summary.heuristics;
    println!("Heuristics:  {} types, {} entities ({} processed, {} skipped, {} failed), {} observations",
        h.entity_types, h.entities, h.processed, h.skipped, h.failed, h.observations);
    match &summary.cleanup {
        Some(c) if c.skipped => println!("Cleanup:     skipped"),
        Some(c) => println!("Cleanup:     {} pruned, {} manual kept, {} stale pairs dropped, {} edges removed",
            c.pruned, c.retained_manual, c.observations_dropped, c.edges_removed),
        None => println!("Cleanup:     disabled"),
    }
    match &summary.evaluation {
        Some(e) => println!("Evaluation:  {} candidates, {} evaluated, {} accepted, {} skipped, {} failed",
            e.candidates, e.evaluated, e.accepted, e.skipped, e.failed),
        None => println!("Evaluation:  disabled"),
    }
    println!("Sync:        {} checked, {} synced, {} failed",
        summary.sync.checked, summary.sync.synced, summary.sync.failed);
    println!("\nCompleted in {:.1}s", elapsed.as_secs_f64());

    Ok(())
}
