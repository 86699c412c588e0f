use anyhow::{Context, Result};
use reldisco::db::{migrate, Db};
use reldisco::error::ReldiscoError;
use reldisco::{Config, RelationDiscoveryEngine};
use std::path::Path;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or("RUST_LOG", &config.reldisco.log_level)
    ).init();

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("verify");

    match command {
        "serve" => run_scheduler(config).await?,
        "verify" => run_schema_verification(&config).await?,
        other => anyhow::bail!("Unknown command: {} (expected verify or serve)", other),
    }

    Ok(())
}

/// Apply migrations to the candidate database and, when separate, the graph database.
async fn migrate_all(config: &Config) -> Result<()> {
    let migrations_dir = Path::new("migrations");
    Db::new(config.db_path())
        .migrate(migrations_dir)
        .await
        .context("Failed to migrate candidate database")?;
    if config.graph_db_path() != config.db_path() {
        Db::new(config.graph_db_path())
            .migrate(migrations_dir)
            .await
            .context("Failed to migrate graph database")?;
    }
    Ok(())
}

/// Run the periodic full-pass scheduler until Ctrl-C
async fn run_scheduler(config: Config) -> Result<()> {
    log::info!("Starting Reldisco scheduler v{}", env!("CARGO_PKG_VERSION"));
    if !config.scheduler.enabled {
        anyhow::bail!("scheduler.enabled is false in the configuration; enable it to run `serve`");
    }
    migrate_all(&config).await?;

    let engine = Arc::new(RelationDiscoveryEngine::from_config(&config)?);
    let interval = config.scheduler.interval();
    engine.start(interval).await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    log::info!("Shutdown requested");
    engine.stop().await;
    Ok(())
}

/// Run database schema verification
async fn run_schema_verification(config: &Config) -> Result<()> {
    log::info!("Starting Reldisco v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Candidate database: {}", config.db_path().display());
    log::info!("Graph database: {}", config.graph_db_path().display());
    log::info!("Oracle provider: {}", config.oracle.provider);

    migrate_all(config).await?;
    log::info!("Database initialized successfully");

    verify_database_schema(&Db::new(config.db_path())).await?;
    if config.graph_db_path() != config.db_path() {
        verify_database_schema(&Db::new(config.graph_db_path())).await?;
    }

    let engine = RelationDiscoveryEngine::from_config(config)?;
    match engine.get_heuristics_version().await? {
        Some(version) => log::info!("Current heuristics version: {}", version),
        None => log::info!("No heuristics run recorded yet"),
    }

    Ok(())
}

/// Verify that all expected database objects exist
async fn verify_database_schema(db: &Db) -> Result<()> {
    db.with_connection(|conn| {
        let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")?;
        let tables: Vec<String> = stmt.query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;

        let expected_tables = [
            "candidate_operations",
            "entities",
            "entities_fts",
            "entity_relations",
            "heuristic_observations",
            "heuristics_state",
            "relation_candidates",
            "relation_edge_owners",
            "schema_migrations",
        ];
        let missing: Vec<&str> = expected_tables
            .iter()
            .copied()
            .filter(|table| !tables.iter().any(|t| t == table))
            .collect();
        if !missing.is_empty() {
            for table in &missing {
                log::error!("Missing table: {}", table);
            }
            return Err(ReldiscoError::Config("Not all required tables exist".to_string()));
        }
        log::debug!("✓ {} tables present", expected_tables.len());

        let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type='trigger' ORDER BY name")?;
        let triggers: Vec<String> = stmt.query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
        for trigger in ["entities_fts_insert", "entities_fts_delete", "entities_fts_update"] {
            if !triggers.iter().any(|t| t == trigger) {
                return Err(ReldiscoError::Config(format!("Missing trigger: {}", trigger)));
            }
        }
        log::debug!("✓ FTS5 triggers exist");

        let applied = migrate::get_applied_migrations(conn)?;
        log::debug!("✓ {} migrations applied", applied.len());

        let journal_mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        if journal_mode.to_uppercase() != "WAL" {
            return Err(ReldiscoError::Config(format!("Journal mode is not WAL: {}", journal_mode)));
        }

        let integrity: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        if integrity != "ok" {
            return Err(ReldiscoError::Config(format!("Database integrity check failed: {}", integrity)));
        }
        log::info!("✓ Database integrity: OK");

        Ok(())
    }).await?;

    log::info!("✓ Schema verification complete for {}", db.path().display());
    Ok(())
}
