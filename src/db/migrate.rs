use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use crate::error::{Result, ReldiscoError};

/// Migration metadata
struct Migration {
    version: u32,
    name: String,
    sql: String,
    checksum: String,
}

/// Create schema_migrations table if it doesn't exist
fn ensure_migrations_table(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            checksum TEXT NOT NULL,
            applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Get list of applied migrations
pub fn get_applied_migrations(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM schema_migrations ORDER BY version")?;
    let names: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()
        .map_err(ReldiscoError::Database)?;
    Ok(names)
}

fn applied_checksum(conn: &Connection, version: u32) -> Result<Option<String>> {
    let checksum = conn
        .query_row(
            "SELECT checksum FROM schema_migrations WHERE version = ?1",
            params![version],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(checksum)
}

/// Parse "001_candidates.sql" into (1, "001_candidates")
fn parse_migration_filename(filename: &str) -> Result<(u32, String)> {
    let stem = filename
        .strip_suffix(".sql")
        .ok_or_else(|| ReldiscoError::Config(format!("Not a migration file: {}", filename)))?;
    let (version_str, _) = stem
        .split_once('_')
        .ok_or_else(|| ReldiscoError::Config(format!("Invalid migration filename: {}", filename)))?;
    let version = version_str
        .parse()
        .map_err(|_| ReldiscoError::Config(format!("Invalid migration version: {}", version_str)))?;
    Ok((version, stem.to_string()))
}

/// Load migration files from migrations directory, ordered by version
fn load_migrations(migrations_dir: &Path) -> Result<Vec<Migration>> {
    let mut migrations = Vec::new();

    for entry in fs::read_dir(migrations_dir)? {
        let path = entry?.path();
        if path.extension().and_then(|s| s.to_str()) != Some("sql") {
            continue;
        }
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ReldiscoError::Config("Invalid migration filename".to_string()))?;

        let (version, name) = parse_migration_filename(filename)?;
        let sql = fs::read_to_string(&path)?;
        let checksum = format!("{:x}", Sha256::digest(sql.as_bytes()));

        migrations.push(Migration { version, name, sql, checksum });
    }

    migrations.sort_by_key(|m| m.version);

    if let Some(pair) = migrations.windows(2).find(|w| w[0].version == w[1].version) {
        return Err(ReldiscoError::Config(format!(
            "Duplicate migration version {} ({} and {})",
            pair[0].version, pair[0].name, pair[1].name
        )));
    }

    Ok(migrations)
}

/// Run all pending migrations
///
/// A migration whose file content changed after it was applied is reported
/// as a configuration error instead of being silently skipped.
pub fn run_migrations(conn: &mut Connection, migrations_dir: &Path) -> Result<()> {
    ensure_migrations_table(conn)?;

    let mut applied_count = 0;
    for migration in load_migrations(migrations_dir)? {
        if let Some(checksum) = applied_checksum(conn, migration.version)? {
            if checksum != migration.checksum {
                return Err(ReldiscoError::Config(format!(
                    "Migration {} was modified after being applied",
                    migration.name
                )));
            }
            log::debug!("Migration {} already applied, skipping", migration.name);
            continue;
        }

        log::info!("Applying migration: {} (version {})", migration.name, migration.version);

        let tx = conn.transaction()?;
        tx.execute_batch(&migration.sql).map_err(|e| {
            ReldiscoError::Config(format!("Failed to execute migration {}: {}", migration.name, e))
        })?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name, checksum) VALUES (?1, ?2, ?3)",
            params![migration.version, migration.name, migration.checksum],
        )?;
        tx.commit()?;

        applied_count += 1;
    }

    log::info!("Migrations complete ({} newly applied)", applied_count);
    Ok(())
}
