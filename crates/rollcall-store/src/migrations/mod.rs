//! Schema migrations, tracked through `PRAGMA user_version`.

use rusqlite::Connection;

#[derive(Debug, Clone, Copy)]
struct Migration {
    version: u32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: include_str!("0001_init.sql"),
}];

/// Latest schema version this binary knows.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}

#[derive(Debug)]
pub enum MigrationOutcome {
    UpToDate(u32),
    Applied { from: u32, to: u32 },
    TooNew { db_version: u32, latest: u32 },
}

/// Apply every pending migration in one transaction.
pub fn apply(conn: &mut Connection) -> rusqlite::Result<MigrationOutcome> {
    let current: u32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    let latest = latest_version();

    if current > latest {
        return Ok(MigrationOutcome::TooNew {
            db_version: current,
            latest,
        });
    }
    if current == latest {
        return Ok(MigrationOutcome::UpToDate(current));
    }

    let tx = conn.transaction()?;
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        tx.execute_batch(migration.sql)?;
        tx.execute_batch(&format!("PRAGMA user_version = {};", migration.version))?;
    }
    tx.commit()?;

    Ok(MigrationOutcome::Applied { from: current, to: latest })
}
