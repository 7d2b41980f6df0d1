// Migration Runner
//
// Migrations are applied once each, in list order, and recorded by ID in the
// `migrations` table.

use crate::map_sqlx_error;
use sqlx::SqlitePool;
use std::collections::HashSet;
use taskbed_core::error::Result;
use tracing::{debug, info};

/// Built-in migrations, in application order
pub const MIGRATIONS: &[(&str, &str)] = &[
    ("001_jobs", include_str!("../migrations/001_jobs.sql")),
    ("002_meta", include_str!("../migrations/002_meta.sql")),
];

/// Run the built-in migrations. Returns how many were newly applied.
pub async fn run_migrations(pool: &SqlitePool) -> Result<usize> {
    apply_migrations(pool, MIGRATIONS).await
}

/// Apply `migrations` that are not yet recorded
///
/// # Panics
/// If two migrations share an ID.
pub async fn apply_migrations(pool: &SqlitePool, migrations: &[(&str, &str)]) -> Result<usize> {
    let mut seen = HashSet::new();
    for (id, _) in migrations {
        assert!(seen.insert(*id), "duplicate migration ID {id}");
    }

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS migrations (id TEXT PRIMARY KEY NOT NULL, applied_at INTEGER NOT NULL)",
    )
    .execute(pool)
    .await
    .map_err(map_sqlx_error)?;

    let mut applied = 0;
    for (id, sql) in migrations {
        let done: Option<String> = sqlx::query_scalar("SELECT id FROM migrations WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(map_sqlx_error)?;
        if done.is_some() {
            debug!(migration = %id, "Migration already applied");
            continue;
        }

        info!(migration = %id, "Applying migration");
        apply_migration(pool, id, sql).await?;
        applied += 1;
    }

    if applied > 0 {
        info!(applied, "Database migrations applied");
    }
    Ok(applied)
}

/// Apply one migration and record it, atomically
async fn apply_migration(pool: &SqlitePool, id: &str, sql: &str) -> Result<()> {
    let mut tx = pool.begin().await.map_err(map_sqlx_error)?;

    for statement in sql.split(';') {
        let clean_statement: String = statement
            .lines()
            .filter(|line| !line.trim().starts_with("--"))
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string();

        if !clean_statement.is_empty() {
            sqlx::query(&clean_statement)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        }
    }

    sqlx::query("INSERT INTO migrations (id, applied_at) VALUES (?, ?)")
        .bind(id)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

    tx.commit().await.map_err(map_sqlx_error)
}
