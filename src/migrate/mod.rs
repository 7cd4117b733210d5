use anyhow::{bail, Context, Result};
use clickhouse_rs::Pool;

/// One embedded schema change.
struct Migration {
    version: u32,
    name: &'static str,
    up_sql: &'static str,
    down_sql: &'static str,
}

/// Embedded migrations, ordered by version.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "init",
        up_sql: include_str!("sql/001_init.up.sql"),
        down_sql: include_str!("sql/001_init.down.sql"),
    },
    Migration {
        version: 2,
        name: "user_id_index",
        up_sql: include_str!("sql/002_user_id_index.up.sql"),
        down_sql: include_str!("sql/002_user_id_index.down.sql"),
    },
];

/// Highest embedded migration version.
pub fn latest_version() -> u32 {
    MIGRATIONS.iter().map(|m| m.version).max().unwrap_or(0)
}

/// Schema state reported by [`Migrator::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationStatus {
    pub version: u32,
    pub dirty: bool,
    pub latest: u32,
}

impl MigrationStatus {
    pub fn pending(&self) -> u32 {
        self.latest.saturating_sub(self.version)
    }
}

/// Applies the event-store schema.
///
/// Progress is tracked in a `schema_migrations` table laid out the way
/// golang-migrate does it, so existing tooling can inspect it.
pub trait Migrator: Send {
    /// Applies all pending forward migrations.
    fn up(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Rolls back the last applied migration.
    fn down(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Returns the applied version, dirty flag and latest embedded version.
    fn status(&self) -> impl std::future::Future<Output = Result<MigrationStatus>> + Send;
}

/// Migration runner for the ClickHouse event store.
pub struct ClickHouseMigrator {
    pool: Pool,
}

impl ClickHouseMigrator {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn ensure_migrations_table(&self) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for migrations table")?;

        handle
            .execute(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version Int64,
                    dirty UInt8,
                    sequence UInt64
                ) ENGINE = TinyLog",
            )
            .await
            .context("creating schema_migrations table")?;

        Ok(())
    }

    async fn current_version(&self) -> Result<(u32, bool)> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for version check")?;

        let block = handle
            .query("SELECT version, dirty FROM schema_migrations ORDER BY sequence DESC LIMIT 1")
            .fetch_all()
            .await
            .context("querying migration version")?;

        let Some(row) = block.rows().next() else {
            return Ok((0, false));
        };

        let version: i64 = row.get("version").context("reading version")?;
        let dirty: u8 = row.get("dirty").context("reading dirty flag")?;
        let version = u32::try_from(version)
            .with_context(|| format!("schema_migrations holds invalid version {version}"))?;

        Ok((version, dirty != 0))
    }

    async fn set_version(&self, version: u32, dirty: bool) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for version update")?;

        handle
            .execute("TRUNCATE TABLE schema_migrations")
            .await
            .context("truncating schema_migrations")?;

        if version == 0 {
            return Ok(());
        }

        let dirty_val = u8::from(dirty);
        let sql = format!(
            "INSERT INTO schema_migrations (version, dirty, sequence) VALUES ({version}, {dirty_val}, 1)"
        );

        handle
            .execute(sql.as_str())
            .await
            .context("inserting migration version")?;

        Ok(())
    }

    async fn execute_sql(&self, sql: &str) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for SQL execution")?;

        for statement in split_statements(sql) {
            handle.execute(statement).await.with_context(|| {
                let preview: String = statement.chars().take(80).collect();
                format!("executing migration statement: {preview}...")
            })?;
        }

        Ok(())
    }
}

impl Migrator for ClickHouseMigrator {
    async fn up(&self) -> Result<()> {
        self.ensure_migrations_table().await?;

        let (current_version, dirty) = self.current_version().await?;
        if dirty {
            bail!("migration version {current_version} is dirty, manual intervention required");
        }

        tracing::info!(current_version, latest = latest_version(), "running migrations");

        let mut applied = 0u32;

        for migration in MIGRATIONS.iter().filter(|m| m.version > current_version) {
            tracing::info!(version = migration.version, name = migration.name, "applying migration");

            self.set_version(migration.version, true).await?;
            self.execute_sql(migration.up_sql).await.with_context(|| {
                format!("applying migration {} ({})", migration.version, migration.name)
            })?;
            self.set_version(migration.version, false).await?;

            applied += 1;
        }

        if applied == 0 {
            tracing::info!("no pending migrations");
        } else {
            tracing::info!(version = latest_version(), applied, "migrations completed");
        }

        Ok(())
    }

    async fn down(&self) -> Result<()> {
        self.ensure_migrations_table().await?;

        let (current_version, _) = self.current_version().await?;
        if current_version == 0 {
            tracing::info!("no migrations to roll back");
            return Ok(());
        }

        let migration = MIGRATIONS
            .iter()
            .find(|m| m.version == current_version)
            .with_context(|| format!("migration version {current_version} not found"))?;

        tracing::info!(version = current_version, name = migration.name, "rolling back migration");

        self.set_version(current_version, true).await?;
        self.execute_sql(migration.down_sql)
            .await
            .with_context(|| format!("rolling back migration version {current_version}"))?;

        let prev_version = previous_version(current_version);
        self.set_version(prev_version, false).await?;

        tracing::info!(version = prev_version, "rollback completed");

        Ok(())
    }

    async fn status(&self) -> Result<MigrationStatus> {
        self.ensure_migrations_table().await?;
        let (version, dirty) = self.current_version().await?;

        Ok(MigrationStatus {
            version,
            dirty,
            latest: latest_version(),
        })
    }
}

fn previous_version(version: u32) -> u32 {
    MIGRATIONS
        .iter()
        .filter(|m| m.version < version)
        .map(|m| m.version)
        .max()
        .unwrap_or(0)
}

/// Splits SQL text into statements on semicolons, dropping blank segments.
fn split_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_statements_basic() {
        let sql = "CREATE TABLE foo (id Int32); CREATE TABLE bar (id Int32);";
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].starts_with("CREATE TABLE foo"));
        assert!(stmts[1].starts_with("CREATE TABLE bar"));
    }

    #[test]
    fn test_split_statements_whitespace_and_empty() {
        assert_eq!(split_statements("\n   SELECT 1;\n\n  SELECT 2;\n\n").len(), 2);
        assert!(split_statements("").is_empty());
        assert_eq!(split_statements("SELECT 1;;;").len(), 1);
    }

    #[test]
    fn test_init_migration_creates_both_tables() {
        let init = &MIGRATIONS[0];
        let stmts = split_statements(init.up_sql);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].contains("user_events"));
        assert!(stmts[1].contains("users"));
        assert!(stmts[1].contains("ReplacingMergeTree(updated_at)"));
        assert_eq!(split_statements(init.down_sql).len(), 2);
    }

    #[test]
    fn test_migrations_embedded_and_ordered() {
        for m in MIGRATIONS {
            assert!(m.version > 0);
            assert!(!m.up_sql.trim().is_empty(), "migration {} up SQL is empty", m.version);
            assert!(!m.down_sql.trim().is_empty(), "migration {} down SQL is empty", m.version);
        }
        for pair in MIGRATIONS.windows(2) {
            assert!(pair[0].version < pair[1].version);
        }
    }

    #[test]
    fn test_version_helpers() {
        assert_eq!(latest_version(), 2);
        assert_eq!(previous_version(2), 1);
        assert_eq!(previous_version(1), 0);

        let status = MigrationStatus {
            version: 1,
            dirty: false,
            latest: latest_version(),
        };
        assert_eq!(status.pending(), 1);
    }
}
