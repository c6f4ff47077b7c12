use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::Connection;
use tracing::debug;

use crate::models::{
    CoreError, CoreErrorKind, CoreResult, Freshness, Manager, PackageRecord, PackageVersion,
    SyncMetadata, SyncStatus, derive_search_tokens,
};
use crate::persistence::{CatalogHit, MigrationStore, PackageStore, SyncStateStore};
use crate::sqlite::fts::sanitize_match_query;
use crate::sqlite::migrations::{latest_schema_version, schema_steps, steps_after};

const RECORD_COLUMNS: &str = "package_id, manager, name, version, description, publisher, \
     homepage, license, tags_json, search_tokens, last_seen_at_unix, is_installed, \
     installed_version, install_date, install_source, install_location";

/// Embedded catalog store. Connections are opened per operation; the
/// database runs in WAL mode so readers never block writers.
pub struct SqliteStore {
    database_path: PathBuf,
}

impl SqliteStore {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
        }
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    fn with_connection<T>(
        &self,
        operation_name: &str,
        operation: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> CoreResult<T> {
        let mut connection = open_connection(&self.database_path).map_err(|error| {
            CoreError::new(
                CoreErrorKind::CacheCorrupt,
                format!(
                    "cache database '{}' refused to open: {error}",
                    self.database_path.display()
                ),
            )
        })?;
        operation(&mut connection).map_err(|error| storage_error(operation_name, error))
    }
}

impl MigrationStore for SqliteStore {
    fn current_version(&self) -> CoreResult<i64> {
        self.with_connection("current_version", |connection| {
            schema_version(connection).map(i64::from)
        })
    }

    fn migrate_to_latest(&self) -> CoreResult<()> {
        self.migrate_to(latest_schema_version())
    }
}

impl SqliteStore {
    /// Bring the schema forward to `target`, one step per transaction so a
    /// crash mid-upgrade leaves a coherent stamp. The cache never migrates
    /// backwards: an older build refuses a newer file rather than touch it.
    pub fn migrate_to(&self, target: i32) -> CoreResult<()> {
        if target != 0 && schema_steps().iter().all(|step| step.version != target) {
            return Err(CoreError::new(
                CoreErrorKind::StorageFailure,
                format!("cache schema version {target} does not exist in this build"),
            ));
        }

        self.with_connection("migrate_to", |connection| {
            let stamped = schema_version(connection)?;
            if stamped > target {
                return Err(sqlite_message_error(&format!(
                    "cache file is at schema {stamped}, newer than this build's {target}; refusing to open it"
                )));
            }

            for step in steps_after(stamped) {
                if step.version > target {
                    break;
                }
                debug!(version = step.version, name = step.name, "applying schema step");
                let transaction = connection.transaction()?;
                transaction.execute_batch(step.sql)?;
                transaction.pragma_update(None, "user_version", step.version)?;
                transaction.commit()?;
            }

            Ok(())
        })
    }
}

impl PackageStore for SqliteStore {
    fn refresh_started(&self, provider: Manager, started_at: i64) -> CoreResult<()> {
        self.with_connection("refresh_started", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "
INSERT INTO sync_metadata (provider, last_sync_started_at_unix, error_message)
VALUES (?1, ?2, NULL)
ON CONFLICT(provider) DO UPDATE SET
    last_sync_started_at_unix = excluded.last_sync_started_at_unix,
    error_message = NULL
",
                (provider.as_str(), started_at),
            )?;
            Ok(())
        })
    }

    fn insert_batch(
        &self,
        provider: Manager,
        records: &[PackageRecord],
        versions: &[PackageVersion],
        first_batch: bool,
    ) -> CoreResult<()> {
        self.with_connection("insert_batch", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = connection.transaction()?;

            // The slice delete rides in the first batch's transaction: a
            // sync that dies before producing anything leaves the previous
            // slice in place.
            if first_batch {
                transaction.execute(
                    "DELETE FROM packages WHERE manager = ?1",
                    [provider.as_str()],
                )?;
                transaction.execute(
                    "DELETE FROM package_versions WHERE manager = ?1",
                    [provider.as_str()],
                )?;
            }

            {
                let mut statement = transaction.prepare(&format!(
                    "
INSERT INTO packages ({RECORD_COLUMNS})
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
ON CONFLICT(package_id, manager) DO UPDATE SET
    name = excluded.name,
    version = excluded.version,
    description = excluded.description,
    publisher = excluded.publisher,
    homepage = excluded.homepage,
    license = excluded.license,
    tags_json = excluded.tags_json,
    search_tokens = excluded.search_tokens,
    last_seen_at_unix = excluded.last_seen_at_unix
"
                ))?;

                for record in records {
                    bind_record(&mut statement, record, record.manager)?;
                }
            }

            {
                let mut statement = transaction.prepare(
                    "
INSERT OR IGNORE INTO package_versions (package_id, manager, version)
VALUES (?1, ?2, ?3)
",
                )?;
                for entry in versions {
                    statement.execute((
                        entry.package_id.as_str(),
                        entry.manager.as_str(),
                        entry.version.as_str(),
                    ))?;
                }
            }

            transaction.commit()
        })
    }

    fn refresh_finished(
        &self,
        provider: Manager,
        status: SyncStatus,
        finished_at: i64,
        error_message: Option<&str>,
    ) -> CoreResult<()> {
        self.with_connection("refresh_finished", |connection| {
            ensure_schema_ready(connection)?;
            let count: u64 = connection.query_row(
                "SELECT COUNT(*) FROM packages WHERE manager = ?1",
                [provider.as_str()],
                |row| row.get(0),
            )?;
            connection.execute(
                "
INSERT INTO sync_metadata
    (provider, last_sync_finished_at_unix, last_sync_status, package_count, error_message)
VALUES (?1, ?2, ?3, ?4, ?5)
ON CONFLICT(provider) DO UPDATE SET
    last_sync_finished_at_unix = excluded.last_sync_finished_at_unix,
    last_sync_status = excluded.last_sync_status,
    package_count = excluded.package_count,
    error_message = excluded.error_message
",
                (
                    provider.as_str(),
                    finished_at,
                    status.as_str(),
                    count,
                    error_message,
                ),
            )?;
            debug!(provider = %provider, status = status.as_str(), count, "refresh finished");
            Ok(())
        })
    }

    fn search(
        &self,
        query: &str,
        managers: Option<&[Manager]>,
        limit: usize,
    ) -> CoreResult<Vec<PackageRecord>> {
        let Some(match_query) = sanitize_match_query(query) else {
            return Ok(Vec::new());
        };

        let manager_filter = manager_filter_sql("packages.manager", managers);
        let qualified_columns = RECORD_COLUMNS
            .split(", ")
            .map(|column| format!("packages.{column}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "
SELECT {qualified_columns} FROM packages
JOIN packages_fts ON packages.id = packages_fts.rowid
WHERE packages_fts MATCH ?1 {manager_filter}
ORDER BY bm25(packages_fts)
LIMIT ?2
"
        );

        let result = self.with_connection("search", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(&sql)?;
            let rows = statement.query_map((match_query.as_str(), limit as i64), row_to_record)?;
            rows.collect()
        });

        // An FTS error on a sanitized query means the index no longer lines
        // up with the content table.
        result.map_err(|error| {
            let lowered = error.message.to_lowercase();
            if lowered.contains("fts5") || lowered.contains("malformed") {
                CoreError::new(
                    CoreErrorKind::CacheCorrupt,
                    format!("full-text index is inconsistent: {}", error.message),
                )
            } else {
                error
            }
        })
    }

    fn list_available(
        &self,
        manager: Option<Manager>,
        limit: usize,
    ) -> CoreResult<Vec<PackageRecord>> {
        let manager_filter = manager_filter_sql("manager", manager.as_ref().map(std::slice::from_ref));
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM packages WHERE 1=1 {manager_filter} ORDER BY name LIMIT ?1"
        );
        self.with_connection("list_available", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(&sql)?;
            let rows = statement.query_map([limit as i64], row_to_record)?;
            rows.collect()
        })
    }

    fn get_installed(
        &self,
        managers: Option<&[Manager]>,
        source: Option<Manager>,
    ) -> CoreResult<Vec<PackageRecord>> {
        let manager_filter = manager_filter_sql("manager", managers);
        let source_filter = match source {
            Some(source) => format!("AND install_source = '{}'", source.as_str()),
            None => String::new(),
        };
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM packages \
             WHERE is_installed = 1 {manager_filter} {source_filter} ORDER BY name"
        );
        self.with_connection("get_installed", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(&sql)?;
            let rows = statement.query_map([], row_to_record)?;
            rows.collect()
        })
    }

    fn get_package(&self, package_id: &str, manager: Manager) -> CoreResult<Option<PackageRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM packages WHERE package_id = ?1 AND manager = ?2"
        );
        self.with_connection("get_package", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(&sql)?;
            let mut rows = statement.query_map((package_id, manager.as_str()), row_to_record)?;
            rows.next().transpose()
        })
    }

    fn find_manager(&self, package_id: &str, name: &str) -> CoreResult<Option<CatalogHit>> {
        let catalog_filter = manager_filter_sql("manager", Some(&Manager::CATALOG));
        let lookups = [
            (
                format!("SELECT package_id, manager, name FROM packages WHERE package_id = ?1 {catalog_filter} LIMIT 1"),
                package_id,
            ),
            (
                format!("SELECT package_id, manager, name FROM packages WHERE package_id = ?1 COLLATE NOCASE {catalog_filter} LIMIT 1"),
                package_id,
            ),
            (
                format!("SELECT package_id, manager, name FROM packages WHERE name = ?1 COLLATE NOCASE {catalog_filter} LIMIT 1"),
                name,
            ),
        ];

        self.with_connection("find_manager", |connection| {
            ensure_schema_ready(connection)?;
            for (sql, needle) in &lookups {
                let mut statement = connection.prepare(sql)?;
                let mut rows = statement.query_map([needle], |row| {
                    let package_id: String = row.get(0)?;
                    let manager: String = row.get(1)?;
                    let name: String = row.get(2)?;
                    Ok(CatalogHit {
                        manager: parse_manager(&manager)?,
                        package_id,
                        name,
                    })
                })?;
                if let Some(hit) = rows.next().transpose()? {
                    return Ok(Some(hit));
                }
            }
            Ok(None)
        })
    }

    fn sync_installed(&self, records: &[PackageRecord]) -> CoreResult<()> {
        self.with_connection("sync_installed", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = connection.transaction()?;

            transaction.execute(
                "
UPDATE packages SET
    is_installed = 0,
    installed_version = NULL,
    install_date = NULL,
    install_source = NULL,
    install_location = NULL
WHERE is_installed = 1
",
                [],
            )?;

            {
                let mut update = transaction.prepare(
                    "
UPDATE packages SET
    is_installed = 1,
    installed_version = ?1,
    install_date = ?2,
    install_source = ?3,
    install_location = ?4
WHERE package_id = ?5 AND manager = ?6
",
                )?;
                let mut insert = transaction.prepare(&format!(
                    "
INSERT INTO packages ({RECORD_COLUMNS})
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
ON CONFLICT(package_id, manager) DO UPDATE SET
    is_installed = excluded.is_installed,
    installed_version = excluded.installed_version,
    install_date = excluded.install_date,
    install_source = excluded.install_source,
    install_location = excluded.install_location
"
                ))?;

                for record in records {
                    let changed = update.execute((
                        record.installed_version.as_deref(),
                        record.install_date.as_deref(),
                        record.install_source.map(Manager::as_str),
                        record.install_location.as_deref(),
                        record.package_id.as_str(),
                        record.manager.as_str(),
                    ))?;
                    if changed == 0 {
                        let manager = record.install_source.unwrap_or(record.manager);
                        bind_record(&mut insert, record, manager)?;
                    }
                }
            }

            transaction.commit()
        })
    }

    fn upsert_one(&self, record: &PackageRecord) -> CoreResult<()> {
        self.with_connection("upsert_one", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(&format!(
                "
INSERT INTO packages ({RECORD_COLUMNS})
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
ON CONFLICT(package_id, manager) DO UPDATE SET
    name = excluded.name,
    version = excluded.version,
    description = excluded.description,
    publisher = excluded.publisher,
    homepage = excluded.homepage,
    license = excluded.license,
    tags_json = excluded.tags_json,
    search_tokens = excluded.search_tokens,
    last_seen_at_unix = excluded.last_seen_at_unix
"
            ))?;
            bind_record(&mut statement, record, record.manager)?;
            Ok(())
        })
    }

    fn versions_of(&self, package_id: &str, manager: Manager) -> CoreResult<Vec<String>> {
        self.with_connection("versions_of", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(
                "
SELECT version FROM package_versions
WHERE package_id = ?1 AND manager = ?2
ORDER BY version
",
            )?;
            let rows = statement.query_map((package_id, manager.as_str()), |row| row.get(0))?;
            rows.collect()
        })
    }

    fn package_count(&self, provider: Manager) -> CoreResult<u64> {
        self.with_connection("package_count", |connection| {
            ensure_schema_ready(connection)?;
            connection.query_row(
                "SELECT COUNT(*) FROM packages WHERE manager = ?1",
                [provider.as_str()],
                |row| row.get(0),
            )
        })
    }
}

impl SyncStateStore for SqliteStore {
    fn sync_metadata(&self, provider: Manager) -> CoreResult<SyncMetadata> {
        self.with_connection("sync_metadata", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(
                "
SELECT last_sync_started_at_unix, last_sync_finished_at_unix, last_sync_status,
       package_count, error_message
FROM sync_metadata WHERE provider = ?1
",
            )?;
            let mut rows = statement.query_map([provider.as_str()], |row| {
                let status: Option<String> = row.get(2)?;
                Ok(SyncMetadata {
                    provider,
                    last_sync_started_at: row.get(0)?,
                    last_sync_finished_at: row.get(1)?,
                    last_sync_status: status.as_deref().and_then(SyncStatus::from_str),
                    package_count: row.get::<_, i64>(3)? as u64,
                    error_message: row.get(4)?,
                })
            })?;
            Ok(rows
                .next()
                .transpose()?
                .unwrap_or_else(|| SyncMetadata::empty(provider)))
        })
    }

    fn freshness(&self, provider: Manager) -> CoreResult<Freshness> {
        let metadata = self.sync_metadata(provider)?;
        Ok(Freshness {
            provider,
            last_sync_at: metadata.last_sync_finished_at,
            package_count: metadata.package_count,
            status: metadata.last_sync_status,
        })
    }

    fn all_freshness(&self) -> CoreResult<Vec<Freshness>> {
        Manager::CATALOG
            .iter()
            .map(|provider| self.freshness(*provider))
            .collect()
    }
}

fn bind_record(
    statement: &mut rusqlite::Statement<'_>,
    record: &PackageRecord,
    manager: Manager,
) -> rusqlite::Result<()> {
    // Derived on every write so the invariant holds regardless of what the
    // producer filled in.
    let search_tokens = derive_search_tokens(
        &record.package_id,
        &record.name,
        record.description.as_deref(),
        &record.tags,
    );
    let tags_json = serde_json::to_string(&record.tags).unwrap_or_else(|_| "[]".to_string());

    statement.execute((
        record.package_id.as_str(),
        manager.as_str(),
        record.name.as_str(),
        record.version.as_str(),
        record.description.as_deref(),
        record.publisher.as_deref(),
        record.homepage.as_deref(),
        record.license.as_deref(),
        tags_json,
        search_tokens,
        record.last_seen_at,
        record.is_installed as i64,
        record.installed_version.as_deref(),
        record.install_date.as_deref(),
        record.install_source.map(Manager::as_str),
        record.install_location.as_deref(),
    ))?;
    Ok(())
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<PackageRecord> {
    let manager: String = row.get(1)?;
    let tags_json: String = row.get(8)?;
    let install_source: Option<String> = row.get(14)?;

    Ok(PackageRecord {
        package_id: row.get(0)?,
        manager: parse_manager(&manager)?,
        name: row.get(2)?,
        version: row.get(3)?,
        description: row.get(4)?,
        publisher: row.get(5)?,
        homepage: row.get(6)?,
        license: row.get(7)?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        search_tokens: row.get(9)?,
        last_seen_at: row.get(10)?,
        is_installed: row.get::<_, i64>(11)? != 0,
        installed_version: row.get(12)?,
        install_date: row.get(13)?,
        install_source: install_source.as_deref().and_then(Manager::from_str),
        install_location: row.get(15)?,
    })
}

/// Inline a manager filter from the closed enum; values are known literals,
/// never user input.
fn manager_filter_sql(column: &str, managers: Option<&[Manager]>) -> String {
    match managers {
        Some(managers) if !managers.is_empty() => {
            let list = managers
                .iter()
                .map(|manager| format!("'{}'", manager.as_str()))
                .collect::<Vec<_>>()
                .join(", ");
            format!("AND {column} IN ({list})")
        }
        _ => String::new(),
    }
}

fn open_connection(database_path: &Path) -> rusqlite::Result<Connection> {
    if let Some(parent) = database_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))?;
        }
    }
    let connection = Connection::open(database_path)?;
    connection.pragma_update(None, "journal_mode", "WAL")?;
    connection.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(connection)
}

/// The `user_version` pragma carries the schema stamp.
fn schema_version(connection: &Connection) -> rusqlite::Result<i32> {
    connection.query_row("PRAGMA user_version", [], |row| row.get(0))
}

fn ensure_schema_ready(connection: &Connection) -> rusqlite::Result<()> {
    if schema_version(connection)? < latest_schema_version() {
        return Err(sqlite_message_error(
            "cache schema is behind this build; run migrations before package operations",
        ));
    }
    Ok(())
}

fn sqlite_message_error(message: &str) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(message.to_string())))
}

fn parse_manager(raw: &str) -> rusqlite::Result<Manager> {
    Manager::from_str(raw).ok_or_else(|| {
        sqlite_message_error(&format!("unknown manager '{raw}' found in persisted record"))
    })
}

fn storage_error(operation: &str, error: rusqlite::Error) -> CoreError {
    CoreError::new(
        CoreErrorKind::StorageFailure,
        format!("cache {operation}: {error}"),
    )
}
