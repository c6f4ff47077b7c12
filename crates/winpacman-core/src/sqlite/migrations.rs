//! Cache schema, as an ordered list of additive steps.
//!
//! The stamp lives in SQLite's `user_version` pragma and only ever moves
//! forward: every step adds tables, columns or indexes on top of the
//! previous one, so an old database upgrades in place and keeps its rows.
//! There is no downgrade path; an older build refuses a newer file instead
//! of mangling it.

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SchemaStep {
    pub version: i32,
    pub name: &'static str,
    pub sql: &'static str,
}

const SCHEMA: [SchemaStep; 2] = [
    SchemaStep {
        version: 1,
        name: "catalog_tables",
        sql: r#"
CREATE TABLE IF NOT EXISTS packages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    package_id TEXT NOT NULL,
    manager TEXT NOT NULL,
    name TEXT NOT NULL,
    version TEXT NOT NULL,
    description TEXT,
    publisher TEXT,
    homepage TEXT,
    license TEXT,
    tags_json TEXT NOT NULL DEFAULT '[]',
    search_tokens TEXT NOT NULL DEFAULT '',
    last_seen_at_unix INTEGER,
    is_installed INTEGER NOT NULL DEFAULT 0,
    installed_version TEXT,
    install_date TEXT,
    install_source TEXT,
    install_location TEXT,
    UNIQUE (package_id, manager)
);

CREATE INDEX IF NOT EXISTS idx_packages_manager_installed
    ON packages (manager, is_installed);
CREATE INDEX IF NOT EXISTS idx_packages_install_source
    ON packages (install_source);
CREATE INDEX IF NOT EXISTS idx_packages_package_id
    ON packages (package_id);

CREATE VIRTUAL TABLE IF NOT EXISTS packages_fts USING fts5(
    package_id, name, description, tags, search_tokens,
    content='packages',
    content_rowid='id'
);

CREATE TRIGGER IF NOT EXISTS packages_fts_ai AFTER INSERT ON packages BEGIN
    INSERT INTO packages_fts(rowid, package_id, name, description, tags, search_tokens)
    VALUES (new.id, new.package_id, new.name, new.description, new.tags_json, new.search_tokens);
END;

CREATE TRIGGER IF NOT EXISTS packages_fts_ad AFTER DELETE ON packages BEGIN
    INSERT INTO packages_fts(packages_fts, rowid, package_id, name, description, tags, search_tokens)
    VALUES ('delete', old.id, old.package_id, old.name, old.description, old.tags_json, old.search_tokens);
END;

CREATE TRIGGER IF NOT EXISTS packages_fts_au AFTER UPDATE ON packages BEGIN
    INSERT INTO packages_fts(packages_fts, rowid, package_id, name, description, tags, search_tokens)
    VALUES ('delete', old.id, old.package_id, old.name, old.description, old.tags_json, old.search_tokens);
    INSERT INTO packages_fts(rowid, package_id, name, description, tags, search_tokens)
    VALUES (new.id, new.package_id, new.name, new.description, new.tags_json, new.search_tokens);
END;

CREATE TABLE IF NOT EXISTS sync_metadata (
    provider TEXT PRIMARY KEY,
    last_sync_started_at_unix INTEGER,
    last_sync_finished_at_unix INTEGER,
    last_sync_status TEXT,
    package_count INTEGER NOT NULL DEFAULT 0,
    error_message TEXT
);
"#,
    },
    SchemaStep {
        version: 2,
        name: "package_versions",
        sql: r#"
CREATE TABLE IF NOT EXISTS package_versions (
    package_id TEXT NOT NULL,
    manager TEXT NOT NULL,
    version TEXT NOT NULL,
    UNIQUE (package_id, manager, version)
);

CREATE INDEX IF NOT EXISTS idx_package_versions_identity
    ON package_versions (package_id, manager);
"#,
    },
];

pub fn schema_steps() -> &'static [SchemaStep] {
    &SCHEMA
}

pub fn latest_schema_version() -> i32 {
    SCHEMA.last().map(|step| step.version).unwrap_or(0)
}

/// Steps still missing from a database stamped at `version`.
pub fn steps_after(version: i32) -> impl Iterator<Item = &'static SchemaStep> {
    SCHEMA.iter().filter(move |step| step.version > version)
}
