/// Schema for the cache, snapshot and queue tables.
pub const SCHEMA: &str = r#"
-- One row per active (class, version) namespace
CREATE TABLE IF NOT EXISTS cache_namespaces (
    name TEXT PRIMARY KEY,
    class TEXT NOT NULL,
    version TEXT NOT NULL,
    activated_at TEXT NOT NULL
);

-- Cached HTTP responses keyed by request fingerprint
CREATE TABLE IF NOT EXISTS cache_entries (
    namespace TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    inserted_at TEXT NOT NULL,
    PRIMARY KEY (namespace, fingerprint)
);

-- Domain snapshots (markets, positions)
CREATE TABLE IF NOT EXISTS snapshots (
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    data TEXT NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (entity_type, entity_id)
);

CREATE INDEX IF NOT EXISTS idx_snapshots_cached_at ON snapshots(cached_at);

-- Write intents awaiting dispatch. AUTOINCREMENT keeps ids from being reused.
CREATE TABLE IF NOT EXISTS pending_operations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    params TEXT NOT NULL,
    enqueued_at TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);
"#;
