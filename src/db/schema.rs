/// Schema for the cache and offline-queue collections.
pub const SCHEMA: &str = r#"
-- Response cache (timestamps in Unix milliseconds)
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_key TEXT PRIMARY KEY,
    source_endpoint TEXT NOT NULL,
    payload BLOB NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_endpoint
    ON cache_entries(source_endpoint);

CREATE INDEX IF NOT EXISTS idx_cache_entries_expires
    ON cache_entries(expires_at);

-- Mutations captured while offline; AUTOINCREMENT ids are never reused,
-- so id order is replay order
CREATE TABLE IF NOT EXISTS offline_operations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    endpoint TEXT NOT NULL,
    method TEXT NOT NULL,
    payload BLOB NOT NULL,
    status TEXT NOT NULL,
    enqueued_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    result BLOB,
    error TEXT
);

CREATE INDEX IF NOT EXISTS idx_offline_operations_status
    ON offline_operations(status, id);
"#;
