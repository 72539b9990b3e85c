pub const SCHEMA: &str = r#"
-- grants table (accepted announcements)
CREATE TABLE IF NOT EXISTS grants (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL CHECK (length(title) > 0),
    url TEXT NOT NULL UNIQUE,
    deadline TEXT,
    category TEXT NOT NULL CHECK (length(category) > 0),
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_grants_deadline ON grants(deadline);
CREATE INDEX IF NOT EXISTS idx_grants_category ON grants(category);
CREATE INDEX IF NOT EXISTS idx_grants_created_at ON grants(created_at DESC);

-- rejected_candidates table (resolved URLs that are never retried)
CREATE TABLE IF NOT EXISTS rejected_candidates (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT,
    url TEXT NOT NULL UNIQUE,
    rejection_reason TEXT NOT NULL,
    extracted_text TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_rejected_created_at ON rejected_candidates(created_at DESC);
"#;
