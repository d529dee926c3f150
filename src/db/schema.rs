pub const SCHEMA: &str = r#"
-- Series: one row per candidate that received a verdict
CREATE TABLE IF NOT EXISTS series (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    base_name TEXT NOT NULL UNIQUE,
    directory TEXT NOT NULL,
    is_series INTEGER NOT NULL,
    caption TEXT,                  -- NULL for rejected candidates
    raw_verdict TEXT NOT NULL,     -- JSON audit envelope
    image_count INTEGER NOT NULL,
    ordering_source TEXT NOT NULL, -- 'verifier', 'scan_order_fallback', 'rejected'
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_series_is_series ON series(is_series);
CREATE INDEX IF NOT EXISTS idx_series_image_count ON series(image_count);

-- Ordered images of a series
CREATE TABLE IF NOT EXISTS series_images (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    series_id INTEGER NOT NULL,
    image_path TEXT NOT NULL,
    order_in_series INTEGER NOT NULL,  -- 1-based
    UNIQUE (series_id, order_in_series),
    FOREIGN KEY (series_id) REFERENCES series(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_series_images_series ON series_images(series_id);

-- Analysis run history
CREATE TABLE IF NOT EXISTS analysis_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    directory TEXT NOT NULL,
    total_images INTEGER NOT NULL DEFAULT 0,
    total_series INTEGER NOT NULL DEFAULT 0,
    accepted INTEGER NOT NULL DEFAULT 0,
    deferred INTEGER NOT NULL DEFAULT 0,
    processed_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#;

