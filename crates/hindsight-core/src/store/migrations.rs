//! Schema migrations.
//!
//! One array of versioned, forward-only SQL migrations, applied in order at
//! `Store::new` via a `Migration { version, description, up }` table,
//! carrying the normative schema from spec.md §6.

/// One forward-only migration step.
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub up: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "banks",
        up: "
            CREATE TABLE IF NOT EXISTS banks (
                bank_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                personality TEXT NOT NULL,
                background TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
        ",
    },
    Migration {
        version: 2,
        description: "documents",
        up: "
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT NOT NULL,
                bank_id TEXT NOT NULL REFERENCES banks(bank_id) ON DELETE CASCADE,
                original_text TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                unit_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (id, bank_id)
            );
        ",
    },
    Migration {
        version: 3,
        description: "memory_units",
        up: "
            CREATE TABLE IF NOT EXISTS memory_units (
                id TEXT PRIMARY KEY,
                bank_id TEXT NOT NULL REFERENCES banks(bank_id) ON DELETE CASCADE,
                document_id TEXT,
                text TEXT NOT NULL,
                fact_type TEXT NOT NULL,
                context TEXT,
                embedding BLOB,
                occurred_start TEXT NOT NULL,
                occurred_end TEXT NOT NULL,
                mentioned_at TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                FOREIGN KEY (document_id, bank_id) REFERENCES documents(id, bank_id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_units_bank_type_mentioned
                ON memory_units (bank_id, fact_type, mentioned_at DESC);
            CREATE INDEX IF NOT EXISTS idx_units_bank_document
                ON memory_units (bank_id, document_id);
        ",
    },
    Migration {
        version: 4,
        description: "memory_units fts5",
        up: "
            CREATE VIRTUAL TABLE IF NOT EXISTS memory_units_fts USING fts5(
                text,
                context,
                content='memory_units',
                content_rowid='rowid',
                tokenize='unicode61 remove_diacritics 2'
            );
            CREATE TRIGGER IF NOT EXISTS memory_units_ai AFTER INSERT ON memory_units BEGIN
                INSERT INTO memory_units_fts(rowid, text, context)
                VALUES (new.rowid, new.text, coalesce(new.context, ''));
            END;
            CREATE TRIGGER IF NOT EXISTS memory_units_ad AFTER DELETE ON memory_units BEGIN
                INSERT INTO memory_units_fts(memory_units_fts, rowid, text, context)
                VALUES ('delete', old.rowid, old.text, coalesce(old.context, ''));
            END;
            CREATE TRIGGER IF NOT EXISTS memory_units_au AFTER UPDATE ON memory_units BEGIN
                INSERT INTO memory_units_fts(memory_units_fts, rowid, text, context)
                VALUES ('delete', old.rowid, old.text, coalesce(old.context, ''));
                INSERT INTO memory_units_fts(rowid, text, context)
                VALUES (new.rowid, new.text, coalesce(new.context, ''));
            END;
        ",
    },
    Migration {
        version: 5,
        description: "entities + unit_entities",
        up: "
            CREATE TABLE IF NOT EXISTS entities (
                id TEXT PRIMARY KEY,
                bank_id TEXT NOT NULL REFERENCES banks(bank_id) ON DELETE CASCADE,
                canonical_name TEXT NOT NULL,
                mention_count INTEGER NOT NULL DEFAULT 0,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}'
            );
            CREATE INDEX IF NOT EXISTS idx_entities_bank_name ON entities (bank_id, canonical_name);

            CREATE TABLE IF NOT EXISTS unit_entities (
                unit_id TEXT NOT NULL REFERENCES memory_units(id) ON DELETE CASCADE,
                entity_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
                PRIMARY KEY (unit_id, entity_id)
            );
            CREATE INDEX IF NOT EXISTS idx_unit_entities_entity ON unit_entities (entity_id);
        ",
    },
    Migration {
        version: 6,
        description: "memory_links",
        up: "
            CREATE TABLE IF NOT EXISTS memory_links (
                from_unit_id TEXT NOT NULL REFERENCES memory_units(id) ON DELETE CASCADE,
                to_unit_id TEXT NOT NULL REFERENCES memory_units(id) ON DELETE CASCADE,
                link_type TEXT NOT NULL,
                weight REAL NOT NULL,
                entity_id TEXT NOT NULL DEFAULT '00000000-0000-0000-0000-000000000000',
                PRIMARY KEY (from_unit_id, to_unit_id, link_type, entity_id)
            );
            CREATE INDEX IF NOT EXISTS idx_links_from ON memory_links (from_unit_id);
            CREATE INDEX IF NOT EXISTS idx_links_to ON memory_links (to_unit_id);
        ",
    },
    Migration {
        version: 7,
        description: "async_operations",
        up: "
            CREATE TABLE IF NOT EXISTS async_operations (
                id TEXT PRIMARY KEY,
                bank_id TEXT NOT NULL,
                task_type TEXT NOT NULL,
                items_count INTEGER NOT NULL DEFAULT 0,
                document_id TEXT,
                created_at TEXT NOT NULL,
                status TEXT NOT NULL,
                error_message TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_operations_bank ON async_operations (bank_id, created_at DESC);
        ",
    },
];
