use anyhow::anyhow;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;

use crate::ids::{self, LeadKind};

pub const DB_FILE_NAME: &str = "edunity.sqlite3";

/// Serialized writers from other processes get this long to drain
/// before a statement reports busy.
const BUSY_TIMEOUT_MS: u64 = 5_000;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

/// In-memory database with the full schema, for tests and dry planning.
pub fn open_in_memory() -> anyhow::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;

    create_lead_table(conn, ids::TEACHER_LEADS_COLLECTION)?;
    create_lead_table(conn, ids::PARENT_REQUESTS_COLLECTION)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS counters(
            name TEXT PRIMARY KEY,
            current INTEGER NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;

    for kind in [LeadKind::Teacher, LeadKind::Parent] {
        create_unique_keys_table(conn, kind.unique_keys_table())?;
        create_id_registry_table(conn, kind.id_registry_table())?;
    }

    conn.execute(
        "CREATE TABLE IF NOT EXISTS lead_assignments(
            id TEXT PRIMARY KEY,
            lead_id TEXT NOT NULL,
            collection_name TEXT NOT NULL,
            assigned_user_id TEXT NOT NULL,
            assigned_user_name TEXT NOT NULL DEFAULT '',
            assigned_by_user_id TEXT NOT NULL DEFAULT '',
            assigned_by_name TEXT NOT NULL DEFAULT '',
            assigned_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_lead_assignments_user ON lead_assignments(assigned_user_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teacher_follow_up_documents(
            edunity_id TEXT PRIMARY KEY,
            lead_doc_id TEXT NOT NULL,
            source_collection TEXT NOT NULL,
            teacher_full_name TEXT NOT NULL DEFAULT '',
            teacher_email TEXT NOT NULL DEFAULT '',
            teacher_phone TEXT NOT NULL DEFAULT '',
            assigned_user_id TEXT NOT NULL DEFAULT '',
            assigned_user_name TEXT NOT NULL DEFAULT '',
            nysc_applicable INTEGER NOT NULL DEFAULT 0,
            reference_contact TEXT NOT NULL DEFAULT '',
            documents TEXT NOT NULL DEFAULT '{}',
            consents TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'pending',
            submitted_at TEXT,
            pushed_to_sales_at TEXT,
            pushed_to_sales_by_user_id TEXT NOT NULL DEFAULT '',
            pushed_to_sales_by_name TEXT NOT NULL DEFAULT '',
            sales_note TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    ensure_follow_up_sales_note(conn)?;

    Ok(())
}

/// Lead tables share one layout so the allocator and repair tool can
/// run against either collection, or a renamed staging copy of one.
pub fn create_lead_table(conn: &Connection, collection: &str) -> anyhow::Result<()> {
    assert_safe_table_name(collection)?;
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS {}(
                id TEXT PRIMARY KEY,
                edunity_id TEXT,
                edunity_id_serial INTEGER,
                full_name TEXT NOT NULL DEFAULT '',
                email TEXT NOT NULL DEFAULT '',
                email_normalized TEXT NOT NULL DEFAULT '',
                phone TEXT NOT NULL DEFAULT '',
                phone_normalized TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT '',
                source TEXT NOT NULL DEFAULT '',
                extra TEXT NOT NULL DEFAULT '{{}}',
                id_reassigned_from TEXT,
                id_reassigned_at TEXT,
                created_at TEXT NOT NULL
            )",
            collection
        ),
        [],
    )?;
    // Existing workspaces may predate the repair audit columns.
    ensure_lead_reassign_columns(conn, collection)?;
    conn.execute(
        &format!(
            "CREATE INDEX IF NOT EXISTS idx_{c}_edunity_id ON {c}(edunity_id)",
            c = collection
        ),
        [],
    )?;
    conn.execute(
        &format!(
            "CREATE INDEX IF NOT EXISTS idx_{c}_email_normalized ON {c}(email_normalized)",
            c = collection
        ),
        [],
    )?;
    conn.execute(
        &format!(
            "CREATE INDEX IF NOT EXISTS idx_{c}_phone_normalized ON {c}(phone_normalized)",
            c = collection
        ),
        [],
    )?;
    conn.execute(
        &format!(
            "CREATE INDEX IF NOT EXISTS idx_{c}_created_at ON {c}(created_at)",
            c = collection
        ),
        [],
    )?;
    Ok(())
}

/// Archive copy of a lead table plus provenance columns. Archived rows
/// keep their source row key.
pub fn create_archive_table(conn: &Connection, archive: &str) -> anyhow::Result<()> {
    assert_safe_table_name(archive)?;
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS {}(
                id TEXT PRIMARY KEY,
                edunity_id TEXT,
                edunity_id_serial INTEGER,
                full_name TEXT NOT NULL DEFAULT '',
                email TEXT NOT NULL DEFAULT '',
                email_normalized TEXT NOT NULL DEFAULT '',
                phone TEXT NOT NULL DEFAULT '',
                phone_normalized TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT '',
                source TEXT NOT NULL DEFAULT '',
                extra TEXT NOT NULL DEFAULT '{{}}',
                id_reassigned_from TEXT,
                id_reassigned_at TEXT,
                created_at TEXT NOT NULL,
                _source_collection TEXT NOT NULL,
                _source_doc_id TEXT NOT NULL,
                _canonical_doc_id TEXT NOT NULL,
                _archive_reason TEXT NOT NULL,
                _archived_at TEXT NOT NULL
            )",
            archive
        ),
        [],
    )?;
    Ok(())
}

fn create_unique_keys_table(conn: &Connection, table: &str) -> anyhow::Result<()> {
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS {}(
                key TEXT PRIMARY KEY,
                key_type TEXT NOT NULL,
                value TEXT NOT NULL,
                doc_id TEXT NOT NULL,
                collection TEXT NOT NULL DEFAULT '',
                created_at TEXT,
                updated_at TEXT
            )",
            table
        ),
        [],
    )?;
    conn.execute(
        &format!(
            "CREATE INDEX IF NOT EXISTS idx_{t}_doc ON {t}(doc_id)",
            t = table
        ),
        [],
    )?;
    Ok(())
}

fn create_id_registry_table(conn: &Connection, table: &str) -> anyhow::Result<()> {
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS {}(
                edunity_id TEXT PRIMARY KEY,
                doc_id TEXT NOT NULL,
                edunity_id_serial INTEGER NOT NULL,
                collection TEXT NOT NULL DEFAULT '',
                created_at TEXT,
                updated_at TEXT
            )",
            table
        ),
        [],
    )?;
    Ok(())
}

fn ensure_lead_reassign_columns(conn: &Connection, table: &str) -> anyhow::Result<()> {
    if !table_has_column(conn, table, "id_reassigned_from")? {
        conn.execute(
            &format!("ALTER TABLE {} ADD COLUMN id_reassigned_from TEXT", table),
            [],
        )?;
    }
    if !table_has_column(conn, table, "id_reassigned_at")? {
        conn.execute(
            &format!("ALTER TABLE {} ADD COLUMN id_reassigned_at TEXT", table),
            [],
        )?;
    }
    Ok(())
}

fn ensure_follow_up_sales_note(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "teacher_follow_up_documents", "sales_note")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE teacher_follow_up_documents ADD COLUMN sales_note TEXT",
        [],
    )?;
    Ok(())
}

/// Collection names reach SQL as identifiers, not bind parameters, so
/// only `[A-Za-z0-9_]` names that do not start with a digit are allowed.
pub fn assert_safe_table_name(name: &str) -> anyhow::Result<()> {
    let mut chars = name.chars();
    let ok = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(anyhow!("unsafe table name: {:?}", name))
    }
}

pub fn table_exists(conn: &Connection, table: &str) -> anyhow::Result<bool> {
    let found: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
            [table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
