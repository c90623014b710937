//! Transactional allocation of sequential lead IDs.
//!
//! Every create runs inside one immediate transaction that claims the
//! next serial, the lead row keyed by the formatted ID, a registry row,
//! and one uniqueness key per contact channel. A conflicting serial is
//! retried a bounded number of times; a conflicting contact key owned
//! by a live lead is a permanent duplicate.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use thiserror::Error;

use crate::ids::{self, LeadKind, MIN_SERIAL};

pub const MAX_ALLOC_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("email and phone are required")]
    MissingContactKey,
    #[error("this email is already registered")]
    DuplicateEmail,
    #[error("this phone number is already registered")]
    DuplicatePhone,
    #[error("could not allocate a unique lead id after {0} attempts")]
    Exhausted(u32),
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

impl AllocError {
    pub fn code(&self) -> &'static str {
        match self {
            AllocError::MissingContactKey => "missing_contact_key",
            AllocError::DuplicateEmail => "duplicate_email",
            AllocError::DuplicatePhone => "duplicate_phone",
            AllocError::Exhausted(_) => "alloc_exhausted",
            AllocError::Db(_) => "db_tx_failed",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewLead {
    pub full_name: String,
    pub email: String,
    pub email_normalized: String,
    pub phone: String,
    pub phone_normalized: String,
    pub status: String,
    pub source: String,
    pub extra: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatedLead {
    pub id: String,
    pub edunity_id: String,
    pub edunity_id_serial: i64,
}

enum AttemptError {
    /// Transient conflict; the caller may try again with a fresh serial.
    Retry(&'static str),
    Fatal(AllocError),
}

impl From<rusqlite::Error> for AttemptError {
    fn from(err: rusqlite::Error) -> Self {
        if is_busy(&err) {
            AttemptError::Retry("db_busy")
        } else {
            AttemptError::Fatal(AllocError::Db(err))
        }
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
    )
}

pub fn create_lead(
    conn: &Connection,
    kind: LeadKind,
    lead: &NewLead,
) -> Result<AllocatedLead, AllocError> {
    if lead.email_normalized.is_empty() || lead.phone_normalized.is_empty() {
        return Err(AllocError::MissingContactKey);
    }

    // Best-effort floor so a stale counter never re-issues a serial that
    // is already on a row. The transaction still owns the real decision.
    let observed_max = observed_max_serial(conn, kind);

    for attempt in 1..=MAX_ALLOC_ATTEMPTS {
        match try_allocate(conn, kind, lead, observed_max) {
            Ok(allocated) => {
                tracing::info!(
                    collection = kind.collection(),
                    edunity_id = %allocated.edunity_id,
                    attempt,
                    "lead id allocated"
                );
                return Ok(allocated);
            }
            Err(AttemptError::Retry(reason)) => {
                tracing::warn!(
                    collection = kind.collection(),
                    attempt,
                    reason,
                    "lead id allocation retry"
                );
            }
            Err(AttemptError::Fatal(e)) => return Err(e),
        }
    }

    Err(AllocError::Exhausted(MAX_ALLOC_ATTEMPTS))
}

fn observed_max_serial(conn: &Connection, kind: LeadKind) -> i64 {
    let floor = MIN_SERIAL - 1;
    let newest: Option<String> = conn
        .query_row(
            &format!(
                "SELECT edunity_id FROM {} WHERE edunity_id IS NOT NULL
                 ORDER BY edunity_id DESC LIMIT 1",
                kind.collection()
            ),
            [],
            |row| row.get(0),
        )
        .optional()
        .ok()
        .flatten();
    match newest.and_then(|id| ids::parse_serial(kind, &id)) {
        Some(serial) => serial.max(floor),
        None => floor,
    }
}

fn try_allocate(
    conn: &Connection,
    kind: LeadKind,
    lead: &NewLead,
    observed_max: i64,
) -> Result<AllocatedLead, AttemptError> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;

    let current: i64 = tx
        .query_row(
            "SELECT current FROM counters WHERE name = ?",
            [kind.counter_name()],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(MIN_SERIAL - 1);

    let next_serial = (current + 1).max(observed_max + 1).max(MIN_SERIAL);
    let edunity_id = ids::format_id(kind, next_serial);
    let collection = kind.collection();

    // The candidate row key must be free.
    if lead_exists(&tx, collection, &edunity_id)? {
        return Err(AttemptError::Retry("id_key_occupied"));
    }

    // A registry entry pointing at a different live lead means the
    // serial is genuinely taken; entries for deleted leads are reclaimed.
    let registry_owner: Option<String> = tx
        .query_row(
            &format!(
                "SELECT doc_id FROM {} WHERE edunity_id = ?",
                kind.id_registry_table()
            ),
            [&edunity_id],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(owner) = registry_owner {
        if owner != edunity_id && lead_exists(&tx, collection, &owner)? {
            return Err(AttemptError::Retry("registry_occupied"));
        }
    }

    let email_key = ids::email_key(&lead.email_normalized);
    if let Some(owner) = unique_key_owner(&tx, kind, &email_key)? {
        if owner != edunity_id && lead_exists(&tx, collection, &owner)? {
            return Err(AttemptError::Fatal(AllocError::DuplicateEmail));
        }
    }

    let phone_key = ids::phone_key(&lead.phone_normalized);
    if let Some(owner) = unique_key_owner(&tx, kind, &phone_key)? {
        if owner != edunity_id && lead_exists(&tx, collection, &owner)? {
            return Err(AttemptError::Fatal(AllocError::DuplicatePhone));
        }
    }

    let now = Utc::now().to_rfc3339();

    tx.execute(
        "INSERT INTO counters(name, current, updated_at) VALUES(?, ?, ?)
         ON CONFLICT(name) DO UPDATE SET current = excluded.current,
                                         updated_at = excluded.updated_at",
        (kind.counter_name(), next_serial, &now),
    )?;

    tx.execute(
        &format!(
            "INSERT INTO {}(id, edunity_id, edunity_id_serial, full_name,
                            email, email_normalized, phone, phone_normalized,
                            status, source, extra, created_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            collection
        ),
        (
            &edunity_id,
            &edunity_id,
            next_serial,
            &lead.full_name,
            &lead.email,
            &lead.email_normalized,
            &lead.phone,
            &lead.phone_normalized,
            &lead.status,
            &lead.source,
            lead.extra.to_string(),
            &now,
        ),
    )?;

    tx.execute(
        &format!(
            "INSERT OR REPLACE INTO {}(edunity_id, doc_id, edunity_id_serial,
                                       collection, created_at, updated_at)
             VALUES(?, ?, ?, ?, ?, ?)",
            kind.id_registry_table()
        ),
        (&edunity_id, &edunity_id, next_serial, collection, &now, &now),
    )?;

    upsert_unique_key(&tx, kind, &email_key, "email", &lead.email_normalized, &edunity_id, &now)?;
    upsert_unique_key(&tx, kind, &phone_key, "phone", &lead.phone_normalized, &edunity_id, &now)?;

    tx.commit()?;

    Ok(AllocatedLead {
        id: edunity_id.clone(),
        edunity_id,
        edunity_id_serial: next_serial,
    })
}

fn lead_exists(tx: &Transaction, collection: &str, doc_id: &str) -> Result<bool, rusqlite::Error> {
    let found: Option<i64> = tx
        .query_row(
            &format!("SELECT 1 FROM {} WHERE id = ?", collection),
            [doc_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn unique_key_owner(
    tx: &Transaction,
    kind: LeadKind,
    key: &str,
) -> Result<Option<String>, rusqlite::Error> {
    tx.query_row(
        &format!(
            "SELECT doc_id FROM {} WHERE key = ?",
            kind.unique_keys_table()
        ),
        [key],
        |row| row.get(0),
    )
    .optional()
}

fn upsert_unique_key(
    tx: &Transaction,
    kind: LeadKind,
    key: &str,
    key_type: &str,
    value: &str,
    doc_id: &str,
    now: &str,
) -> Result<(), rusqlite::Error> {
    tx.execute(
        &format!(
            "INSERT OR REPLACE INTO {}(key, key_type, value, doc_id,
                                       collection, created_at, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            kind.unique_keys_table()
        ),
        (key, key_type, value, doc_id, kind.collection(), now, now),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn lead(name: &str, email: &str, phone: &str) -> NewLead {
        let email = ids::normalize_email(email);
        let phone = ids::normalize_phone(phone);
        NewLead {
            full_name: name.to_string(),
            email: email.clone(),
            email_normalized: email,
            phone: phone.clone(),
            phone_normalized: phone,
            status: String::new(),
            source: "teacher_form".to_string(),
            extra: serde_json::json!({}),
        }
    }

    #[test]
    fn first_allocation_is_min_serial() {
        let conn = db::open_in_memory().expect("open");
        let a = create_lead(&conn, LeadKind::Teacher, &lead("A", "a@x.com", "0801"))
            .expect("allocate");
        assert_eq!(a.edunity_id, "EDU-ON-T-00101");
        assert_eq!(a.edunity_id_serial, 101);
        assert_eq!(a.id, a.edunity_id);
    }

    #[test]
    fn serials_are_contiguous_across_creates() {
        let conn = db::open_in_memory().expect("open");
        for (i, serial) in (101..106).enumerate() {
            let a = create_lead(
                &conn,
                LeadKind::Teacher,
                &lead("T", &format!("t{i}@x.com"), &format!("080{i}")),
            )
            .expect("allocate");
            assert_eq!(a.edunity_id_serial, serial);
        }
        let counter: i64 = conn
            .query_row(
                "SELECT current FROM counters WHERE name = 'teacher_onboard_serial'",
                [],
                |r| r.get(0),
            )
            .expect("counter");
        assert_eq!(counter, 105);
    }

    #[test]
    fn teacher_and_parent_serials_are_independent() {
        let conn = db::open_in_memory().expect("open");
        let t = create_lead(&conn, LeadKind::Teacher, &lead("T", "t@x.com", "0801"))
            .expect("teacher");
        let p = create_lead(&conn, LeadKind::Parent, &lead("P", "p@x.com", "0802"))
            .expect("parent");
        assert_eq!(t.edunity_id, "EDU-ON-T-00101");
        assert_eq!(p.edunity_id, "ED-PR-00101");
    }

    #[test]
    fn duplicate_email_is_rejected() {
        let conn = db::open_in_memory().expect("open");
        create_lead(&conn, LeadKind::Teacher, &lead("A", "same@x.com", "0801"))
            .expect("first");
        let err = create_lead(&conn, LeadKind::Teacher, &lead("B", "SAME@X.COM", "0802"))
            .expect_err("second should conflict");
        assert!(matches!(err, AllocError::DuplicateEmail));
    }

    #[test]
    fn duplicate_phone_is_rejected() {
        let conn = db::open_in_memory().expect("open");
        create_lead(&conn, LeadKind::Teacher, &lead("A", "a@x.com", "0801-222"))
            .expect("first");
        let err = create_lead(&conn, LeadKind::Teacher, &lead("B", "b@x.com", "(0801) 222"))
            .expect_err("second should conflict");
        assert!(matches!(err, AllocError::DuplicatePhone));
    }

    #[test]
    fn missing_contact_key_is_rejected_up_front() {
        let conn = db::open_in_memory().expect("open");
        let err = create_lead(&conn, LeadKind::Teacher, &lead("A", "   ", "no digits"))
            .expect_err("no contact keys");
        assert!(matches!(err, AllocError::MissingContactKey));
    }

    #[test]
    fn stale_counter_is_bridged_by_observed_max() {
        let conn = db::open_in_memory().expect("open");
        conn.execute(
            "INSERT INTO teacher_interests(id, edunity_id, edunity_id_serial, created_at)
             VALUES('EDU-ON-T-00500', 'EDU-ON-T-00500', 500, '2024-01-01T00:00:00Z')",
            [],
        )
        .expect("seed row");
        // Counter lags far behind the visible rows.
        conn.execute(
            "INSERT INTO counters(name, current) VALUES('teacher_onboard_serial', 110)",
            [],
        )
        .expect("seed counter");

        let a = create_lead(&conn, LeadKind::Teacher, &lead("A", "a@x.com", "0801"))
            .expect("allocate");
        assert_eq!(a.edunity_id_serial, 501);
    }

    #[test]
    fn legacy_prefixed_rows_feed_the_observed_max() {
        let conn = db::open_in_memory().expect("open");
        conn.execute(
            "INSERT INTO teacher_interests(id, edunity_id, edunity_id_serial, created_at)
             VALUES('ED-ON-T-00230', 'ED-ON-T-00230', 230, '2023-01-01T00:00:00Z')",
            [],
        )
        .expect("seed legacy row");

        let a = create_lead(&conn, LeadKind::Teacher, &lead("A", "a@x.com", "0801"))
            .expect("allocate");
        assert_eq!(a.edunity_id, "EDU-ON-T-00231");
    }

    #[test]
    fn dead_unique_key_entries_are_reclaimed() {
        let conn = db::open_in_memory().expect("open");
        // Entry left behind by a lead that no longer exists.
        conn.execute(
            "INSERT INTO teacher_lead_unique_keys(key, key_type, value, doc_id, collection)
             VALUES('email:ghost@x.com', 'email', 'ghost@x.com', 'EDU-ON-T-09999', 'teacher_interests')",
            [],
        )
        .expect("seed dead key");

        let a = create_lead(&conn, LeadKind::Teacher, &lead("A", "ghost@x.com", "0801"))
            .expect("allocate over dead key");
        let owner: String = conn
            .query_row(
                "SELECT doc_id FROM teacher_lead_unique_keys WHERE key = 'email:ghost@x.com'",
                [],
                |r| r.get(0),
            )
            .expect("key owner");
        assert_eq!(owner, a.edunity_id);
    }

    #[test]
    fn squatted_candidate_key_without_serial_exhausts_retries() {
        let conn = db::open_in_memory().expect("open");
        // Row occupies the first candidate key but exposes no edunity_id,
        // so the observed-max floor cannot route around it.
        conn.execute(
            "INSERT INTO teacher_interests(id, created_at)
             VALUES('EDU-ON-T-00101', '2024-01-01T00:00:00Z')",
            [],
        )
        .expect("seed squatter");

        let err = create_lead(&conn, LeadKind::Teacher, &lead("A", "a@x.com", "0801"))
            .expect_err("allocation cannot settle");
        assert!(matches!(err, AllocError::Exhausted(MAX_ALLOC_ATTEMPTS)));
    }

    #[test]
    fn registry_entry_for_live_lead_blocks_the_serial() {
        let conn = db::open_in_memory().expect("open");
        // Live lead stored under an opaque key claims serial 101 via the
        // registry only.
        conn.execute(
            "INSERT INTO teacher_interests(id, edunity_id, created_at)
             VALUES('import-abc', NULL, '2024-01-01T00:00:00Z')",
            [],
        )
        .expect("seed opaque lead");
        conn.execute(
            "INSERT INTO teacher_lead_id_registry(edunity_id, doc_id, edunity_id_serial, collection)
             VALUES('EDU-ON-T-00101', 'import-abc', 101, 'teacher_interests')",
            [],
        )
        .expect("seed registry");

        let err = create_lead(&conn, LeadKind::Teacher, &lead("A", "a@x.com", "0801"))
            .expect_err("serial 101 is registry-claimed and never advances");
        assert!(matches!(err, AllocError::Exhausted(_)));
    }

    #[test]
    fn registry_entry_for_deleted_lead_is_reclaimed() {
        let conn = db::open_in_memory().expect("open");
        conn.execute(
            "INSERT INTO teacher_lead_id_registry(edunity_id, doc_id, edunity_id_serial, collection)
             VALUES('EDU-ON-T-00101', 'gone-row', 101, 'teacher_interests')",
            [],
        )
        .expect("seed stale registry");

        let a = create_lead(&conn, LeadKind::Teacher, &lead("A", "a@x.com", "0801"))
            .expect("allocate over stale registry entry");
        assert_eq!(a.edunity_id, "EDU-ON-T-00101");
        let owner: String = conn
            .query_row(
                "SELECT doc_id FROM teacher_lead_id_registry WHERE edunity_id = 'EDU-ON-T-00101'",
                [],
                |r| r.get(0),
            )
            .expect("registry owner");
        assert_eq!(owner, "EDU-ON-T-00101");
    }

    #[test]
    fn allocation_writes_registry_and_both_keys() {
        let conn = db::open_in_memory().expect("open");
        let a = create_lead(&conn, LeadKind::Teacher, &lead("A", "a@x.com", "0801"))
            .expect("allocate");

        let key_count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM teacher_lead_unique_keys WHERE doc_id = ?",
                [&a.edunity_id],
                |r| r.get(0),
            )
            .expect("count keys");
        assert_eq!(key_count, 2);

        let reg_serial: i64 = conn
            .query_row(
                "SELECT edunity_id_serial FROM teacher_lead_id_registry WHERE edunity_id = ?",
                [&a.edunity_id],
                |r| r.get(0),
            )
            .expect("registry serial");
        assert_eq!(reg_serial, a.edunity_id_serial);
    }
}
