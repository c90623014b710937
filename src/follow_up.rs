//! Follow-up documentation workflow for onboarded teachers.
//!
//! A follow-up record tracks the compliance documents collected after a
//! teacher lead is assigned: which files are in, which consents are
//! answered, and whether the record has been handed to Sales. Progress
//! is always derived from the record contents, never trusted from the
//! stored status alone, except that a pushed record stays pushed.

use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;

use crate::ids;

pub const REQUIRED_DOCUMENT_KEYS_BASE: [&str; 4] = [
    "cvPdf",
    "passportPhoto",
    "validId",
    "highestQualificationCertificate",
];
pub const NYSC_DOCUMENT_KEY: &str = "nyscCertificate";
pub const OPTIONAL_DOCUMENT_KEYS: [&str; 2] = ["trcnCertificate", "otherSupportingDocument"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentationStatus {
    Pending,
    Partial,
    Complete,
    PushedToSales,
}

impl DocumentationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentationStatus::Pending => "pending",
            DocumentationStatus::Partial => "partial",
            DocumentationStatus::Complete => "complete",
            DocumentationStatus::PushedToSales => "pushed_to_sales",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DocumentProgress {
    pub status: DocumentationStatus,
    pub required_uploaded: usize,
    pub required_total: usize,
    pub missing_required_keys: Vec<&'static str>,
    pub consents_all_yes: bool,
    pub has_any_upload: bool,
}

pub fn required_document_keys(nysc_applicable: bool) -> Vec<&'static str> {
    let mut keys: Vec<&'static str> = REQUIRED_DOCUMENT_KEYS_BASE.to_vec();
    if nysc_applicable {
        keys.push(NYSC_DOCUMENT_KEY);
    }
    keys
}

pub fn all_document_keys(nysc_applicable: bool) -> Vec<&'static str> {
    let mut keys = required_document_keys(nysc_applicable);
    keys.extend(OPTIONAL_DOCUMENT_KEYS);
    keys
}

fn entry_field<'v>(documents: &'v Value, key: &str, field: &str) -> Option<&'v str> {
    documents.get(key)?.get(field)?.as_str()
}

/// A document entry counts as uploaded once it points at stored bytes,
/// either a storage path on this machine or a remote download URL.
pub fn has_document_upload(documents: &Value, key: &str) -> bool {
    let has = |field: &str| {
        entry_field(documents, key, field)
            .map(|v| !v.trim().is_empty())
            .unwrap_or(false)
    };
    has("storagePath") || has("downloadUrl")
}

fn consent_given(consents: &Value, key: &str) -> bool {
    consents.get(key).and_then(Value::as_bool).unwrap_or(false)
}

/// Derives progress from a record-shaped JSON object (`documents`,
/// `consents`, `nyscApplicable`, `status`, `pushedToSalesAt`).
pub fn document_progress(record: &Value) -> DocumentProgress {
    let nysc_applicable = record
        .get("nyscApplicable")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let required = required_document_keys(nysc_applicable);
    let empty = Value::Null;
    let documents = record.get("documents").unwrap_or(&empty);
    let consents = record.get("consents").unwrap_or(&empty);

    let missing_required_keys: Vec<&'static str> = required
        .iter()
        .copied()
        .filter(|key| !has_document_upload(documents, key))
        .collect();
    let required_uploaded = required.len() - missing_required_keys.len();
    let has_any_upload = all_document_keys(nysc_applicable)
        .iter()
        .any(|key| has_document_upload(documents, key));

    let background = consent_given(consents, "backgroundCheckConsent");
    let safeguarding = consent_given(consents, "safeguardingPolicyAcknowledgement");
    let data_processing = consent_given(consents, "dataProcessingConsent");
    let consents_all_yes = background && safeguarding && data_processing;
    let any_consent = background || safeguarding || data_processing;

    let already_pushed = record.get("status").and_then(Value::as_str)
        == Some(DocumentationStatus::PushedToSales.as_str())
        || record
            .get("pushedToSalesAt")
            .and_then(Value::as_str)
            .map(|v| !v.trim().is_empty())
            .unwrap_or(false);

    let status = if already_pushed {
        DocumentationStatus::PushedToSales
    } else if required_uploaded == required.len() && consents_all_yes {
        DocumentationStatus::Complete
    } else if required_uploaded > 0 || has_any_upload || any_consent {
        DocumentationStatus::Partial
    } else {
        DocumentationStatus::Pending
    };

    DocumentProgress {
        status,
        required_uploaded,
        required_total: required.len(),
        missing_required_keys,
        consents_all_yes,
        has_any_upload,
    }
}

/// Uppercased, trimmed form used for record keys and lead lookups.
pub fn normalize_lookup_id(value: &str) -> String {
    value.trim().to_uppercase()
}

fn sanitize_storage_segment(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut last_dash = false;
    for ch in value.trim().chars() {
        let ch = ch.to_ascii_lowercase();
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '.' || ch == '_' {
            out.push(ch);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}

pub fn build_document_storage_path(
    edunity_id: &str,
    key: &str,
    original_file_name: &str,
    millis: i64,
) -> String {
    let id_segment = sanitize_storage_segment(&normalize_lookup_id(edunity_id));
    let mut name_segment = sanitize_storage_segment(original_file_name);
    if name_segment.is_empty() {
        name_segment = format!("{}-file", key);
    }
    format!(
        "teacher-follow-up/{}/{}/{}-{}",
        id_segment, key, millis, name_segment
    )
}

#[derive(Debug, Clone)]
pub struct LeadLookup {
    pub doc_id: String,
    pub edunity_id: String,
    pub full_name: String,
    pub email: String,
    pub phone: String,
    pub extra: Value,
}

struct LookupRow {
    doc_id: String,
    edunity_id: Option<String>,
    full_name: String,
    email: String,
    phone: String,
    extra: String,
}

fn lookup_row(row: &rusqlite::Row) -> Result<LookupRow, rusqlite::Error> {
    Ok(LookupRow {
        doc_id: row.get(0)?,
        edunity_id: row.get(1)?,
        full_name: row.get(2)?,
        email: row.get(3)?,
        phone: row.get(4)?,
        extra: row.get(5)?,
    })
}

fn find_by_exact_id(
    conn: &Connection,
    edunity_id: &str,
) -> Result<Option<LookupRow>, rusqlite::Error> {
    const COLS: &str = "id, edunity_id, full_name, email, phone, extra";
    let direct = conn
        .query_row(
            &format!(
                "SELECT {} FROM {} WHERE id = ?",
                COLS,
                ids::TEACHER_LEADS_COLLECTION
            ),
            [edunity_id],
            lookup_row,
        )
        .optional()?;
    if direct.is_some() {
        return Ok(direct);
    }
    conn.query_row(
        &format!(
            "SELECT {} FROM {} WHERE edunity_id = ? LIMIT 1",
            COLS,
            ids::TEACHER_LEADS_COLLECTION
        ),
        [edunity_id],
        lookup_row,
    )
    .optional()
}

/// Finds a teacher lead by public ID: first the row keyed directly by
/// the uppercased ID, then a field match for rows stored under opaque
/// keys. Legacy-prefixed input also matches rows already rewritten to
/// the current prefix.
pub fn find_teacher_lead(
    conn: &Connection,
    raw_id: &str,
) -> Result<Option<LeadLookup>, rusqlite::Error> {
    let mut edunity_id = normalize_lookup_id(raw_id);
    if edunity_id.is_empty() {
        return Ok(None);
    }

    let mut found = find_by_exact_id(conn, &edunity_id)?;
    if found.is_none() {
        if let Some(canonical) = ids::normalize_id(ids::LeadKind::Teacher, &edunity_id) {
            if canonical != edunity_id {
                found = find_by_exact_id(conn, &canonical)?;
                if found.is_some() {
                    edunity_id = canonical;
                }
            }
        }
    }

    Ok(found.map(|row| LeadLookup {
        doc_id: row.doc_id,
        edunity_id: row
            .edunity_id
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(edunity_id),
        full_name: row.full_name,
        email: row.email,
        phone: row.phone,
        extra: serde_json::from_str(&row.extra).unwrap_or(Value::Null),
    }))
}
