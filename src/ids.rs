//! Lead ID grammar and contact-key normalization.
//!
//! Human-facing IDs are a fixed prefix plus a zero-padded serial, e.g.
//! `EDU-ON-T-00123`. Teacher leads issued before the prefix change use
//! `ED-ON-T-` and are still accepted on parse; writes always emit the
//! current prefix.

pub const TEACHER_LEADS_COLLECTION: &str = "teacher_interests";
pub const PARENT_REQUESTS_COLLECTION: &str = "parent_requests";

pub const TEACHER_LEAD_ID_PREFIX: &str = "EDU-ON-T-";
pub const LEGACY_TEACHER_LEAD_ID_PREFIX: &str = "ED-ON-T-";
pub const PARENT_REQUEST_ID_PREFIX: &str = "ED-PR-";

/// Serials below this are reserved; the first issued ID ends in 00101.
pub const MIN_SERIAL: i64 = 101;
pub const SERIAL_WIDTH: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadKind {
    Teacher,
    Parent,
}

impl LeadKind {
    pub fn collection(self) -> &'static str {
        match self {
            LeadKind::Teacher => TEACHER_LEADS_COLLECTION,
            LeadKind::Parent => PARENT_REQUESTS_COLLECTION,
        }
    }

    pub fn for_collection(name: &str) -> Option<LeadKind> {
        match name {
            TEACHER_LEADS_COLLECTION => Some(LeadKind::Teacher),
            PARENT_REQUESTS_COLLECTION => Some(LeadKind::Parent),
            _ => None,
        }
    }

    pub fn counter_name(self) -> &'static str {
        match self {
            LeadKind::Teacher => "teacher_onboard_serial",
            LeadKind::Parent => "parent_request_serial",
        }
    }

    pub fn id_prefix(self) -> &'static str {
        match self {
            LeadKind::Teacher => TEACHER_LEAD_ID_PREFIX,
            LeadKind::Parent => PARENT_REQUEST_ID_PREFIX,
        }
    }

    pub fn legacy_id_prefix(self) -> Option<&'static str> {
        match self {
            LeadKind::Teacher => Some(LEGACY_TEACHER_LEAD_ID_PREFIX),
            LeadKind::Parent => None,
        }
    }

    pub fn unique_keys_table(self) -> &'static str {
        match self {
            LeadKind::Teacher => "teacher_lead_unique_keys",
            LeadKind::Parent => "parent_request_unique_keys",
        }
    }

    pub fn id_registry_table(self) -> &'static str {
        match self {
            LeadKind::Teacher => "teacher_lead_id_registry",
            LeadKind::Parent => "parent_request_id_registry",
        }
    }
}

pub fn archive_collection(collection: &str) -> String {
    format!("{}_dedup_archive", collection)
}

pub fn normalize_email(value: &str) -> String {
    value.trim().to_lowercase()
}

pub fn normalize_phone(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii_digit()).collect()
}

pub fn email_key(normalized_email: &str) -> String {
    format!("email:{}", normalized_email)
}

pub fn phone_key(normalized_phone: &str) -> String {
    format!("phone:{}", normalized_phone)
}

/// Extracts the serial from an ID in current or legacy form.
/// Prefix matching is case-insensitive; the serial must be exactly
/// [`SERIAL_WIDTH`] digits.
pub fn parse_serial(kind: LeadKind, id: &str) -> Option<i64> {
    let trimmed = id.trim();
    if let Some(serial) = strip_prefixed_serial(trimmed, kind.id_prefix()) {
        return Some(serial);
    }
    if let Some(legacy) = kind.legacy_id_prefix() {
        if let Some(serial) = strip_prefixed_serial(trimmed, legacy) {
            return Some(serial);
        }
    }
    None
}

fn strip_prefixed_serial(id: &str, prefix: &str) -> Option<i64> {
    if id.len() != prefix.len() + SERIAL_WIDTH {
        return None;
    }
    let (head, tail) = id.split_at(prefix.len());
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    if !tail.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    tail.parse::<i64>().ok()
}

pub fn format_id(kind: LeadKind, serial: i64) -> String {
    format!(
        "{}{:0width$}",
        kind.id_prefix(),
        serial,
        width = SERIAL_WIDTH
    )
}

/// Rewrites any accepted ID form into the canonical current-prefix form.
/// Returns `None` when the input does not parse at all.
pub fn normalize_id(kind: LeadKind, id: &str) -> Option<String> {
    parse_serial(kind, id).map(|serial| format_id(kind, serial))
}
