use crate::alloc::{self, NewLead};
use crate::follow_up;
use crate::ids::{self, LeadKind};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

const LIST_DEFAULT_LIMIT: i64 = 200;
const LIST_MAX_LIMIT: i64 = 2000;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn db_err(e: rusqlite::Error) -> HandlerErr {
    HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    }
}

fn str_param(params: &serde_json::Value, key: &str) -> String {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn string_array_param(params: &serde_json::Value, key: &str) -> Vec<String> {
    params
        .get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Non-authoritative pre-flight: a plain query against both the raw and
/// normalized contact columns, mirroring what the intake form runs
/// before submitting. The allocator's uniqueness index is the
/// authority; this just produces a friendlier early answer.
pub(super) fn contact_in_use(
    conn: &Connection,
    collection: &str,
    column_raw: &str,
    column_normalized: &str,
    value: &str,
) -> Result<bool, rusqlite::Error> {
    let found: Option<i64> = conn
        .query_row(
            &format!(
                "SELECT 1 FROM {} WHERE {} = ?1 OR {} = ?1 LIMIT 1",
                collection, column_raw, column_normalized
            ),
            [value],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub(super) fn duplicate_preflight(
    conn: &Connection,
    kind: LeadKind,
    email_normalized: &str,
    phone_normalized: &str,
) -> Result<(bool, bool), rusqlite::Error> {
    let duplicate_email = contact_in_use(
        conn,
        kind.collection(),
        "email",
        "email_normalized",
        email_normalized,
    )?;
    let duplicate_phone = contact_in_use(
        conn,
        kind.collection(),
        "phone",
        "phone_normalized",
        phone_normalized,
    )?;
    Ok((duplicate_email, duplicate_phone))
}

pub(super) fn alloc_error_response(id: &str, e: alloc::AllocError) -> serde_json::Value {
    let details = match &e {
        alloc::AllocError::DuplicateEmail => {
            Some(json!({ "duplicateEmail": true, "duplicatePhone": false }))
        }
        alloc::AllocError::DuplicatePhone => {
            Some(json!({ "duplicateEmail": false, "duplicatePhone": true }))
        }
        _ => None,
    };
    err(id, e.code(), e.to_string(), details)
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let full_name = str_param(&req.params, "fullName").trim().to_string();
    let email_normalized = ids::normalize_email(&str_param(&req.params, "email"));
    let phone_normalized = ids::normalize_phone(&str_param(&req.params, "phone"));
    if full_name.is_empty() || email_normalized.is_empty() || phone_normalized.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "fullName, email, and phone are required.",
            None,
        );
    }

    let (duplicate_email, duplicate_phone) = match duplicate_preflight(
        conn,
        LeadKind::Teacher,
        &email_normalized,
        &phone_normalized,
    ) {
        Ok(v) => v,
        Err(e) => return db_err(e).response(&req.id),
    };
    if duplicate_email || duplicate_phone {
        let (code, message) = if duplicate_email {
            ("duplicate_email", "This email is already registered.")
        } else {
            ("duplicate_phone", "This phone number is already registered.")
        };
        return err(
            &req.id,
            code,
            message,
            Some(json!({
                "duplicateEmail": duplicate_email,
                "duplicatePhone": duplicate_phone,
            })),
        );
    }

    let extra = json!({
        "state": str_param(&req.params, "state"),
        "lga": str_param(&req.params, "lga"),
        "area": str_param(&req.params, "area"),
        "subjects": string_array_param(&req.params, "subjects"),
        "minClass": str_param(&req.params, "minClass"),
        "maxClass": str_param(&req.params, "maxClass"),
        "examFocus": string_array_param(&req.params, "examFocus"),
        "availability": str_param(&req.params, "availability"),
        "lessonType": str_param(&req.params, "lessonType"),
        "privateTutoring": str_param(&req.params, "privateTutoring"),
        "teachingExperience": str_param(&req.params, "teachingExperience"),
        "consent": req.params.get("consent").and_then(|v| v.as_bool()).unwrap_or(false),
    });

    let lead = NewLead {
        full_name,
        email: email_normalized.clone(),
        email_normalized,
        phone: phone_normalized.clone(),
        phone_normalized,
        status: String::new(),
        source: "teacher_form".to_string(),
        extra,
    };

    match alloc::create_lead(conn, LeadKind::Teacher, &lead) {
        Ok(created) => ok(
            &req.id,
            json!({
                "id": created.id,
                "edunityId": created.edunity_id,
                "edunityIdSerial": created.edunity_id_serial,
            }),
        ),
        Err(e) => alloc_error_response(&req.id, e),
    }
}

pub(super) fn list_limit(params: &serde_json::Value) -> i64 {
    params
        .get("limit")
        .and_then(|v| v.as_i64())
        .unwrap_or(LIST_DEFAULT_LIMIT)
        .clamp(1, LIST_MAX_LIMIT)
}

fn lead_row_json(row: &rusqlite::Row) -> Result<serde_json::Value, rusqlite::Error> {
    let extra_raw: String = row.get(9)?;
    let extra: serde_json::Value =
        serde_json::from_str(&extra_raw).unwrap_or(serde_json::Value::Null);
    Ok(json!({
        "id": row.get::<_, String>(0)?,
        "edunityId": row.get::<_, Option<String>>(1)?,
        "edunityIdSerial": row.get::<_, Option<i64>>(2)?,
        "fullName": row.get::<_, String>(3)?,
        "email": row.get::<_, String>(4)?,
        "phone": row.get::<_, String>(5)?,
        "status": row.get::<_, String>(6)?,
        "source": row.get::<_, String>(7)?,
        "createdAt": row.get::<_, String>(8)?,
        "extra": extra,
    }))
}

pub(super) fn list_leads(
    conn: &Connection,
    collection: &str,
    limit: i64,
) -> Result<Vec<serde_json::Value>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id, edunity_id, edunity_id_serial, full_name, email, phone,
                status, source, created_at, extra
         FROM {} ORDER BY created_at DESC, rowid DESC LIMIT ?",
        collection
    ))?;
    let rows = stmt
        .query_map([limit], |row| lead_row_json(row))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let limit = list_limit(&req.params);
    match list_leads(conn, ids::TEACHER_LEADS_COLLECTION, limit) {
        Ok(leads) => ok(&req.id, json!({ "leads": leads })),
        Err(e) => db_err(e).response(&req.id),
    }
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let raw_id = str_param(&req.params, "edunityId");
    if raw_id.trim().is_empty() {
        return err(&req.id, "bad_params", "missing params.edunityId", None);
    }

    match follow_up::find_teacher_lead(conn, &raw_id) {
        Ok(Some(lead)) => ok(
            &req.id,
            json!({
                "id": lead.doc_id,
                "edunityId": lead.edunity_id,
                "fullName": lead.full_name,
                "email": lead.email,
                "phone": lead.phone,
                "extra": lead.extra,
            }),
        ),
        Ok(None) => err(
            &req.id,
            "not_found",
            "teacher lead not found",
            Some(json!({ "edunityId": raw_id })),
        ),
        Err(e) => db_err(e).response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "teacherLeads.create" => Some(handle_create(state, req)),
        "teacherLeads.list" => Some(handle_list(state, req)),
        "teacherLeads.get" => Some(handle_get(state, req)),
        _ => None,
    }
}
