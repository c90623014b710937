use crate::follow_up::{self, DocumentationStatus};
use crate::ids;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

fn str_param(params: &Value, key: &str) -> String {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

struct FollowUpRow {
    edunity_id: String,
    lead_doc_id: String,
    source_collection: String,
    teacher_full_name: String,
    teacher_email: String,
    teacher_phone: String,
    assigned_user_id: String,
    assigned_user_name: String,
    nysc_applicable: bool,
    reference_contact: String,
    documents: Value,
    consents: Value,
    status: String,
    submitted_at: Option<String>,
    pushed_to_sales_at: Option<String>,
    pushed_to_sales_by_user_id: String,
    pushed_to_sales_by_name: String,
    sales_note: Option<String>,
    created_at: String,
    updated_at: String,
}

const ROW_COLS: &str = "edunity_id, lead_doc_id, source_collection, teacher_full_name,
    teacher_email, teacher_phone, assigned_user_id, assigned_user_name,
    nysc_applicable, reference_contact, documents, consents, status,
    submitted_at, pushed_to_sales_at, pushed_to_sales_by_user_id,
    pushed_to_sales_by_name, sales_note, created_at, updated_at";

fn read_row(row: &rusqlite::Row) -> Result<FollowUpRow, rusqlite::Error> {
    let documents_raw: String = row.get(10)?;
    let consents_raw: String = row.get(11)?;
    Ok(FollowUpRow {
        edunity_id: row.get(0)?,
        lead_doc_id: row.get(1)?,
        source_collection: row.get(2)?,
        teacher_full_name: row.get(3)?,
        teacher_email: row.get(4)?,
        teacher_phone: row.get(5)?,
        assigned_user_id: row.get(6)?,
        assigned_user_name: row.get(7)?,
        nysc_applicable: row.get::<_, i64>(8)? != 0,
        reference_contact: row.get(9)?,
        documents: serde_json::from_str(&documents_raw).unwrap_or_else(|_| json!({})),
        consents: serde_json::from_str(&consents_raw).unwrap_or_else(|_| json!({})),
        status: row.get(12)?,
        submitted_at: row.get(13)?,
        pushed_to_sales_at: row.get(14)?,
        pushed_to_sales_by_user_id: row.get(15)?,
        pushed_to_sales_by_name: row.get(16)?,
        sales_note: row.get(17)?,
        created_at: row.get(18)?,
        updated_at: row.get(19)?,
    })
}

fn load_record(
    conn: &Connection,
    edunity_id: &str,
) -> Result<Option<FollowUpRow>, rusqlite::Error> {
    conn.query_row(
        &format!(
            "SELECT {} FROM teacher_follow_up_documents WHERE edunity_id = ?",
            ROW_COLS
        ),
        [edunity_id],
        read_row,
    )
    .optional()
}

fn record_json(row: &FollowUpRow) -> Value {
    json!({
        "edunityId": row.edunity_id,
        "leadDocId": row.lead_doc_id,
        "sourceCollection": row.source_collection,
        "teacherFullName": row.teacher_full_name,
        "teacherEmail": row.teacher_email,
        "teacherPhone": row.teacher_phone,
        "assignedUserId": row.assigned_user_id,
        "assignedUserName": row.assigned_user_name,
        "nyscApplicable": row.nysc_applicable,
        "referenceContact": row.reference_contact,
        "documents": row.documents,
        "consents": row.consents,
        "status": row.status,
        "submittedAt": row.submitted_at,
        "pushedToSalesAt": row.pushed_to_sales_at,
        "pushedToSalesByUserId": row.pushed_to_sales_by_user_id,
        "pushedToSalesByName": row.pushed_to_sales_by_name,
        "salesNote": row.sales_note,
        "createdAt": row.created_at,
        "updatedAt": row.updated_at,
    })
}

fn progress_json(record: &Value) -> Value {
    let progress = follow_up::document_progress(record);
    json!({
        "status": progress.status.as_str(),
        "requiredUploaded": progress.required_uploaded,
        "requiredTotal": progress.required_total,
        "missingRequiredKeys": progress.missing_required_keys,
        "consentsAllYes": progress.consents_all_yes,
        "hasAnyUpload": progress.has_any_upload,
    })
}

fn find_lead_or_err(
    conn: &Connection,
    req: &Request,
    raw_id: &str,
) -> Result<follow_up::LeadLookup, serde_json::Value> {
    if raw_id.trim().is_empty() {
        return Err(err(&req.id, "bad_params", "missing params.edunityId", None));
    }
    match follow_up::find_teacher_lead(conn, raw_id) {
        Ok(Some(lead)) => Ok(lead),
        Ok(None) => Err(err(
            &req.id,
            "not_found",
            "teacher lead not found",
            Some(json!({ "edunityId": raw_id })),
        )),
        Err(e) => Err(err(&req.id, "db_query_failed", e.to_string(), None)),
    }
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let raw_id = str_param(&req.params, "edunityId");
    let lead = match find_lead_or_err(conn, req, &raw_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let record_key = follow_up::normalize_lookup_id(&lead.edunity_id);
    let record = match load_record(conn, &record_key) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let lead_json = json!({
        "id": lead.doc_id,
        "edunityId": lead.edunity_id,
        "fullName": lead.full_name,
        "email": lead.email,
        "phone": lead.phone,
    });
    match record {
        Some(row) => {
            let record = record_json(&row);
            let progress = progress_json(&record);
            ok(
                &req.id,
                json!({ "record": record, "progress": progress, "lead": lead_json }),
            )
        }
        None => ok(&req.id, json!({ "record": null, "lead": lead_json })),
    }
}

fn handle_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let raw_id = str_param(&req.params, "edunityId");
    let lead = match find_lead_or_err(conn, req, &raw_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let record_key = follow_up::normalize_lookup_id(&lead.edunity_id);
    let existing = match load_record(conn, &record_key) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let now = Utc::now().to_rfc3339();

    let documents = match req.params.get("documents") {
        Some(v) if v.is_object() => v.clone(),
        Some(_) => return err(&req.id, "bad_params", "documents must be an object", None),
        None => existing
            .as_ref()
            .map(|r| r.documents.clone())
            .unwrap_or_else(|| json!({})),
    };
    let consents = match req.params.get("consents") {
        Some(v) if v.is_object() => v.clone(),
        Some(_) => return err(&req.id, "bad_params", "consents must be an object", None),
        None => existing
            .as_ref()
            .map(|r| r.consents.clone())
            .unwrap_or_else(|| json!({})),
    };
    let nysc_applicable = req
        .params
        .get("nyscApplicable")
        .and_then(Value::as_bool)
        .or(existing.as_ref().map(|r| r.nysc_applicable))
        .unwrap_or(false);
    let reference_contact = req
        .params
        .get("referenceContact")
        .and_then(Value::as_str)
        .map(|v| v.trim().to_string())
        .or(existing.as_ref().map(|r| r.reference_contact.clone()))
        .unwrap_or_default();
    let assigned_user_id = req
        .params
        .get("assignedUserId")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or(existing.as_ref().map(|r| r.assigned_user_id.clone()))
        .unwrap_or_default();
    let assigned_user_name = req
        .params
        .get("assignedUserName")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or(existing.as_ref().map(|r| r.assigned_user_name.clone()))
        .unwrap_or_default();

    // Status is always re-derived from contents; pushed stays pushed.
    let shape = json!({
        "nyscApplicable": nysc_applicable,
        "documents": documents,
        "consents": consents,
        "status": existing.as_ref().map(|r| r.status.clone()).unwrap_or_default(),
        "pushedToSalesAt": existing.as_ref().and_then(|r| r.pushed_to_sales_at.clone()),
    });
    let progress = follow_up::document_progress(&shape);

    let created_at = existing
        .as_ref()
        .map(|r| r.created_at.clone())
        .unwrap_or_else(|| now.clone());
    let submitted_at = existing
        .as_ref()
        .and_then(|r| r.submitted_at.clone())
        .unwrap_or_else(|| now.clone());

    let write = conn.execute(
        "INSERT OR REPLACE INTO teacher_follow_up_documents(
            edunity_id, lead_doc_id, source_collection, teacher_full_name,
            teacher_email, teacher_phone, assigned_user_id, assigned_user_name,
            nysc_applicable, reference_contact, documents, consents, status,
            submitted_at, pushed_to_sales_at, pushed_to_sales_by_user_id,
            pushed_to_sales_by_name, sales_note, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            record_key,
            lead.doc_id,
            ids::TEACHER_LEADS_COLLECTION,
            lead.full_name,
            lead.email,
            lead.phone,
            assigned_user_id,
            assigned_user_name,
            nysc_applicable as i64,
            reference_contact,
            documents.to_string(),
            consents.to_string(),
            progress.status.as_str(),
            submitted_at,
            existing.as_ref().and_then(|r| r.pushed_to_sales_at.clone()),
            existing
                .as_ref()
                .map(|r| r.pushed_to_sales_by_user_id.clone())
                .unwrap_or_default(),
            existing
                .as_ref()
                .map(|r| r.pushed_to_sales_by_name.clone())
                .unwrap_or_default(),
            existing.as_ref().and_then(|r| r.sales_note.clone()),
            created_at,
            now,
        ],
    );
    if let Err(e) = write {
        return err(&req.id, "db_write_failed", e.to_string(), None);
    }

    let saved = match load_record(conn, &record_key) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "db_write_failed", "record vanished after save", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let record = record_json(&saved);
    let progress = progress_json(&record);
    ok(&req.id, json!({ "record": record, "progress": progress }))
}

fn handle_push_to_sales(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let raw_id = str_param(&req.params, "edunityId");
    let lead = match find_lead_or_err(conn, req, &raw_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let record_key = follow_up::normalize_lookup_id(&lead.edunity_id);
    let existing = match load_record(conn, &record_key) {
        Ok(Some(v)) => v,
        Ok(None) => {
            return err(
                &req.id,
                "not_found",
                "no follow-up record for this lead",
                Some(json!({ "edunityId": record_key })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let record = record_json(&existing);
    let progress = follow_up::document_progress(&record);
    if progress.status == DocumentationStatus::PushedToSales {
        return err(
            &req.id,
            "conflict",
            "record was already pushed to sales",
            Some(json!({ "status": progress.status.as_str() })),
        );
    }
    if progress.status != DocumentationStatus::Complete {
        return err(
            &req.id,
            "conflict",
            "documentation must be complete before pushing to sales",
            Some(json!({
                "status": progress.status.as_str(),
                "missingRequiredKeys": progress.missing_required_keys,
                "consentsAllYes": progress.consents_all_yes,
            })),
        );
    }

    let now = Utc::now().to_rfc3339();
    let by_user_id = str_param(&req.params, "byUserId");
    let by_name = str_param(&req.params, "byName");
    let sales_note = req
        .params
        .get("salesNote")
        .and_then(Value::as_str)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    let write = conn.execute(
        "UPDATE teacher_follow_up_documents
         SET status = ?, pushed_to_sales_at = ?, pushed_to_sales_by_user_id = ?,
             pushed_to_sales_by_name = ?, sales_note = ?, updated_at = ?
         WHERE edunity_id = ?",
        rusqlite::params![
            DocumentationStatus::PushedToSales.as_str(),
            now,
            by_user_id,
            by_name,
            sales_note,
            now,
            record_key,
        ],
    );
    if let Err(e) = write {
        return err(&req.id, "db_write_failed", e.to_string(), None);
    }

    let saved = match load_record(conn, &record_key) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "db_write_failed", "record vanished after push", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let record = record_json(&saved);
    let progress = progress_json(&record);
    ok(&req.id, json!({ "record": record, "progress": progress }))
}

/// Where an upload for this lead/document should be stored. The client
/// uploads bytes to this path, then saves the record with it.
fn handle_document_path(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let raw_id = str_param(&req.params, "edunityId");
    let key = str_param(&req.params, "key");
    if key.trim().is_empty() {
        return err(&req.id, "bad_params", "missing params.key", None);
    }
    let lead = match find_lead_or_err(conn, req, &raw_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let file_name = str_param(&req.params, "fileName");
    let millis = Utc::now().timestamp_millis();
    let path = follow_up::build_document_storage_path(&lead.edunity_id, &key, &file_name, millis);
    ok(&req.id, json!({ "storagePath": path }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "followUp.get" => Some(handle_get(state, req)),
        "followUp.save" => Some(handle_save(state, req)),
        "followUp.pushToSales" => Some(handle_push_to_sales(state, req)),
        "followUp.documentPath" => Some(handle_document_path(state, req)),
        _ => None,
    }
}
