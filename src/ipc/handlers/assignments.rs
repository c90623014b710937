use crate::db;
use crate::ids::LeadKind;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

const ASSIGNMENTS_LIST_MAX: i64 = 2000;

/// Lower-cased segment with every run of characters outside
/// `[a-z0-9_-]` collapsed to one underscore.
fn normalize_segment(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut in_run = false;
    for ch in value.trim().to_lowercase().chars() {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_' || ch == '-' {
            out.push(ch);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    out
}

pub fn build_assignment_id(collection: &str, lead_id: &str) -> String {
    format!(
        "{}__{}",
        normalize_segment(collection),
        normalize_segment(lead_id)
    )
}

fn str_param(params: &serde_json::Value, key: &str) -> String {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string()
}

fn lead_exists(
    conn: &Connection,
    collection: &str,
    lead_id: &str,
) -> Result<bool, rusqlite::Error> {
    let found: Option<i64> = conn
        .query_row(
            &format!(
                "SELECT 1 FROM {} WHERE id = ?1 OR edunity_id = ?1 LIMIT 1",
                collection
            ),
            [lead_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn handle_assign(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let collection = str_param(&req.params, "collection");
    let lead_id = str_param(&req.params, "leadId");
    let assigned_user_id = str_param(&req.params, "assignedUserId");
    if collection.is_empty() || lead_id.is_empty() || assigned_user_id.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "collection, leadId, and assignedUserId are required.",
            None,
        );
    }
    if LeadKind::for_collection(&collection).is_none() {
        return err(
            &req.id,
            "bad_params",
            "unknown lead collection",
            Some(json!({ "collection": collection })),
        );
    }
    if db::assert_safe_table_name(&collection).is_err() {
        return err(&req.id, "bad_params", "unknown lead collection", None);
    }

    match lead_exists(conn, &collection, &lead_id) {
        Ok(true) => {}
        Ok(false) => {
            return err(
                &req.id,
                "not_found",
                "lead not found",
                Some(json!({ "collection": collection, "leadId": lead_id })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let row_id = build_assignment_id(&collection, &lead_id);
    let assigned_at = Utc::now().to_rfc3339();
    let assigned_user_name = str_param(&req.params, "assignedUserName");
    let assigned_by_user_id = str_param(&req.params, "assignedByUserId");
    let assigned_by_name = str_param(&req.params, "assignedByName");

    let write = conn.execute(
        "INSERT OR REPLACE INTO lead_assignments(
            id, lead_id, collection_name, assigned_user_id, assigned_user_name,
            assigned_by_user_id, assigned_by_name, assigned_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &row_id,
            &lead_id,
            &collection,
            &assigned_user_id,
            &assigned_user_name,
            &assigned_by_user_id,
            &assigned_by_name,
            &assigned_at,
        ),
    );
    if let Err(e) = write {
        return err(&req.id, "db_write_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "id": row_id,
            "leadId": lead_id,
            "collectionName": collection,
            "assignedUserId": assigned_user_id,
            "assignedUserName": assigned_user_name,
            "assignedByUserId": assigned_by_user_id,
            "assignedByName": assigned_by_name,
            "assignedAt": assigned_at,
        }),
    )
}

fn handle_unassign(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let collection = str_param(&req.params, "collection");
    let lead_id = str_param(&req.params, "leadId");
    if collection.is_empty() || lead_id.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "collection and leadId are required.",
            None,
        );
    }

    let row_id = build_assignment_id(&collection, &lead_id);
    match conn.execute("DELETE FROM lead_assignments WHERE id = ?", [&row_id]) {
        Ok(n) => ok(&req.id, json!({ "id": row_id, "removed": n > 0 })),
        Err(e) => err(&req.id, "db_write_failed", e.to_string(), None),
    }
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT id, lead_id, collection_name, assigned_user_id, assigned_user_name,
                assigned_by_user_id, assigned_by_name, assigned_at
         FROM lead_assignments ORDER BY assigned_at DESC LIMIT ?",
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt.query_map([ASSIGNMENTS_LIST_MAX], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, String>(5)?,
            row.get::<_, String>(6)?,
            row.get::<_, String>(7)?,
        ))
    });
    let rows = match rows {
        Ok(v) => v.collect::<Result<Vec<_>, _>>(),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut assignments = serde_json::Map::new();
    for (id, lead_id, collection_name, user_id, user_name, by_user_id, by_name, assigned_at) in
        rows
    {
        // Rows missing their linkage are skipped, not surfaced.
        if lead_id.is_empty() || collection_name.is_empty() || user_id.is_empty() {
            continue;
        }
        assignments.insert(
            id.clone(),
            json!({
                "id": id,
                "leadId": lead_id,
                "collectionName": collection_name,
                "assignedUserId": user_id,
                "assignedUserName": user_name,
                "assignedByUserId": by_user_id,
                "assignedByName": by_name,
                "assignedAt": assigned_at,
            }),
        );
    }

    ok(&req.id, json!({ "assignments": assignments }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "leads.assign" => Some(handle_assign(state, req)),
        "leads.unassign" => Some(handle_unassign(state, req)),
        "leads.assignments.list" => Some(handle_list(state, req)),
        _ => None,
    }
}
