use crate::alloc::{self, NewLead};
use crate::ids::{self, LeadKind};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

use super::teacher_leads::{alloc_error_response, duplicate_preflight, list_leads, list_limit};

fn str_param(params: &serde_json::Value, key: &str) -> String {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let parent_full_name = str_param(&req.params, "parentFullName").trim().to_string();
    let email_normalized = ids::normalize_email(&str_param(&req.params, "parentEmail"));
    let phone_normalized = ids::normalize_phone(&str_param(&req.params, "parentPhone"));
    if parent_full_name.is_empty() || email_normalized.is_empty() || phone_normalized.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "parentFullName, parentEmail, and parentPhone are required.",
            None,
        );
    }

    let relationship = str_param(&req.params, "relationshipToLearner")
        .trim()
        .to_string();
    let learner_name = str_param(&req.params, "learnerName").trim().to_string();
    let requested_subjects: Vec<String> = req
        .params
        .get("requestedSubjects")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();
    if relationship.is_empty() || learner_name.is_empty() || requested_subjects.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "relationshipToLearner, learnerName, and requestedSubjects are required.",
            None,
        );
    }

    let (duplicate_email, duplicate_phone) = match duplicate_preflight(
        conn,
        LeadKind::Parent,
        &email_normalized,
        &phone_normalized,
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if duplicate_email || duplicate_phone {
        let (code, message) = if duplicate_email {
            ("duplicate_email", "This email already has a request.")
        } else {
            ("duplicate_phone", "This phone already has a request.")
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

    let number_of_learners = req
        .params
        .get("numberOfLearners")
        .and_then(|v| {
            v.as_i64()
                .or_else(|| v.as_str().and_then(|s| s.trim().parse::<i64>().ok()))
        })
        .filter(|n| *n > 0)
        .unwrap_or(1);

    let extra = json!({
        "relationshipToLearner": relationship,
        "learnerName": learner_name,
        "numberOfLearners": number_of_learners,
        "learnerClass": str_param(&req.params, "learnerClass"),
        "additionalLearners": req.params.get("additionalLearners").cloned()
            .filter(|v| v.is_array()).unwrap_or_else(|| json!([])),
        "state": str_param(&req.params, "state"),
        "lga": str_param(&req.params, "lga"),
        "area": str_param(&req.params, "area"),
        "requestedSubjects": requested_subjects,
        "examFocus": req.params.get("examFocus").cloned()
            .filter(|v| v.is_array()).unwrap_or_else(|| json!([])),
        "lessonType": str_param(&req.params, "lessonType"),
        "preferredSchedule": str_param(&req.params, "preferredSchedule").trim(),
        "urgency": str_param(&req.params, "urgency"),
        "additionalNotes": str_param(&req.params, "additionalNotes").trim(),
        "consent": req.params.get("consent").and_then(|v| v.as_bool()).unwrap_or(false),
    });

    let lead = NewLead {
        full_name: parent_full_name,
        email: email_normalized.clone(),
        email_normalized,
        phone: phone_normalized.clone(),
        phone_normalized,
        status: "new".to_string(),
        source: "parent_form".to_string(),
        extra,
    };

    match alloc::create_lead(conn, LeadKind::Parent, &lead) {
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

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let limit = list_limit(&req.params);
    match list_leads(conn, ids::PARENT_REQUESTS_COLLECTION, limit) {
        Ok(requests) => ok(&req.id, json!({ "requests": requests })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "parentRequests.create" => Some(handle_create(state, req)),
        "parentRequests.list" => Some(handle_list(state, req)),
        _ => None,
    }
}
