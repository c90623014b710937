//! Duplicate-contact reconciliation over a lead collection.
//!
//! Planning is read-only: load every row, connect rows that share a
//! normalized email or phone, pick one canonical row per component,
//! then derive the row moves, ID reassignments, and index repairs that
//! would make the collection clean. Applying executes the plan in
//! bounded batches, archiving each duplicate before its delete so an
//! interrupted run never loses a row.

use anyhow::anyhow;
use chrono::Utc;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use crate::db;
use crate::ids::{self, LeadKind, MIN_SERIAL};

/// Write-op ceiling per committed batch.
pub const MAX_WRITES_PER_BATCH: usize = 450;

pub const ARCHIVE_REASON: &str = "duplicate_contact";

/// Array-backed disjoint set with union by rank and path halving.
pub struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    pub fn new(len: usize) -> Self {
        UnionFind {
            parent: (0..len).collect(),
            rank: vec![0; len],
        }
    }

    pub fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    pub fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            Ordering::Less => self.parent[ra] = rb,
            Ordering::Greater => self.parent[rb] = ra,
            Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

struct LeadDoc {
    doc_id: String,
    edunity_id: String,
    serial: Option<i64>,
    email: String,
    email_normalized: String,
    phone: String,
    phone_normalized: String,
    email_effective: String,
    phone_effective: String,
    created_at_millis: i64,
}

#[derive(Debug, Clone)]
pub struct PlannedRemoval {
    pub doc_id: String,
    pub canonical_doc_id: String,
    pub email: String,
    pub phone: String,
}

#[derive(Debug, Clone, Default)]
pub struct CanonicalUpdate {
    pub doc_id: String,
    /// New ID fields, when the row's ID or serial is wrong.
    pub edunity_id: Option<String>,
    pub edunity_id_serial: Option<i64>,
    pub id_reassigned_from: Option<String>,
    /// Normalized contact repairs.
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IdReassignment {
    pub doc_id: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone)]
pub struct UniqueKeyUpsert {
    pub key: String,
    pub key_type: String,
    pub value: String,
    pub doc_id: String,
}

#[derive(Debug, Clone)]
pub struct RegistryUpsert {
    pub edunity_id: String,
    pub doc_id: String,
    pub edunity_id_serial: i64,
}

pub struct RepairPlan {
    pub kind: LeadKind,
    pub collection: String,
    pub archive_collection: String,
    pub total_docs: usize,
    pub duplicate_email_groups: usize,
    pub duplicate_phone_groups: usize,
    pub duplicate_components: usize,
    pub canonical_count: usize,
    pub removals: Vec<PlannedRemoval>,
    pub updates: Vec<CanonicalUpdate>,
    pub reassignments: Vec<IdReassignment>,
    pub unique_key_upserts: Vec<UniqueKeyUpsert>,
    pub unique_key_deletes: Vec<String>,
    pub registry_upserts: Vec<RegistryUpsert>,
    pub registry_deletes: Vec<String>,
    pub final_counter: i64,
}

impl RepairPlan {
    pub fn write_op_count(&self) -> usize {
        let counter_ops = if self.canonical_count > 0 { 1 } else { 0 };
        self.removals.len() * 2
            + self.updates.len()
            + self.unique_key_upserts.len()
            + self.unique_key_deletes.len()
            + self.registry_upserts.len()
            + self.registry_deletes.len()
            + counter_ops
    }
}

fn created_at_millis(raw: &str) -> i64 {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(i64::MAX)
}

fn effective_contact(normalized_col: &str, raw_col: &str, normalize: fn(&str) -> String) -> String {
    if !normalized_col.trim().is_empty() {
        normalize(normalized_col)
    } else {
        normalize(raw_col)
    }
}

fn load_docs(conn: &Connection, collection: &str) -> anyhow::Result<Vec<LeadDoc>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id, edunity_id, edunity_id_serial, email, email_normalized,
                phone, phone_normalized, created_at
         FROM {} ORDER BY rowid",
        collection
    ))?;
    let docs = stmt
        .query_map([], |row| {
            let doc_id: String = row.get(0)?;
            let edunity_id: Option<String> = row.get(1)?;
            let serial: Option<i64> = row.get(2)?;
            let email: String = row.get(3)?;
            let email_normalized: String = row.get(4)?;
            let phone: String = row.get(5)?;
            let phone_normalized: String = row.get(6)?;
            let created_at: String = row.get(7)?;
            Ok((
                doc_id,
                edunity_id.unwrap_or_default(),
                serial,
                email,
                email_normalized,
                phone,
                phone_normalized,
                created_at,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(
            |(doc_id, edunity_id, serial, email, email_normalized, phone, phone_normalized, created_at)| {
                let email_effective =
                    effective_contact(&email_normalized, &email, ids::normalize_email);
                let phone_effective =
                    effective_contact(&phone_normalized, &phone, ids::normalize_phone);
                LeadDoc {
                    doc_id,
                    edunity_id: edunity_id.trim().to_string(),
                    serial,
                    email,
                    email_normalized,
                    phone,
                    phone_normalized,
                    email_effective,
                    phone_effective,
                    created_at_millis: created_at_millis(&created_at),
                }
            },
        )
        .collect();
    Ok(docs)
}

fn compare_docs(a: &LeadDoc, b: &LeadDoc) -> Ordering {
    a.created_at_millis
        .cmp(&b.created_at_millis)
        .then_with(|| a.doc_id.cmp(&b.doc_id))
}

pub fn plan_repair(conn: &Connection, kind: LeadKind, collection: &str) -> anyhow::Result<RepairPlan> {
    db::assert_safe_table_name(collection)?;
    if !db::table_exists(conn, collection)? {
        return Err(anyhow!("lead collection table not found: {}", collection));
    }

    let docs = load_docs(conn, collection)?;
    let archive_collection = ids::archive_collection(collection);
    let mut plan = RepairPlan {
        kind,
        collection: collection.to_string(),
        archive_collection,
        total_docs: docs.len(),
        duplicate_email_groups: 0,
        duplicate_phone_groups: 0,
        duplicate_components: 0,
        canonical_count: 0,
        removals: Vec::new(),
        updates: Vec::new(),
        reassignments: Vec::new(),
        unique_key_upserts: Vec::new(),
        unique_key_deletes: Vec::new(),
        registry_upserts: Vec::new(),
        registry_deletes: Vec::new(),
        final_counter: MIN_SERIAL - 1,
    };
    if docs.is_empty() {
        return Ok(plan);
    }

    let mut by_email: HashMap<&str, Vec<usize>> = HashMap::new();
    let mut by_phone: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, doc) in docs.iter().enumerate() {
        if !doc.email_effective.is_empty() {
            by_email.entry(doc.email_effective.as_str()).or_default().push(i);
        }
        if !doc.phone_effective.is_empty() {
            by_phone.entry(doc.phone_effective.as_str()).or_default().push(i);
        }
    }
    plan.duplicate_email_groups = by_email.values().filter(|v| v.len() > 1).count();
    plan.duplicate_phone_groups = by_phone.values().filter(|v| v.len() > 1).count();

    let mut uf = UnionFind::new(docs.len());
    for group in by_email.values().chain(by_phone.values()) {
        for &i in &group[1..] {
            uf.union(group[0], i);
        }
    }

    // Components in first-seen row order for stable output.
    let mut component_order: Vec<usize> = Vec::new();
    let mut components: HashMap<usize, Vec<usize>> = HashMap::new();
    for i in 0..docs.len() {
        let root = uf.find(i);
        let entry = components.entry(root).or_default();
        if entry.is_empty() {
            component_order.push(root);
        }
        entry.push(i);
    }

    let mut removed: HashSet<usize> = HashSet::new();
    for root in &component_order {
        let mut members = components[root].clone();
        if members.len() < 2 {
            continue;
        }
        plan.duplicate_components += 1;
        members.sort_by(|&a, &b| compare_docs(&docs[a], &docs[b]));
        let canonical = members[0];
        for &dup in &members[1..] {
            removed.insert(dup);
            plan.removals.push(PlannedRemoval {
                doc_id: docs[dup].doc_id.clone(),
                canonical_doc_id: docs[canonical].doc_id.clone(),
                email: docs[dup].email_effective.clone(),
                phone: docs[dup].phone_effective.clone(),
            });
        }
    }

    let mut canonicals: Vec<usize> = (0..docs.len()).filter(|i| !removed.contains(i)).collect();
    canonicals.sort_by(|&a, &b| compare_docs(&docs[a], &docs[b]));
    plan.canonical_count = canonicals.len();

    let max_observed = canonicals
        .iter()
        .filter_map(|&i| ids::parse_serial(kind, &docs[i].edunity_id))
        .max()
        .unwrap_or(MIN_SERIAL - 1);
    let mut next_free = (max_observed + 1).max(MIN_SERIAL);

    // Earliest rows keep their serials; invalid or colliding ones take
    // the next free serial, skipping anything already claimed.
    let mut claimed: HashSet<i64> = HashSet::new();
    let mut final_serials: Vec<(usize, i64)> = Vec::with_capacity(canonicals.len());
    for &i in &canonicals {
        let parsed = ids::parse_serial(kind, &docs[i].edunity_id);
        let serial = match parsed {
            Some(s) if !claimed.contains(&s) => s,
            _ => {
                while claimed.contains(&next_free) {
                    next_free += 1;
                }
                let s = next_free;
                next_free += 1;
                s
            }
        };
        claimed.insert(serial);
        plan.final_counter = plan.final_counter.max(serial);
        final_serials.push((i, serial));
    }

    let mut desired_registry: HashMap<String, (String, i64)> = HashMap::new();
    let mut desired_keys: HashMap<String, UniqueKeyUpsert> = HashMap::new();
    for &(i, serial) in &final_serials {
        let doc = &docs[i];
        let final_id = ids::format_id(kind, serial);

        let mut update = CanonicalUpdate {
            doc_id: doc.doc_id.clone(),
            ..CanonicalUpdate::default()
        };
        if doc.edunity_id != final_id || doc.serial != Some(serial) {
            update.edunity_id = Some(final_id.clone());
            update.edunity_id_serial = Some(serial);
            if !doc.edunity_id.is_empty() && doc.edunity_id != final_id {
                update.id_reassigned_from = Some(doc.edunity_id.clone());
            }
            plan.reassignments.push(IdReassignment {
                doc_id: doc.doc_id.clone(),
                from: if doc.edunity_id.is_empty() {
                    "(empty)".to_string()
                } else {
                    doc.edunity_id.clone()
                },
                to: final_id.clone(),
            });
        }
        if !doc.email_effective.is_empty()
            && (doc.email != doc.email_effective || doc.email_normalized != doc.email_effective)
        {
            update.email = Some(doc.email_effective.clone());
        }
        if !doc.phone_effective.is_empty()
            && (doc.phone != doc.phone_effective || doc.phone_normalized != doc.phone_effective)
        {
            update.phone = Some(doc.phone_effective.clone());
        }
        if update.edunity_id.is_some() || update.email.is_some() || update.phone.is_some() {
            plan.updates.push(update);
        }

        desired_registry
            .entry(final_id.clone())
            .or_insert_with(|| (doc.doc_id.clone(), serial));
        if !doc.email_effective.is_empty() {
            let key = ids::email_key(&doc.email_effective);
            desired_keys.entry(key.clone()).or_insert_with(|| UniqueKeyUpsert {
                key,
                key_type: "email".to_string(),
                value: doc.email_effective.clone(),
                doc_id: doc.doc_id.clone(),
            });
        }
        if !doc.phone_effective.is_empty() {
            let key = ids::phone_key(&doc.phone_effective);
            desired_keys.entry(key.clone()).or_insert_with(|| UniqueKeyUpsert {
                key,
                key_type: "phone".to_string(),
                value: doc.phone_effective.clone(),
                doc_id: doc.doc_id.clone(),
            });
        }
    }

    diff_unique_keys(conn, kind, collection, &desired_keys, &mut plan)?;
    diff_registry(conn, kind, collection, &desired_registry, &mut plan)?;

    // Stable output ordering for review diffs.
    plan.unique_key_upserts.sort_by(|a, b| a.key.cmp(&b.key));
    plan.unique_key_deletes.sort();
    plan.registry_upserts.sort_by(|a, b| a.edunity_id.cmp(&b.edunity_id));
    plan.registry_deletes.sort();

    Ok(plan)
}

fn diff_unique_keys(
    conn: &Connection,
    kind: LeadKind,
    collection: &str,
    desired: &HashMap<String, UniqueKeyUpsert>,
    plan: &mut RepairPlan,
) -> anyhow::Result<()> {
    let mut stmt = conn.prepare(&format!(
        "SELECT key, value, doc_id, collection FROM {}",
        kind.unique_keys_table()
    ))?;
    let existing = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut seen: HashSet<&str> = HashSet::new();
    for (key, value, doc_id, owner_collection) in &existing {
        // Entries explicitly owned by another collection are left alone.
        if !owner_collection.is_empty() && owner_collection != collection {
            continue;
        }
        seen.insert(key.as_str());
        match desired.get(key) {
            Some(want) => {
                if want.doc_id != *doc_id || want.value != *value || owner_collection != collection
                {
                    plan.unique_key_upserts.push(want.clone());
                }
            }
            None => plan.unique_key_deletes.push(key.clone()),
        }
    }
    for (key, want) in desired {
        if !seen.contains(key.as_str()) {
            plan.unique_key_upserts.push(want.clone());
        }
    }
    Ok(())
}

fn diff_registry(
    conn: &Connection,
    kind: LeadKind,
    collection: &str,
    desired: &HashMap<String, (String, i64)>,
    plan: &mut RepairPlan,
) -> anyhow::Result<()> {
    let mut stmt = conn.prepare(&format!(
        "SELECT edunity_id, doc_id, edunity_id_serial, collection FROM {}",
        kind.id_registry_table()
    ))?;
    let existing = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut seen: HashSet<&str> = HashSet::new();
    for (edunity_id, doc_id, serial, owner_collection) in &existing {
        if !owner_collection.is_empty() && owner_collection != collection {
            continue;
        }
        seen.insert(edunity_id.as_str());
        match desired.get(edunity_id) {
            Some((want_doc, want_serial)) => {
                if want_doc != doc_id || want_serial != serial || owner_collection != collection {
                    plan.registry_upserts.push(RegistryUpsert {
                        edunity_id: edunity_id.clone(),
                        doc_id: want_doc.clone(),
                        edunity_id_serial: *want_serial,
                    });
                }
            }
            None => plan.registry_deletes.push(edunity_id.clone()),
        }
    }
    for (edunity_id, (doc_id, serial)) in desired {
        if !seen.contains(edunity_id.as_str()) {
            plan.registry_upserts.push(RegistryUpsert {
                edunity_id: edunity_id.clone(),
                doc_id: doc_id.clone(),
                edunity_id_serial: *serial,
            });
        }
    }
    Ok(())
}

enum WriteOp<'p> {
    ArchiveCopy(&'p PlannedRemoval),
    DeleteLead(&'p str),
    UpdateLead(&'p CanonicalUpdate),
    UpsertUniqueKey(&'p UniqueKeyUpsert),
    DeleteUniqueKey(&'p str),
    UpsertRegistry(&'p RegistryUpsert),
    DeleteRegistry(&'p str),
    SetCounter(i64),
}

/// Executes the plan in batches of at most [`MAX_WRITES_PER_BATCH`]
/// ops, one transaction per batch. Returns the committed op count.
pub fn apply_repair(conn: &Connection, plan: &RepairPlan) -> anyhow::Result<usize> {
    db::assert_safe_table_name(&plan.collection)?;
    db::create_archive_table(conn, &plan.archive_collection)?;

    let mut ops: Vec<WriteOp> = Vec::with_capacity(plan.write_op_count());
    for removal in &plan.removals {
        // Archive copy rides in the same batch slot order as its delete.
        ops.push(WriteOp::ArchiveCopy(removal));
        ops.push(WriteOp::DeleteLead(&removal.doc_id));
    }
    for update in &plan.updates {
        ops.push(WriteOp::UpdateLead(update));
    }
    for upsert in &plan.unique_key_upserts {
        ops.push(WriteOp::UpsertUniqueKey(upsert));
    }
    for key in &plan.unique_key_deletes {
        ops.push(WriteOp::DeleteUniqueKey(key));
    }
    for upsert in &plan.registry_upserts {
        ops.push(WriteOp::UpsertRegistry(upsert));
    }
    for edunity_id in &plan.registry_deletes {
        ops.push(WriteOp::DeleteRegistry(edunity_id));
    }
    if plan.canonical_count > 0 {
        ops.push(WriteOp::SetCounter(plan.final_counter));
    }

    let now = Utc::now().to_rfc3339();
    let mut committed = 0usize;
    for batch in ops.chunks(MAX_WRITES_PER_BATCH) {
        let tx = conn.unchecked_transaction()?;
        for op in batch {
            execute_op(&tx, plan, op, &now)?;
        }
        tx.commit()?;
        committed += batch.len();
        tracing::info!(
            collection = %plan.collection,
            committed,
            total = ops.len(),
            "repair batch committed"
        );
    }
    Ok(committed)
}

fn execute_op(
    tx: &rusqlite::Transaction,
    plan: &RepairPlan,
    op: &WriteOp,
    now: &str,
) -> anyhow::Result<()> {
    let kind = plan.kind;
    match op {
        WriteOp::ArchiveCopy(removal) => {
            tx.execute(
                &format!(
                    "INSERT OR REPLACE INTO {archive}(
                        id, edunity_id, edunity_id_serial, full_name,
                        email, email_normalized, phone, phone_normalized,
                        status, source, extra, id_reassigned_from,
                        id_reassigned_at, created_at,
                        _source_collection, _source_doc_id,
                        _canonical_doc_id, _archive_reason, _archived_at)
                     SELECT id, edunity_id, edunity_id_serial, full_name,
                            email, email_normalized, phone, phone_normalized,
                            status, source, extra, id_reassigned_from,
                            id_reassigned_at, created_at,
                            ?1, id, ?2, ?3, ?4
                     FROM {src} WHERE id = ?5",
                    archive = plan.archive_collection,
                    src = plan.collection
                ),
                (
                    &plan.collection,
                    &removal.canonical_doc_id,
                    ARCHIVE_REASON,
                    now,
                    &removal.doc_id,
                ),
            )?;
        }
        WriteOp::DeleteLead(doc_id) => {
            tx.execute(
                &format!("DELETE FROM {} WHERE id = ?", plan.collection),
                [doc_id],
            )?;
        }
        WriteOp::UpdateLead(update) => {
            let mut sets: Vec<&str> = Vec::new();
            let mut values: Vec<SqlValue> = Vec::new();
            if let (Some(id), Some(serial)) = (&update.edunity_id, update.edunity_id_serial) {
                sets.push("edunity_id = ?");
                values.push(SqlValue::Text(id.clone()));
                sets.push("edunity_id_serial = ?");
                values.push(SqlValue::Integer(serial));
                if let Some(from) = &update.id_reassigned_from {
                    sets.push("id_reassigned_from = ?");
                    values.push(SqlValue::Text(from.clone()));
                    sets.push("id_reassigned_at = ?");
                    values.push(SqlValue::Text(now.to_string()));
                }
            }
            if let Some(email) = &update.email {
                sets.push("email = ?");
                values.push(SqlValue::Text(email.clone()));
                sets.push("email_normalized = ?");
                values.push(SqlValue::Text(email.clone()));
            }
            if let Some(phone) = &update.phone {
                sets.push("phone = ?");
                values.push(SqlValue::Text(phone.clone()));
                sets.push("phone_normalized = ?");
                values.push(SqlValue::Text(phone.clone()));
            }
            if sets.is_empty() {
                return Ok(());
            }
            values.push(SqlValue::Text(update.doc_id.clone()));
            tx.execute(
                &format!(
                    "UPDATE {} SET {} WHERE id = ?",
                    plan.collection,
                    sets.join(", ")
                ),
                params_from_iter(values),
            )?;
        }
        WriteOp::UpsertUniqueKey(upsert) => {
            tx.execute(
                &format!(
                    "INSERT OR REPLACE INTO {}(key, key_type, value, doc_id,
                                               collection, created_at, updated_at)
                     VALUES(?, ?, ?, ?, ?, NULL, ?)",
                    kind.unique_keys_table()
                ),
                (
                    &upsert.key,
                    &upsert.key_type,
                    &upsert.value,
                    &upsert.doc_id,
                    &plan.collection,
                    now,
                ),
            )?;
        }
        WriteOp::DeleteUniqueKey(key) => {
            tx.execute(
                &format!("DELETE FROM {} WHERE key = ?", kind.unique_keys_table()),
                [key],
            )?;
        }
        WriteOp::UpsertRegistry(upsert) => {
            tx.execute(
                &format!(
                    "INSERT OR REPLACE INTO {}(edunity_id, doc_id, edunity_id_serial,
                                               collection, created_at, updated_at)
                     VALUES(?, ?, ?, ?, NULL, ?)",
                    kind.id_registry_table()
                ),
                (
                    &upsert.edunity_id,
                    &upsert.doc_id,
                    upsert.edunity_id_serial,
                    &plan.collection,
                    now,
                ),
            )?;
        }
        WriteOp::DeleteRegistry(edunity_id) => {
            tx.execute(
                &format!(
                    "DELETE FROM {} WHERE edunity_id = ?",
                    kind.id_registry_table()
                ),
                [edunity_id],
            )?;
        }
        WriteOp::SetCounter(value) => {
            // The counter never moves backwards, even when the final
            // surviving serial is lower than what was already issued.
            tx.execute(
                "INSERT INTO counters(name, current, updated_at) VALUES(?, ?, ?)
                 ON CONFLICT(name) DO UPDATE SET
                   current = MAX(current, excluded.current),
                   updated_at = excluded.updated_at",
                (kind.counter_name(), value, now),
            )?;
        }
    }
    Ok(())
}
