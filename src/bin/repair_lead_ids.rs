//! Offline reconciliation of duplicate leads and their IDs.
//!
//! Dry run by default; `--apply` executes the plan. The lead collection
//! comes from `TEACHER_LEADS_COLLECTION` (default `teacher_interests`),
//! loaded from the environment or a `.env` file.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;

use edunityd::db;
use edunityd::dedup;
use edunityd::ids::LeadKind;

#[derive(Parser)]
#[command(name = "repair-lead-ids")]
#[command(about = "Merge duplicate leads and repair their IDs and indexes", long_about = None)]
struct Cli {
    /// Workspace directory holding edunity.sqlite3
    workspace: PathBuf,

    /// Execute the plan. Without this flag nothing is written.
    #[arg(long)]
    apply: bool,
}

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let collection = std::env::var("TEACHER_LEADS_COLLECTION")
        .unwrap_or_else(|_| "teacher_interests".to_string());
    let kind = LeadKind::for_collection(&collection)
        .with_context(|| format!("unsupported lead collection: {}", collection))?;

    let conn = db::open_db(&cli.workspace).with_context(|| {
        format!(
            "failed to open workspace {}",
            cli.workspace.to_string_lossy()
        )
    })?;

    println!(
        "[scan] collection={} mode={}",
        collection,
        if cli.apply { "APPLY" } else { "DRY_RUN" }
    );
    let plan = dedup::plan_repair(&conn, kind, &collection)?;
    println!("[scan] total_docs={}", plan.total_docs);
    if plan.total_docs == 0 {
        println!("[result] Collection is empty, nothing to dedupe.");
        return Ok(());
    }

    println!(
        "[summary] duplicate_email_groups={}",
        plan.duplicate_email_groups
    );
    println!(
        "[summary] duplicate_phone_groups={}",
        plan.duplicate_phone_groups
    );
    println!(
        "[summary] duplicate_contact_components={}",
        plan.duplicate_components
    );
    println!(
        "[summary] docs_to_archive_and_delete={}",
        plan.removals.len()
    );
    println!("[summary] canonical_docs={}", plan.canonical_count);
    println!("[summary] docs_to_update={}", plan.updates.len());
    println!(
        "[summary] docs_with_id_reassignments={}",
        plan.reassignments.len()
    );
    println!(
        "[summary] unique_key_docs_to_upsert={}",
        plan.unique_key_upserts.len()
    );
    println!(
        "[summary] unique_key_docs_to_delete={}",
        plan.unique_key_deletes.len()
    );
    println!(
        "[summary] id_registry_docs_to_upsert={}",
        plan.registry_upserts.len()
    );
    println!(
        "[summary] id_registry_docs_to_delete={}",
        plan.registry_deletes.len()
    );

    for row in &plan.reassignments {
        println!("[id] {}: {} -> {}", row.doc_id, row.from, row.to);
    }
    for row in &plan.removals {
        let email = if row.email.is_empty() { "-" } else { &row.email };
        let phone = if row.phone.is_empty() { "-" } else { &row.phone };
        println!(
            "[delete] {} duplicate_of={} email={} phone={}",
            row.doc_id, row.canonical_doc_id, email, phone
        );
    }

    if !cli.apply {
        println!("[dry-run] No writes made. Run with --apply to execute.");
        return Ok(());
    }

    let committed = dedup::apply_repair(&conn, &plan)?;
    println!(
        "[apply] completed. write_ops={} archive_collection={}",
        committed, plan.archive_collection
    );
    Ok(())
}
