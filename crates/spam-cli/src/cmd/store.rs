use crate::cmd::Env;
use crate::output::{print_json, print_table};
use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;
use spam_core::store::Record;
use spam_core::types::Namespace;

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum StoreSubcommand {
    /// List records, optionally limited to one namespace
    List {
        /// Namespace as collection/kind (e.g. storage/volumes)
        #[arg(long)]
        namespace: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(env: &Env, subcmd: StoreSubcommand, json: bool) -> Result<()> {
    match subcmd {
        StoreSubcommand::List { namespace } => list(env, namespace.as_deref(), json),
    }
}

/// One listed record; credential secrets are never printed.
#[derive(Serialize)]
struct Row {
    namespace: String,
    id: String,
    value: String,
}

fn describe(record: &Record) -> String {
    match record {
        Record::Tracked { used: true } => "used".into(),
        Record::Tracked { used: false } => "unused".into(),
        Record::Credential(c) => format!("credential ({})", c.project_name),
        Record::Setting { value } => value.clone(),
    }
}

fn list(env: &Env, namespace: Option<&str>, json: bool) -> Result<()> {
    let store = env.open_store()?;
    let namespaces = match namespace {
        Some(ns) => vec![ns.parse::<Namespace>()?],
        None => store.namespaces()?,
    };

    let mut rows = Vec::new();
    for ns in namespaces {
        for (id, record) in store.entries(&ns)? {
            rows.push(Row {
                namespace: ns.to_string(),
                id,
                value: describe(&record),
            });
        }
    }

    if json {
        return print_json(&rows);
    }
    if rows.is_empty() {
        println!("No records.");
        return Ok(());
    }
    let table: Vec<Vec<String>> = rows
        .into_iter()
        .map(|r| vec![r.namespace, r.id, r.value])
        .collect();
    print_table(&["NAMESPACE", "ID", "VALUE"], &table);
    Ok(())
}
