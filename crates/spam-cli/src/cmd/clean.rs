use crate::cmd::Env;
use crate::output::{print_json, print_table};
use anyhow::Result;
use spam_core::keeper::CleanEntry;
use spam_core::types::Collection;

pub fn run(env: &Env, names: &[String], json: bool) -> Result<()> {
    let collections = parse_collections(names)?;
    let wired = env.wire()?;
    let report = wired.keeper.clean(&collections)?;

    if json {
        return print_json(&report);
    }

    let row = |status: &str, entry: &CleanEntry| {
        vec![
            entry.kind.namespace().to_string(),
            entry.id.clone(),
            status.to_string(),
            entry.error.clone().unwrap_or_default(),
        ]
    };
    let rows: Vec<Vec<String>> = report
        .deleted
        .iter()
        .map(|e| row("deleted", e))
        .chain(report.kept.iter().map(|e| row("protected", e)))
        .chain(report.failed.iter().map(|e| row("failed", e)))
        .collect();
    if rows.is_empty() {
        println!("Nothing tracked in {}.", names.join(", "));
        return Ok(());
    }
    print_table(&["NAMESPACE", "ID", "STATUS", "ERROR"], &rows);
    println!(
        "\n{} deleted, {} protected, {} failed",
        report.deleted.len(),
        report.kept.len(),
        report.failed.len()
    );
    Ok(())
}

/// Collection names (aliases accepted), or `all`.
fn parse_collections(names: &[String]) -> Result<Vec<Collection>> {
    if names.iter().any(|n| n == "all") {
        return Ok(Collection::all().to_vec());
    }
    names
        .iter()
        .map(|n| n.parse::<Collection>().map_err(Into::into))
        .collect()
}
