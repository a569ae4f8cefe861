use crate::cmd::Env;
use crate::output::{print_json, print_table};
use anyhow::{Context, Result};
use spam_core::actions::ActionSet;
use spam_core::pipeline::PipelineFile;
use spam_core::simulator::{RunReport, Services, Shutdown, Simulator};
use std::path::Path;
use std::sync::Arc;

pub fn run(env: &Env, conf: &Path, only: &[String], json: bool) -> Result<()> {
    let actions = Arc::new(ActionSet::default());
    let file = PipelineFile::load(conf)
        .with_context(|| format!("failed to load pipelines from {}", conf.display()))?;
    file.validate(&actions)?;
    let pipelines = file.select(only)?;

    let wired = env.wire()?;
    let services = Services {
        keeper: wired.keeper,
        actions,
        connector: wired.connector,
    };
    let shutdown = Shutdown::new();
    let mut simulator = Simulator::new(pipelines, services)?.with_shutdown(shutdown.clone());

    let rt = tokio::runtime::Runtime::new()?;
    rt.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, stopping at the next pause");
            shutdown.trigger();
        }
    });
    let report = rt.block_on(simulator.run())?;

    if json {
        print_json(&report)?;
    } else {
        print_summary(&report);
    }
    Ok(())
}

fn print_summary(report: &RunReport) {
    let mut rows = Vec::new();
    for branch in &report.branches {
        let principal = branch.principal.clone().unwrap_or_else(|| "-".into());
        if let Some(reason) = &branch.aborted {
            rows.push(vec![
                branch.pipeline.clone(),
                branch.collection.to_string(),
                "-".into(),
                principal,
                "0".into(),
                "0".into(),
                "0".into(),
                format!("aborted: {reason}"),
            ]);
            continue;
        }
        for step in &branch.steps {
            let t = &step.tally;
            rows.push(vec![
                branch.pipeline.clone(),
                branch.collection.to_string(),
                step.action.clone(),
                principal.clone(),
                t.invoked.to_string(),
                t.skipped.to_string(),
                t.failed.to_string(),
                if branch.interrupted { "interrupted" } else { "" }.to_string(),
            ]);
        }
    }
    print_table(
        &[
            "PIPELINE", "COLLECTION", "ACTION", "PRINCIPAL", "INVOKED", "SKIPPED", "FAILED", "NOTE",
        ],
        &rows,
    );
    let total = report.total();
    println!(
        "\n{} invocations: {} created, {} updated, {} deleted, {} changed, {} skipped, {} failed",
        total.invoked,
        total.created,
        total.updated,
        total.deleted,
        total.changed,
        total.skipped,
        total.failed
    );
}
