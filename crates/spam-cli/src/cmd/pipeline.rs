use crate::output::{print_json, print_table};
use anyhow::{Context, Result};
use clap::Subcommand;
use serde::Serialize;
use spam_core::actions::ActionSet;
use spam_core::pipeline::PipelineFile;
use std::path::{Path, PathBuf};

#[derive(Subcommand)]
pub enum PipelineSubcommand {
    /// Validate a pipeline file and print its steps in run order
    Check {
        /// Pipeline file (YAML or JSON)
        #[arg(long = "conf")]
        conf: PathBuf,
    },

    /// List every registered action
    Actions,
}

pub fn run(subcmd: PipelineSubcommand, json: bool) -> Result<()> {
    match subcmd {
        PipelineSubcommand::Check { conf } => check(&conf, json),
        PipelineSubcommand::Actions => actions(json),
    }
}

#[derive(Serialize)]
struct StepRow {
    pipeline: String,
    collection: String,
    action: String,
    period_secs: f64,
    repetitions: u32,
    cycles: u32,
}

fn check(conf: &Path, json: bool) -> Result<()> {
    let file = PipelineFile::load(conf)
        .with_context(|| format!("failed to load pipelines from {}", conf.display()))?;
    file.validate(&ActionSet::default())?;

    let rows: Vec<StepRow> = file
        .pipelines
        .iter()
        .flat_map(|p| {
            p.branches.iter().flat_map(move |b| {
                b.steps.iter().map(move |s| StepRow {
                    pipeline: p.name.clone(),
                    collection: b.collection.to_string(),
                    action: s.label(),
                    period_secs: s.rate.period.as_secs_f64(),
                    repetitions: s.rate.repetitions,
                    cycles: s.rate.cycles,
                })
            })
        })
        .collect();

    if json {
        return print_json(&rows);
    }
    let table: Vec<Vec<String>> = rows
        .iter()
        .map(|r| {
            vec![
                r.pipeline.clone(),
                r.collection.clone(),
                r.action.clone(),
                format!("{}s", r.period_secs),
                r.repetitions.to_string(),
                r.cycles.to_string(),
            ]
        })
        .collect();
    print_table(
        &["PIPELINE", "COLLECTION", "ACTION", "PERIOD", "REPS", "CYCLES"],
        &table,
    );
    Ok(())
}

#[derive(Serialize)]
struct ActionRow {
    collection: String,
    action: String,
    effect: String,
}

fn actions(json: bool) -> Result<()> {
    let set = ActionSet::default();
    let rows: Vec<ActionRow> = set
        .specs()
        .iter()
        .map(|spec| ActionRow {
            collection: spec.collection().to_string(),
            action: format!("{}/{}", spec.kind.as_str(), spec.verb),
            effect: spec.effect.to_string(),
        })
        .collect();

    if json {
        return print_json(&rows);
    }
    let table: Vec<Vec<String>> = rows
        .into_iter()
        .map(|r| vec![r.collection, r.action, r.effect])
        .collect();
    print_table(&["COLLECTION", "ACTION", "EFFECT"], &table);
    Ok(())
}
