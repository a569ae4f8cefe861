//! Declarative pipelines.
//!
//! A pipeline maps collections to nested action names; each leaf is a rate
//! triple `[period_seconds, repetitions, cycles]`:
//!
//! ```yaml
//! storage:
//!   volumes:
//!     create: [60, 3, 2]
//!     attach: [30, 1, 4]
//! ```
//!
//! A file holds either one pipeline (top-level keys are collections) or a
//! map of named pipelines. JSON is accepted as well. Declaration order is
//! kept.

use std::path::Path;
use std::time::Duration;

use serde_yaml::{Mapping, Value};

use crate::actions::{ActionRef, ActionSet};
use crate::error::{Result, SpamError};
use crate::types::Collection;

pub const DEFAULT_PIPELINE: &str = "default";

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rate {
    pub period: Duration,
    pub repetitions: u32,
    pub cycles: u32,
}

impl Rate {
    pub fn new(period_secs: f64, repetitions: u32, cycles: u32) -> Result<Self> {
        if !period_secs.is_finite() || period_secs < 0.0 {
            return Err(SpamError::InvalidPipeline(format!(
                "period must be a non-negative number of seconds, got {period_secs}"
            )));
        }
        if repetitions == 0 {
            return Err(SpamError::InvalidPipeline(
                "repetitions must be at least 1".into(),
            ));
        }
        Ok(Self {
            period: Duration::from_secs_f64(period_secs),
            repetitions,
            cycles,
        })
    }

    /// Upper bound of each pause between invocations.
    pub fn max_pause(&self) -> Duration {
        self.period / self.repetitions
    }

    pub fn invocations(&self) -> u64 {
        u64::from(self.repetitions) * u64::from(self.cycles)
    }
}

/// One leaf: an action path below the branch's collection and its rate.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub path: Vec<String>,
    pub rate: Rate,
}

impl Step {
    pub fn label(&self) -> String {
        self.path.join("/")
    }
}

/// Everything declared under one collection key, in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub collection: Collection,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    pub name: String,
    pub branches: Vec<Branch>,
}

impl Pipeline {
    /// Resolve every step against `actions`, failing on the first unknown
    /// one.
    pub fn resolve(&self, actions: &ActionSet) -> Result<Vec<Vec<ActionRef>>> {
        self.branches
            .iter()
            .map(|branch| {
                branch
                    .steps
                    .iter()
                    .map(|step| {
                        actions
                            .resolve(branch.collection, &step.path)
                            .map_err(|e| match e {
                                SpamError::UnknownAction(what) => SpamError::UnknownAction(
                                    format!("{what} in pipeline '{}'", self.name),
                                ),
                                other => other,
                            })
                    })
                    .collect()
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// File
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineFile {
    pub pipelines: Vec<Pipeline>,
}

impl PipelineFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let root: Value = serde_yaml::from_str(text)?;
        let Value::Mapping(root) = root else {
            return Err(SpamError::InvalidPipeline(
                "top level must be a mapping".into(),
            ));
        };
        if root.is_empty() {
            return Err(SpamError::InvalidPipeline("no pipelines declared".into()));
        }

        let single = root
            .keys()
            .all(|k| k.as_str().is_some_and(|k| k.parse::<Collection>().is_ok()));
        let pipelines = if single {
            vec![parse_pipeline(DEFAULT_PIPELINE, &root)?]
        } else {
            root.iter()
                .map(|(name, body)| {
                    let name = key(name, "pipeline name")?;
                    let Value::Mapping(body) = body else {
                        return Err(SpamError::InvalidPipeline(format!(
                            "pipeline '{name}' must be a mapping of collections"
                        )));
                    };
                    parse_pipeline(name, body)
                })
                .collect::<Result<Vec<_>>>()?
        };
        Ok(Self { pipelines })
    }

    /// Check every leaf of every pipeline against `actions`.
    pub fn validate(&self, actions: &ActionSet) -> Result<()> {
        for pipeline in &self.pipelines {
            pipeline.resolve(actions)?;
        }
        Ok(())
    }

    /// The pipelines named in `only`, or all of them when `only` is empty.
    pub fn select(self, only: &[String]) -> Result<Vec<Pipeline>> {
        if only.is_empty() {
            return Ok(self.pipelines);
        }
        if let Some(missing) = only
            .iter()
            .find(|name| !self.pipelines.iter().any(|p| &p.name == *name))
        {
            let known: Vec<&str> = self.pipelines.iter().map(|p| p.name.as_str()).collect();
            return Err(SpamError::InvalidPipeline(format!(
                "no pipeline named '{missing}' (declared: {})",
                known.join(", ")
            )));
        }
        Ok(self
            .pipelines
            .into_iter()
            .filter(|p| only.contains(&p.name))
            .collect())
    }
}

fn key<'a>(value: &'a Value, what: &str) -> Result<&'a str> {
    value
        .as_str()
        .ok_or_else(|| SpamError::InvalidPipeline(format!("{what} must be a string, got {value:?}")))
}

fn parse_pipeline(name: &str, body: &Mapping) -> Result<Pipeline> {
    let mut branches = Vec::new();
    for (collection, tree) in body {
        let label = key(collection, "collection")?;
        let collection: Collection = label
            .parse()
            .map_err(|e| SpamError::InvalidPipeline(format!("{name}: {e}")))?;
        let mut steps = Vec::new();
        walk(tree, &mut Vec::new(), &mut steps)
            .map_err(|e| SpamError::InvalidPipeline(format!("{name}/{label}: {e}")))?;
        if steps.is_empty() {
            return Err(SpamError::InvalidPipeline(format!(
                "{name}/{label}: no actions declared"
            )));
        }
        branches.push(Branch { collection, steps });
    }
    Ok(Pipeline {
        name: name.to_string(),
        branches,
    })
}

/// Depth-first walk collecting leaves in declaration order. Errors carry
/// the offending path.
fn walk(node: &Value, path: &mut Vec<String>, steps: &mut Vec<Step>) -> std::result::Result<(), String> {
    match node {
        Value::Mapping(children) => {
            for (name, child) in children {
                let name = name
                    .as_str()
                    .ok_or_else(|| format!("{}: action names must be strings", path.join("/")))?;
                path.push(name.to_string());
                walk(child, path, steps)?;
                path.pop();
            }
            Ok(())
        }
        Value::Sequence(items) => {
            let rate = parse_rate(items).map_err(|e| format!("{}: {e}", path.join("/")))?;
            steps.push(Step {
                path: path.clone(),
                rate,
            });
            Ok(())
        }
        other => Err(format!(
            "{}: expected a mapping or [period, repetitions, cycles], got {other:?}",
            path.join("/")
        )),
    }
}

fn parse_rate(items: &[Value]) -> std::result::Result<Rate, String> {
    let [period, repetitions, cycles] = items else {
        return Err(format!("expected 3 rate values, got {}", items.len()));
    };
    let period = period
        .as_f64()
        .ok_or_else(|| format!("period must be a number, got {period:?}"))?;
    let count = |v: &Value, what: &str| {
        v.as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| format!("{what} must be a non-negative integer, got {v:?}"))
    };
    Rate::new(
        period,
        count(repetitions, "repetitions")?,
        count(cycles, "cycles")?,
    )
    .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_pipeline_keeps_declaration_order() {
        let file = PipelineFile::parse(
            "storage:\n  volumes:\n    create: [60, 3, 2]\n    attach: [30, 1, 4]\nidentity:\n  projects:\n    create: [1.5, 1, 1]\n",
        )
        .unwrap();
        assert_eq!(file.pipelines.len(), 1);
        let pipeline = &file.pipelines[0];
        assert_eq!(pipeline.name, DEFAULT_PIPELINE);
        assert_eq!(pipeline.branches[0].collection, Collection::Storage);
        assert_eq!(pipeline.branches[1].collection, Collection::Identity);

        let labels: Vec<String> = pipeline.branches[0].steps.iter().map(Step::label).collect();
        assert_eq!(labels, ["volumes/create", "volumes/attach"]);
        assert_eq!(
            pipeline.branches[0].steps[0].rate,
            Rate::new(60.0, 3, 2).unwrap()
        );
        assert_eq!(
            pipeline.branches[1].steps[0].rate.period,
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn named_pipelines_parse_from_json() {
        let file = PipelineFile::parse(
            r#"{"steady": {"cinder": {"volumes": {"create": [10, 5, 2]}}},
                "burst": {"nova": {"servers": {"create": [1, 1, 1]}}}}"#,
        )
        .unwrap();
        let names: Vec<&str> = file.pipelines.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["steady", "burst"]);
        assert_eq!(file.pipelines[1].branches[0].collection, Collection::Compute);
    }

    #[test]
    fn zero_repetitions_is_rejected() {
        let err = PipelineFile::parse("storage:\n  volumes:\n    create: [10, 0, 1]\n").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("repetitions"), "{msg}");
        assert!(msg.contains("volumes/create"), "{msg}");
    }

    #[test]
    fn malformed_leaves_are_rejected() {
        for text in [
            "storage:\n  volumes:\n    create: [10, 1]\n",
            "storage:\n  volumes:\n    create: 5\n",
            "storage:\n  volumes:\n    create: [-1, 1, 1]\n",
            "storage: {}\n",
            "[1, 2, 3]\n",
        ] {
            assert!(PipelineFile::parse(text).is_err(), "{text}");
        }
    }

    #[test]
    fn validate_rejects_unknown_actions() {
        let actions = ActionSet::default();
        let ok = PipelineFile::parse("storage:\n  volumes:\n    attach: [1, 1, 1]\n").unwrap();
        assert!(ok.validate(&actions).is_ok());

        let bad = PipelineFile::parse("storage:\n  volumes:\n    explode: [1, 1, 1]\n").unwrap();
        assert!(matches!(
            bad.validate(&actions).unwrap_err(),
            SpamError::UnknownAction(_)
        ));

        let nested = PipelineFile::parse("network:\n  subnets:\n    create:\n      fast: [1, 1, 1]\n").unwrap();
        assert!(nested.validate(&actions).is_err());
    }

    #[test]
    fn select_filters_by_name() {
        let file = PipelineFile::parse(
            "a:\n  storage:\n    volumes:\n      create: [1, 1, 1]\nb:\n  image:\n    images:\n      create: [1, 1, 1]\n",
        )
        .unwrap();
        let picked = file.clone().select(&["b".to_string()]).unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].name, "b");
        assert!(file.select(&["c".to_string()]).is_err());
    }

    #[test]
    fn rate_bounds() {
        let rate = Rate::new(10.0, 5, 2).unwrap();
        assert_eq!(rate.max_pause(), Duration::from_secs(2));
        assert_eq!(rate.invocations(), 10);
    }
}
