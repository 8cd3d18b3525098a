//! Review gate adapter: turns a reviewer's structured verdict document into a
//! [`ReviewVerdict`] and a routing decision.
//!
//! Documents vary between reviewers, so a small closed set of key and value
//! aliases is accepted. Anything outside that set is malformed; the adapter
//! never guesses.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use warden_types::{Finding, Overall, Result, ReviewVerdict, WardenError};

use crate::collaborators::{invoke_collaborator, CollaboratorRequest, DEFAULT_COLLABORATOR_TIMEOUT};
use crate::credentials::CollaboratorEnv;
use crate::process::CommandLine;

pub const DEFAULT_COVERAGE_THRESHOLD: f64 = 95.0;

const MARKER_KEYS: &[&str] = &["overall", "verdict", "decision"];
const COVERAGE_KEYS: &[&str] = &["coverage", "coverage_percent", "coverage_pct"];
const BLOCKING_KEYS: &[&str] = &["blocking", "blockers"];
const HIGH_PRIORITY_KEYS: &[&str] = &["high_priority", "high"];
const SUGGESTION_KEYS: &[&str] = &["suggestions", "suggestion"];

fn parse_marker(raw: &str) -> Option<Overall> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "approve" | "approved" | "accept" | "accepted" => Some(Overall::Approve),
        "revise" | "request_changes" | "changes_requested" | "needs_revision" => {
            Some(Overall::Revise)
        }
        "discuss" | "needs_discussion" | "escalate" => Some(Overall::Discuss),
        _ => None,
    }
}

/// Normalise a raw verdict document.
pub fn normalize(doc: &Value) -> Result<ReviewVerdict> {
    let obj = doc
        .as_object()
        .ok_or_else(|| malformed("verdict document is not a JSON object"))?;

    let (marker_key, marker) = first_present(obj, MARKER_KEYS)
        .ok_or_else(|| malformed("no overall/verdict/decision marker"))?;
    let marker = marker
        .as_str()
        .ok_or_else(|| malformed(format!("'{marker_key}' is not a string")))?;
    let overall =
        parse_marker(marker).ok_or_else(|| malformed(format!("unknown marker '{marker}'")))?;

    let tiers = match obj.get("findings") {
        Some(Value::Object(inner)) => inner,
        Some(_) => return Err(malformed("'findings' is not an object")),
        None => obj,
    };

    Ok(ReviewVerdict {
        overall,
        blocking: findings(tiers, BLOCKING_KEYS)?,
        high_priority: findings(tiers, HIGH_PRIORITY_KEYS)?,
        suggestions: findings(tiers, SUGGESTION_KEYS)?,
        coverage_percent: coverage(obj)?,
    })
}

fn malformed(msg: impl Into<String>) -> WardenError {
    WardenError::MalformedVerdict(msg.into())
}

fn first_present<'a>(obj: &'a Map<String, Value>, keys: &[&'static str]) -> Option<(&'static str, &'a Value)> {
    keys.iter()
        .find_map(|k| obj.get(*k).filter(|v| !v.is_null()).map(|v| (*k, v)))
}

fn findings(obj: &Map<String, Value>, keys: &[&'static str]) -> Result<Vec<Finding>> {
    let Some((key, value)) = first_present(obj, keys) else {
        return Ok(Vec::new());
    };
    let items = value
        .as_array()
        .ok_or_else(|| malformed(format!("'{key}' is not a list")))?;
    items
        .iter()
        .map(|item| match item {
            Value::String(s) if !s.trim().is_empty() => Ok(Finding::new(s.trim())),
            Value::Object(o) => {
                let summary = ["summary", "message", "title"]
                    .iter()
                    .find_map(|k| o.get(*k).and_then(Value::as_str))
                    .filter(|s| !s.trim().is_empty())
                    .ok_or_else(|| malformed(format!("a '{key}' finding has no summary")))?;
                let location = ["location", "file"]
                    .iter()
                    .find_map(|k| o.get(*k).and_then(Value::as_str))
                    .map(str::to_string);
                Ok(Finding {
                    summary: summary.trim().to_string(),
                    location,
                })
            }
            _ => Err(malformed(format!("unusable entry in '{key}'"))),
        })
        .collect()
}

fn coverage(obj: &Map<String, Value>) -> Result<f64> {
    let Some((key, value)) = first_present(obj, COVERAGE_KEYS) else {
        return Ok(0.0);
    };
    let pct = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| malformed(format!("'{key}' is not a percentage")))?;
    if !(0.0..=100.0).contains(&pct) {
        return Err(malformed(format!("'{key}' = {pct} is outside 0..=100")));
    }
    Ok(pct)
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReviewPolicy {
    pub coverage_threshold: f64,
}

impl Default for ReviewPolicy {
    fn default() -> Self {
        Self {
            coverage_threshold: DEFAULT_COVERAGE_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReviewDecision {
    Proceed,
    /// Loop back to authoring with these findings.
    Revise { findings: Vec<Finding> },
    /// Ambiguity only a human can resolve.
    Escalate { reason: String },
}

impl ReviewPolicy {
    /// Coverage is checked independently of the raw marker, so an approval
    /// below the threshold is a revision.
    pub fn decide(&self, verdict: &ReviewVerdict) -> ReviewDecision {
        match verdict.overall {
            Overall::Discuss => ReviewDecision::Escalate {
                reason: "reviewer asked for discussion".into(),
            },
            Overall::Revise => ReviewDecision::Revise {
                findings: verdict.carried_findings(),
            },
            Overall::Approve if verdict.coverage_percent >= self.coverage_threshold => {
                ReviewDecision::Proceed
            }
            Overall::Approve => {
                let mut findings = verdict.carried_findings();
                findings.push(Finding::new(format!(
                    "coverage {:.1}% is below the required {:.1}%",
                    verdict.coverage_percent, self.coverage_threshold
                )));
                ReviewDecision::Revise { findings }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Reviewer
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Reviewer: Send + Sync {
    /// Produce the raw verdict document for the current artifacts.
    async fn review(&self, request: &CollaboratorRequest, env: &CollaboratorEnv) -> Result<Value>;
}

pub struct CommandReviewer {
    command: CommandLine,
    timeout: Duration,
    base_env: Option<HashMap<String, String>>,
}

impl CommandReviewer {
    pub fn new(command: CommandLine) -> Self {
        Self {
            command,
            timeout: DEFAULT_COLLABORATOR_TIMEOUT,
            base_env: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_base_env(mut self, base: HashMap<String, String>) -> Self {
        self.base_env = Some(base);
        self
    }
}

#[async_trait]
impl Reviewer for CommandReviewer {
    async fn review(&self, request: &CollaboratorRequest, env: &CollaboratorEnv) -> Result<Value> {
        let stdout =
            invoke_collaborator(&self.command, self.timeout, self.base_env.as_ref(), request, env)
                .await?;
        serde_json::from_str(stdout.trim())
            .map_err(|e| malformed(format!("reviewer output is not JSON: {e}")))
    }
}
