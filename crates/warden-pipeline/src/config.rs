//! `warden.toml` configuration.
//!
//! Layering is file, then environment, then command-line flags. The file and
//! environment layers live here; the environment is always passed in as a map.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use warden_types::{Result, WardenError};

use crate::collaborators::DEFAULT_COLLABORATOR_TIMEOUT;
use crate::credentials::{Credential, CredentialPool};
use crate::human_gate::{DEFAULT_ACCEPT_TOKEN, DEFAULT_HUMAN_TIMEOUT, DEFAULT_REJECT_TOKEN};
use crate::process::CommandLine;
use crate::review_gate::{ReviewPolicy, DEFAULT_COVERAGE_THRESHOLD};
use crate::router::{RoutingPolicy, DEFAULT_MAX_ITERATIONS};
use crate::test_gate::DEFAULT_TEST_TIMEOUT;
use crate::validator::ValidatorConfig;

pub const CONFIG_FILE_NAME: &str = "warden.toml";

pub const ENV_CHECKPOINT_DIR: &str = "WARDEN_CHECKPOINT_DIR";
pub const ENV_MAX_WORKERS: &str = "WARDEN_MAX_WORKERS";
pub const ENV_HUMAN_TIMEOUT_SECS: &str = "WARDEN_HUMAN_TIMEOUT_SECS";
pub const ENV_MAX_ITERATIONS: &str = "WARDEN_MAX_ITERATIONS";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WardenConfig {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub tests: TestsSection,
    #[serde(default)]
    pub review: ReviewSection,
    #[serde(default)]
    pub author: AuthorSection,
    #[serde(default)]
    pub coordinator: CoordinatorSection,
    #[serde(default)]
    pub validator: ValidatorConfig,
    #[serde(default)]
    pub checkpoint: CheckpointSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSection {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_coverage_threshold")]
    pub coverage_threshold: f64,
    /// Pause for a human edit after each fresh draft.
    #[serde(default = "default_true")]
    pub human_edit: bool,
    #[serde(default = "default_human_timeout_secs")]
    pub human_timeout_secs: u64,
    #[serde(default = "default_accept_token")]
    pub accept_token: String,
    #[serde(default = "default_reject_token")]
    pub reject_token: String,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            coverage_threshold: default_coverage_threshold(),
            human_edit: true,
            human_timeout_secs: default_human_timeout_secs(),
            accept_token: default_accept_token(),
            reject_token: default_reject_token(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestsSection {
    #[serde(default)]
    pub command: Option<CommandLine>,
    #[serde(default = "default_test_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for TestsSection {
    fn default() -> Self {
        Self {
            command: None,
            timeout_secs: default_test_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewSection {
    #[serde(default)]
    pub command: Option<CommandLine>,
    #[serde(default = "default_collaborator_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ReviewSection {
    fn default() -> Self {
        Self {
            command: None,
            timeout_secs: default_collaborator_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorSection {
    #[serde(default)]
    pub draft: Option<CommandLine>,
    #[serde(default)]
    pub scaffold: Option<CommandLine>,
    #[serde(default)]
    pub implement: Option<CommandLine>,
    #[serde(default = "default_collaborator_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for AuthorSection {
    fn default() -> Self {
        Self {
            draft: None,
            scaffold: None,
            implement: None,
            timeout_secs: default_collaborator_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorSection {
    /// Requested parallelism; clamped by the coordinator.
    #[serde(default)]
    pub max_workers: Option<usize>,
    /// Names of environment variables holding pooled credentials.
    #[serde(default)]
    pub credentials: Vec<String>,
    /// Give up on a lease after this long. Unset waits indefinitely.
    #[serde(default)]
    pub lease_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSection {
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

fn default_coverage_threshold() -> f64 {
    DEFAULT_COVERAGE_THRESHOLD
}

fn default_true() -> bool {
    true
}

fn default_human_timeout_secs() -> u64 {
    DEFAULT_HUMAN_TIMEOUT.as_secs()
}

fn default_accept_token() -> String {
    DEFAULT_ACCEPT_TOKEN.to_string()
}

fn default_reject_token() -> String {
    DEFAULT_REJECT_TOKEN.to_string()
}

fn default_test_timeout_secs() -> u64 {
    DEFAULT_TEST_TIMEOUT.as_secs()
}

fn default_collaborator_timeout_secs() -> u64 {
    DEFAULT_COLLABORATOR_TIMEOUT.as_secs()
}

impl WardenConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| WardenError::Config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path`. A missing file is an error.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            WardenError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            WardenError::Config(msg) => WardenError::Config(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    /// Load `<root>/warden.toml`, or defaults when there is none.
    pub async fn discover(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILE_NAME);
        if tokio::fs::try_exists(&path).await? {
            tracing::debug!(path = %path.display(), "Loading configuration");
            Self::load(&path).await
        } else {
            Ok(Self::default())
        }
    }

    /// Apply `WARDEN_*` overrides from `vars`.
    pub fn apply_env(&mut self, vars: &HashMap<String, String>) -> Result<()> {
        if let Some(dir) = vars.get(ENV_CHECKPOINT_DIR).filter(|v| !v.trim().is_empty()) {
            self.checkpoint.dir = Some(dir.clone());
        }
        if let Some(v) = vars.get(ENV_MAX_WORKERS) {
            self.coordinator.max_workers = Some(parse_env(ENV_MAX_WORKERS, v)?);
        }
        if let Some(v) = vars.get(ENV_HUMAN_TIMEOUT_SECS) {
            self.engine.human_timeout_secs = parse_env(ENV_HUMAN_TIMEOUT_SECS, v)?;
        }
        if let Some(v) = vars.get(ENV_MAX_ITERATIONS) {
            self.engine.max_iterations = parse_env(ENV_MAX_ITERATIONS, v)?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        let threshold = self.engine.coverage_threshold;
        if !(0.0..=100.0).contains(&threshold) {
            return Err(WardenError::Config(format!(
                "engine.coverage_threshold must be within 0..=100, got {threshold}"
            )));
        }
        for (name, secs) in [
            ("engine.human_timeout_secs", self.engine.human_timeout_secs),
            ("tests.timeout_secs", self.tests.timeout_secs),
            ("review.timeout_secs", self.review.timeout_secs),
            ("author.timeout_secs", self.author.timeout_secs),
        ] {
            if secs == 0 {
                return Err(WardenError::Config(format!("{name} must be positive")));
            }
        }
        Ok(())
    }

    pub fn routing_policy(&self) -> RoutingPolicy {
        RoutingPolicy {
            max_iterations: self.engine.max_iterations,
            human_edit: self.engine.human_edit,
            review: ReviewPolicy {
                coverage_threshold: self.engine.coverage_threshold,
            },
        }
    }

    pub fn human_timeout(&self) -> Duration {
        Duration::from_secs(self.engine.human_timeout_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.tests.timeout_secs)
    }

    pub fn review_timeout(&self) -> Duration {
        Duration::from_secs(self.review.timeout_secs)
    }

    pub fn author_timeout(&self) -> Duration {
        Duration::from_secs(self.author.timeout_secs)
    }

    /// Build the credential pool from the configured variable names.
    ///
    /// With no names configured the pool holds `workers` secretless
    /// credentials, so only the worker cap limits concurrency.
    pub fn credential_pool(
        &self,
        vars: &HashMap<String, String>,
        workers: usize,
    ) -> Result<CredentialPool> {
        let pool = if self.coordinator.credentials.is_empty() {
            CredentialPool::anonymous(workers)?
        } else {
            let credentials = self
                .coordinator
                .credentials
                .iter()
                .map(|name| match vars.get(name) {
                    Some(secret) if !secret.is_empty() => Ok(Credential::new(name.clone(), secret.clone())),
                    _ => Err(WardenError::Config(format!(
                        "credential variable {name} is not set"
                    ))),
                })
                .collect::<Result<Vec<_>>>()?;
            CredentialPool::new(credentials)?
        };
        Ok(pool.with_acquire_timeout(self.coordinator.lease_timeout_secs.map(Duration::from_secs)))
    }

    /// Variables that must never reach a collaborator except through a lease.
    pub fn hidden_env(&self) -> Vec<String> {
        self.coordinator.credentials.clone()
    }

    pub fn checkpoint_override(&self) -> Option<&str> {
        self.checkpoint.dir.as_deref()
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| WardenError::Config(format!("{name} has an invalid value '{value}'")))
}
