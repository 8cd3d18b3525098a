//! Path and context admission control.
//!
//! Every piece of externally supplied file content passes through
//! [`Validator::validate`] before the engine admits it: user-requested context
//! files before an authoring call, and authored artifacts before they are
//! written. The validator itself never touches the filesystem; [`confine`]
//! adds the symlink check right before a read or write.

use std::path::{Component, Path, PathBuf};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use warden_types::{PathValidationResult, RejectionReason, Result, WardenError};

pub const DEFAULT_MAX_FILE_BYTES: u64 = 100 * 1024;
pub const DEFAULT_MAX_CONTEXT_TOKENS: u64 = 200_000;

/// Filename globs treated as secret-bearing, matched case-insensitively
/// against the final path component.
const SECRET_NAME_GLOBS: &[&str] = &[
    ".env",
    ".env.*",
    "*.pem",
    "*.key",
    "*.p12",
    "*.pfx",
    "*.keystore",
    "*.jks",
    "id_rsa*",
    "id_dsa*",
    "id_ecdsa*",
    "id_ed25519*",
    ".netrc",
    ".npmrc",
    ".pypirc",
    "credentials*",
    "*secret*",
    "*.tfvars",
];

/// Directory names whose contents are never admitted.
const SECRET_DIRS: &[&str] = &[".ssh", ".aws", ".gnupg", ".docker"];

const CONTENT_MARKERS: &[(&str, &str)] = &[
    (
        "a private key block",
        r"-----BEGIN (?:[A-Z0-9]+ )*PRIVATE KEY-----",
    ),
    ("an AWS access key id", r"\bAKIA[0-9A-Z]{16}\b"),
    ("a GitHub token", r"\bgh[pousr]_[A-Za-z0-9]{36,}\b"),
    ("a Slack token", r"\bxox[abprs]-[A-Za-z0-9-]{10,}"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub max_file_bytes: u64,
    pub max_context_tokens: u64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            max_context_tokens: DEFAULT_MAX_CONTEXT_TOKENS,
        }
    }
}

/// One admitted context file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextFile {
    pub path: PathBuf,
    pub content: String,
}

/// The full set of context admitted for one external call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextBundle {
    pub files: Vec<ContextFile>,
    pub estimated_tokens: u64,
}

/// Rough token estimate used for the aggregate budget.
pub fn estimate_tokens(bytes: u64) -> u64 {
    bytes.div_ceil(4)
}

pub struct Validator {
    config: ValidatorConfig,
    secret_names: GlobSet,
    markers: Vec<(&'static str, Regex)>,
}

impl Validator {
    pub fn new(config: ValidatorConfig) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in SECRET_NAME_GLOBS {
            let glob = GlobBuilder::new(pattern)
                .case_insensitive(true)
                .literal_separator(true)
                .build()
                .map_err(|e| WardenError::Config(format!("bad secret glob {pattern}: {e}")))?;
            builder.add(glob);
        }
        let secret_names = builder
            .build()
            .map_err(|e| WardenError::Config(format!("secret glob set: {e}")))?;

        let markers = CONTENT_MARKERS
            .iter()
            .map(|(label, re)| {
                Regex::new(re)
                    .map(|r| (*label, r))
                    .map_err(|e| WardenError::Config(format!("bad content marker {label}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config,
            secret_names,
            markers,
        })
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Validate one file. Identical inputs always yield identical results.
    pub fn validate(&self, path: &Path, declared_root: &Path, content: &[u8]) -> PathValidationResult {
        match self.check(path, declared_root, content) {
            Ok(()) => PathValidationResult::valid(path),
            Err(reason) => PathValidationResult::invalid(path, reason),
        }
    }

    fn check(
        &self,
        path: &Path,
        declared_root: &Path,
        content: &[u8],
    ) -> std::result::Result<(), RejectionReason> {
        let resolved = resolve_within(path, declared_root)?;
        let relative = resolved
            .strip_prefix(normalize_lexically(declared_root))
            .unwrap_or(&resolved);

        for component in relative.components() {
            if let Component::Normal(name) = component {
                let name = name.to_string_lossy();
                if let Some(dir) = SECRET_DIRS.iter().find(|d| name.eq_ignore_ascii_case(d)) {
                    return Err(RejectionReason::SecretLikeName {
                        pattern: (*dir).to_string(),
                    });
                }
            }
        }
        if let Some(name) = relative.file_name() {
            if let Some(&idx) = self.secret_names.matches(name).first() {
                return Err(RejectionReason::SecretLikeName {
                    pattern: SECRET_NAME_GLOBS[idx].to_string(),
                });
            }
        }

        let size = content.len() as u64;
        if size > self.config.max_file_bytes {
            return Err(RejectionReason::FileTooLarge {
                size,
                limit: self.config.max_file_bytes,
            });
        }

        if let Some((label, _)) = self.markers.iter().find(|(_, re)| re.is_match(content)) {
            return Err(RejectionReason::SecretLikeContent {
                marker: (*label).to_string(),
            });
        }
        Ok(())
    }

    /// Fail if a content set of `total_bytes` across `files` files exceeds
    /// the context budget. Callers run this before any external call.
    pub fn check_budget(&self, files: usize, total_bytes: u64) -> Result<u64> {
        let estimated_tokens = estimate_tokens(total_bytes);
        if estimated_tokens > self.config.max_context_tokens {
            return Err(WardenError::ContextBudgetExceeded {
                files,
                estimated_tokens,
                budget_tokens: self.config.max_context_tokens,
            });
        }
        Ok(estimated_tokens)
    }

    /// Admit a set of files as one context bundle.
    ///
    /// The aggregate budget is checked first, then each file; the first
    /// rejection fails the whole set.
    pub fn admit(&self, declared_root: &Path, files: Vec<(PathBuf, Vec<u8>)>) -> Result<ContextBundle> {
        let total: u64 = files.iter().map(|(_, c)| c.len() as u64).sum();
        let estimated_tokens = self.check_budget(files.len(), total)?;

        let mut admitted = Vec::with_capacity(files.len());
        for (path, content) in files {
            let result = self.validate(&path, declared_root, &content);
            if !result.is_valid() {
                tracing::warn!(path = %path.display(), reason = ?result.reason, "Context file rejected");
            }
            let path = result.into_result()?;
            admitted.push(ContextFile {
                path,
                content: String::from_utf8_lossy(&content).into_owned(),
            });
        }
        Ok(ContextBundle {
            files: admitted,
            estimated_tokens,
        })
    }
}

/// Resolve `path` against `root` without touching the filesystem.
///
/// Relative paths may use `..` as long as they never climb above `root`.
/// Absolute paths are accepted only when they normalise to a location
/// under `root`.
pub fn resolve_within(path: &Path, root: &Path) -> std::result::Result<PathBuf, RejectionReason> {
    if path.as_os_str().is_empty() {
        return Err(RejectionReason::EmptyPath);
    }
    let root = normalize_lexically(root);

    if path.has_root() {
        let normalized = normalize_lexically(path);
        if normalized.starts_with(&root) && normalized != root {
            return Ok(normalized);
        }
        return Err(RejectionReason::AbsoluteOutsideRoot);
    }

    let mut stack: Vec<&std::ffi::OsStr> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(c) => stack.push(c),
            Component::CurDir => {}
            Component::ParentDir => {
                if stack.pop().is_none() {
                    return Err(RejectionReason::ParentTraversal);
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(RejectionReason::AbsoluteOutsideRoot);
            }
        }
    }
    if stack.is_empty() {
        return Err(RejectionReason::EmptyPath);
    }
    let mut resolved = root;
    resolved.extend(stack);
    Ok(resolved)
}

/// Resolve `path` under `root`, then make sure no symlink along it leads
/// outside `root`.
///
/// The deepest existing ancestor is canonicalised, so paths that do not
/// exist yet (artifacts about to be written) are covered too. A dangling
/// link cannot be followed safely and is rejected.
pub async fn confine(path: &Path, root: &Path) -> Result<PathBuf> {
    let rejected = |reason: RejectionReason| WardenError::PathRejected {
        path: path.display().to_string(),
        reason,
    };
    let resolved = resolve_within(path, root).map_err(rejected)?;
    let real_root = tokio::fs::canonicalize(root).await?;

    let mut existing = resolved.as_path();
    loop {
        match tokio::fs::canonicalize(existing).await {
            Ok(real) if real.starts_with(&real_root) => return Ok(resolved),
            Ok(_) => return Err(rejected(RejectionReason::LinkOutsideRoot)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if tokio::fs::symlink_metadata(existing).await.is_ok() {
                    return Err(rejected(RejectionReason::LinkOutsideRoot));
                }
                match existing.parent() {
                    Some(parent) => existing = parent,
                    None => return Ok(resolved),
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Collapse `.` and `..` components lexically.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
