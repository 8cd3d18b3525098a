//! Finite credential pool with exclusive, RAII-released leases.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use warden_types::{CredentialLease, InstanceId, Result, WardenError};

/// Environment variable carrying the leased secret to collaborators.
pub const CREDENTIAL_ENV: &str = "WARDEN_CREDENTIAL";
/// Environment variable carrying the leased credential's id.
pub const CREDENTIAL_ID_ENV: &str = "WARDEN_CREDENTIAL_ID";

#[derive(Clone)]
pub struct Credential {
    id: String,
    secret: String,
}

impl Credential {
    pub fn new(id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            secret: secret.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Environment handed to collaborator processes while this credential is leased.
    pub fn env(&self) -> CollaboratorEnv {
        let mut vars = HashMap::new();
        vars.insert(CREDENTIAL_ID_ENV.to_string(), self.id.clone());
        if !self.secret.is_empty() {
            vars.insert(CREDENTIAL_ENV.to_string(), self.secret.clone());
        }
        CollaboratorEnv(vars)
    }
}

// Manual Debug impl to avoid leaking the secret
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Extra environment for collaborator processes. Values are never printed.
#[derive(Clone, Default)]
pub struct CollaboratorEnv(HashMap<String, String>);

impl CollaboratorEnv {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn vars(&self) -> &HashMap<String, String> {
        &self.0
    }
}

impl fmt::Debug for CollaboratorEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.0.keys().collect();
        keys.sort();
        f.debug_struct("CollaboratorEnv").field("keys", &keys).finish()
    }
}

// ---------------------------------------------------------------------------
// CredentialPool
// ---------------------------------------------------------------------------

pub struct CredentialPool {
    size: usize,
    permits: Arc<Semaphore>,
    available: Mutex<Vec<Credential>>,
    log: Mutex<Vec<CredentialLease>>,
    active: AtomicUsize,
    peak: AtomicUsize,
    acquire_timeout: Option<Duration>,
}

impl fmt::Debug for CredentialPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPool")
            .field("size", &self.size)
            .field("active", &self.active())
            .field("peak", &self.peak())
            .finish()
    }
}

impl CredentialPool {
    pub fn new(credentials: Vec<Credential>) -> Result<Self> {
        if credentials.is_empty() {
            return Err(WardenError::Config("credential pool is empty".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for c in &credentials {
            if !seen.insert(c.id.as_str()) {
                return Err(WardenError::Config(format!(
                    "duplicate credential id '{}'",
                    c.id
                )));
            }
        }
        let size = credentials.len();
        // Leases are popped from the end; reverse so the first credential is leased first.
        let mut available = credentials;
        available.reverse();
        Ok(Self {
            size,
            permits: Arc::new(Semaphore::new(size)),
            available: Mutex::new(available),
            log: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            acquire_timeout: None,
        })
    }

    /// A pool of `n` secretless credentials named `anonymous-1..=n`.
    pub fn anonymous(n: usize) -> Result<Self> {
        Self::new(
            (1..=n)
                .map(|i| Credential::new(format!("anonymous-{i}"), ""))
                .collect(),
        )
    }

    /// Fail an acquisition that waits longer than `timeout`.
    pub fn with_acquire_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous leases observed.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Every lease granted so far, in grant order.
    pub fn lease_log(&self) -> Vec<CredentialLease> {
        lock(&self.log).clone()
    }

    /// Wait for a free credential. Blocks while the pool is exhausted.
    pub async fn acquire(self: &Arc<Self>, holder: &InstanceId) -> Result<LeaseGuard> {
        let started = tokio::time::Instant::now();
        let acquire = self.permits.clone().acquire_owned();
        let permit = match self.acquire_timeout {
            Some(limit) => tokio::time::timeout(limit, acquire).await.map_err(|_| {
                WardenError::CredentialPoolExhausted {
                    pool_size: self.size,
                    waited_ms: started.elapsed().as_millis() as u64,
                }
            })?,
            None => acquire.await,
        }
        .map_err(|_| WardenError::Other("credential pool closed".into()))?;

        let credential = lock(&self.available)
            .pop()
            .ok_or_else(|| WardenError::Other("credential pool has a permit but no credential".into()))?;

        let log_index = {
            let mut log = lock(&self.log);
            log.push(CredentialLease {
                credential_id: credential.id.clone(),
                holder: holder.clone(),
                acquired_at: Utc::now(),
                released_at: None,
            });
            log.len() - 1
        };
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_active, Ordering::SeqCst);

        tracing::debug!(
            instance = %holder,
            credential = %credential.id,
            active = now_active,
            waited_ms = started.elapsed().as_millis() as u64,
            "Credential leased"
        );
        Ok(LeaseGuard {
            pool: Arc::clone(self),
            credential: Some(credential),
            log_index,
            _permit: permit,
        })
    }

    fn release(&self, credential: Credential, log_index: usize) {
        if let Some(lease) = lock(&self.log).get_mut(log_index) {
            lease.released_at = Some(Utc::now());
        }
        tracing::debug!(credential = %credential.id, "Credential released");
        self.active.fetch_sub(1, Ordering::SeqCst);
        lock(&self.available).push(credential);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// An active lease. The credential returns to the pool on drop, before the
/// pool slot is freed.
pub struct LeaseGuard {
    pool: Arc<CredentialPool>,
    credential: Option<Credential>,
    log_index: usize,
    _permit: OwnedSemaphorePermit,
}

impl LeaseGuard {
    pub fn credential_id(&self) -> &str {
        self.credential.as_ref().map(|c| c.id()).unwrap_or_default()
    }

    pub fn env(&self) -> CollaboratorEnv {
        self.credential
            .as_ref()
            .map(Credential::env)
            .unwrap_or_default()
    }
}

impl fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("credential", &self.credential)
            .finish()
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Some(credential) = self.credential.take() {
            self.pool.release(credential, self.log_index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> InstanceId {
        InstanceId::from_work_unit(s).unwrap()
    }

    fn pool(n: usize) -> Arc<CredentialPool> {
        Arc::new(
            CredentialPool::new(
                (1..=n)
                    .map(|i| Credential::new(format!("cred-{i}"), format!("secret-{i}")))
                    .collect(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn empty_pool_is_rejected() {
        assert!(CredentialPool::new(Vec::new()).is_err());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let err = CredentialPool::new(vec![Credential::new("a", "x"), Credential::new("a", "y")])
            .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn debug_output_redacts_secret() {
        let c = Credential::new("gh-1", "ghp_supersecret");
        let dbg = format!("{c:?}");
        assert!(dbg.contains("gh-1"));
        assert!(!dbg.contains("ghp_supersecret"));
        let env = format!("{:?}", c.env());
        assert!(!env.contains("ghp_supersecret"));
        assert!(env.contains(CREDENTIAL_ENV));
    }

    #[test]
    fn anonymous_credentials_only_expose_id() {
        let c = Credential::new("anonymous-1", "");
        let env = c.env();
        assert_eq!(env.vars().get(CREDENTIAL_ID_ENV).map(String::as_str), Some("anonymous-1"));
        assert!(!env.vars().contains_key(CREDENTIAL_ENV));
    }

    #[tokio::test]
    async fn lease_is_exclusive_and_returned_on_drop() {
        let pool = pool(1);
        let guard = pool.acquire(&id("a")).await.unwrap();
        assert_eq!(guard.credential_id(), "cred-1");
        assert_eq!(pool.active(), 1);

        let waiting = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(&id("b")).await.map(|g| g.credential_id().to_string()) })
        };
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());

        drop(guard);
        let second = waiting.await.unwrap().unwrap();
        assert_eq!(second, "cred-1");
        assert_eq!(pool.active(), 0);
        assert_eq!(pool.peak(), 1);

        let log = pool.lease_log();
        assert_eq!(log.len(), 2);
        assert!(log.iter().all(|l| l.released_at.is_some()));
        assert_eq!(log[0].holder, id("a"));
        assert_eq!(log[1].holder, id("b"));
    }

    #[tokio::test]
    async fn distinct_holders_get_distinct_credentials() {
        let pool = pool(2);
        let a = pool.acquire(&id("a")).await.unwrap();
        let b = pool.acquire(&id("b")).await.unwrap();
        assert_ne!(a.credential_id(), b.credential_id());
        assert_eq!(pool.peak(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn acquisition_tolerance_yields_coordination_error() {
        let pool = Arc::new(
            CredentialPool::anonymous(1)
                .unwrap()
                .with_acquire_timeout(Some(Duration::from_millis(200))),
        );
        let _held = pool.acquire(&id("a")).await.unwrap();
        let err = pool.acquire(&id("b")).await.unwrap_err();
        match err {
            WardenError::CredentialPoolExhausted { pool_size, waited_ms } => {
                assert_eq!(pool_size, 1);
                assert!(waited_ms >= 200);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn env_carries_leased_secret() {
        let pool = pool(1);
        let guard = pool.acquire(&id("a")).await.unwrap();
        let env = guard.env();
        assert_eq!(env.vars().get(CREDENTIAL_ENV).map(String::as_str), Some("secret-1"));
    }
}
