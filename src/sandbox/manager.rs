//! Pool of daemon sessions keyed by session id.
//!
//! The session map is the only shared structure mutated by concurrent callers;
//! every lookup, insertion and eviction happens under its lock. Sessions are
//! started and shut down outside that lock so one slow guest never blocks the
//! rest of the pool.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::error::{Result, SandboxError};
use crate::sandbox::config::ExecutionPolicy;
use crate::sandbox::session::{DaemonSession, SessionClaim, SessionRoot};

const MAX_SESSION_ID_LEN: usize = 128;

/// Capacity and lifetime bounds of a [`SessionManager`].
#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    /// Maximum number of live sessions.
    pub max_sessions: usize,
    /// A session unused for longer than this may be evicted.
    pub idle_ttl: Duration,
    /// A session older than this may be evicted regardless of use.
    pub hard_ttl: Duration,
    /// Parent directory for session roots; temporary directories when unset.
    pub root_dir: Option<PathBuf>,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            max_sessions: 16,
            idle_ttl: Duration::from_secs(10 * 60),
            hard_ttl: Duration::from_secs(60 * 60),
            root_dir: None,
        }
    }
}

impl SessionManagerConfig {
    /// Create a new builder for SessionManagerConfig.
    pub fn builder() -> SessionManagerConfigBuilder {
        SessionManagerConfigBuilder::default()
    }
}

/// Builder for creating SessionManagerConfig instances.
#[derive(Debug, Clone, Default)]
pub struct SessionManagerConfigBuilder {
    max_sessions: Option<usize>,
    idle_ttl: Option<Duration>,
    hard_ttl: Option<Duration>,
    root_dir: Option<PathBuf>,
}

impl SessionManagerConfigBuilder {
    /// Set the pool capacity.
    pub fn max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = Some(max);
        self
    }

    /// Set the idle TTL.
    pub fn idle_ttl(mut self, ttl: Duration) -> Self {
        self.idle_ttl = Some(ttl);
        self
    }

    /// Set the hard TTL.
    pub fn hard_ttl(mut self, ttl: Duration) -> Self {
        self.hard_ttl = Some(ttl);
        self
    }

    /// Keep session roots under `dir` instead of temporary directories.
    pub fn root_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.root_dir = Some(dir.into());
        self
    }

    /// Build the SessionManagerConfig.
    pub fn build(self) -> SessionManagerConfig {
        let default = SessionManagerConfig::default();
        SessionManagerConfig {
            max_sessions: self.max_sessions.unwrap_or(default.max_sessions),
            idle_ttl: self.idle_ttl.unwrap_or(default.idle_ttl),
            hard_ttl: self.hard_ttl.unwrap_or(default.hard_ttl),
            root_dir: self.root_dir.or(default.root_dir),
        }
    }
}

/// Eviction view of one pooled session.
#[derive(Debug, Clone)]
struct Candidate {
    id: String,
    idle: Duration,
    age: Duration,
    busy: bool,
}

impl Candidate {
    fn of(session: &DaemonSession) -> Self {
        Self {
            id: session.id().to_string(),
            idle: session.idle_for(),
            age: session.age(),
            busy: session.is_busy(),
        }
    }

    fn expired(&self, config: &SessionManagerConfig) -> bool {
        self.idle > config.idle_ttl || self.age > config.hard_ttl
    }
}

/// Idle sessions past a TTL, least recently used first. Busy sessions are never picked.
fn expired_victims(candidates: &[Candidate], config: &SessionManagerConfig) -> Vec<String> {
    let mut expired: Vec<&Candidate> = candidates
        .iter()
        .filter(|c| !c.busy && c.expired(config))
        .collect();
    expired.sort_by(|a, b| b.idle.cmp(&a.idle));
    expired.into_iter().map(|c| c.id.clone()).collect()
}

/// Sessions to evict so that one more fits in a pool of `max_sessions`.
///
/// Expired sessions go first; if the pool is still full, the least recently
/// used idle sessions follow.
fn capacity_victims(candidates: &[Candidate], config: &SessionManagerConfig) -> Vec<String> {
    let mut victims = expired_victims(candidates, config);
    let mut remaining = candidates.len() - victims.len();

    let mut idle: Vec<&Candidate> = candidates
        .iter()
        .filter(|c| !c.busy && !victims.contains(&c.id))
        .collect();
    idle.sort_by(|a, b| b.idle.cmp(&a.idle));
    for candidate in idle {
        if remaining < config.max_sessions {
            break;
        }
        victims.push(candidate.id.clone());
        remaining -= 1;
    }
    victims
}

/// Pool of [`DaemonSession`]s.
#[derive(Debug)]
pub struct SessionManager {
    config: SessionManagerConfig,
    interpreter: PathBuf,
    policy: Arc<ExecutionPolicy>,
    sessions: Mutex<HashMap<String, Arc<DaemonSession>>>,
}

impl SessionManager {
    /// Empty pool spawning `interpreter` under `policy`.
    pub fn new(
        config: SessionManagerConfig,
        interpreter: impl Into<PathBuf>,
        policy: Arc<ExecutionPolicy>,
    ) -> Self {
        Self {
            config,
            interpreter: interpreter.into(),
            policy,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Pool configuration.
    pub fn config(&self) -> &SessionManagerConfig {
        &self.config
    }

    /// Return the live session for `id`, creating and starting one if needed.
    ///
    /// `extra_env` is applied when a new guest is started.
    pub async fn get_or_create(
        &self,
        id: &str,
        extra_env: &BTreeMap<String, String>,
    ) -> Result<Arc<DaemonSession>> {
        let claim = self.checkout(id, extra_env).await?;
        Ok(Arc::clone(claim.session()))
    }

    /// Like [`get_or_create`](Self::get_or_create), but the session stays
    /// busy, and so cannot be evicted, until the claim is dropped.
    pub async fn checkout(
        &self,
        id: &str,
        extra_env: &BTreeMap<String, String>,
    ) -> Result<SessionClaim> {
        validate_session_id(id)?;

        let mut evicted = Vec::new();
        let session = {
            let mut sessions = self.sessions.lock().await;
            self.lookup_or_insert(&mut sessions, id, &mut evicted)
        };

        for stale in evicted {
            stale.shutdown().await;
        }
        let session = session?;

        if let Err(e) = session.start(extra_env).await {
            let mut sessions = self.sessions.lock().await;
            if sessions.get(id).is_some_and(|s| Arc::ptr_eq(s, session.session())) {
                sessions.remove(id);
            }
            return Err(e);
        }
        Ok(session)
    }

    /// Runs under the map lock, so the returned claim is taken before any
    /// other caller can pick the session for eviction. Removed sessions land
    /// in `evicted` for shutdown.
    fn lookup_or_insert(
        &self,
        sessions: &mut HashMap<String, Arc<DaemonSession>>,
        id: &str,
        evicted: &mut Vec<Arc<DaemonSession>>,
    ) -> Result<SessionClaim> {
        if let Some(existing) = sessions.get(id) {
            if existing.is_alive() {
                return Ok(existing.claim());
            }
            tracing::debug!(session_id = %id, "replacing dead session");
            if let Some(dead) = sessions.remove(id) {
                evicted.push(dead);
            }
        }

        if sessions.len() >= self.config.max_sessions {
            let candidates: Vec<Candidate> =
                sessions.values().map(|s| Candidate::of(s)).collect();
            for victim in capacity_victims(&candidates, &self.config) {
                if let Some(session) = sessions.remove(&victim) {
                    tracing::info!(session_id = %victim, "evicting session");
                    evicted.push(session);
                }
            }
        }
        if sessions.len() >= self.config.max_sessions {
            tracing::warn!(max_sessions = self.config.max_sessions, "session pool exhausted");
            return Err(SandboxError::CapacityExhausted(self.config.max_sessions));
        }

        let session = Arc::new(DaemonSession::new(
            id,
            self.make_root(id)?,
            self.interpreter.clone(),
            Arc::clone(&self.policy),
        ));
        let claim = session.claim();
        sessions.insert(id.to_string(), session);
        Ok(claim)
    }

    fn make_root(&self, id: &str) -> Result<SessionRoot> {
        match &self.config.root_dir {
            Some(parent) => {
                let dir = parent.join(id);
                std::fs::create_dir_all(&dir)?;
                Ok(SessionRoot::Directory(dir.canonicalize()?))
            }
            None => Ok(SessionRoot::Temporary(
                tempfile::Builder::new().prefix("pyexec-session-").tempdir()?,
            )),
        }
    }

    /// The registered session for `id`, if any.
    pub async fn get(&self, id: &str) -> Option<Arc<DaemonSession>> {
        self.sessions.lock().await.get(id).cloned()
    }

    /// Whether `id` is registered.
    pub async fn contains(&self, id: &str) -> bool {
        self.sessions.lock().await.contains_key(id)
    }

    /// Number of registered sessions.
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Whether the pool is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Registered session ids, sorted.
    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Shut down and remove one session. Returns `false` if it was not registered.
    pub async fn close(&self, id: &str) -> bool {
        let removed = self.sessions.lock().await.remove(id);
        match removed {
            Some(session) => {
                session.shutdown().await;
                true
            }
            None => false,
        }
    }

    /// Shut down and remove every session.
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in drained {
            session.shutdown().await;
        }
    }

    /// Unregister `session` if it is still the one registered under its id, then shut it down.
    pub async fn discard(&self, session: &Arc<DaemonSession>) {
        {
            let mut sessions = self.sessions.lock().await;
            if sessions.get(session.id()).is_some_and(|s| Arc::ptr_eq(s, session)) {
                sessions.remove(session.id());
            }
        }
        session.shutdown().await;
    }

    /// Evict every idle session past its idle or hard TTL. Returns how many.
    pub async fn sweep_expired(&self) -> usize {
        let expired: Vec<_> = {
            let mut sessions = self.sessions.lock().await;
            let candidates: Vec<Candidate> = sessions.values().map(|s| Candidate::of(s)).collect();
            expired_victims(&candidates, &self.config)
                .into_iter()
                .filter_map(|id| sessions.remove(&id))
                .collect()
        };
        for session in &expired {
            tracing::info!(session_id = %session.id(), "sweeping expired session");
            session.shutdown().await;
        }
        expired.len()
    }
}

/// Session ids become directory names, so keep them to a safe alphabet.
pub fn validate_session_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(SandboxError::InvalidArgument(format!(
            "session id {id:?} must be 1-{MAX_SESSION_ID_LEN} characters of [A-Za-z0-9._-]"
        )))
    }
}
