//! Pools of started script engines
//!
//! An [`EnginePool`] hands out engines without ever blocking: when no idle
//! engine is available a fresh one is started on the spot ("overflow"). Returning
//! an engine to a full pool stops it instead, so the idle set never exceeds
//! the configured capacity.
//!
//! Sessions bind a client to one engine for as long as they keep making requests,
//! so script state kept in globals survives between their requests. Bindings
//! expire after an idle TTL and are swept lazily on lookup.
//!
//! A [`PoolRegistry`] keeps one pool per [`PoolKey`], i.e. per filesystem
//! instance and site version, so engines never see a stale module cache from
//! another deployment.

use crate::fs::VirtualFs;
use crate::runtime::{CapabilitySet, EngineSetup, RuntimeResult, ScriptEngine};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

/// Produces started engines for a pool
pub type EngineFactory = Arc<dyn Fn() -> RuntimeResult<Arc<ScriptEngine>> + Send + Sync>;

struct SessionBinding {
    engine: Arc<ScriptEngine>,
    last_used: Instant,
}

pub struct EnginePool {
    capacity: usize,
    factory: EngineFactory,
    available: Mutex<VecDeque<Arc<ScriptEngine>>>,
    sessions: Mutex<HashMap<String, SessionBinding>>,
    session_ttl: Option<Duration>,
    closed: AtomicBool,
}

impl EnginePool {
    /// Create a pool and pre-start `capacity` engines
    pub fn new(
        capacity: usize,
        session_ttl: Option<Duration>,
        factory: EngineFactory,
    ) -> RuntimeResult<Self> {
        let mut available = VecDeque::with_capacity(capacity);
        for _ in 0..capacity {
            available.push_back(factory()?);
        }
        tracing::debug!(capacity, "engine pool created");

        Ok(Self {
            capacity,
            factory,
            available: Mutex::new(available),
            sessions: Mutex::new(HashMap::new()),
            session_ttl,
            closed: AtomicBool::new(false),
        })
    }

    /// Pool whose engines are built from `setup`
    pub fn with_setup(
        capacity: usize,
        session_ttl: Option<Duration>,
        setup: EngineSetup,
    ) -> RuntimeResult<Self> {
        let factory: EngineFactory = Arc::new(move || ScriptEngine::spawn(setup.clone()));
        Self::new(capacity, session_ttl, factory)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available_len(&self) -> usize {
        self.available.lock().len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Take an idle engine or start a new one; never waits
    pub fn get_engine(&self) -> RuntimeResult<Arc<ScriptEngine>> {
        {
            let mut available = self.available.lock();
            while let Some(engine) = available.pop_front() {
                if !engine.is_stopped() {
                    return Ok(engine);
                }
            }
        }

        let engine = (self.factory)()?;
        tracing::debug!(engine = engine.id(), "pool empty, started overflow engine");
        Ok(engine)
    }

    /// Hand an engine back.
    ///
    /// Stopped engines are discarded. When the pool is full or closed the engine
    /// is stopped instead of kept.
    pub fn return_engine(&self, engine: Arc<ScriptEngine>) {
        if engine.is_stopped() {
            return;
        }

        let rejected = {
            let mut available = self.available.lock();
            if self.is_closed() || available.len() >= self.capacity {
                Some(engine)
            } else {
                available.push_back(engine);
                None
            }
        };

        if let Some(engine) = rejected {
            tracing::debug!(engine = engine.id(), "pool full, stopping returned engine");
            engine.stop();
        }
    }

    /// The engine bound to `session_id`, binding one from the pool on first use
    pub fn get_engine_for_session(&self, session_id: &str) -> RuntimeResult<Arc<ScriptEngine>> {
        let now = Instant::now();
        let expired = {
            let mut sessions = self.sessions.lock();
            let expired = self.sweep_expired(&mut sessions, now);
            if let Some(binding) = sessions.get_mut(session_id) {
                if !binding.engine.is_stopped() {
                    binding.last_used = now;
                    let engine = binding.engine.clone();
                    drop(sessions);
                    self.release_all(expired);
                    return Ok(engine);
                }
                sessions.remove(session_id);
            }
            expired
        };
        self.release_all(expired);

        let engine = self.get_engine()?;

        // Another request for the same session may have bound an engine meanwhile
        let mut sessions = self.sessions.lock();
        if let Some(binding) = sessions.get_mut(session_id) {
            if !binding.engine.is_stopped() {
                binding.last_used = now;
                let bound = binding.engine.clone();
                drop(sessions);
                self.return_engine(engine);
                return Ok(bound);
            }
        }
        sessions.insert(
            session_id.to_string(),
            SessionBinding {
                engine: engine.clone(),
                last_used: now,
            },
        );
        tracing::debug!(engine = engine.id(), session = session_id, "session bound");
        Ok(engine)
    }

    /// Unbind a session and return its engine to the pool
    pub fn release_session_engine(&self, session_id: &str) {
        let binding = self.sessions.lock().remove(session_id);
        if let Some(binding) = binding {
            self.return_engine(binding.engine);
        }
    }

    fn sweep_expired(
        &self,
        sessions: &mut HashMap<String, SessionBinding>,
        now: Instant,
    ) -> Vec<Arc<ScriptEngine>> {
        let Some(ttl) = self.session_ttl else {
            return Vec::new();
        };
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, binding)| now.duration_since(binding.last_used) >= ttl)
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| sessions.remove(&id))
            .map(|binding| binding.engine)
            .collect()
    }

    fn release_all(&self, engines: Vec<Arc<ScriptEngine>>) {
        for engine in engines {
            self.return_engine(engine);
        }
    }

    /// Stop every idle and session-bound engine; later returns stop their engine
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let idle: Vec<_> = self.available.lock().drain(..).collect();
        let bound: Vec<_> = self
            .sessions
            .lock()
            .drain()
            .map(|(_, binding)| binding.engine)
            .collect();
        for engine in idle.iter().chain(bound.iter()) {
            engine.stop();
        }
        tracing::debug!(stopped = idle.len() + bound.len(), "engine pool shut down");
    }
}

impl Drop for EnginePool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for EnginePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnginePool")
            .field("capacity", &self.capacity)
            .field("available", &self.available_len())
            .field("sessions", &self.session_count())
            .finish()
    }
}

/// Identity of a pool: which filesystem instance and which site version
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    fs_identity: usize,
    fs_kind: &'static str,
    version: String,
}

impl PoolKey {
    pub fn new(fs: &Arc<dyn VirtualFs>, version: &str) -> Self {
        Self {
            fs_identity: Arc::as_ptr(fs) as *const () as usize,
            fs_kind: fs.kind(),
            version: version.to_string(),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }
}

/// Settings shared by every pool a registry creates
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub capacity: usize,
    pub session_ttl: Option<Duration>,
    pub base_path: String,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            capacity: 3,
            session_ttl: Some(Duration::from_secs(30 * 60)),
            base_path: "/".to_string(),
        }
    }
}

/// Lazily created pools, one per [`PoolKey`]
pub struct PoolRegistry {
    options: PoolOptions,
    capabilities: CapabilitySet,
    pools: Mutex<HashMap<PoolKey, Arc<EnginePool>>>,
}

impl PoolRegistry {
    pub fn new(options: PoolOptions) -> Self {
        Self::with_capabilities(options, CapabilitySet::standard())
    }

    pub fn with_capabilities(options: PoolOptions, capabilities: CapabilitySet) -> Self {
        Self {
            options,
            capabilities,
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// The pool for this filesystem and version, created on first use.
    ///
    /// Engines start outside the registry lock. When two callers race to create
    /// the same pool, the first insert wins and the other pool is shut down.
    pub fn pool_for(
        &self,
        fs: &Arc<dyn VirtualFs>,
        version: &str,
    ) -> RuntimeResult<Arc<EnginePool>> {
        let key = PoolKey::new(fs, version);
        if let Some(pool) = self.pools.lock().get(&key) {
            return Ok(pool.clone());
        }

        let setup = EngineSetup::new(fs.clone())
            .base_path(self.options.base_path.clone())
            .version(version)
            .capabilities(self.capabilities.clone());
        let built = Arc::new(EnginePool::with_setup(
            self.options.capacity,
            self.options.session_ttl,
            setup,
        )?);

        let (pool, lost) = {
            let mut pools = self.pools.lock();
            match pools.get(&key) {
                Some(existing) => (existing.clone(), Some(built)),
                None => {
                    pools.insert(key, built.clone());
                    (built, None)
                }
            }
        };
        match lost {
            Some(lost) => lost.shutdown(),
            None => tracing::info!(
                fs = fs.kind(),
                version,
                capacity = self.options.capacity,
                "created engine pool"
            ),
        }
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.pools.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.lock().is_empty()
    }

    /// Shut down and forget every pool
    pub fn shutdown(&self) {
        let pools: Vec<_> = self.pools.lock().drain().map(|(_, pool)| pool).collect();
        for pool in pools {
            pool.shutdown();
        }
    }
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new(PoolOptions::default())
    }
}
