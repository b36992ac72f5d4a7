//! Engine instances and their worker threads

use super::{
    CapabilityConfig, CapabilitySet, LoadedModule, ModuleLoader, RuntimeError, RuntimeResult,
    ThrownError, event_loop::EngineEventLoop, panic_message,
};
use crate::fs::VirtualFs;
use boa_engine::{Context, JsValue, Source, context::ContextBuilder};
use parking_lot::Mutex;
use std::{
    panic::{self, AssertUnwindSafe},
    rc::Rc,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{self, RecvTimeoutError},
    },
    thread,
    time::Instant,
};
use tokio::sync::oneshot;

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

type Task = Box<dyn FnOnce(&mut EngineScope) + Send>;

enum Envelope {
    Run(Task),
    Shutdown,
}

/// Everything an engine needs to build its context on the worker thread
#[derive(Clone, Debug)]
pub struct EngineSetup {
    pub fs: Arc<dyn VirtualFs>,
    /// Directory that bare `require` calls and `process.cwd()` resolve against
    pub base_path: String,
    pub version: String,
    pub capabilities: CapabilitySet,
}

impl EngineSetup {
    pub fn new(fs: Arc<dyn VirtualFs>) -> Self {
        Self {
            fs,
            base_path: "/".to_string(),
            version: "dev".to_string(),
            capabilities: CapabilitySet::standard(),
        }
    }

    pub fn base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = base_path.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// Cloneable handle for putting tasks on one engine's queue
#[derive(Clone)]
pub struct TaskScheduler {
    engine_id: u64,
    sender: mpsc::Sender<Envelope>,
}

impl TaskScheduler {
    pub fn engine_id(&self) -> u64 {
        self.engine_id
    }

    pub fn schedule<F>(&self, task: F) -> RuntimeResult<()>
    where
        F: FnOnce(&mut EngineScope) + Send + 'static,
    {
        self.sender
            .send(Envelope::Run(Box::new(task)))
            .map_err(|_| RuntimeError::EngineStopped(self.engine_id))
    }
}

/// One script engine bound to a dedicated worker thread.
///
/// Tasks run one at a time in the order they were scheduled. A task that panics
/// is logged and the worker keeps serving the queue.
pub struct ScriptEngine {
    id: u64,
    setup: EngineSetup,
    scheduler: Mutex<Option<TaskScheduler>>,
    stopped: AtomicBool,
}

impl ScriptEngine {
    pub fn new(setup: EngineSetup) -> Self {
        Self {
            id: NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed),
            setup,
            scheduler: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    /// Create and start an engine in one step
    pub fn spawn(setup: EngineSetup) -> RuntimeResult<Arc<Self>> {
        let engine = Arc::new(Self::new(setup));
        engine.start()?;
        Ok(engine)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn setup(&self) -> &EngineSetup {
        &self.setup
    }

    pub fn is_started(&self) -> bool {
        self.scheduler.lock().is_some()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Spawn the worker and wait until its context and capabilities are ready.
    ///
    /// Starting a running engine is a no-op.
    pub fn start(&self) -> RuntimeResult<()> {
        let mut scheduler = self.scheduler.lock();
        if self.is_stopped() {
            return Err(RuntimeError::EngineStopped(self.id));
        }
        if scheduler.is_some() {
            return Ok(());
        }

        let (sender, receiver) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let id = self.id;
        let setup = self.setup.clone();
        let handle = TaskScheduler {
            engine_id: id,
            sender,
        };
        let worker_handle = handle.clone();

        thread::Builder::new()
            .name(format!("rivet-engine-{id}"))
            .spawn(move || worker_main(id, setup, worker_handle, receiver, ready_tx))
            .map_err(|e| RuntimeError::EngineStart(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                *scheduler = Some(handle);
                tracing::debug!(engine = id, fs = self.setup.fs.kind(), "engine started");
                Ok(())
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(RuntimeError::EngineStart(
                "worker exited during startup".to_string(),
            )),
        }
    }

    /// A handle to the task queue, if the engine is running
    pub fn scheduler(&self) -> Option<TaskScheduler> {
        self.scheduler.lock().clone()
    }

    /// Queue a task without waiting for it
    pub fn schedule<F>(&self, task: F) -> RuntimeResult<()>
    where
        F: FnOnce(&mut EngineScope) + Send + 'static,
    {
        let scheduler = self.scheduler.lock();
        match scheduler.as_ref() {
            Some(scheduler) => scheduler.schedule(task),
            None if self.is_stopped() => Err(RuntimeError::EngineStopped(self.id)),
            None => Err(RuntimeError::EngineNotStarted(self.id)),
        }
    }

    /// Queue a task and get a receiver for its result.
    ///
    /// A panic inside the task is reported as [`RuntimeError::TaskPanicked`].
    pub fn run<T, F>(&self, task: F) -> RuntimeResult<oneshot::Receiver<RuntimeResult<T>>>
    where
        T: Send + 'static,
        F: FnOnce(&mut EngineScope) -> RuntimeResult<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.schedule(move |scope| {
            let result = panic::catch_unwind(AssertUnwindSafe(|| task(scope))).unwrap_or_else(
                |payload| Err(RuntimeError::TaskPanicked(panic_message(payload.as_ref()))),
            );
            let _ = tx.send(result);
        })?;
        Ok(rx)
    }

    /// Run a task and await its result
    pub async fn call<T, F>(&self, task: F) -> RuntimeResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut EngineScope) -> RuntimeResult<T> + Send + 'static,
    {
        let rx = self.run(task)?;
        rx.await
            .map_err(|_| RuntimeError::EngineStopped(self.id))?
    }

    /// Run a task and block the current thread until it finishes.
    ///
    /// Must not be called from inside an async runtime.
    pub fn call_blocking<T, F>(&self, task: F) -> RuntimeResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut EngineScope) -> RuntimeResult<T> + Send + 'static,
    {
        self.run(task)?
            .blocking_recv()
            .map_err(|_| RuntimeError::EngineStopped(self.id))?
    }

    /// Ask the worker to exit after the tasks already queued.
    ///
    /// Does not wait for the worker. Stopping twice is a no-op.
    pub fn stop(&self) {
        let mut scheduler = self.scheduler.lock();
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(scheduler) = scheduler.take() {
            let _ = scheduler.sender.send(Envelope::Shutdown);
            tracing::debug!(engine = self.id, "engine stopping");
        }
    }
}

impl Drop for ScriptEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ScriptEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptEngine")
            .field("id", &self.id)
            .field("started", &self.is_started())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

fn worker_main(
    id: u64,
    setup: EngineSetup,
    scheduler: TaskScheduler,
    receiver: mpsc::Receiver<Envelope>,
    ready: mpsc::SyncSender<RuntimeResult<()>>,
) {
    // Capabilities may keep clones; the worker itself holds none past startup
    let built = panic::catch_unwind(AssertUnwindSafe(move || {
        EngineScope::new(id, &setup, &scheduler)
    }))
    .unwrap_or_else(|payload| Err(RuntimeError::EngineStart(panic_message(payload.as_ref()))));
    let mut scope = match built {
        Ok(scope) => {
            let _ = ready.send(Ok(()));
            scope
        }
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };

    loop {
        let envelope = match scope.event_loop.next_deadline() {
            Some(deadline) => {
                match receiver.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                    Ok(envelope) => Some(envelope),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match receiver.recv() {
                Ok(envelope) => Some(envelope),
                Err(_) => break,
            },
        };

        match envelope {
            Some(Envelope::Run(task)) => {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task(&mut scope))) {
                    tracing::error!(
                        engine = id,
                        "task panicked: {}",
                        panic_message(payload.as_ref())
                    );
                }
            }
            Some(Envelope::Shutdown) => break,
            None => {}
        }

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| scope.run_jobs())) {
            tracing::error!(engine = id, "job panicked: {}", panic_message(payload.as_ref()));
        }
    }

    tracing::debug!(engine = id, "engine worker exited");
}

/// The engine-thread view handed to every task
pub struct EngineScope {
    id: u64,
    context: Context,
    loader: Rc<ModuleLoader>,
    event_loop: Rc<EngineEventLoop>,
    base_path: String,
}

impl EngineScope {
    fn new(id: u64, setup: &EngineSetup, scheduler: &TaskScheduler) -> RuntimeResult<Self> {
        let event_loop = Rc::new(EngineEventLoop::new(id));
        let mut context = ContextBuilder::default()
            .job_executor(event_loop.clone())
            .build()
            .map_err(|e| RuntimeError::EngineStart(e.to_string()))?;
        context.runtime_limits_mut().set_recursion_limit(16384);

        let loader = Rc::new(ModuleLoader::new(setup.fs.clone(), id));
        let mut config = CapabilityConfig {
            context: &mut context,
            fs: &setup.fs,
            base_path: &setup.base_path,
            version: &setup.version,
            engine_id: id,
            loader: &loader,
            scheduler,
        };
        setup.capabilities.install(&mut config)?;

        Ok(Self {
            id,
            context,
            loader,
            event_loop,
            base_path: setup.base_path.clone(),
        })
    }

    pub fn engine_id(&self) -> u64 {
        self.id
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    pub fn loader(&self) -> &Rc<ModuleLoader> {
        &self.loader
    }

    /// Load a module through this engine's cache
    pub fn load_module(&mut self, specifier: &str, base_dir: &str) -> RuntimeResult<LoadedModule> {
        self.loader.load(specifier, base_dir, &mut self.context)
    }

    /// Evaluate a script in the global scope
    pub fn eval(&mut self, source: &str) -> RuntimeResult<JsValue> {
        let result = self.context.eval(Source::from_bytes(source.as_bytes()));
        result.map_err(|err| {
            RuntimeError::JsError(ThrownError::from_js(&err, &mut self.context).message)
        })
    }

    /// Run promise jobs, due timers and async jobs that are ready now
    pub fn run_jobs(&mut self) {
        self.event_loop.run_ready(&mut self.context);
    }

    /// Whether callbacks (including future timers) are still queued
    pub fn has_pending_work(&self) -> bool {
        self.event_loop.has_pending_work()
    }

    /// Keep running jobs until nothing is queued or `deadline` passes
    pub fn run_until_idle(&mut self, deadline: Instant) -> bool {
        loop {
            self.run_jobs();
            if !self.has_pending_work() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let wake = self
                .event_loop
                .next_deadline()
                .map_or(deadline, |next| next.min(deadline));
            thread::sleep(wake.saturating_duration_since(now));
        }
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }
}

impl Drop for EngineScope {
    fn drop(&mut self) {
        self.loader.clear();
    }
}
