//! Per-engine event loop
//!
//! Installed as the Boa job executor of an engine's context. Work is split into:
//! - promise jobs (microtasks), always drained first
//! - timers from setTimeout/setInterval, kept in a min-heap by deadline
//! - generic jobs
//! - native async jobs such as `fetch`
//!
//! The loop never sleeps. The engine worker asks for [`EngineEventLoop::next_deadline`]
//! and waits on its task queue until then, so scheduled tasks are not starved
//! by pending timers.

use boa_engine::{
    Context, JsResult,
    job::{GenericJob, Job, JobExecutor, NativeAsyncJob, PromiseJob, TimeoutJob},
};
use std::{
    cell::{Cell, RefCell},
    cmp::Ordering,
    collections::{BinaryHeap, VecDeque},
    rc::Rc,
    time::{Duration, Instant},
};

/// A timer entry in the priority queue
struct TimerEntry {
    deadline: Instant,
    job: TimeoutJob,
    /// Insertion order, breaks ties between equal deadlines
    id: u64,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (earliest deadline first)
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

pub(crate) struct EngineEventLoop {
    engine_id: u64,
    microtasks: RefCell<VecDeque<PromiseJob>>,
    timers: RefCell<BinaryHeap<TimerEntry>>,
    async_jobs: RefCell<VecDeque<NativeAsyncJob>>,
    generic_jobs: RefCell<VecDeque<GenericJob>>,
    timer_counter: Cell<u64>,
}

impl EngineEventLoop {
    pub(crate) fn new(engine_id: u64) -> Self {
        Self {
            engine_id,
            microtasks: RefCell::new(VecDeque::with_capacity(64)),
            timers: RefCell::new(BinaryHeap::with_capacity(32)),
            async_jobs: RefCell::new(VecDeque::with_capacity(16)),
            generic_jobs: RefCell::new(VecDeque::with_capacity(16)),
            timer_counter: Cell::new(0),
        }
    }

    /// Whether any job, including a future timer, is queued
    pub(crate) fn has_pending_work(&self) -> bool {
        !self.microtasks.borrow().is_empty()
            || !self.timers.borrow().is_empty()
            || !self.async_jobs.borrow().is_empty()
            || !self.generic_jobs.borrow().is_empty()
    }

    /// Deadline of the earliest pending timer
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.timers.borrow().peek().map(|entry| entry.deadline)
    }

    /// Run everything that is ready now, without waiting for future timers.
    ///
    /// Job failures are uncaught script errors; they are logged and the loop
    /// moves on to the next job.
    pub(crate) fn run_ready(&self, context: &mut Context) {
        loop {
            self.drain_microtasks(context);
            let mut progressed = self.fire_due_timers(context);
            progressed |= self.run_generic_jobs(context);
            progressed |= self.run_async_jobs(context);

            if !progressed && self.microtasks.borrow().is_empty() {
                break;
            }
        }
    }

    fn drain_microtasks(&self, context: &mut Context) {
        loop {
            let next = self.microtasks.borrow_mut().pop_front();
            let Some(job) = next else { break };
            if let Err(err) = job.call(context) {
                tracing::error!(engine = self.engine_id, "uncaught error in promise job: {err}");
            }
        }
    }

    fn fire_due_timers(&self, context: &mut Context) -> bool {
        let now = Instant::now();
        let mut fired = false;

        loop {
            let entry = {
                let mut timers = self.timers.borrow_mut();
                match timers.peek() {
                    Some(entry) if entry.deadline <= now => timers.pop(),
                    _ => None,
                }
            };
            let Some(entry) = entry else { break };

            if entry.job.is_cancelled() {
                continue;
            }
            if let Err(err) = entry.job.call(context) {
                tracing::error!(engine = self.engine_id, "uncaught error in timer callback: {err}");
            }
            fired = true;
            self.drain_microtasks(context);
        }

        fired
    }

    fn run_generic_jobs(&self, context: &mut Context) -> bool {
        let mut ran = false;
        loop {
            let next = self.generic_jobs.borrow_mut().pop_front();
            let Some(job) = next else { break };
            if let Err(err) = job.call(context) {
                tracing::error!(engine = self.engine_id, "uncaught error in generic job: {err}");
            }
            ran = true;
            self.drain_microtasks(context);
        }
        ran
    }

    fn run_async_jobs(&self, context: &mut Context) -> bool {
        let mut ran = false;
        loop {
            let next = self.async_jobs.borrow_mut().pop_front();
            let Some(job) = next else { break };
            let outcome = {
                let cell = RefCell::new(&mut *context);
                futures_lite::future::block_on(job.call(&cell))
            };
            if let Err(err) = outcome {
                tracing::error!(engine = self.engine_id, "uncaught error in async job: {err}");
            }
            ran = true;
            self.drain_microtasks(context);
        }
        ran
    }
}

impl JobExecutor for EngineEventLoop {
    fn enqueue_job(self: Rc<Self>, job: Job, _context: &mut Context) {
        match job {
            Job::PromiseJob(promise_job) => {
                self.microtasks.borrow_mut().push_back(promise_job);
            }
            Job::TimeoutJob(timeout_job) => {
                let timeout_ms = timeout_job.timeout().as_millis() as u64;
                let deadline = Instant::now() + Duration::from_millis(timeout_ms);
                let id = self.timer_counter.get() + 1;
                self.timer_counter.set(id);
                self.timers.borrow_mut().push(TimerEntry {
                    deadline,
                    job: timeout_job,
                    id,
                });
            }
            Job::AsyncJob(async_job) => {
                self.async_jobs.borrow_mut().push_back(async_job);
            }
            Job::GenericJob(generic_job) => {
                self.generic_jobs.borrow_mut().push_back(generic_job);
            }
            _ => {
                tracing::warn!(engine = self.engine_id, "dropping unsupported job kind");
            }
        }
    }

    fn run_jobs(self: Rc<Self>, context: &mut Context) -> JsResult<()> {
        self.run_ready(context);
        Ok(())
    }
}
