//! Background STAGE 1 loading with time-borrowing.
//!
//! One worker thread loads the *next* phase while the current one is on
//! screen. At most one task is tracked at a time: submitting a new one cancels
//! a task that has not started, or waits (bounded) for one that has.

use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::phase::Phase;
use crate::resources::Resources;
use crossbeam_channel::{Receiver, Sender, unbounded};
use dyadsync_timing::{Nanos, SharedTimer};
use log::{debug, error, info, warn};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How often the worker re-reads the timer while holding a task for its start time.
const START_POLL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq)]
enum TaskState {
    Pending,
    Running,
    Cancelled,
    Done(std::result::Result<Duration, String>),
}

impl TaskState {
    fn in_flight(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

struct Task {
    id: u64,
    phase: Arc<Phase>,
    state: TaskState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreloadStats {
    pub submitted: usize,
    pub cancelled: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Default)]
struct Tracker {
    current: Option<Task>,
    /// Start the current task now instead of at its `not_before`.
    hurry: bool,
    next_id: u64,
    stats: PreloadStats,
}

struct Shared {
    tracker: Mutex<Tracker>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Tracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait until the current task leaves `Running`/`Pending` or `timeout` passes.
    /// Returns the guard and whether the task settled.
    fn wait_settled<'a>(
        &self,
        mut tracker: MutexGuard<'a, Tracker>,
        timeout: Duration,
        include_pending: bool,
    ) -> (MutexGuard<'a, Tracker>, bool) {
        let deadline = Instant::now() + timeout;
        loop {
            let busy = tracker.current.as_ref().is_some_and(|t| match t.state {
                TaskState::Running => true,
                TaskState::Pending => include_pending,
                _ => false,
            });
            if !busy {
                return (tracker, true);
            }
            let now = Instant::now();
            if now >= deadline {
                return (tracker, false);
            }
            tracker = self
                .changed
                .wait_timeout(tracker, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

struct Job {
    id: u64,
    phase: Arc<Phase>,
    not_before: Option<Nanos>,
}

pub struct ContinuousPreloader {
    shared: Arc<Shared>,
    sender: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    cancel_wait: Duration,
    shutdown_wait: Duration,
    slow_warn: Duration,
}

impl ContinuousPreloader {
    pub fn new(resources: Resources, timer: SharedTimer, config: &RuntimeConfig) -> Result<Self> {
        let shared = Arc::new(Shared {
            tracker: Mutex::new(Tracker::default()),
            changed: Condvar::new(),
        });
        let (sender, receiver) = unbounded();
        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("dyadsync-preload".into())
            .spawn(move || worker_loop(receiver, worker_shared, resources, timer))?;
        debug!("preload worker started");

        Ok(Self {
            shared,
            sender: Some(sender),
            worker: Some(worker),
            cancel_wait: config.cancel_wait(),
            shutdown_wait: config.shutdown_wait(),
            slow_warn: Duration::from_millis(config.slow_preload_warn_ms),
        })
    }

    /// Queue STAGE 1 for `phase`, to start no earlier than `not_before`.
    ///
    /// Returns false when the phase has nothing to preload or the worker is gone.
    pub fn preload_next(&self, phase: &Arc<Phase>, not_before: Option<Nanos>) -> bool {
        if !phase.needs_preload() {
            return false;
        }
        let Some(sender) = &self.sender else {
            warn!("preloader already shut down, not loading {}", phase.name);
            return false;
        };

        let mut tracker = self.shared.lock();
        let mut superseded = None;
        let previous = tracker
            .current
            .as_ref()
            .map(|t| (t.state.clone(), t.phase.clone()));
        match previous {
            Some((TaskState::Pending, old)) => {
                if let Some(task) = tracker.current.as_mut() {
                    task.state = TaskState::Cancelled;
                }
                tracker.stats.cancelled += 1;
                debug!("cancelled pending preload of {}", old.name);
            }
            Some((TaskState::Running, old)) => {
                info!("preload of {} still running, waiting", old.name);
                let (guard, settled) = self.shared.wait_settled(tracker, self.cancel_wait, false);
                tracker = guard;
                if settled {
                    superseded = Some(old);
                } else {
                    warn!(
                        "previous preload did not finish within {} ms, submitting anyway",
                        self.cancel_wait.as_millis()
                    );
                }
            }
            _ => {}
        }

        let id = tracker.next_id;
        tracker.next_id += 1;
        tracker.current = Some(Task {
            id,
            phase: phase.clone(),
            state: TaskState::Pending,
        });
        tracker.hurry = false;
        tracker.stats.submitted += 1;
        drop(tracker);
        self.shared.changed.notify_all();

        // A superseded load must not keep its channels alongside the new one,
        // unless the execution thread has already armed it to run.
        if let Some(old) = superseded.filter(|old| !Arc::ptr_eq(old, phase)) {
            if old.is_armed() {
                debug!("{} is armed for execution, keeping its channels", old.name);
            } else {
                old.reset();
                debug!("released superseded preload of {}", old.name);
            }
        }

        let job = Job {
            id,
            phase: phase.clone(),
            not_before,
        };
        if sender.send(job).is_err() {
            error!("preload worker is gone, {} will load synchronously", phase.name);
            return false;
        }
        info!("STAGE 1 for {} queued", phase.name);
        true
    }

    /// Block until the tracked task finishes or `timeout` passes.
    ///
    /// Returns true when there is nothing left to wait for and the load succeeded.
    pub fn wait_for_preload(&self, timeout: Duration) -> bool {
        let started = Instant::now();
        let mut tracker = self.shared.lock();
        if !tracker.current.as_ref().is_some_and(|t| t.state.in_flight()) {
            return Self::outcome(&tracker);
        }
        tracker.hurry = true;
        self.shared.changed.notify_all();

        let (mut tracker, settled) = self.shared.wait_settled(tracker, timeout, true);
        tracker.hurry = false;
        let waited = started.elapsed();
        if !settled {
            error!(
                "preload wait timed out after {} ms",
                waited.as_millis()
            );
            return false;
        }
        if waited > self.slow_warn {
            warn!(
                "waited {:.1} ms for a preload; time-borrowing did not cover the load",
                waited.as_secs_f64() * 1000.0
            );
        }
        Self::outcome(&tracker)
    }

    fn outcome(tracker: &Tracker) -> bool {
        match tracker.current.as_ref().map(|t| (&t.state, &t.phase.name)) {
            Some((TaskState::Done(Err(e)), name)) => {
                error!("preload of {name} failed: {e}");
                false
            }
            _ => true,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.shared
            .lock()
            .current
            .as_ref()
            .is_some_and(|t| t.state.in_flight())
    }

    pub fn stats(&self) -> PreloadStats {
        self.shared.lock().stats
    }

    /// Stop the worker after the current task, waiting at most `shutdown_wait`. Idempotent.
    pub fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let tracker = self.shared.lock();
        let (mut tracker, settled) = self.shared.wait_settled(tracker, self.shutdown_wait, false);
        if let Some(task) = tracker.current.as_mut().filter(|t| t.state == TaskState::Pending) {
            task.state = TaskState::Cancelled;
            tracker.stats.cancelled += 1;
        }
        drop(tracker);
        self.shared.changed.notify_all();
        self.sender.take();

        if settled {
            if worker.join().is_err() {
                error!("preload worker panicked");
            }
            debug!("preload worker stopped");
        } else {
            warn!(
                "preload still running after {} ms, detaching worker",
                self.shutdown_wait.as_millis()
            );
        }
    }
}

impl Drop for ContinuousPreloader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ContinuousPreloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContinuousPreloader")
            .field("running", &self.worker.is_some())
            .field("stats", &self.stats())
            .finish()
    }
}

fn worker_loop(jobs: Receiver<Job>, shared: Arc<Shared>, resources: Resources, timer: SharedTimer) {
    while let Ok(job) = jobs.recv() {
        if !claim(&shared, &job, &timer) {
            continue;
        }

        let result = job.phase.prepare(&resources).map_err(|e| e.to_string());

        let mut tracker = shared.lock();
        match &result {
            Ok(_) => tracker.stats.completed += 1,
            Err(e) => {
                tracker.stats.failed += 1;
                error!("STAGE 1 for {} failed: {e}", job.phase.name);
            }
        }
        match tracker.current.as_mut() {
            Some(task) if task.id == job.id => task.state = TaskState::Done(result),
            _ => warn!("preload of {} finished after being superseded", job.phase.name),
        }
        drop(tracker);
        shared.changed.notify_all();
    }
}

/// Hold the job until its start time, then mark it running. False if it was cancelled meanwhile.
fn claim(shared: &Shared, job: &Job, timer: &SharedTimer) -> bool {
    let mut tracker = shared.lock();
    loop {
        let hurry = tracker.hurry;
        let Some(task) = tracker.current.as_mut().filter(|t| t.id == job.id) else {
            return false;
        };
        if task.state != TaskState::Pending {
            return false;
        }
        if hurry || job.not_before.is_none_or(|at| timer.now() >= at) {
            task.state = TaskState::Running;
            return true;
        }
        tracker = shared
            .changed
            .wait_timeout(tracker, START_POLL)
            .unwrap_or_else(PoisonError::into_inner)
            .0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimProvider;
    use dyadsync_timing::{SimulatedTimer, SyncEngine};

    fn preloader(timer: &SimulatedTimer, provider: SimProvider) -> ContinuousPreloader {
        let resources = Resources::new(Arc::new(provider), [0, 1]);
        ContinuousPreloader::new(resources, timer.shared(), &RuntimeConfig::default()).unwrap()
    }

    #[test]
    fn phases_without_preload_are_ignored() {
        let timer = SimulatedTimer::new();
        let p = preloader(&timer, SimProvider::new(timer.shared()));
        assert!(!p.preload_next(&Arc::new(Phase::fixation(1.0)), None));
        assert_eq!(p.stats().submitted, 0);
        assert!(p.wait_for_preload(Duration::from_millis(10)));
    }

    #[test]
    fn deferred_task_waits_for_its_start_time_unless_hurried() {
        let timer = SimulatedTimer::new();
        let p = preloader(&timer, SimProvider::new(timer.shared()));
        let video = Arc::new(Phase::video("a.mp4", "b.mp4"));

        assert!(p.preload_next(&video, Some(200_000_000)));
        thread::sleep(Duration::from_millis(20));
        assert!(!video.is_loaded());

        assert!(p.wait_for_preload(Duration::from_secs(2)));
        assert!(video.is_loaded());
        assert_eq!(p.stats().completed, 1);
    }

    #[test]
    fn second_submission_cancels_a_pending_first() {
        let timer = SimulatedTimer::new();
        let p = preloader(&timer, SimProvider::new(timer.shared()));
        let first = Arc::new(Phase::video("a.mp4", "b.mp4"));
        let second = Arc::new(Phase::video("c.mp4", "d.mp4"));

        p.preload_next(&first, Some(u64::MAX));
        p.preload_next(&second, None);
        assert!(p.wait_for_preload(Duration::from_secs(2)));

        assert!(!first.is_loaded());
        assert!(second.is_loaded());
        let stats = p.stats();
        assert_eq!((stats.cancelled, stats.completed), (1, 1));
    }

    #[test]
    fn running_first_is_awaited_then_released() {
        let timer = SimulatedTimer::new();
        let provider = SimProvider::new(timer.shared()).with_load_delay(Duration::from_millis(50));
        let p = preloader(&timer, provider);
        let first = Arc::new(Phase::video("a.mp4", "b.mp4"));
        let second = Arc::new(Phase::video("c.mp4", "d.mp4"));

        p.preload_next(&first, None);
        while !p.shared.lock().current.as_ref().is_some_and(|t| t.state != TaskState::Pending) {
            thread::sleep(Duration::from_millis(1));
        }
        p.preload_next(&second, None);
        assert!(p.wait_for_preload(Duration::from_secs(2)));

        assert!(!first.is_loaded(), "superseded load must be released");
        assert!(second.is_loaded());
        assert_eq!(p.stats().completed, 2);
    }

    #[test]
    fn armed_phase_survives_being_superseded() {
        let timer = SimulatedTimer::new();
        let provider = SimProvider::new(timer.shared()).with_load_delay(Duration::from_millis(50));
        let resources = Resources::new(Arc::new(provider), [0, 1]);
        let p = ContinuousPreloader::new(resources.clone(), timer.shared(), &RuntimeConfig::default())
            .unwrap();
        let current = Arc::new(Phase::video("a.mp4", "b.mp4"));
        let next = Arc::new(Phase::video("c.mp4", "d.mp4"));

        p.preload_next(&current, None);
        while !p.shared.lock().current.as_ref().is_some_and(|t| t.state != TaskState::Pending) {
            thread::sleep(Duration::from_millis(1));
        }
        // The execution thread joins the running load, then arms the phase it is about to run.
        current.prepare(&resources).unwrap();
        current
            .prepare_sync(&SyncEngine::new(timer.shared()), 150.0)
            .unwrap();

        p.preload_next(&next, None);
        assert!(p.wait_for_preload(Duration::from_secs(2)));
        assert!(current.is_armed(), "the phase about to run keeps its channels");
        assert!(next.is_loaded());
        assert_eq!(p.stats().completed, 2);
    }

    #[test]
    fn failed_load_is_reported() {
        let timer = SimulatedTimer::new();
        let p = preloader(&timer, SimProvider::new(timer.shared()).with_missing("gone.mp4"));
        let video = Arc::new(Phase::video("gone.mp4", "b.mp4"));
        p.preload_next(&video, None);
        assert!(!p.wait_for_preload(Duration::from_secs(2)));
        assert_eq!(p.stats().failed, 1);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let timer = SimulatedTimer::new();
        let mut p = preloader(&timer, SimProvider::new(timer.shared()));
        p.preload_next(&Arc::new(Phase::video("a.mp4", "b.mp4")), Some(u64::MAX));
        p.shutdown();
        p.shutdown();
        assert!(!p.preload_next(&Arc::new(Phase::video("a.mp4", "b.mp4")), None));
        assert_eq!(p.stats().cancelled, 1);
    }
}
