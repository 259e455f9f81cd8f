//! Cooperative timer wheel driven by the execution thread.
//!
//! Tasks never run on another thread: they fire only from [`Clock::run_due`],
//! [`Clock::pump`] or [`Clock::run_until`], which the owner calls from its loop.

use crate::timer::{to_nanos, Nanos, SharedTimer};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

struct Entry {
    id: u64,
    due: Nanos,
    interval: Option<Duration>,
    task: Box<dyn FnMut()>,
}

pub struct Clock {
    timer: SharedTimer,
    entries: Vec<Entry>,
    next_id: u64,
}

impl Clock {
    pub fn new(timer: SharedTimer) -> Self {
        Self {
            timer,
            entries: Vec::new(),
            next_id: 0,
        }
    }

    pub fn timer(&self) -> &SharedTimer {
        &self.timer
    }

    pub fn now(&self) -> Nanos {
        self.timer.now()
    }

    /// Schedule `task` to run once at or after `deadline`.
    pub fn at(&mut self, deadline: Nanos, task: impl FnMut() + 'static) -> TimerHandle {
        self.push(deadline, None, Box::new(task))
    }

    pub fn after(&mut self, delay: Duration, task: impl FnMut() + 'static) -> TimerHandle {
        let due = self.now().saturating_add(to_nanos(delay));
        self.push(due, None, Box::new(task))
    }

    pub fn every(&mut self, interval: Duration, task: impl FnMut() + 'static) -> TimerHandle {
        let due = self.now().saturating_add(to_nanos(interval));
        self.push(due, Some(interval), Box::new(task))
    }

    /// Returns false if the task already fired (one-shot) or was never scheduled.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != handle.0);
        before != self.entries.len()
    }

    pub fn is_scheduled(&self, handle: TimerHandle) -> bool {
        self.entries.iter().any(|e| e.id == handle.0)
    }

    pub fn pending(&self) -> usize {
        self.entries.len()
    }

    pub fn next_due(&self) -> Option<Nanos> {
        self.entries.iter().map(|e| e.due).min()
    }

    /// Fire every task whose deadline has passed, earliest first.
    pub fn run_due(&mut self) -> usize {
        let mut fired = 0;
        loop {
            let now = self.now();
            let Some(idx) = self
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.due <= now)
                .min_by_key(|(_, e)| (e.due, e.id))
                .map(|(i, _)| i)
            else {
                break;
            };

            let mut entry = self.entries.swap_remove(idx);
            (entry.task)();
            fired += 1;

            if let Some(interval) = entry.interval {
                let step = to_nanos(interval).max(1);
                while entry.due <= now {
                    entry.due = entry.due.saturating_add(step);
                }
                self.entries.push(entry);
            }
        }
        fired
    }

    /// Run due tasks, then sleep until the next deadline or `max_wait`, whichever is first.
    pub fn pump(&mut self, max_wait: Duration) -> usize {
        let fired = self.run_due();
        let now = self.now();
        let mut wait = to_nanos(max_wait);
        if let Some(due) = self.next_due() {
            wait = wait.min(due.saturating_sub(now));
        }
        if wait > 0 {
            self.timer.sleep(Duration::from_nanos(wait));
        }
        fired
    }

    /// Drive the wheel until `deadline`, never sleeping longer than `tick` at once.
    pub fn run_until(&mut self, deadline: Nanos, tick: Duration) {
        loop {
            self.run_due();
            let now = self.now();
            if now >= deadline {
                break;
            }
            let remaining = Duration::from_nanos(deadline - now);
            self.pump(tick.min(remaining));
        }
    }

    fn push(&mut self, due: Nanos, interval: Option<Duration>, task: Box<dyn FnMut()>) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(Entry {
            id,
            due,
            interval,
            task,
        });
        TimerHandle(id)
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clock")
            .field("now", &self.now())
            .field("pending", &self.entries.len())
            .finish()
    }
}
