use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::info;

use crate::config::DEFAULT_BACKOFF_STEP;
use crate::util::lock_unpoisoned;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffSnapshot {
    pub allowed: bool,
    pub cooldown: Duration,
    pub timer_active: bool,
    pub remaining: Duration,
    pub trips: u64,
}

#[derive(Debug)]
struct BackoffState {
    cooldown: Duration,
    resume_at: Option<Instant>,
    trips: u64,
}

impl BackoffState {
    // Clears an elapsed cooldown; returns true while one is still running.
    fn refresh(&mut self, now: Instant) -> bool {
        match self.resume_at {
            Some(resume_at) if now < resume_at => true,
            Some(_) => {
                self.resume_at = None;
                info!(
                    cooldown_ms = self.cooldown.as_millis() as u64,
                    "resuming requests"
                );
                false
            }
            None => false,
        }
    }
}

/// Dispatch gate shared by every worker. The cooldown grows by `step` per trip and never resets.
#[derive(Debug)]
pub struct BackoffController {
    step: Duration,
    state: Mutex<BackoffState>,
}

impl Default for BackoffController {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_STEP)
    }
}

impl BackoffController {
    pub fn new(step: Duration) -> Self {
        Self {
            step: step.max(Duration::from_millis(1)),
            state: Mutex::new(BackoffState {
                cooldown: Duration::ZERO,
                resume_at: None,
                trips: 0,
            }),
        }
    }

    pub fn step(&self) -> Duration {
        self.step
    }

    /// Starts a cooldown unless one is running. Returns whether a new one started.
    pub fn trigger(&self) -> bool {
        let mut state = lock_unpoisoned(&self.state);
        let now = Instant::now();
        if state.refresh(now) {
            return false;
        }
        state.cooldown = state.cooldown.saturating_add(self.step);
        state.resume_at = Some(now + state.cooldown);
        state.trips = state.trips.saturating_add(1);
        info!(
            cooldown_ms = state.cooldown.as_millis() as u64,
            trips = state.trips,
            "backing off new requests"
        );
        true
    }

    pub fn is_allowed(&self) -> bool {
        let mut state = lock_unpoisoned(&self.state);
        !state.refresh(Instant::now())
    }

    /// Last cooldown length; the next trip adds one more `step` to it.
    pub fn cooldown(&self) -> Duration {
        lock_unpoisoned(&self.state).cooldown
    }

    pub fn trips(&self) -> u64 {
        lock_unpoisoned(&self.state).trips
    }

    pub fn snapshot(&self) -> BackoffSnapshot {
        let mut state = lock_unpoisoned(&self.state);
        let now = Instant::now();
        let timer_active = state.refresh(now);
        let remaining = state
            .resume_at
            .map(|resume_at| resume_at.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO);
        BackoffSnapshot {
            allowed: !timer_active,
            cooldown: state.cooldown,
            timer_active,
            remaining,
            trips: state.trips,
        }
    }
}
