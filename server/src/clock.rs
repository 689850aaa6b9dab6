//! Per-room countdown clock.
//!
//! A clock is a spawned ticker that enqueues messages onto the owning room's
//! inbox; expiry is therefore always handled as a queued message by the room
//! worker, never synchronously. A room holds at most one live clock: `start`
//! supersedes any running one, and generation numbers let the worker discard
//! ticks from a superseded clock that were already in flight. Timing uses
//! tokio's monotonic clock.

use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

/// Messages a clock enqueues onto its room's inbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockEvent {
    /// One-second countdown notification.
    Tick { generation: u64, remaining: u32 },
    /// The countdown reached zero.
    Expired { generation: u64 },
}

/// Countdown driver owned by a room worker.
pub struct TurnClock<M: From<ClockEvent> + Send + 'static> {
    inbox: UnboundedSender<M>,
    generation: u64,
    task: Option<JoinHandle<()>>,
    total: u32,
}

impl<M: From<ClockEvent> + Send + 'static> TurnClock<M> {
    pub fn new(inbox: UnboundedSender<M>) -> Self {
        Self {
            inbox,
            generation: 0,
            task: None,
            total: 0,
        }
    }

    /// Starts a countdown of `seconds`, cancelling any live clock, and
    /// returns the new generation.
    pub fn start(&mut self, seconds: u32) -> u64 {
        self.cancel();
        self.generation += 1;
        self.total = seconds;
        let generation = self.generation;
        let inbox = self.inbox.clone();
        self.task = Some(tokio::spawn(async move {
            let mut remaining = seconds;
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                remaining = remaining.saturating_sub(1);
                if remaining == 0 {
                    let _ = inbox.send(M::from(ClockEvent::Expired { generation }));
                    break;
                }
                let _ = inbox.send(M::from(ClockEvent::Tick {
                    generation,
                    remaining,
                }));
            }
        }));
        generation
    }

    /// Restarts the countdown with a fresh duration.
    pub fn reset(&mut self, seconds: u32) -> u64 {
        self.start(seconds)
    }

    /// Stops the clock. Idempotent; in-flight events from the cancelled
    /// generation are rejected by `is_current`.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// True if `generation` belongs to the clock that is currently live.
    pub fn is_current(&self, generation: u64) -> bool {
        self.task.is_some() && generation == self.generation
    }

    /// Total seconds of the most recently started countdown.
    pub fn total_seconds(&self) -> u32 {
        self.total
    }
}

impl<M: From<ClockEvent> + Send + 'static> Drop for TurnClock<M> {
    fn drop(&mut self) {
        self.cancel();
    }
}
