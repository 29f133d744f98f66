//! Background compaction thread.
//!
//! One std thread per shard waits on a channel for [`Trigger`]s and wakes up
//! on its own every `interval`. Each wake-up hands control to the shard's
//! cycle function; the worker itself knows nothing about files or caches.

use crate::error::Result;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Why the worker woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    /// The cache crossed its snapshot threshold.
    Snapshot,
    /// Look for compaction work (also sent by the interval timer).
    Compact,
    /// Exit the loop.
    Shutdown,
}

/// Cloneable sending side used by writers to wake the worker.
#[derive(Debug, Clone)]
pub struct TriggerHandle {
    sender: Sender<Trigger>,
}

impl TriggerHandle {
    /// Creates a handle and the receiver the worker will consume.
    pub fn channel() -> (Self, Receiver<Trigger>) {
        let (sender, receiver) = mpsc::channel();
        (Self { sender }, receiver)
    }

    /// Sends a trigger. A stopped worker is not an error.
    pub fn notify(&self, trigger: Trigger) {
        if self.sender.send(trigger).is_err() {
            debug!(?trigger, "Compaction worker is gone, trigger dropped");
        }
    }
}

/// A running background worker. Stopped and joined on drop.
#[derive(Debug)]
pub struct CompactionWorker {
    trigger: TriggerHandle,
    handle: Option<JoinHandle<()>>,
}

impl CompactionWorker {
    /// Spawns the worker thread.
    ///
    /// `cycle` runs on the worker thread for every wake-up other than
    /// shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn<F>(
        name: impl Into<String>,
        interval: Duration,
        trigger: TriggerHandle,
        receiver: Receiver<Trigger>,
        cycle: F,
    ) -> Result<Self>
    where
        F: Fn(Trigger) + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || worker_loop(&receiver, interval, cycle))?;
        Ok(Self {
            trigger,
            handle: Some(handle),
        })
    }

    /// Asks the worker for a cycle.
    pub fn notify(&self, trigger: Trigger) {
        self.trigger.notify(trigger);
    }

    /// Stops the thread and waits for the current cycle to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.trigger.notify(Trigger::Shutdown);
        if handle.join().is_err() {
            warn!("Compaction worker panicked");
        }
    }
}

impl Drop for CompactionWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<F>(receiver: &Receiver<Trigger>, interval: Duration, cycle: F)
where
    F: Fn(Trigger),
{
    debug!(?interval, "Compaction worker started");
    loop {
        let trigger = match receiver.recv_timeout(interval) {
            Ok(trigger) => trigger,
            Err(RecvTimeoutError::Timeout) => Trigger::Compact,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if trigger == Trigger::Shutdown {
            break;
        }

        // Coalesce a burst of triggers into one cycle.
        let mut snapshot = trigger == Trigger::Snapshot;
        let mut shutdown = false;
        while let Ok(next) = receiver.try_recv() {
            match next {
                Trigger::Shutdown => shutdown = true,
                Trigger::Snapshot => snapshot = true,
                Trigger::Compact => {}
            }
        }

        cycle(if snapshot {
            Trigger::Snapshot
        } else {
            Trigger::Compact
        });
        if shutdown {
            break;
        }
    }
    debug!("Compaction worker stopped");
}
