// Copyright (c) 2025, The Feclink Project Authors.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright
//       notice, this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above
//       copyright notice, this list of conditions and the following disclaimer
//       in the documentation and/or other materials provided with the
//       distribution.
//
//     * Neither the name of the copyright holder nor the names of its
//       contributors may be used to endorse or promote products derived from
//       this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT
// LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR
// A PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT
// OWNER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT
// LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE,
// DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY
// THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT
// (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
// OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! # Pipeline Orchestration
//!
//! Both daemons run the same skeleton: a handful of named worker threads,
//! one per stage, connected by coalescing wake-up signals and sharing the
//! matrix pool. A stage that is awake and scanning absorbs any number of
//! further raises; a stage that found nothing goes back to waiting with a
//! poll timeout so the exit flag is always honored within one interval.
//!
//! Raises happen only after the raiser has dropped the matrix lock the new
//! work lives behind, so a woken stage always observes the transition.

pub mod receiver;
pub mod sender;

use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

/// Poll timeout for blocking stage waits and transport receives.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Cadence of the per-daemon watchdog scan thread.
pub(crate) const WATCHDOG_TICK: Duration = Duration::from_millis(25);

/// Raising half of a stage wake-up. Clones share the same channel, so fill
/// worker and watchdog can both wake the codec stage.
#[derive(Clone)]
pub(crate) struct StageNotifier {
    tx: Sender<()>,
}

/// Waiting half of a stage wake-up, owned by exactly one worker.
pub(crate) struct StageWaiter {
    rx: Receiver<()>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    /// At least one raise since the last wait.
    Raised,
    /// Poll interval elapsed; check the exit flag and wait again.
    Idle,
    /// Every raiser is gone.
    Closed,
}

pub(crate) fn stage_signal() -> (StageNotifier, StageWaiter) {
    let (tx, rx) = bounded(1);
    (StageNotifier { tx }, StageWaiter { rx })
}

impl StageNotifier {
    /// Wakes the stage. A raise onto an already-pending signal coalesces;
    /// a raise after the stage exited is dropped.
    pub fn raise(&self) {
        match self.tx.try_send(()) {
            Ok(()) => {}
            Err(TrySendError::Full(())) | Err(TrySendError::Disconnected(())) => {}
        }
    }
}

impl StageWaiter {
    pub fn wait(&self, timeout: Duration) -> WaitOutcome {
        match self.rx.recv_timeout(timeout) {
            Ok(()) => WaitOutcome::Raised,
            Err(RecvTimeoutError::Timeout) => WaitOutcome::Idle,
            Err(RecvTimeoutError::Disconnected) => WaitOutcome::Closed,
        }
    }
}

/// Spawns a named worker thread. Thread creation failure is a startup-time
/// resource problem, treated like any other startup allocation failure.
pub(crate) fn spawn_worker<F>(name: &str, f: F) -> thread::JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .unwrap_or_else(|e| panic!("failed to spawn {name} worker: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raises_coalesce_into_one_wakeup() {
        let (notifier, waiter) = stage_signal();
        notifier.raise();
        notifier.raise();
        notifier.raise();
        assert_eq!(waiter.wait(POLL_INTERVAL), WaitOutcome::Raised);
        assert_eq!(waiter.wait(Duration::from_millis(5)), WaitOutcome::Idle);
    }

    #[test]
    fn wait_reports_closure_when_all_raisers_drop() {
        let (notifier, waiter) = stage_signal();
        let clone = notifier.clone();
        drop(notifier);
        drop(clone);
        assert_eq!(waiter.wait(POLL_INTERVAL), WaitOutcome::Closed);
    }

    #[test]
    fn raise_after_waiter_exit_is_harmless() {
        let (notifier, waiter) = stage_signal();
        drop(waiter);
        notifier.raise();
    }
}
