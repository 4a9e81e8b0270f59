//! Mutual exclusion between the camera's operating modes

use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{Error, Result};

/// What the camera is currently doing. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    #[default]
    Idle,
    LiveView,
    ScheduledCapture,
}

impl std::fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            OperatingMode::Idle => "idle",
            OperatingMode::LiveView => "live view",
            OperatingMode::ScheduledCapture => "scheduled capture",
        })
    }
}

/// Linearizes mode transitions. Entering a busy mode fails rather than
/// queueing or overriding.
#[derive(Debug, Default)]
pub struct ModeGuard {
    mode: Mutex<OperatingMode>,
}

impl ModeGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, OperatingMode> {
        // The guarded value is a plain enum, always consistent.
        self.mode.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn current(&self) -> OperatingMode {
        *self.lock()
    }

    /// Switch from Idle to `mode`. Entering the mode that is already active
    /// is a conflict too, so callers can tell "started" from "was running".
    pub fn enter(&self, mode: OperatingMode) -> Result<()> {
        let mut current = self.lock();
        if *current != OperatingMode::Idle {
            return Err(Error::ModeConflict {
                requested: mode,
                active: *current,
            });
        }
        *current = mode;
        debug!(%mode, "Entered mode");
        Ok(())
    }

    /// Return to Idle if `mode` is the active one. Returns whether it was.
    pub fn leave(&self, mode: OperatingMode) -> bool {
        let mut current = self.lock();
        if *current != mode {
            warn!(%mode, active = %*current, "Leaving a mode that is not active");
            return false;
        }
        *current = OperatingMode::Idle;
        debug!(%mode, "Left mode");
        true
    }

    /// Fail unless nothing else is using the camera.
    pub fn ensure_idle(&self, requested: OperatingMode) -> Result<()> {
        let current = *self.lock();
        if current != OperatingMode::Idle {
            return Err(Error::ModeConflict {
                requested,
                active: current,
            });
        }
        Ok(())
    }

    /// Enter `mode` for the lifetime of the returned lease. The mode is left
    /// again when the lease drops unless [`ModeLease::keep`] is called.
    pub fn acquire(&self, mode: OperatingMode) -> Result<ModeLease<'_>> {
        self.enter(mode)?;
        Ok(ModeLease {
            guard: self,
            mode,
            kept: false,
        })
    }
}

/// Scoped hold on an operating mode.
#[must_use = "dropping the lease leaves the mode immediately"]
pub struct ModeLease<'a> {
    guard: &'a ModeGuard,
    mode: OperatingMode,
    kept: bool,
}

impl ModeLease<'_> {
    pub fn mode(&self) -> OperatingMode {
        self.mode
    }

    /// Keep the mode entered after the lease is gone; a later `leave` is
    /// then the caller's job.
    pub fn keep(mut self) {
        self.kept = true;
    }
}

impl Drop for ModeLease<'_> {
    fn drop(&mut self) {
        if !self.kept {
            self.guard.leave(self.mode);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn live_view_blocks_schedule_until_left() {
        let guard = ModeGuard::new();
        guard.enter(OperatingMode::LiveView).unwrap();

        let err = guard.enter(OperatingMode::ScheduledCapture).unwrap_err();
        assert!(matches!(
            err,
            Error::ModeConflict {
                requested: OperatingMode::ScheduledCapture,
                active: OperatingMode::LiveView
            }
        ));

        assert!(guard.leave(OperatingMode::LiveView));
        guard.enter(OperatingMode::ScheduledCapture).unwrap();
        assert_eq!(guard.current(), OperatingMode::ScheduledCapture);
    }

    #[test]
    fn reentering_active_mode_is_a_conflict() {
        let guard = ModeGuard::new();
        guard.enter(OperatingMode::LiveView).unwrap();
        assert!(matches!(
            guard.enter(OperatingMode::LiveView),
            Err(Error::ModeConflict {
                active: OperatingMode::LiveView,
                ..
            })
        ));
        assert!(matches!(
            guard.ensure_idle(OperatingMode::Idle),
            Err(Error::ModeConflict { .. })
        ));
    }

    #[test]
    fn leaving_inactive_mode_changes_nothing() {
        let guard = ModeGuard::new();
        guard.enter(OperatingMode::ScheduledCapture).unwrap();
        assert!(!guard.leave(OperatingMode::LiveView));
        assert_eq!(guard.current(), OperatingMode::ScheduledCapture);
    }

    #[test]
    fn lease_releases_unless_kept() {
        let guard = ModeGuard::new();
        {
            let lease = guard.acquire(OperatingMode::LiveView).unwrap();
            assert_eq!(lease.mode(), OperatingMode::LiveView);
        }
        assert_eq!(guard.current(), OperatingMode::Idle);

        guard.acquire(OperatingMode::LiveView).unwrap().keep();
        assert_eq!(guard.current(), OperatingMode::LiveView);
    }

    #[test]
    fn concurrent_enters_admit_one_winner() {
        let guard = Arc::new(ModeGuard::new());
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let guard = Arc::clone(&guard);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let mode = if i % 2 == 0 {
                        OperatingMode::LiveView
                    } else {
                        OperatingMode::ScheduledCapture
                    };
                    barrier.wait();
                    guard.enter(mode).is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
