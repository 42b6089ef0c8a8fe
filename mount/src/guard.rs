//! RAII guard for in-flight motion
//!
//! A motion task owns a [`MotionGuard`] from the moment it is queued. If
//! the task fails, panics, or is discarded before it runs, dropping the
//! guard takes the mount out of its moving state without setting any
//! terminal flag. Nothing is written once an abort has moved the epoch
//! on.

use crate::state::{MotionKind, MountState, SharedState};
use tracing::warn;

/// What the guard releases when abandoned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardScope {
    Motion(MotionKind),
    PulseGuide,
}

impl std::fmt::Display for GuardScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuardScope::Motion(kind) => write!(f, "{}", kind),
            GuardScope::PulseGuide => write!(f, "pulse guiding"),
        }
    }
}

pub struct MotionGuard {
    state: SharedState,
    epoch: u64,
    scope: GuardScope,
    armed: bool,
}

impl MotionGuard {
    pub fn new(state: SharedState, epoch: u64, scope: GuardScope) -> Self {
        Self {
            state,
            epoch,
            scope,
            armed: true,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Whether no abort has happened since the motion began
    pub fn is_current(&self) -> bool {
        self.state.with(|s| s.is_current(self.epoch))
    }

    /// A cancellation check for the wait helpers
    pub fn cancel_check(&self) -> impl Fn() -> bool + Send + Sync + 'static {
        let state = self.state.clone();
        let epoch = self.epoch;
        move || !state.with(|s| s.is_current(epoch))
    }

    /// Apply the terminal update and release the scope, atomically
    ///
    /// Returns `None` when an abort made this motion stale, otherwise
    /// whether tracking should be restarted.
    pub fn complete(mut self, finish: impl FnOnce(&mut MountState)) -> Option<bool> {
        self.armed = false;
        let epoch = self.epoch;
        let scope = self.scope;
        self.state.with_mut(|s| {
            if !s.is_current(epoch) {
                return None;
            }
            finish(s);
            Some(match scope {
                GuardScope::Motion(_) => s.end_motion(epoch),
                GuardScope::PulseGuide => {
                    s.set_pulse_guiding(false);
                    false
                }
            })
        })
    }

    /// Leave the scope in place; another task will release it
    pub fn defuse(mut self) {
        self.armed = false;
    }
}

impl Drop for MotionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let epoch = self.epoch;
        let scope = self.scope;
        self.state.with_mut(|s| {
            if !s.is_current(epoch) {
                return;
            }
            warn!("MotionGuard: {} did not complete, returning to idle", scope);
            match scope {
                GuardScope::Motion(_) => s.abandon_motion(epoch),
                GuardScope::PulseGuide => s.set_pulse_guiding(false),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn moving(kind: MotionKind) -> (SharedState, MotionGuard) {
        let state = SharedState::default();
        let epoch = state.with_mut(|s| s.begin_motion(kind));
        let guard = MotionGuard::new(state.clone(), epoch, GuardScope::Motion(kind));
        (state, guard)
    }

    #[test]
    fn test_drop_leaves_moving_state_without_terminal_flag() {
        let (state, guard) = moving(MotionKind::Parking);
        drop(guard);
        state.with(|s| {
            assert!(!s.is_moving());
            assert!(!s.at_park);
        });
    }

    #[test]
    fn test_complete_applies_terminal_update() {
        let (state, guard) = moving(MotionKind::Parking);
        assert_eq!(guard.complete(|s| s.set_at_park(true)), Some(false));
        state.with(|s| {
            assert!(!s.is_moving());
            assert!(s.at_park);
        });
    }

    #[test]
    fn test_stale_guard_writes_nothing() {
        let (state, guard) = moving(MotionKind::Homing);
        let cancelled = guard.cancel_check();
        assert!(!cancelled());

        state.with_mut(|s| s.abort());
        assert!(cancelled());
        assert!(!guard.is_current());

        // A new motion has started; the stale guard must not touch it
        state.with_mut(|s| s.begin_motion(MotionKind::Slewing));
        assert_eq!(guard.complete(|s| s.set_at_home(true)), None);
        state.with(|s| {
            assert!(s.is_moving());
            assert!(!s.at_home);
        });
    }

    #[test]
    fn test_defuse_keeps_motion() {
        let (state, guard) = moving(MotionKind::MovingAxis);
        guard.defuse();
        assert!(state.with(|s| s.is_moving()));
    }

    #[test]
    fn test_pulse_guide_scope() {
        let state = SharedState::default();
        let epoch = state.with_mut(|s| {
            s.set_pulse_guiding(true);
            s.motion_epoch
        });
        drop(MotionGuard::new(state.clone(), epoch, GuardScope::PulseGuide));
        assert!(!state.with(|s| s.pulse_guiding));
    }
}
