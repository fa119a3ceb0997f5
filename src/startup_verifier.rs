use std::time::{Duration, Instant};

use crate::debug_log;

/// Time a new server must stay alive before it counts as started
pub const DEFAULT_GRACE_WINDOW: Duration = Duration::from_secs(5);

/// How often the verifier checks the process while the grace window runs
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// States of a startup verification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationState {
    /// Grace window still running, process alive so far
    Pending,
    /// Process survived the grace window
    Verified,
    /// Process died before the grace window elapsed
    FailedEarly,
}

/// Confirms a just-started process survives its grace window
///
/// One verifier exists per start attempt. It resolves exactly once: to `FailedEarly` as soon as
/// a poll finds the process dead, or to `Verified` at the first poll after the grace window
/// with the process still alive. Polls after that never change the state again.
#[derive(Debug, Clone)]
pub struct StartupVerifier {
    pid: u32,
    launched_at: Instant,
    grace_window: Duration,
    state: VerificationState,
}

impl StartupVerifier {
    /// Creates a verifier for a process launched at `launched_at`
    pub fn new(pid: u32, launched_at: Instant, grace_window: Duration) -> Self {
        Self {
            pid,
            launched_at,
            grace_window,
            state: VerificationState::Pending,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> VerificationState {
        self.state
    }

    pub fn is_resolved(&self) -> bool {
        self.state != VerificationState::Pending
    }

    /// Polls with the current time, see [`StartupVerifier::poll_at`]
    pub fn poll(
        &mut self,
        alive: bool,
        correctly_named: impl FnOnce() -> bool,
    ) -> Option<VerificationState> {
        self.poll_at(self.launched_at.elapsed(), alive, correctly_named)
    }

    /// Advances the state machine
    ///
    /// `correctly_named` is only consulted once the grace window is over, a launcher script may
    /// still be replacing itself with the server before that. Returns the new state only on the
    /// poll that resolves the verification.
    pub fn poll_at(
        &mut self,
        elapsed: Duration,
        alive: bool,
        correctly_named: impl FnOnce() -> bool,
    ) -> Option<VerificationState> {
        if self.is_resolved() {
            return None;
        }

        if !alive {
            debug_log!(
                "Process {} died {:?} after launch, inside the grace window",
                self.pid,
                elapsed
            );
            self.state = VerificationState::FailedEarly;
        } else if elapsed >= self.grace_window {
            if correctly_named() {
                self.state = VerificationState::Verified;
            } else {
                debug_log!(
                    "Process {} is alive but does not carry the server name",
                    self.pid
                );
                self.state = VerificationState::FailedEarly;
            }
        } else {
            return None;
        }

        Some(self.state)
    }
}

/// Polls the verifier on a timer until it resolves
///
/// `still_relevant` is checked before every poll, once it returns false the verification is
/// abandoned and `None` is returned without ever probing the process again.
pub async fn run_verification<R, A, N>(
    mut verifier: StartupVerifier,
    poll_interval: Duration,
    still_relevant: R,
    is_alive: A,
    is_server_named: N,
) -> Option<VerificationState>
where
    R: Fn() -> bool,
    A: Fn() -> bool,
    N: Fn() -> bool,
{
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if !still_relevant() {
            debug_log!("Verification of process {} cancelled", verifier.pid());
            return None;
        }
        if let Some(state) = verifier.poll(is_alive(), &is_server_named) {
            return Some(state);
        }
    }
}

#[cfg(test)]
#[path = "startup_verifier_tests.rs"]
mod startup_verifier_tests;
