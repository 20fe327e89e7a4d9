// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Watches a kernel boot for its Secure Boot report.

use crate::console::ConsoleReader;
use crate::console::Narration;
use crate::session::ConsoleSession;
use crate::session::FailureReason;
use crate::session::SessionOutcome;
use std::io::BufRead;
use std::io::Write;

/// Printed by the kernel when the firmware did not enforce Secure Boot.
pub const SECURE_BOOT_DISABLED: &str = "Secure boot disabled";
/// Printed by the kernel when Secure Boot is on and lockdown is active.
pub const SECURE_BOOT_ENABLED: &str = "Secure boot enabled and kernel locked down";

/// Validation progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidateState {
    /// The kernel is booting; no report seen yet.
    Booting,
    /// The kernel reported Secure Boot disabled.
    Disabled,
    /// The kernel reported Secure Boot enabled with lockdown.
    Enabled,
}

/// The validation state machine.
#[derive(Debug)]
pub struct ValidateSession {
    state: ValidateState,
}

impl ValidateSession {
    /// A session in [`ValidateState::Booting`].
    pub fn new() -> Self {
        Self {
            state: ValidateState::Booting,
        }
    }

    /// The current state.
    pub fn state(&self) -> ValidateState {
        self.state
    }

    /// Feeds one console line. Terminal states are sticky.
    pub fn observe(&mut self, line: &str) -> ValidateState {
        if self.state == ValidateState::Booting {
            // Checked first so a line somehow carrying both reports fails.
            let next = if line.contains(SECURE_BOOT_DISABLED) {
                ValidateState::Disabled
            } else if line.contains(SECURE_BOOT_ENABLED) {
                ValidateState::Enabled
            } else {
                return self.state;
            };
            tracing::debug!(from = ?self.state, to = ?next, "validation transition");
            self.state = next;
        }
        self.state
    }
}

impl ConsoleSession for ValidateSession {
    fn drive<W: Write, R: BufRead>(
        &mut self,
        _input: &mut W,
        console: &mut ConsoleReader<R>,
    ) -> SessionOutcome {
        loop {
            let line = match console.read_line(Narration::Guest) {
                Ok(Some(line)) => line,
                Ok(None) => {
                    return SessionOutcome::Failure(FailureReason::ValidationMarkerNotObserved);
                }
                Err(err) => return err.into(),
            };
            match self.observe(&line) {
                ValidateState::Booting => {}
                ValidateState::Disabled => {
                    tracing::error!("guest reports secure boot disabled");
                    return SessionOutcome::Failure(FailureReason::SecureBootDisabled);
                }
                ValidateState::Enabled => {
                    tracing::info!("confirmed: secure boot enabled");
                    return SessionOutcome::Success;
                }
            }
        }
    }
}
