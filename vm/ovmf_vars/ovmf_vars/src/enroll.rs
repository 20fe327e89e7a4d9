// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Drives the UEFI shell to enroll the default Secure Boot keys.

use crate::console::ConsoleReader;
use crate::console::Narration;
use crate::session::ConsoleSession;
use crate::session::FailureReason;
use crate::session::SessionOutcome;
use std::io;
use std::io::BufRead;
use std::io::Write;

/// Interrupts the shell's startup countdown.
const ESCAPE: &[u8] = b"\x1b";

/// Sent back to back, without waiting for the shell to respond.
const SHELL_COMMANDS: [&[u8]; 3] = [b"fs0:\r\n", b"EnrollDefaultKeys.efi\r\n", b"reset\r\n"];

/// Printed by `EnrollDefaultKeys.efi` once the keys are in place.
pub const ENROLLMENT_MARKER: &str = "info: success";

/// Enrollment progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollState {
    /// The guest has been launched; waiting for the shell banner.
    Started,
    /// The escape key was sent and the shell is interactive.
    ShellEntered,
    /// The enrollment commands have been sent.
    CommandsSent,
    /// Watching the console for [`ENROLLMENT_MARKER`].
    AwaitingSuccess,
    /// The marker was seen.
    Succeeded,
    /// The console closed or failed before the marker was seen.
    Failed,
}

/// The enrollment state machine.
#[derive(Debug)]
pub struct EnrollSession {
    state: EnrollState,
}

impl EnrollSession {
    /// A session in [`EnrollState::Started`].
    pub fn new() -> Self {
        Self {
            state: EnrollState::Started,
        }
    }

    /// The current state.
    pub fn state(&self) -> EnrollState {
        self.state
    }

    fn transition(&mut self, state: EnrollState) {
        tracing::debug!(from = ?self.state, to = ?state, "enrollment transition");
        self.state = state;
    }

    /// Feeds one console line while awaiting success. Returns `true` once
    /// the marker has been observed.
    pub fn observe(&mut self, line: &str) -> bool {
        if self.state == EnrollState::AwaitingSuccess && line.contains(ENROLLMENT_MARKER) {
            self.transition(EnrollState::Succeeded);
        }
        self.state == EnrollState::Succeeded
    }

    fn enter_shell<W: Write, R: BufRead>(
        &mut self,
        input: &mut W,
        console: &mut ConsoleReader<R>,
    ) -> io::Result<()> {
        // The first line means the firmware is up and the shell is counting
        // down. Its content does not matter.
        console.read_line(Narration::Plain)?;
        input.write_all(ESCAPE)?;
        input.flush()?;
        self.transition(EnrollState::ShellEntered);

        for command in SHELL_COMMANDS {
            input.write_all(command)?;
        }
        input.flush()?;
        self.transition(EnrollState::CommandsSent);
        Ok(())
    }

    fn fail(&mut self, reason: FailureReason) -> SessionOutcome {
        self.transition(EnrollState::Failed);
        SessionOutcome::Failure(reason)
    }
}

impl ConsoleSession for EnrollSession {
    fn drive<W: Write, R: BufRead>(
        &mut self,
        input: &mut W,
        console: &mut ConsoleReader<R>,
    ) -> SessionOutcome {
        if let Err(err) = self.enter_shell(input, console) {
            return self.fail(FailureReason::Console(err));
        }

        self.transition(EnrollState::AwaitingSuccess);
        loop {
            match console.read_line(Narration::Guest) {
                Ok(Some(line)) => {
                    if self.observe(&line) {
                        tracing::info!("default keys enrolled");
                        return SessionOutcome::Success;
                    }
                }
                Ok(None) => return self.fail(FailureReason::EnrollmentMarkerNotObserved),
                Err(err) => return self.fail(FailureReason::Console(err)),
            }
        }
    }
}
