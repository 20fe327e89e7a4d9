// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Lifecycle of a single phase: launch the guest, drive its console to a
//! terminal outcome, then kill it and drain whatever output is left.
//!
//! The guest is held by a [`GuestGuard`] for the whole phase, so it is
//! terminated on every exit path, including early returns and panics.

use crate::console::ConsoleReader;
use crate::console::Echo;
use crate::error::Error;
use crate::qemu::QemuInvocation;
use std::io;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Read;
use std::io::Write;
use thiserror::Error;

/// Why a console session failed.
#[derive(Debug, Error)]
pub enum FailureReason {
    /// The console closed before the key enrollment tool reported success.
    #[error("enrollment marker not observed")]
    EnrollmentMarkerNotObserved,
    /// The kernel reported that Secure Boot is off.
    #[error("secure boot disabled")]
    SecureBootDisabled,
    /// The console closed before the kernel reported its Secure Boot state.
    #[error("validation marker not observed")]
    ValidationMarkerNotObserved,
    /// Reading from or writing to the console failed.
    #[error("console i/o failed")]
    Console(#[source] io::Error),
}

/// The terminal result of a console session.
#[derive(Debug)]
#[must_use]
pub enum SessionOutcome {
    /// The session reached its success state.
    Success,
    /// The session reached a failure state.
    Failure(FailureReason),
}

impl SessionOutcome {
    /// Converts the outcome into a `Result`.
    pub fn into_result(self) -> Result<(), FailureReason> {
        match self {
            SessionOutcome::Success => Ok(()),
            SessionOutcome::Failure(reason) => Err(reason),
        }
    }
}

impl From<io::Error> for SessionOutcome {
    fn from(err: io::Error) -> Self {
        SessionOutcome::Failure(FailureReason::Console(err))
    }
}

/// A state machine that drives a guest console to a terminal outcome.
pub trait ConsoleSession {
    /// Runs the session until it succeeds or fails.
    fn drive<W: Write, R: BufRead>(
        &mut self,
        input: &mut W,
        console: &mut ConsoleReader<R>,
    ) -> SessionOutcome;
}

/// Starts guest processes.
pub trait Launch {
    /// Handle used to terminate the guest.
    type Guest: Terminate;
    /// The guest's console input.
    type Input: Write;
    /// The guest's console output.
    type Output: Read;

    /// Starts a guest for `invocation` with its standard streams captured.
    fn launch(
        &mut self,
        invocation: &QemuInvocation,
    ) -> io::Result<(Self::Guest, Self::Input, Self::Output)>;
}

/// A guest that can be forcibly stopped.
pub trait Terminate {
    /// Kills the guest and waits for it to exit.
    fn terminate(&mut self) -> io::Result<()>;
}

/// Owns a running guest and terminates it exactly once.
pub struct GuestGuard<G: Terminate> {
    guest: G,
    terminated: bool,
}

impl<G: Terminate> GuestGuard<G> {
    /// Takes ownership of a running guest.
    pub fn new(guest: G) -> Self {
        Self {
            guest,
            terminated: false,
        }
    }

    /// Terminates the guest. Subsequent calls do nothing.
    pub fn terminate(&mut self) {
        if std::mem::replace(&mut self.terminated, true) {
            return;
        }
        if let Err(err) = self.guest.terminate() {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "failed to terminate guest"
            );
        }
    }
}

impl<G: Terminate> Drop for GuestGuard<G> {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Runs one phase end to end.
///
/// The guest is always terminated and its output drained before this
/// returns, whichever way the session ended.
pub fn run_session<L, S>(
    launcher: &mut L,
    invocation: &QemuInvocation,
    session: &mut S,
    echo: Option<Echo>,
) -> Result<(), Error>
where
    L: Launch,
    S: ConsoleSession,
{
    let phase = invocation.phase();
    tracing::info!(phase, "starting guest");
    let (guest, mut input, output) = launcher
        .launch(invocation)
        .map_err(|err| Error::Launch { phase, source: err })?;

    let mut guest = GuestGuard::new(guest);
    let mut console = ConsoleReader::new(BufReader::new(output), echo);

    let outcome = session.drive(&mut input, &mut console);
    tracing::debug!(phase, ?outcome, "session finished");

    guest.terminate();
    drop(input);
    if let Err(err) = console.drain() {
        tracing::warn!(
            phase,
            error = &err as &dyn std::error::Error,
            "failed to drain guest console"
        );
    }

    outcome
        .into_result()
        .map_err(|reason| Error::Session { phase, reason })
}
