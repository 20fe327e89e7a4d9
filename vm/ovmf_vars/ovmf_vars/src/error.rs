// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error object for the ovmf_vars crate

use crate::session::FailureReason;
use std::path::PathBuf;
use thiserror::Error;

/// Provisioning errors.
#[derive(Debug, Error)]
pub enum Error {
    /// The output exists and overwriting was not allowed
    #[error("{} already exists", .0.display())]
    OutputExists(PathBuf),
    /// Copying the template variables store failed
    #[error("failed to copy template vars")]
    CopyTemplate(#[source] std::io::Error),
    /// The guest could not be started
    #[error("failed to start {phase} guest")]
    Launch {
        /// The phase being run
        phase: &'static str,
        /// The underlying spawn error
        #[source]
        source: std::io::Error,
    },
    /// The boot payload could not be fetched
    #[error("failed to fetch {what}")]
    Fetch {
        /// Which payload file
        what: &'static str,
        /// The fetcher's error
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// A phase ended in failure
    #[error("{phase} phase failed")]
    Session {
        /// The phase that failed
        phase: &'static str,
        /// Why it failed
        #[source]
        reason: FailureReason,
    },
}
