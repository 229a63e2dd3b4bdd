// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;

use miette::Diagnostic;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Diagnostic, Debug, Error)]
#[diagnostic(
    url(
        "https://spkenv.dev/error_codes#{}",
        self.code().unwrap_or_else(|| Box::new("spfs::mount::generic"))
    )
)]
pub enum Error {
    #[error("Out of system resources while {context}")]
    #[diagnostic(
        code("spfs::mount::resource_exhaustion"),
        help("Check the open file and process limits for this user (ulimit -n / ulimit -u)")
    )]
    ResourceExhaustion {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Failed to launch mount helper {}: {reason}", program.display())]
    #[diagnostic(code("spfs::mount::helper_spawn_failure"))]
    HelperSpawnFailure { program: PathBuf, reason: String },

    #[error("No usable FUSE backend: {0}")]
    #[diagnostic(
        code("spfs::mount::backend_not_found"),
        help("Install macFUSE (https://osxfuse.github.io) or FUSE-T (https://www.fuse-t.org)")
    )]
    BackendNotFound(String),

    #[error("Mount helper protocol violation: {0}")]
    #[diagnostic(code("spfs::mount::protocol_violation"))]
    ProtocolViolation(String),

    #[error("FUSE-T mount failed: {0}")]
    #[diagnostic(code("spfs::mount::handshake_failure"))]
    HandshakeFailure(String),

    #[error(
        "Mount helper {} failed: {status}. Stderr: {stderr}, Stdout: {stdout}",
        program.display()
    )]
    #[diagnostic(code("spfs::mount::helper_exit_failure"))]
    HelperExitFailure {
        program: PathBuf,
        status: ExitStatus,
        stdout: String,
        stderr: String,
    },

    #[error(transparent)]
    #[diagnostic(code("spfs::mount::io"))]
    Io(#[from] io::Error),

    #[error(transparent)]
    #[diagnostic(code("spfs::mount::config"))]
    Config(#[from] config::ConfigError),
}

impl Error {
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::ProtocolViolation(message.into())
    }

    pub fn handshake<S: Into<String>>(message: S) -> Self {
        Self::HandshakeFailure(message.into())
    }

    /// Map a failed descriptor or process allocation, separating
    /// table exhaustion from all other os errors.
    pub(crate) fn from_alloc(context: &'static str, source: io::Error) -> Self {
        match source.raw_os_error() {
            Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM | libc::EAGAIN) => {
                Self::ResourceExhaustion { context, source }
            }
            _ => Self::Io(source),
        }
    }

    /// How much this error says about an installed backend.
    ///
    /// When several backends were attempted, the most specific
    /// failure is the one worth reporting: a backend that is
    /// installed but broken is more actionable than one that is
    /// simply missing.
    pub fn specificity(&self) -> u8 {
        match self {
            Self::HandshakeFailure(_) | Self::HelperExitFailure { .. } => 5,
            Self::ProtocolViolation(_) => 4,
            Self::HelperSpawnFailure { .. } => 3,
            Self::ResourceExhaustion { .. } | Self::Io(_) | Self::Config(_) => 2,
            Self::BackendNotFound(_) => 1,
        }
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        Self::Io(io::Error::from(errno))
    }
}
