// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Launching and supervising mount helper processes

use std::ffi::OsString;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use faccess::PathExt;
use nix::fcntl::{FcntlArg, fcntl};
use nix::unistd::{close, dup2};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

use crate::endpoint::Endpoint;
use crate::{Error, Result};

#[cfg(test)]
#[path = "./launcher_test.rs"]
mod launcher_test;

/// The descriptor number at which the first inherited endpoint is
/// placed in a helper, directly after stdin, stdout and stderr.
pub const FIRST_INHERITED_SLOT: RawFd = 3;

/// Describes a single helper process to be launched
#[derive(Debug)]
pub struct Launch {
    program: PathBuf,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
    inherited: Vec<Endpoint>,
    detach: bool,
    capture_output: bool,
}

impl Launch {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            inherited: Vec::new(),
            detach: false,
            capture_output: false,
        }
    }

    pub fn with_arg<S: Into<OsString>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set an environment variable in addition to the ones inherited
    /// from the current process
    pub fn with_env<K: Into<OsString>, V: Into<OsString>>(mut self, key: K, value: V) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Pass an endpoint to the helper.
    ///
    /// Endpoints are placed at consecutive descriptor slots starting
    /// at [`FIRST_INHERITED_SLOT`], in the order that they are added.
    /// Once the launch is consumed they are closed in this process.
    pub fn with_inherited(mut self, endpoint: Endpoint) -> Self {
        self.inherited.push(endpoint);
        self
    }

    /// Run the helper in a new session, so that it is not affected by
    /// anything that happens to the process group of the caller.
    pub fn with_detached(mut self, detach: bool) -> Self {
        self.detach = detach;
        self
    }

    /// Collect stdout and stderr of the helper instead of discarding them.
    pub fn with_captured_output(mut self, capture: bool) -> Self {
        self.capture_output = capture;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// The value given for an extra environment variable, if any
    pub fn env_var<K: AsRef<std::ffi::OsStr>>(&self, key: K) -> Option<&OsString> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key.as_ref())
            .map(|(_, v)| v)
    }

    pub fn is_detached(&self) -> bool {
        self.detach
    }

    pub fn captures_output(&self) -> bool {
        self.capture_output
    }

    /// The endpoints to be inherited, alongside the slot each will occupy
    pub fn slots(&self) -> impl Iterator<Item = (RawFd, &Endpoint)> {
        (FIRST_INHERITED_SLOT..).zip(self.inherited.iter())
    }

    /// Take the endpoints out of this launch, in slot order
    pub fn into_inherited(self) -> Vec<Endpoint> {
        self.inherited
    }
}

/// The final state of a helper process that has been waited on
#[derive(Debug)]
pub struct HelperExit {
    pub program: PathBuf,
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl HelperExit {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Turn an unsuccessful exit into an error carrying its output.
    pub fn into_result(self) -> Result<()> {
        if self.success() {
            return Ok(());
        }
        Err(Error::HelperExitFailure {
            program: self.program,
            status: self.status,
            stdout: String::from_utf8_lossy(&self.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&self.stderr).trim().to_string(),
        })
    }
}

/// A running helper process.
///
/// A helper can either be waited on or released, both of which
/// consume the handle so that its exit status is collected at most once.
#[async_trait::async_trait]
pub trait Helper: Send + std::fmt::Debug {
    /// The os process id, if the process is still known
    fn id(&self) -> Option<u32>;

    fn program(&self) -> &Path;

    /// Wait for the helper to exit, collecting any captured output.
    async fn wait(self: Box<Self>) -> Result<HelperExit>;

    /// Stop tracking the helper, leaving it to run on its own.
    fn release(self: Box<Self>);
}

/// Something that can start helper processes
pub trait Spawner: Send + Sync {
    fn spawn(&self, launch: Launch) -> Result<Box<dyn Helper>>;
}

/// Check that a helper program can actually be run.
pub fn ensure_launchable(program: &Path) -> Result<()> {
    let reason = if !program.exists() {
        "no such file"
    } else if !program.is_file() {
        "not a file"
    } else if !program.executable() {
        "not executable"
    } else {
        return Ok(());
    };
    Err(Error::HelperSpawnFailure {
        program: program.to_owned(),
        reason: reason.to_string(),
    })
}

/// Spawns real os processes
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessSpawner;

impl Spawner for ProcessSpawner {
    fn spawn(&self, launch: Launch) -> Result<Box<dyn Helper>> {
        let Launch {
            program,
            args,
            env,
            inherited,
            detach,
            capture_output,
        } = launch;
        // the inherited endpoints are closed in this process when
        // this function returns, whether or not the spawn succeeded
        ensure_launchable(&program)?;

        let mut cmd = tokio::process::Command::new(&program);
        cmd.args(&args);
        cmd.envs(env.iter().map(|(k, v)| (k, v)));
        cmd.stdin(Stdio::null());
        if capture_output {
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::null());
        }

        let sources: Vec<RawFd> = inherited.iter().map(|e| e.as_raw_fd()).collect();
        // allocated up front, nothing may allocate between fork and exec
        let mut relocated: Vec<RawFd> = vec![-1; sources.len()];
        // SAFETY: the closure only makes async-signal-safe calls
        // and does not allocate
        unsafe {
            cmd.pre_exec(move || {
                if detach {
                    nix::unistd::setsid()?;
                }
                place_inherited(&sources, &mut relocated)
            });
        }

        tracing::debug!(
            program = %program.display(),
            ?args,
            detach,
            inherited = ?inherited.iter().map(|e| e.tag()).collect::<Vec<_>>(),
            "launching mount helper"
        );
        let mut child = cmd.spawn().map_err(|err| spawn_error(&program, err))?;
        drop(inherited);
        tracing::debug!(pid = ?child.id(), program = %program.display(), "mount helper started");
        // the helper must never block on a full pipe while we wait
        // for it to do something else, so output is collected right away
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);
        Ok(Box::new(ProcessHelper {
            program,
            child,
            stdout,
            stderr,
        }))
    }
}

/// Move each source descriptor onto its slot in the child.
///
/// A source may already sit on the slot of another, so all of them
/// are first moved above the slot range before being placed.
fn place_inherited(sources: &[RawFd], relocated: &mut [RawFd]) -> io::Result<()> {
    let floor = FIRST_INHERITED_SLOT + sources.len() as RawFd;
    for (source, moved) in sources.iter().zip(relocated.iter_mut()) {
        *moved = fcntl(*source, FcntlArg::F_DUPFD(floor))?;
    }
    for (slot, moved) in (FIRST_INHERITED_SLOT..).zip(relocated.iter()) {
        // dup2 leaves the new descriptor inheritable
        dup2(*moved, slot)?;
        close(*moved)?;
    }
    Ok(())
}

fn spawn_error(program: &Path, err: io::Error) -> Error {
    match err.raw_os_error() {
        Some(libc::EAGAIN | libc::EMFILE | libc::ENFILE | libc::ENOMEM) => {
            Error::ResourceExhaustion {
                context: "launching the mount helper",
                source: err,
            }
        }
        _ => Error::HelperSpawnFailure {
            program: program.to_owned(),
            reason: err.to_string(),
        },
    }
}

/// Read everything from an output pipe on a background task.
fn drain<R>(mut pipe: R) -> JoinHandle<io::Result<Vec<u8>>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        pipe.read_to_end(&mut buf).await?;
        Ok(buf)
    })
}

async fn collect(output: Option<JoinHandle<io::Result<Vec<u8>>>>) -> Result<Vec<u8>> {
    match output {
        None => Ok(Vec::new()),
        Some(task) => Ok(task.await.map_err(io::Error::other)??),
    }
}

#[derive(Debug)]
struct ProcessHelper {
    program: PathBuf,
    child: tokio::process::Child,
    stdout: Option<JoinHandle<io::Result<Vec<u8>>>>,
    stderr: Option<JoinHandle<io::Result<Vec<u8>>>>,
}

#[async_trait::async_trait]
impl Helper for ProcessHelper {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn program(&self) -> &Path {
        &self.program
    }

    async fn wait(self: Box<Self>) -> Result<HelperExit> {
        let Self {
            program,
            mut child,
            stdout,
            stderr,
        } = *self;
        let status = child.wait().await?;
        tracing::debug!(program = %program.display(), %status, "mount helper exited");
        Ok(HelperExit {
            program,
            status,
            stdout: collect(stdout).await?,
            stderr: collect(stderr).await?,
        })
    }

    fn release(self: Box<Self>) {
        tracing::debug!(pid = ?self.child.id(), "releasing mount helper");
        // dropping the child neither kills nor waits on the process,
        // and any output still being collected is discarded
        drop(self.child);
    }
}
