// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::collections::HashMap;
use std::ffi::OsString;
use std::io::{IoSlice, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::socket::{ControlMessage, MsgFlags, sendmsg};
use rstest::fixture;
use tokio::sync::oneshot;

use crate::endpoint::Endpoint;
use crate::launcher::{Helper, HelperExit, Launch, Spawner};
use crate::{Error, Result};

pub fn init_logging() {
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::new("spfs_fuse_mount=trace"))
        .without_time()
        .with_test_writer()
        .finish();
    let _ = tracing::subscriber::set_global_default(sub);
}

#[fixture]
pub fn tmpdir() -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix("spfs-test-")
        .tempdir()
        .expect("failed to create dir for test")
}

/// The number of descriptors currently open in this process.
pub fn open_descriptor_count() -> usize {
    let dir = if Path::new("/proc/self/fd").is_dir() {
        "/proc/self/fd"
    } else {
        "/dev/fd"
    };
    // the directory handle used for listing is itself counted once
    std::fs::read_dir(dir)
        .expect("failed to list open descriptors")
        .count()
        - 1
}

/// Create an executable shell script, returning its path.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("failed to write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("failed to make script executable");
    path
}

/// Look up a program on `PATH`, if it is available on this system.
pub fn find_program(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Create an empty file that stands in for an installed helper.
pub fn install_placeholder(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("failed to create install dir");
    }
    std::fs::write(&path, "").expect("failed to write placeholder");
    path
}

pub fn exit_code(code: i32) -> ExitStatus {
    ExitStatus::from_raw(code << 8)
}

/// What a fake helper does with the endpoints it inherits.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Send a descriptor over the first slot, then exit after a delay
    SendDescriptor { exit_code: i32, exit_after: Duration },
    /// Exit without sending anything
    ExitEarly { exit_code: i32, stderr: &'static str },
    /// Write plain bytes over the first slot, without any descriptor
    SendBytes,
    /// Read the mount request on the second slot and answer it
    Reply { reply: Vec<u8> },
    /// Refuse to start at all
    FailToSpawn,
}

/// The parts of a [`Launch`] that tests want to look at afterwards.
#[derive(Debug, Clone)]
pub struct RecordedLaunch {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub env: HashMap<String, String>,
    pub slots: Vec<RawFd>,
    pub detach: bool,
    pub capture_output: bool,
}

impl RecordedLaunch {
    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }
}

const RECORDED_VARS: &[&str] = &[
    "_FUSE_CALL_BY_LIB",
    "_FUSE_DAEMON_PATH",
    "_FUSE_COMMFD",
    "_FUSE_MONFD",
    "_FUSE_COMMVERS",
    "MOUNT_OSXFUSE_CALL_BY_LIB",
    "MOUNT_OSXFUSE_DAEMON_PATH",
];

/// Plays the role of the mount helpers on background threads.
#[derive(Debug, Default, Clone)]
pub struct FakeSpawner {
    behaviors: Arc<Mutex<HashMap<PathBuf, Behavior>>>,
    launches: Arc<Mutex<Vec<RecordedLaunch>>>,
}

impl FakeSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior<P: Into<PathBuf>>(self, program: P, behavior: Behavior) -> Self {
        self.behaviors
            .lock()
            .unwrap()
            .insert(program.into(), behavior);
        self
    }

    pub fn launches(&self) -> Vec<RecordedLaunch> {
        self.launches.lock().unwrap().clone()
    }

    pub fn launched(&self, program: &Path) -> bool {
        self.launches().iter().any(|l| l.program == program)
    }
}

impl Spawner for FakeSpawner {
    fn spawn(&self, launch: Launch) -> Result<Box<dyn Helper>> {
        let mut env = HashMap::new();
        for var in RECORDED_VARS {
            if let Some(value) = launch.env_var(var) {
                env.insert(var.to_string(), value.to_string_lossy().into_owned());
            }
        }
        let record = RecordedLaunch {
            program: launch.program().to_owned(),
            args: launch.args().to_vec(),
            env,
            slots: launch.slots().map(|(slot, _)| slot).collect(),
            detach: launch.is_detached(),
            capture_output: launch.captures_output(),
        };
        self.launches.lock().unwrap().push(record.clone());

        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&record.program)
            .cloned()
            .unwrap_or(Behavior::FailToSpawn);
        if let Behavior::FailToSpawn = behavior {
            return Err(Error::HelperSpawnFailure {
                program: record.program,
                reason: "refused by test".into(),
            });
        }

        let endpoints = launch.into_inherited();
        let (tx, rx) = oneshot::channel();
        let program = record.program.clone();
        std::thread::spawn(move || {
            let exit = act(&program, behavior, endpoints);
            let _ = tx.send(exit);
        });
        Ok(Box::new(FakeHelper {
            program: record.program,
            exit: rx,
        }))
    }
}

fn act(program: &Path, behavior: Behavior, endpoints: Vec<Endpoint>) -> HelperExit {
    let mut stderr = Vec::new();
    let code = match behavior {
        Behavior::SendDescriptor {
            exit_code,
            exit_after,
        } => {
            let shared = std::fs::File::open("/dev/null").expect("failed to open /dev/null");
            let fds = [shared.as_raw_fd()];
            let payload = [0u8; 1];
            sendmsg::<()>(
                endpoints[0].as_raw_fd(),
                &[IoSlice::new(&payload)],
                &[ControlMessage::ScmRights(&fds)],
                MsgFlags::empty(),
                None,
            )
            .expect("failed to send descriptor");
            drop(shared);
            drop(endpoints);
            std::thread::sleep(exit_after);
            exit_code
        }
        Behavior::ExitEarly { exit_code, stderr: message } => {
            drop(endpoints);
            stderr.extend_from_slice(message.as_bytes());
            exit_code
        }
        Behavior::SendBytes => {
            (&endpoints[0])
                .write_all(b"nope")
                .expect("failed to write bytes");
            0
        }
        Behavior::Reply { reply } => {
            let mut request = [0u8; 5];
            let mut monitor = &endpoints[1];
            match monitor.read_exact(&mut request) {
                Ok(()) => {
                    assert_eq!(&request, b"mount", "unexpected mount request");
                    let _ = monitor.write_all(&reply);
                }
                Err(_) => return exit(program, 1, b"no mount request".to_vec()),
            }
            0
        }
        Behavior::FailToSpawn => unreachable!("handled before spawning"),
    };
    exit(program, code, stderr)
}

fn exit(program: &Path, code: i32, stderr: Vec<u8>) -> HelperExit {
    HelperExit {
        program: program.to_owned(),
        status: exit_code(code),
        stdout: Vec::new(),
        stderr,
    }
}

#[derive(Debug)]
pub struct FakeHelper {
    program: PathBuf,
    exit: oneshot::Receiver<HelperExit>,
}

#[async_trait::async_trait]
impl Helper for FakeHelper {
    fn id(&self) -> Option<u32> {
        None
    }

    fn program(&self) -> &Path {
        &self.program
    }

    async fn wait(self: Box<Self>) -> Result<HelperExit> {
        self.exit
            .await
            .map_err(|_| Error::protocol("fake helper thread panicked"))
    }

    fn release(self: Box<Self>) {}
}
