// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Mounting through the FUSE-T NFS server
//!
//! FUSE-T runs a local NFS server which the kernel mounts in place of
//! a FUSE kernel extension. The server is given two sockets, one that
//! carries FUSE traffic and one that it uses to coordinate the mount
//! itself. The server daemonizes and outlives the negotiation, so it
//! is never waited on; the mount lasts as long as the monitor socket
//! stays open on our side.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use crate::endpoint::{Endpoint, EndpointPair};
use crate::launcher::{Launch, Spawner};
use crate::request::{Backend, MountRequest};
use crate::selector::{Handoff, MountOutcome};
use crate::signal::{self, Termination};
use crate::{Error, Result};

#[cfg(test)]
#[path = "./fuse_t_test.rs"]
mod fuse_t_test;

const MOUNT_REQUEST: &[u8] = b"mount";
const MOUNT_SUCCESS: [u8; 4] = [0; 4];

/// Start a FUSE-T mount, returning as soon as the server is running.
///
/// The returned readiness resolves once the server has answered the
/// mount request. Its termination channel never reports anything.
pub fn mount(
    spawner: &dyn Spawner,
    program: &Path,
    request: &MountRequest,
    io_size: u64,
) -> Result<Handoff> {
    let primary = EndpointPair::new("fuse-t")?;
    let monitor = EndpointPair::new("fuse-t monitor")?;

    let launch = server_launch(program, request, io_size)
        .with_inherited(primary.remote)
        .with_inherited(monitor.remote);
    let helper = spawner.spawn(launch)?;
    tracing::debug!(pid = ?helper.id(), "FUSE-T server started, releasing it");
    helper.release();

    let monitor = Arc::new(monitor.local);
    let (notifier, ready) = signal::readiness();
    let shared = Arc::clone(&monitor);
    let mountpoint = request.mountpoint().to_owned();
    tokio::task::spawn_blocking(move || {
        let result = handshake(&shared);
        match &result {
            Ok(()) => tracing::info!(mountpoint = %mountpoint.display(), "FUSE-T mount is ready"),
            Err(err) => tracing::debug!(%err, "FUSE-T handshake failed"),
        }
        notifier.fire(result);
    });

    Ok(Handoff {
        outcome: MountOutcome {
            channel: File::from(primary.local.into_owned_fd()),
            backend: Backend::FuseT,
            retained: vec![monitor],
        },
        ready,
        termination: Termination::closed(),
    })
}

/// Build the server launch, without any inherited endpoints.
pub(crate) fn server_launch(program: &Path, request: &MountRequest, io_size: u64) -> Launch {
    let mut launch = Launch::new(program);
    if request.is_read_only() {
        launch = launch.with_arg("-r");
    }
    if let Some(name) = request.display_name() {
        launch = launch.with_arg(format!("--volname={name}"));
    }
    launch
        .with_arg(format!("--rwsize={io_size}"))
        .with_arg(request.mountpoint())
        .with_env("_FUSE_COMMFD", "3")
        .with_env("_FUSE_MONFD", "4")
        .with_env("_FUSE_COMMVERS", "2")
        .with_detached(true)
        .with_captured_output(false)
}

/// Ask the server to mount and wait for its answer.
pub(crate) fn handshake(monitor: &Endpoint) -> Result<()> {
    let mut stream = monitor;
    stream
        .write_all(MOUNT_REQUEST)
        .map_err(|err| Error::handshake(format!("could not send the mount request: {err}")))?;
    let mut reply = [0u8; 4];
    stream
        .read_exact(&mut reply)
        .map_err(|err| Error::handshake(format!("no complete reply from the server: {err}")))?;
    if reply != MOUNT_SUCCESS {
        return Err(Error::handshake(format!(
            "the server rejected the mount with {reply:?}"
        )));
    }
    Ok(())
}
