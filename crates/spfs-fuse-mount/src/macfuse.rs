// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Mounting through a macFUSE (or OSXFUSE) mount helper
//!
//! The helper loads the kernel extension, opens the fuse device and
//! mounts it, then passes the open device back over the socket given
//! to it in `_FUSE_COMMFD`. It is run in the foreground and watched
//! until it exits, since its exit status is the only way that a failed
//! mount is reported.

use std::ffi::OsString;
use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;
use std::time::Duration;

use crate::ancillary;
use crate::endpoint::{EndpointPair, set_cloexec};
use crate::launcher::{Helper, HelperExit, Launch, Spawner};
use crate::request::{Backend, LegacyLocation, MountRequest};
use crate::selector::{Handoff, MountOutcome};
use crate::signal::{self, ReadinessNotifier, TerminationReporter};
use crate::{Error, Result};

#[cfg(test)]
#[path = "./macfuse_test.rs"]
mod macfuse_test;

/// Run the mount helper of the given installation and receive the
/// fuse device from it.
///
/// Readiness resolves once the helper has either exited or been
/// running for the grace period without failing. A failure of the
/// helper after that is sent to the termination channel.
pub async fn mount(
    spawner: &dyn Spawner,
    location: &LegacyLocation,
    request: &MountRequest,
    io_size: u64,
    grace: Duration,
) -> Result<Handoff> {
    let pair = EndpointPair::new("macfuse")?;
    let launch = helper_launch(&location.mount, request, io_size, daemon_path())
        .with_inherited(pair.remote);
    let helper = spawner.spawn(launch)?;
    tracing::debug!(pid = ?helper.id(), location = %location.name, "macFUSE mount helper started");

    let local = pair.local;
    let received = tokio::task::spawn_blocking(move || ancillary::receive_descriptor(&local))
        .await
        .unwrap_or_else(|err| {
            Err(Error::protocol(format!(
                "receiving the fuse device stopped unexpectedly: {err}"
            )))
        });
    let channel = match received.and_then(adopt) {
        Ok(channel) => channel,
        Err(err) => return Err(reap(helper, err, grace).await),
    };

    let (notifier, ready) = signal::readiness();
    let (reporter, termination) = signal::termination();
    tokio::spawn(supervise(helper, grace, notifier, reporter));

    Ok(Handoff {
        outcome: MountOutcome {
            channel: File::from(channel),
            backend: Backend::MacFuse,
            retained: Vec::new(),
        },
        ready,
        termination,
    })
}

/// Build the helper launch, without the inherited endpoint.
pub(crate) fn helper_launch(
    program: &Path,
    request: &MountRequest,
    io_size: u64,
    daemon: OsString,
) -> Launch {
    let mut launch = Launch::new(program);
    let options = request.legacy_option_string();
    if !options.is_empty() {
        launch = launch.with_arg("-o").with_arg(options);
    }
    launch
        .with_arg("-o")
        .with_arg(format!("iosize={io_size}"))
        .with_arg(request.mountpoint())
        .with_env("_FUSE_CALL_BY_LIB", "")
        .with_env("_FUSE_DAEMON_PATH", daemon.clone())
        .with_env("_FUSE_COMMFD", "3")
        .with_env("_FUSE_COMMVERS", "2")
        .with_env("MOUNT_OSXFUSE_CALL_BY_LIB", "")
        .with_env("MOUNT_OSXFUSE_DAEMON_PATH", daemon)
        .with_detached(false)
        .with_captured_output(true)
}

/// The program that the helper reports as owning the mount.
fn daemon_path() -> OsString {
    std::env::args_os()
        .next()
        .or_else(|| std::env::current_exe().ok().map(OsString::from))
        .unwrap_or_default()
}

/// Keep a private copy of a received descriptor.
///
/// The received descriptor is not close-on-exec, so it is duplicated
/// into one that is, and the original is closed.
fn adopt(received: OwnedFd) -> Result<OwnedFd> {
    set_cloexec(received.as_raw_fd())?;
    let channel = received
        .try_clone()
        .map_err(|err| Error::from_alloc("duplicating the fuse device", err))?;
    tracing::trace!(
        received = received.as_raw_fd(),
        channel = channel.as_raw_fd(),
        "adopted fuse device"
    );
    Ok(channel)
}

/// Hand a helper off to a background task that waits for it, adding
/// its exit details to the error if they arrive within the grace period.
async fn reap(helper: Box<dyn Helper>, err: Error, grace: Duration) -> Error {
    let mut reaper = tokio::spawn(async move {
        let exit = helper.wait().await;
        if let Ok(exit) = &exit {
            tracing::debug!(status = %exit.status, "reaped failed macFUSE mount helper");
        }
        exit
    });
    match tokio::time::timeout(grace, &mut reaper).await {
        Ok(Ok(Ok(exit))) => with_exit_details(err, &exit),
        // the reaper keeps running if the helper is still alive
        _ => err,
    }
}

fn with_exit_details(err: Error, exit: &HelperExit) -> Error {
    match err {
        Error::ProtocolViolation(message) => Error::ProtocolViolation(format!(
            "{message} (helper exited with {}, stderr: {})",
            exit.status,
            String::from_utf8_lossy(&exit.stderr).trim()
        )),
        err => err,
    }
}

/// Watch the helper until it exits, deciding readiness on the way.
async fn supervise(
    helper: Box<dyn Helper>,
    grace: Duration,
    notifier: ReadinessNotifier,
    reporter: TerminationReporter,
) {
    let mut exit = helper.wait();
    if let Ok(result) = tokio::time::timeout(grace, &mut exit).await {
        let result = result.and_then(HelperExit::into_result);
        match &result {
            Ok(()) => tracing::info!("macFUSE mount is ready"),
            Err(err) => tracing::debug!(%err, "macFUSE mount helper failed"),
        }
        notifier.fire(result);
        return;
    }
    tracing::info!("macFUSE mount is ready");
    notifier.fire(Ok(()));

    match exit.await.and_then(HelperExit::into_result) {
        Ok(()) => tracing::debug!("macFUSE mount helper exited cleanly"),
        Err(err) => {
            tracing::warn!(%err, "macFUSE mount helper failed after the mount was ready");
            reporter.report(err);
        }
    }
}
