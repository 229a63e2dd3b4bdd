// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::fs::File;
use std::sync::Arc;

use crate::config::Config;
use crate::endpoint::Endpoint;
use crate::launcher::{ProcessSpawner, Spawner};
use crate::request::{Backend, MountRequest};
use crate::signal::{Readiness, Termination};
use crate::{Error, Result, fuse_t, macfuse};

#[cfg(test)]
#[path = "./selector_test.rs"]
mod selector_test;

/// The result of a successful negotiation
#[derive(Debug)]
pub struct MountOutcome {
    /// The channel on which the kernel exchanges FUSE messages.
    ///
    /// This must not be read or written until the accompanying
    /// readiness has resolved successfully.
    pub channel: File,
    /// The backend that produced the channel
    pub backend: Backend,
    /// Endpoints that must stay open for as long as the mount should
    /// remain alive. Dropping them may unmount the filesystem.
    pub retained: Vec<Arc<Endpoint>>,
}

/// Everything handed back to the caller when a mount was started
#[derive(Debug)]
pub struct Handoff {
    pub outcome: MountOutcome,
    pub ready: Readiness,
    pub termination: Termination,
}

/// The progress of a single negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum SelectorState {
    Unattempted,
    TryingModern,
    TryingLegacy,
    Succeeded,
    Exhausted,
}

/// Tracks the state of a negotiation and the failures seen so far.
#[derive(Debug)]
struct Selection {
    state: SelectorState,
    failures: Vec<Error>,
}

impl Selection {
    fn new() -> Self {
        Self {
            state: SelectorState::Unattempted,
            failures: Vec::new(),
        }
    }

    fn advance(&mut self, next: SelectorState) {
        tracing::debug!(from = %self.state, to = %next, "mount negotiation");
        self.state = next;
    }

    fn fail(&mut self, err: Error) {
        tracing::debug!(state = %self.state, %err, "mount attempt failed");
        self.failures.push(err);
    }

    fn succeed(mut self, handoff: Handoff) -> Handoff {
        self.advance(SelectorState::Succeeded);
        tracing::info!(backend = %handoff.outcome.backend, "negotiated fuse channel");
        handoff
    }

    /// Give up, reporting the most specific failure seen.
    fn exhaust(mut self) -> Error {
        self.advance(SelectorState::Exhausted);
        let mut best: Option<Error> = None;
        for err in self.failures {
            match &best {
                Some(current) if current.specificity() >= err.specificity() => {}
                _ => best = Some(err),
            }
        }
        best.unwrap_or_else(|| Error::BackendNotFound("no backend was permitted".into()))
    }
}

/// Negotiates FUSE channels with whichever backend is available.
///
/// FUSE-T is preferred when it is installed. If it is not, the macFUSE
/// installations named by the request are searched in order. A backend
/// that is installed but fails is reported as is, without trying the
/// other one.
///
/// A backend counts as installed when its helper path exists, even if
/// that path cannot be run. Such an installation fails to launch rather
/// than being skipped.
#[derive(Clone)]
pub struct Negotiator {
    config: Config,
    spawner: Arc<dyn Spawner>,
}

impl std::fmt::Debug for Negotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Negotiator {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            spawner: Arc::new(ProcessSpawner),
        }
    }

    /// Use a different mechanism to launch mount helpers.
    pub fn with_spawner(mut self, spawner: Arc<dyn Spawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start a mount of the requested path.
    ///
    /// On success, the channel in the returned outcome must not be
    /// used until the readiness signal has resolved.
    pub async fn mount(&self, request: &MountRequest) -> Result<Handoff> {
        let forced = request.forced_backend();
        let mut selection = Selection::new();
        tracing::debug!(
            mountpoint = %request.mountpoint().display(),
            %forced,
            "negotiating fuse mount"
        );

        if forced.allows(Backend::FuseT) {
            selection.advance(SelectorState::TryingModern);
            let program = &self.config.fuset.path;
            if program.exists() {
                // an installed but failing FUSE-T is reported, not skipped
                return match fuse_t::mount(
                    self.spawner.as_ref(),
                    program,
                    request,
                    self.config.mount.io_size,
                ) {
                    Ok(handoff) => Ok(selection.succeed(handoff)),
                    Err(err) => {
                        selection.fail(err);
                        Err(selection.exhaust())
                    }
                };
            }
            selection.fail(Error::BackendNotFound(format!(
                "FUSE-T server not found at {}",
                program.display()
            )));
        }

        if forced.allows(Backend::MacFuse) {
            selection.advance(SelectorState::TryingLegacy);
            let locations = request.legacy_locations();
            match locations.iter().find(|l| l.mount.exists()) {
                Some(location) => {
                    tracing::debug!(location = %location.name, "found macFUSE installation");
                    match macfuse::mount(
                        self.spawner.as_ref(),
                        location,
                        request,
                        self.config.mount.io_size,
                        self.config.exit_grace(),
                    )
                    .await
                    {
                        Ok(handoff) => return Ok(selection.succeed(handoff)),
                        Err(err) => selection.fail(err),
                    }
                }
                None => {
                    let searched: Vec<_> = locations
                        .iter()
                        .map(|l| l.mount.display().to_string())
                        .collect();
                    selection.fail(Error::BackendNotFound(format!(
                        "no macFUSE installation in [{}]",
                        searched.join(", ")
                    )));
                }
            }
        }

        Err(selection.exhaust())
    }
}
