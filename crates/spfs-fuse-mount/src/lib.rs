// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Negotiation of a FUSE kernel channel on macOS.
//!
//! A FUSE filesystem on macOS cannot open its kernel channel directly.
//! Instead, one of two externally installed mount helpers is run and
//! hands back a connected descriptor:
//!
//! - FUSE-T, which serves the filesystem to the kernel over NFS and is
//!   preferred whenever it is installed
//! - macFUSE (formerly OSXFUSE), which uses a kernel extension
//!
//! ```no_run
//! # async fn run() -> spfs_fuse_mount::Result<()> {
//! let config = spfs_fuse_mount::Config::load()?;
//! let request = config.request_for("/spfs").with_read_only(true);
//! let handoff = spfs_fuse_mount::Negotiator::new(config).mount(&request).await?;
//! handoff.ready.wait().await?;
//! // the channel in handoff.outcome can now be served
//! # Ok(())
//! # }
//! ```

mod ancillary;
mod config;
mod endpoint;
mod error;
mod fuse_t;
mod launcher;
mod macfuse;
mod request;
mod selector;
mod signal;

#[cfg(test)]
mod fixtures;

pub use ancillary::{decode_rights, receive_descriptor};
pub use self::config::{
    Config,
    FUSE_T_PATH_VAR,
    FuseT,
    MacFuse,
    Mount,
    load_config,
    load_config_from_env,
};
pub use endpoint::{Endpoint, EndpointPair};
pub use error::{Error, Result};
pub use launcher::{
    FIRST_INHERITED_SLOT,
    Helper,
    HelperExit,
    Launch,
    ProcessSpawner,
    Spawner,
    ensure_launchable,
};
pub use request::{Backend, ForcedBackend, LegacyLocation, MountRequest};
pub use selector::{Handoff, MountOutcome, Negotiator, SelectorState};
pub use signal::{Readiness, Termination};

/// Mount the requested path using the configuration found on this
/// system and in the current environment.
pub async fn mount(request: &MountRequest) -> Result<Handoff> {
    Negotiator::new(Config::load()?).mount(request).await
}
