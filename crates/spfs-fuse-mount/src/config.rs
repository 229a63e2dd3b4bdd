// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::request::{ForcedBackend, LegacyLocation, MountRequest};
use crate::Result;

#[cfg(test)]
#[path = "./config_test.rs"]
mod config_test;

static SYSTEM_CONFIG: &str = "/etc/spfs/mount";
static USER_CONFIG: &str = ".config/spfs/mount";

/// Environment variables with this prefix override config values,
/// as `SPFS_<SECTION>_<NAME>` (eg: `SPFS_MOUNT_BACKEND=fuse-t`).
const ENV_PREFIX: &str = "SPFS_";

/// The variable that FUSE-T itself honors to relocate its server.
pub const FUSE_T_PATH_VAR: &str = "FUSE_NFSSRV_PATH";

const DEFAULT_FUSE_T_PATH: &str = "/usr/local/bin/go-nfsv4";
const DEFAULT_IO_SIZE: u64 = 128 * 1024;
const DEFAULT_EXIT_GRACE_MS: u64 = 250;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Mount {
    /// Only ever attempt this backend, instead of preferring FUSE-T
    /// and falling back to macFUSE
    pub backend: ForcedBackend,

    /// The largest single read or write, in bytes, that the kernel
    /// should send to the filesystem
    ///
    /// macFUSE splits larger writes into multiple requests based on
    /// this value, regardless of what the filesystem reports at init.
    pub io_size: u64,

    /// How long to keep watching the macFUSE mount helper for a
    /// failure after the channel was received, before the mount is
    /// reported as ready.
    pub exit_grace_ms: u64,
}

impl Default for Mount {
    fn default() -> Self {
        Self {
            backend: ForcedBackend::Unset,
            io_size: DEFAULT_IO_SIZE,
            exit_grace_ms: DEFAULT_EXIT_GRACE_MS,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct FuseT {
    /// The FUSE-T NFS server program
    pub path: PathBuf,
}

impl Default for FuseT {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_FUSE_T_PATH),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct MacFuse {
    /// Installations to look for, in order of preference
    pub locations: Vec<LegacyLocation>,
}

impl Default for MacFuse {
    fn default() -> Self {
        Self {
            locations: LegacyLocation::defaults(),
        }
    }
}

/// Configuration values for negotiating FUSE mounts.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    // These sub-types should aim to only have one level of
    // values within them, otherwise they become impossible to address
    // with environment variables.
    pub mount: Mount,
    pub fuset: FuseT,
    pub macfuse: MacFuse,
}

impl Config {
    /// Load the config from disk and the current environment
    pub fn load() -> Result<Self> {
        load_config()
    }

    /// Start a request for the given mountpoint using the configured
    /// backend preference and installation locations.
    pub fn request_for<P: Into<PathBuf>>(&self, mountpoint: P) -> MountRequest {
        MountRequest::new(mountpoint)
            .with_forced_backend(self.mount.backend)
            .with_legacy_locations(self.macfuse.locations.clone())
    }

    pub fn exit_grace(&self) -> Duration {
        Duration::from_millis(self.mount.exit_grace_ms)
    }
}

/// Load the mount configuration, even if it has already been loaded.
///
/// This includes the default, system and user configurations (if they exist)
/// as well as any overrides from the environment.
pub fn load_config() -> Result<Config> {
    load_config_from_env(std::env::vars())
}

/// Load the mount configuration using the given environment
/// instead of the one of the current process.
pub fn load_config_from_env<I>(vars: I) -> Result<Config>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut files = vec![PathBuf::from(SYSTEM_CONFIG)];
    if let Some(home) = dirs::home_dir() {
        files.push(home.join(USER_CONFIG));
    }
    load_from(&files, vars)
}

fn load_from<I>(files: &[PathBuf], vars: I) -> Result<Config>
where
    I: IntoIterator<Item = (String, String)>,
{
    use config::{Config as RawConfig, File};

    let mut config_builder = RawConfig::builder();
    for file in files {
        // any format supported by the config crate: toml, yaml, json, ini, etc
        config_builder =
            config_builder.add_source(File::with_name(&path_name(file)).required(false));
    }

    let mut fuse_t_path = None;
    for (var, value) in vars {
        if var == FUSE_T_PATH_VAR {
            if !value.is_empty() {
                fuse_t_path = Some(value);
            }
            continue;
        }
        let Some(tail) = var.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let Some((section, name)) = tail.split_once('_') else {
            // typically, a value with no section is not a configuration
            // value, and can be skipped (eg: SPFS_LOG)
            continue;
        };

        let key = format!("{}.{}", section.to_lowercase(), name.to_lowercase());
        config_builder = config_builder.set_override(key, value)?;
    }
    if let Some(path) = fuse_t_path {
        config_builder = config_builder.set_override("fuset.path", path)?;
    }

    let config = config_builder.build()?;
    Ok(Config::deserialize(config)?)
}

fn path_name(path: &Path) -> String {
    format!("{}", path.display())
}
