// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[cfg(test)]
#[path = "./request_test.rs"]
mod request_test;

/// The external mechanisms that can produce a FUSE channel on macOS
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Backend {
    /// The legacy, kernel extension based macFUSE (formerly OSXFUSE)
    #[strum(to_string = "macfuse", serialize = "legacy")]
    #[serde(rename = "macfuse", alias = "legacy")]
    MacFuse,
    /// The userspace, NFS based FUSE-T
    #[strum(to_string = "fuse-t", serialize = "modern")]
    #[serde(alias = "modern")]
    FuseT,
}

/// Restricts which backend a mount attempt may use.
///
/// When unset, FUSE-T is preferred and macFUSE is used as a fallback.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum ForcedBackend {
    #[default]
    #[strum(to_string = "unset", serialize = "auto")]
    #[serde(alias = "auto")]
    Unset,
    #[strum(to_string = "macfuse", serialize = "legacy")]
    #[serde(rename = "macfuse", alias = "legacy")]
    MacFuse,
    #[strum(to_string = "fuse-t", serialize = "modern")]
    #[serde(alias = "modern")]
    FuseT,
}

impl ForcedBackend {
    pub fn is_unset(&self) -> bool {
        matches!(self, Self::Unset)
    }

    /// True if the given backend may be attempted under this setting.
    pub fn allows(&self, backend: Backend) -> bool {
        match self {
            Self::Unset => true,
            Self::MacFuse => backend == Backend::MacFuse,
            Self::FuseT => backend == Backend::FuseT,
        }
    }
}

/// A place where a macFUSE-style installation may be found
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyLocation {
    /// A short name for this installation, used in logs and errors
    pub name: String,
    /// The mount helper program of this installation
    pub mount: PathBuf,
}

impl LegacyLocation {
    pub fn new<N: Into<String>, P: Into<PathBuf>>(name: N, mount: P) -> Self {
        Self {
            name: name.into(),
            mount: mount.into(),
        }
    }

    /// macFUSE 4 and later
    pub fn macfuse_v4() -> Self {
        Self::new(
            "macfuse",
            "/Library/Filesystems/macfuse.fs/Contents/Resources/mount_macfuse",
        )
    }

    /// OSXFUSE 3
    pub fn osxfuse_v3() -> Self {
        Self::new(
            "osxfuse",
            "/Library/Filesystems/osxfuse.fs/Contents/Resources/mount_osxfuse",
        )
    }

    /// The locations searched when none are configured, newest first
    pub fn defaults() -> Vec<Self> {
        vec![Self::macfuse_v4(), Self::osxfuse_v3()]
    }
}

/// Everything the caller decides about a single mount attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    mountpoint: PathBuf,
    read_only: bool,
    display_name: Option<String>,
    legacy_locations: Option<Vec<LegacyLocation>>,
    forced_backend: ForcedBackend,
    options: Vec<String>,
}

impl MountRequest {
    pub fn new<P: Into<PathBuf>>(mountpoint: P) -> Self {
        Self {
            mountpoint: mountpoint.into(),
            read_only: false,
            display_name: None,
            legacy_locations: None,
            forced_backend: ForcedBackend::Unset,
            options: Vec::new(),
        }
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// The name shown for the mounted volume
    pub fn with_display_name<S: Into<String>>(mut self, name: S) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Search these locations for a macFUSE installation, in order,
    /// instead of the defaults
    pub fn with_legacy_locations(mut self, locations: Vec<LegacyLocation>) -> Self {
        self.legacy_locations = Some(locations);
        self
    }

    pub fn with_forced_backend(mut self, forced: ForcedBackend) -> Self {
        self.forced_backend = forced;
        self
    }

    /// Add a raw macFUSE mount option (eg: `allow_other` or `iosize=4096`)
    ///
    /// Options are passed to the helper exactly as given.
    pub fn with_option<S: Into<String>>(mut self, option: S) -> Self {
        self.options.push(option.into());
        self
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref().filter(|n| !n.is_empty())
    }

    pub fn forced_backend(&self) -> ForcedBackend {
        self.forced_backend
    }

    pub fn legacy_locations(&self) -> Vec<LegacyLocation> {
        self.legacy_locations
            .clone()
            .unwrap_or_else(LegacyLocation::defaults)
    }

    pub fn options(&self) -> &[String] {
        &self.options
    }

    /// The comma separated option string understood by the macFUSE
    /// mount helpers.
    pub fn legacy_option_string(&self) -> String {
        let mut options = Vec::new();
        if let Some(name) = self.display_name() {
            options.push(format!("fsname={name}"));
        }
        if self.read_only {
            options.push("ro".to_string());
        }
        options.extend(self.options.iter().filter(|o| !o.is_empty()).cloned());
        options.join(",")
    }
}
