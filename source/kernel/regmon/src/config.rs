// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Monitor configuration: region table, writeback alias, bypass handling
//! OWNERS: @kernel-team
//! PUBLIC API: MonitorConfig, BypassPolicy, ConfigError, LoadError (std), DEFAULT_WRITEBACK_OFFSET
//! DEPENDS_ON: region::RegionRegistry; serde + toml behind the `std` feature
//! INVARIANTS: A MonitorConfig always holds a validated region table
//!
//! File format (all keys optional; no `[[region]]` means the built-in table):
//!
//! ```toml
//! writeback_offset = 0x700000
//! bypass = "write-through"   # or "deny"
//!
//! [[region]]
//! base = 0xf9016000
//! end = 0xf9017000
//! device = 5
//! bypass_cutoff = 0xf9016100 # optional
//! ```

use crate::region::{RegionError, RegionRegistry};

/// Distance from a guarded virtual address to its writable alias.
pub const DEFAULT_WRITEBACK_OFFSET: usize = 0x70_0000;

/// What to do with a write that lands in a bypass sub-range.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(serde::Deserialize))]
#[cfg_attr(feature = "std", serde(rename_all = "kebab-case"))]
pub enum BypassPolicy {
    /// Forward the write unchecked (logged and counted).
    #[default]
    WriteThrough,
    /// Suppress the write as if it had been denied.
    Deny,
}

/// Errors raised while building a configuration.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid region table: {0}")]
    Invalid(#[from] RegionError),
    #[error("writeback offset {offset:#x} pushes region {base:#x} past the address space")]
    WritebackOutOfRange { base: usize, offset: usize },
}

/// Everything a `TrapDispatcher` needs besides its hardware handles.
///
/// Fields are private so every instance has passed the alias range check.
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    regions: RegionRegistry,
    writeback_offset: usize,
    bypass: BypassPolicy,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            regions: RegionRegistry::builtin(),
            writeback_offset: DEFAULT_WRITEBACK_OFFSET,
            bypass: BypassPolicy::default(),
        }
    }
}

impl MonitorConfig {
    /// Checks that every guarded address has a representable alias.
    pub fn new(
        regions: RegionRegistry,
        writeback_offset: usize,
        bypass: BypassPolicy,
    ) -> Result<Self, ConfigError> {
        check_alias_range(&regions, writeback_offset)?;
        Ok(Self { regions, writeback_offset, bypass })
    }

    pub fn regions(&self) -> &RegionRegistry {
        &self.regions
    }

    pub fn writeback_offset(&self) -> usize {
        self.writeback_offset
    }

    pub fn bypass(&self) -> BypassPolicy {
        self.bypass
    }

    pub fn with_bypass(mut self, bypass: BypassPolicy) -> Self {
        self.bypass = bypass;
        self
    }

    pub fn with_writeback_offset(mut self, offset: usize) -> Result<Self, ConfigError> {
        check_alias_range(&self.regions, offset)?;
        self.writeback_offset = offset;
        Ok(self)
    }

    pub fn with_regions(mut self, regions: RegionRegistry) -> Result<Self, ConfigError> {
        check_alias_range(&regions, self.writeback_offset)?;
        self.regions = regions;
        Ok(self)
    }

    pub(crate) fn into_parts(self) -> (RegionRegistry, usize, BypassPolicy) {
        (self.regions, self.writeback_offset, self.bypass)
    }
}

fn check_alias_range(regions: &RegionRegistry, offset: usize) -> Result<(), ConfigError> {
    match regions.regions().iter().find(|r| r.end.checked_add(offset).is_none()) {
        Some(region) => Err(ConfigError::WritebackOutOfRange { base: region.base, offset }),
        None => Ok(()),
    }
}

#[cfg(feature = "std")]
pub use load::LoadError;

#[cfg(feature = "std")]
mod load {
    use std::fs;
    use std::path::{Path, PathBuf};

    use serde::Deserialize;

    use super::{BypassPolicy, ConfigError, MonitorConfig, DEFAULT_WRITEBACK_OFFSET};
    use crate::region::{ProtectedRegion, RegionRegistry};
    use crate::types::DeviceId;

    /// Errors raised while loading a TOML configuration.
    #[derive(Debug, thiserror::Error)]
    pub enum LoadError {
        #[error("failed to read config file {path}: {source}")]
        Read {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
        #[error("failed to parse config: {source}")]
        Parse {
            #[source]
            source: toml::de::Error,
        },
        #[error(transparent)]
        Config(#[from] ConfigError),
    }

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct RawConfig {
        #[serde(default = "default_offset")]
        writeback_offset: usize,
        #[serde(default)]
        bypass: BypassPolicy,
        #[serde(default, rename = "region")]
        regions: Vec<RawRegion>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct RawRegion {
        base: usize,
        end: usize,
        device: u8,
        #[serde(default)]
        bypass_cutoff: Option<usize>,
    }

    fn default_offset() -> usize {
        DEFAULT_WRITEBACK_OFFSET
    }

    impl MonitorConfig {
        /// Parses a TOML document.
        pub fn from_toml_str(data: &str) -> Result<Self, LoadError> {
            let raw: RawConfig = toml::from_str(data).map_err(|source| LoadError::Parse { source })?;
            let regions = if raw.regions.is_empty() {
                RegionRegistry::builtin()
            } else {
                RegionRegistry::new(
                    raw.regions
                        .into_iter()
                        .map(|r| ProtectedRegion::new(r.base, r.end, DeviceId(r.device), r.bypass_cutoff))
                        .collect(),
                )
                .map_err(ConfigError::from)?
            };
            Ok(Self::new(regions, raw.writeback_offset, raw.bypass)?)
        }

        /// Reads and parses the TOML file at `path`.
        pub fn load(path: &Path) -> Result<Self, LoadError> {
            let data = fs::read_to_string(path)
                .map_err(|source| LoadError::Read { path: path.to_path_buf(), source })?;
            let config = Self::from_toml_str(&data)?;
            log::info!(
                target: "regmon::config",
                "loaded {} region(s) from {}",
                config.regions().regions().len(),
                path.display()
            );
            Ok(config)
        }
    }
}
