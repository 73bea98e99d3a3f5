//! Kernel configuration
//!
//! Boot code builds a [`KernelConfig`] (usually the default, or parsed from
//! the boot image on hosted builds) and hands it to [`crate::Kernel::new`].

use serde::{Deserialize, Serialize};

/// Hard upper bound on cores, one bit per core in the global work mask.
pub const MAX_CPUS: usize = 64;

/// Kernel-wide configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Number of physical cores, each with its own scheduler
    #[serde(default = "default_cpus")]
    pub cpus: usize,

    /// Maximum number of live kernel objects
    #[serde(default = "default_max_objects")]
    pub max_objects: usize,

    /// Maximum number of entries in one capability directory
    #[serde(default = "default_cspace_quota")]
    pub cspace_quota: usize,

    /// Number of address-space identifiers, including the reserved ASID 0
    #[serde(default = "default_asid_count")]
    pub asid_count: u16,

    /// Number of scheduling priority levels (0 is lowest)
    #[serde(default = "default_priorities")]
    pub priorities: u8,

    /// Length of a scheduling super period in ticks
    #[serde(default = "default_super_period")]
    pub super_period: u64,

    /// Round-robin slice for contexts without remaining quota
    #[serde(default = "default_fill_slice")]
    pub fill_slice: u64,

    /// Quota of the core thread created at boot
    #[serde(default)]
    pub default_quota: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            cpus: default_cpus(),
            max_objects: default_max_objects(),
            cspace_quota: default_cspace_quota(),
            asid_count: default_asid_count(),
            priorities: default_priorities(),
            super_period: default_super_period(),
            fill_slice: default_fill_slice(),
            default_quota: 0,
        }
    }
}

fn default_cpus() -> usize {
    4
}

fn default_max_objects() -> usize {
    8192
}

fn default_cspace_quota() -> usize {
    4096
}

fn default_asid_count() -> u16 {
    256
}

fn default_priorities() -> u8 {
    4
}

fn default_super_period() -> u64 {
    1_000_000
}

fn default_fill_slice() -> u64 {
    10_000
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A field has a value the kernel cannot run with
    #[error("invalid value for `{field}`: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// What is wrong with it
        reason: &'static str,
    },
    /// The configuration document could not be parsed
    #[cfg(feature = "std")]
    #[error("malformed configuration: {0}")]
    Parse(String),
}

impl KernelConfig {
    /// Single-core configuration, handy for deterministic tests.
    pub fn uniprocessor() -> Self {
        Self {
            cpus: 1,
            ..Self::default()
        }
    }

    /// Check that the configuration describes a bootable kernel.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason| Err(ConfigError::Invalid { field, reason });

        if self.cpus == 0 {
            return invalid("cpus", "at least one core is required");
        }
        if self.cpus > MAX_CPUS {
            return invalid("cpus", "more cores than the work mask can address");
        }
        if self.max_objects == 0 || self.max_objects > u32::MAX as usize {
            return invalid("max_objects", "must fit a 32-bit object index");
        }
        if self.cspace_quota == 0 || self.cspace_quota >= u32::MAX as usize {
            return invalid("cspace_quota", "must fit a 32-bit capability id");
        }
        if self.asid_count < 2 {
            return invalid("asid_count", "ASID 0 is reserved, need at least one more");
        }
        if self.priorities == 0 {
            return invalid("priorities", "at least one priority level is required");
        }
        if self.fill_slice == 0 {
            return invalid("fill_slice", "round-robin slice must be non-zero");
        }
        if self.super_period < self.fill_slice {
            return invalid("super_period", "must be at least one fill slice");
        }
        Ok(())
    }

    /// Parse a TOML document, falling back to defaults for missing fields.
    #[cfg(feature = "std")]
    pub fn from_toml_str(document: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(document).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert_eq!(KernelConfig::default().validate(), Ok(()));
        assert_eq!(KernelConfig::uniprocessor().cpus, 1);
    }

    #[test]
    fn test_rejects_zero_cpus() {
        let config = KernelConfig {
            cpus: 0,
            ..KernelConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "cpus", .. })
        ));
    }

    #[test]
    fn test_rejects_reserved_only_asid_space() {
        let config = KernelConfig {
            asid_count: 1,
            ..KernelConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_short_super_period() {
        let config = KernelConfig {
            super_period: 10,
            fill_slice: 100,
            ..KernelConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "super_period", .. })
        ));
    }

    #[cfg(feature = "std")]
    #[test]
    fn test_from_toml_partial() {
        let config = KernelConfig::from_toml_str("cpus = 2\nfill_slice = 50\n").unwrap();
        assert_eq!(config.cpus, 2);
        assert_eq!(config.fill_slice, 50);
        assert_eq!(config.priorities, 4);
    }

    #[cfg(feature = "std")]
    #[test]
    fn test_from_toml_invalid() {
        assert!(matches!(
            KernelConfig::from_toml_str("cpus = 0"),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            KernelConfig::from_toml_str("cpus = \"many\""),
            Err(ConfigError::Parse(_))
        ));
    }
}
