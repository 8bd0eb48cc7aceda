//! Monitor configuration
//!
//! A `MonitorConfig` describes the limits of one monitor instance and the
//! partitions it hosts. It is plain serde data, so an embedder can build it
//! in code or load it from JSON with [`MonitorConfig::from_json`].

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use serde::{Deserialize, Serialize};
use spci_abi::{MemAccess, PageRange, PartitionId, Version};
use spci_core::{Limits, StateError};
use spci_hal::HalError;
use thiserror::Error;
use uuid::Uuid;

/// Default audit ring size
pub const DEFAULT_SYSLOG_CAPACITY: usize = 4096;

/// Limits and partitions of one monitor instance
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Implemented protocol version
    pub version: Version,
    /// Largest page count accepted by `RXTX_MAP`
    pub max_mailbox_pages: u32,
    /// Capacity of the memory transaction table
    pub max_transactions: usize,
    /// Number of events the audit SysLog keeps
    pub syslog_capacity: usize,
    /// Run the invariant checker after every mutating call
    pub check_invariants: bool,
    /// Partitions registered at construction
    pub partitions: Vec<PartitionConfig>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        let limits = Limits::default();
        Self {
            version: Version::COMPILED,
            max_mailbox_pages: limits.max_mailbox_pages,
            max_transactions: limits.max_transactions,
            syslog_capacity: DEFAULT_SYSLOG_CAPACITY,
            check_invariants: false,
            partitions: Vec::new(),
        }
    }
}

/// One hosted partition
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionConfig {
    pub id: PartitionId,
    #[serde(default)]
    pub uuid: Uuid,
    #[serde(default = "default_execution_contexts")]
    pub execution_contexts: u16,
    #[serde(default)]
    pub properties: u32,
    /// Memory the partition owns at boot
    #[serde(default)]
    pub memory: Vec<MemoryConfig>,
}

/// A range of pages owned by a partition at boot
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub base: u64,
    pub page_count: u32,
    #[serde(default = "default_access")]
    pub access: MemAccess,
}

impl MemoryConfig {
    pub fn range(&self) -> PageRange {
        PageRange::new(self.base, self.page_count)
    }
}

fn default_execution_contexts() -> u16 {
    1
}

fn default_access() -> MemAccess {
    MemAccess::RW
}

/// Errors while loading a configuration or building a monitor from it
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Malformed monitor config: {0}")]
    Parse(String),
    #[error("Version major {0} does not fit in 15 bits")]
    InvalidVersion(u16),
    #[error("Mailbox page limit must be at least 1")]
    NoMailboxPages,
    #[error("SysLog capacity must be at least 1")]
    NoSyslogCapacity,
    #[error(transparent)]
    State(#[from] StateError),
    #[error("Mapper refused boot memory of {partition}: {source}")]
    Mapper {
        partition: PartitionId,
        #[source]
        source: HalError,
    },
}

impl MonitorConfig {
    /// Parse a configuration from JSON and validate it.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: MonitorConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the limits. Partition records are checked on registration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version.major > 0x7FFF {
            return Err(ConfigError::InvalidVersion(self.version.major));
        }
        if self.max_mailbox_pages == 0 {
            return Err(ConfigError::NoMailboxPages);
        }
        if self.syslog_capacity == 0 {
            return Err(ConfigError::NoSyslogCapacity);
        }
        Ok(())
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_mailbox_pages: self.max_mailbox_pages,
            max_transactions: self.max_transactions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MonitorConfig::default();
        assert_eq!(config.version, Version::COMPILED);
        assert_eq!(config.max_mailbox_pages, 1);
        assert_eq!(config.max_transactions, 64);
        assert_eq!(config.syslog_capacity, DEFAULT_SYSLOG_CAPACITY);
        assert!(!config.check_invariants);
        assert!(config.partitions.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json() {
        let config = MonitorConfig::from_json(
            r#"{
                "max_transactions": 8,
                "check_invariants": true,
                "partitions": [
                    {
                        "id": 1,
                        "uuid": "6e6f6e65-0000-0000-0000-000000000001",
                        "memory": [{ "base": 1048576, "page_count": 2 }]
                    },
                    { "id": 2, "execution_contexts": 4, "properties": 3 }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.max_transactions, 8);
        assert_eq!(config.max_mailbox_pages, 1);
        assert!(config.check_invariants);
        assert_eq!(config.partitions.len(), 2);

        let first = &config.partitions[0];
        assert_eq!(first.id, PartitionId(1));
        assert_eq!(first.execution_contexts, 1);
        assert_eq!(
            first.uuid,
            Uuid::from_u128(0x6e6f6e65_0000_0000_0000_000000000001)
        );
        assert_eq!(first.memory[0].range(), PageRange::new(0x10_0000, 2));
        assert_eq!(first.memory[0].access, MemAccess::RW);

        let second = &config.partitions[1];
        assert_eq!(second.uuid, Uuid::nil());
        assert_eq!(second.execution_contexts, 4);
        assert_eq!(second.properties, 3);
        assert!(second.memory.is_empty());
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        let err = MonitorConfig::from_json("{ \"partitions\": 7 }").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_zero_mailbox_pages_rejected() {
        let err = MonitorConfig::from_json(r#"{ "max_mailbox_pages": 0 }"#).unwrap_err();
        assert_eq!(err, ConfigError::NoMailboxPages);
    }

    #[test]
    fn test_oversized_major_rejected() {
        let config = MonitorConfig {
            version: Version::new(0x8000, 0),
            ..MonitorConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidVersion(0x8000)));
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = MonitorConfig {
            partitions: alloc::vec![PartitionConfig {
                id: PartitionId(5),
                uuid: Uuid::from_u128(5),
                execution_contexts: 2,
                properties: 1,
                memory: alloc::vec![MemoryConfig {
                    base: 0x4000,
                    page_count: 1,
                    access: MemAccess::READ,
                }],
            }],
            ..MonitorConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(MonitorConfig::from_json(&json).unwrap(), config);
    }
}
