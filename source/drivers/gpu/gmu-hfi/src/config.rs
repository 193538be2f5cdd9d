// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Link tunables loaded from TOML
//! DEPS: serde, toml, std::fs (file operations)
//! OWNERS: @gpu
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests (host), tempfile-backed load tests

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::{self, ProtocolVersion};
use crate::table::DEFAULT_QUEUE_WORDS;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read link config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse link config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid link config: {0}")]
    Invalid(&'static str),
}

/// Tunables for one host-firmware link. Every field has a default, so an empty
/// file is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkConfig {
    /// Protocol spoken on the queues.
    pub protocol_major: u8,
    pub protocol_minor: u8,
    /// Firmware version the host was built against.
    pub fw_major: u32,
    pub fw_minor: u32,
    /// Legacy hardware queue indices and INIT handshake.
    pub legacy_layout: bool,
    /// Words per ring.
    pub queue_words: usize,
    /// Enables the first dispatch queue.
    pub dispatch_queue: bool,
    pub response_timeout_ms: u64,
    /// Deadline for FW_VER and CORE_FW_START.
    pub long_op_timeout_ms: u64,
    /// Slice a waiting sender sleeps before draining the message queue itself.
    pub poll_interval_us: u64,
    /// How long a busy command queue is retried where retrying is allowed.
    pub busy_budget_ms: u64,
    /// Whether a response timeout faults the link.
    pub fault_on_timeout: bool,
    /// Sends TEST before START on protocol 1.
    pub test_handshake: bool,
    /// Debug buffer announced in INIT on the legacy layout.
    pub dbg_buffer_addr: u32,
    pub dbg_buffer_size: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            protocol_major: 2,
            protocol_minor: 0,
            fw_major: 2,
            fw_minor: 0,
            legacy_layout: false,
            queue_words: DEFAULT_QUEUE_WORDS,
            dispatch_queue: false,
            response_timeout_ms: 100,
            long_op_timeout_ms: 1000,
            poll_interval_us: 100,
            busy_budget_ms: 10,
            fault_on_timeout: true,
            test_handshake: false,
            dbg_buffer_addr: 0,
            dbg_buffer_size: 0,
        }
    }
}

impl LinkConfig {
    /// Reads and validates a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::parse(&data, path)
    }

    /// Parses and validates TOML text.
    pub fn from_toml_str(data: &str) -> Result<Self, ConfigError> {
        Self::parse(data, Path::new("<inline>"))
    }

    fn parse(data: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(data)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=2).contains(&self.protocol_major) {
            return Err(ConfigError::Invalid("protocol_major must be 1 or 2"));
        }
        if self.queue_words < 16 || self.queue_words % codec::QUEUE_ALIGN_WORDS != 0 {
            return Err(ConfigError::Invalid("queue_words must be a multiple of 4, at least 16"));
        }
        if self.response_timeout_ms == 0 || self.long_op_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero"));
        }
        if self.poll_interval_us == 0 {
            return Err(ConfigError::Invalid("poll_interval_us must be non-zero"));
        }
        if self.fw_major > 0xF || self.fw_minor > 0xFFF {
            return Err(ConfigError::Invalid("firmware version out of range"));
        }
        Ok(())
    }

    pub fn protocol(&self) -> ProtocolVersion {
        ProtocolVersion::new(self.protocol_major, self.protocol_minor)
    }

    /// Version word offered in FW_VER.
    pub fn fw_version_word(&self) -> u32 {
        codec::version_word(self.fw_major, self.fw_minor)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn long_op_timeout(&self) -> Duration {
        Duration::from_millis(self.long_op_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    pub fn busy_budget(&self) -> Duration {
        Duration::from_millis(self.busy_budget_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn empty_file_yields_defaults() {
        let config = LinkConfig::from_toml_str("").unwrap();
        assert_eq!(config, LinkConfig::default());
        assert_eq!(config.protocol(), ProtocolVersion::V2);
        assert_eq!(config.response_timeout(), Duration::from_millis(100));
        assert_eq!(config.fw_version_word(), 0x2000_0000);
    }

    #[test]
    fn load_overrides_and_validates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("link.toml");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "protocol_major = 1\nlegacy_layout = true\nqueue_words = 256\nresponse_timeout_ms = 250").unwrap();

        let config = LinkConfig::load(&path).unwrap();
        assert_eq!(config.protocol(), ProtocolVersion::V1);
        assert!(config.legacy_layout);
        assert_eq!(config.queue_words, 256);
        assert_eq!(config.response_timeout(), Duration::from_millis(250));
        assert!(config.fault_on_timeout);
    }

    #[test]
    fn rejects_bad_values() {
        let config = LinkConfig { queue_words: 10, ..LinkConfig::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        let config = LinkConfig { protocol_major: 3, ..LinkConfig::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        let config = LinkConfig { queue_words: 12, ..LinkConfig::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        let config = LinkConfig { queue_words: 16, ..LinkConfig::default() };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn reports_parse_and_read_errors_with_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "queue_wordz = 4").unwrap();
        let err = LinkConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("bad.toml"));

        let err = LinkConfig::load(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
