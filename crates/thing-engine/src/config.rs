// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Thing configuration.
//!
//! Supports both programmatic and file-based (TOML) configuration.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

use crate::error::ThingError;
use crate::protocol::{DEVICE_NAME_LEN, HEADER_SIZE, MAX_MESSAGE_SIZE};
use crate::registry::Registry;
use crate::transport;

/// Engine and runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThingConfig {
    /// Device name sent in REGISTER_REQ.
    #[serde(default = "default_name")]
    pub name: String,

    /// Resend window for unanswered requests (milliseconds).
    #[serde(default = "default_resend_timeout")]
    pub resend_timeout_ms: u64,

    /// TIME period given to newly registered items (seconds).
    #[serde(default = "default_period")]
    pub default_period_secs: u16,

    /// Largest message the link carries.
    #[serde(default = "default_mtu")]
    pub mtu: usize,

    /// Protocol task tick (milliseconds).
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Capacity of each runner queue, in messages.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Gateway address (`host:port`) for the network transports.
    #[serde(default)]
    pub gateway: Option<String>,
}

fn default_name() -> String {
    "Thing".to_string()
}

fn default_resend_timeout() -> u64 {
    15_000
}

fn default_period() -> u16 {
    crate::registry::DEFAULT_PERIOD_SECS
}

fn default_mtu() -> usize {
    crate::MAX_PACKET_SIZE
}

fn default_tick_interval() -> u64 {
    10
}

fn default_queue_depth() -> usize {
    8
}

impl Default for ThingConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            resend_timeout_ms: default_resend_timeout(),
            default_period_secs: default_period(),
            mtu: default_mtu(),
            tick_interval_ms: default_tick_interval(),
            queue_depth: default_queue_depth(),
            gateway: None,
        }
    }
}

impl ThingConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ThingError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> Result<Self, ThingError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration. Returns Ok(()) if valid.
    pub fn validate(&self) -> Result<(), ThingError> {
        if self.name.is_empty() {
            return Err(ThingError::InvalidConfig("name must not be empty".into()));
        }
        if self.name.len() > DEVICE_NAME_LEN {
            return Err(ThingError::InvalidConfig(format!(
                "name must be <= {} bytes",
                DEVICE_NAME_LEN
            )));
        }
        if self.resend_timeout_ms == 0 {
            return Err(ThingError::InvalidConfig(
                "resend_timeout_ms must be > 0".into(),
            ));
        }
        if self.default_period_secs == 0 {
            return Err(ThingError::InvalidConfig(
                "default_period_secs must be > 0".into(),
            ));
        }
        // Must carry a credential message, and payload_len is a u8.
        if self.mtu < MAX_MESSAGE_SIZE || self.mtu > HEADER_SIZE + u8::MAX as usize {
            return Err(ThingError::InvalidConfig(format!(
                "mtu must be in {}..={}",
                MAX_MESSAGE_SIZE,
                HEADER_SIZE + u8::MAX as usize
            )));
        }
        if self.tick_interval_ms == 0 {
            return Err(ThingError::InvalidConfig(
                "tick_interval_ms must be > 0".into(),
            ));
        }
        if self.queue_depth == 0 {
            return Err(ThingError::InvalidConfig("queue_depth must be > 0".into()));
        }
        Ok(())
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_resend_timeout(mut self, ms: u64) -> Self {
        self.resend_timeout_ms = ms;
        self
    }

    pub fn with_gateway(mut self, addr: impl Into<String>) -> Self {
        self.gateway = Some(addr.into());
        self
    }

    /// Empty registry whose items start with `default_period_secs`.
    pub fn registry<const N: usize>(&self) -> Registry<N> {
        Registry::with_default_period(self.default_period_secs)
    }

    /// Resolved gateway address; `None` when not configured.
    pub fn gateway_addr(&self) -> Result<Option<SocketAddr>, ThingError> {
        match self.gateway.as_deref() {
            Some(addr) => Ok(Some(transport::resolve(addr)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = ThingConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.name, "Thing");
        assert_eq!(cfg.resend_timeout_ms, 15_000);
        assert_eq!(cfg.default_period_secs, 30);
        assert_eq!(cfg.mtu, 128);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg = ThingConfig::from_toml(
            r#"
            name = "kitchen-thermo"
            resend_timeout_ms = 3000
            gateway = "192.168.1.10:8884"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.name, "kitchen-thermo");
        assert_eq!(cfg.resend_timeout_ms, 3000);
        assert_eq!(cfg.gateway.as_deref(), Some("192.168.1.10:8884"));
        assert_eq!(cfg.queue_depth, 8);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let bad = [
            ThingConfig::default().with_name(""),
            ThingConfig::default().with_name("x".repeat(65)),
            ThingConfig::default().with_resend_timeout(0),
            ThingConfig {
                mtu: 64,
                ..Default::default()
            },
            ThingConfig {
                mtu: 258,
                ..Default::default()
            },
            ThingConfig {
                queue_depth: 0,
                ..Default::default()
            },
            ThingConfig {
                default_period_secs: 0,
                ..Default::default()
            },
        ];
        for cfg in bad {
            assert!(
                matches!(cfg.validate(), Err(ThingError::InvalidConfig(_))),
                "{:?}",
                cfg
            );
        }
    }

    #[test]
    fn test_from_toml_reports_errors() {
        assert!(matches!(
            ThingConfig::from_toml("mtu = \"big\""),
            Err(ThingError::ConfigParse(_))
        ));
        assert!(matches!(
            ThingConfig::from_toml("mtu = 16"),
            Err(ThingError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_registry_and_gateway_helpers() {
        let cfg = ThingConfig {
            default_period_secs: 7,
            ..Default::default()
        };
        let mut reg = cfg.registry::<2>();
        let id = reg
            .register(
                0,
                "LED",
                crate::types::type_id::SWITCH,
                crate::types::ValueType::Bool,
                0,
                crate::registry::Binding::Cell(crate::registry::SharedCell::boolean(false)),
            )
            .unwrap();
        assert_eq!(reg.config_of(id).unwrap().period_secs, 7);

        assert_eq!(cfg.gateway_addr().unwrap(), None);
        let cfg = cfg.with_gateway("127.0.0.1:8884");
        assert_eq!(
            cfg.gateway_addr().unwrap(),
            Some("127.0.0.1:8884".parse().unwrap())
        );
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("thing.toml");
        std::fs::write(&path, "name = \"porch-light\"\n").unwrap();
        assert_eq!(ThingConfig::from_file(&path).unwrap().name, "porch-light");
        assert!(matches!(
            ThingConfig::from_file(dir.path().join("missing.toml")),
            Err(ThingError::ConfigIo(_))
        ));
    }
}
