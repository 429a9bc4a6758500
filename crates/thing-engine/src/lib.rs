// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Device-side ("thing") protocol engine for KNoT-style IoT gateways.
//!
//! Firmware declares its sensors and actuators as typed data items; the
//! engine registers the device with a gateway, authenticates, transfers the
//! item schemas and then exchanges values both ways over a compact binary
//! protocol.
//!
//! # Architecture
//!
//! ```text
//! Thing (this crate)                                    Gateway
//!   |                                                      |
//!   |--- REGISTER_REQ(device_id, name) ------------------->|   new device
//!   |<-- REGISTER_RESP(uuid, token) -----------------------|
//!   |--- SCHEMA(item 0) ... SCHEMA_END(item n) ----------->|   one per item
//!   |<-- SCHEMA_RESP ... SCHEMA_END_RESP ------------------|
//!   |                                                      |
//!   |--- AUTH_REQ(uuid, token) --------------------------->|   after reboot
//!   |<-- AUTH_RESP ----------------------------------------|
//!   |                                                      |
//!   |--- PUSH_DATA_REQ(item, value) ---------------------->|   send policy
//!   |<-- PUSH_DATA_RESP -----------------------------------|
//!   |<-- PUSH_DATA_REQ / POLL_DATA_REQ / PUSH_CONFIG_REQ --|   commands
//! ```
//!
//! # Layers
//!
//! | Module | Role |
//! |--------|------|
//! | [`types`] | value types, type-id/unit tables, schemas |
//! | [`protocol`] | wire codec |
//! | [`registry`] | data items, event configuration, send policy |
//! | [`engine`] | REG / AUTH / SCHEMA / ONLINE / ERROR state machine |
//! | [`storage`] | persisted device identity |
//! | [`transport`] | UDP, TCP and in-process links |
//! | [`runner`] | net + protocol threads joined by bounded queues |
//!
//! # Example
//!
//! ```
//! use thing_engine::engine::ManualClock;
//! use thing_engine::registry::{Binding, SharedCell};
//! use thing_engine::storage::MemoryStore;
//! use thing_engine::types::{type_id, unit, ValueType};
//! use thing_engine::{Engine, ThingConfig, MAX_DATA_ITEMS};
//!
//! let config = ThingConfig::default();
//! let temperature = SharedCell::int(21);
//! let mut registry = config.registry::<MAX_DATA_ITEMS>();
//! registry
//!     .register(
//!         0,
//!         "THERMO",
//!         type_id::TEMPERATURE,
//!         ValueType::Int,
//!         unit::TEMPERATURE_C,
//!         Binding::Cell(temperature.clone()),
//!     )
//!     .unwrap();
//!
//! let mut engine = Engine::new(
//!     config,
//!     registry,
//!     MemoryStore::new(),
//!     Box::new(ManualClock::default()),
//! )
//! .unwrap();
//!
//! let mut out = [0u8; thing_engine::MAX_PACKET_SIZE];
//! let n = engine.run(&[], &mut out).unwrap();
//! assert_eq!(out[0], thing_engine::protocol::MSG_REGISTER_REQ);
//! assert_eq!(n, 74);
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod runner;
pub mod storage;
pub mod transport;
pub mod types;

/// Default link MTU.
pub const MAX_PACKET_SIZE: usize = 128;

/// Default registry capacity.
pub const MAX_DATA_ITEMS: usize = 8;

// Re-exports for convenience.
pub use config::ThingConfig;
pub use engine::{Clock, Engine, LinkStatus, ManualClock, State, StateKind, SystemClock};
pub use error::{
    AppError, CodecError, ConfigError, RegisterError, StorageError, ThingError, TransportError,
    WriteError,
};
pub use protocol::{decode, frame_len, Message, Opcode, WireConfig};
pub use registry::{
    Binding, DataSource, EventConfig, EventFlags, ItemCallbacks, ItemId, Limit, Registry,
    SharedCell,
};
pub use runner::{StatusIndicator, ThingRunner};
pub use storage::{DeviceIdentity, FileStore, IdentityStore, MemoryStore};
pub use transport::{ChannelTransport, TcpTransport, Transport, UdpTransport};
pub use types::{Schema, Value, ValueType};
