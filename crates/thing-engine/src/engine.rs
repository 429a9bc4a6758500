// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Protocol state machine.
//
// REG -> SCHEMA -> ONLINE for a new device, AUTH -> ONLINE once an identity
// is stored. ERROR is terminal until restart(). Each run() call consumes at
// most one inbound message and produces at most one outbound message; it
// never blocks.
//
// One request is in flight at a time. The Timer keeps its bytes, the
// response opcode that answers it and the resend deadline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ThingConfig;
use crate::error::{CodecError, ConfigError, ThingError, WriteError};
use crate::protocol::{
    self, Message, Opcode, Token, Uuid, WireConfig, MAX_MESSAGE_SIZE, RESULT_ERR_INVALID,
    RESULT_ERR_PERM, RESULT_SUCCESS,
};
use crate::registry::{EventConfig, ItemId, Registry};
use crate::storage::{DeviceIdentity, IdentityStore};
use crate::types::Value;

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Monotonic millisecond clock.
pub trait Clock: Send {
    fn now_ms(&self) -> u64;
}

/// Wall clock, counted from construction.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Clock moved by hand. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Engine state, with the data each state needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Registering with the gateway.
    Register,
    /// Authenticating with stored credentials.
    Auth,
    /// Sending the schema of `cursor`.
    Schema { cursor: ItemId },
    /// Polling items round-robin after `cursor`; `in_flight` awaits its ack.
    Online {
        cursor: Option<ItemId>,
        in_flight: Option<ItemId>,
    },
    /// Terminal until restart.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKind {
    Register,
    Auth,
    Schema,
    Online,
    Error,
}

impl State {
    pub fn kind(&self) -> StateKind {
        match self {
            Self::Register => StateKind::Register,
            Self::Auth => StateKind::Auth,
            Self::Schema { .. } => StateKind::Schema,
            Self::Online { .. } => StateKind::Online,
            Self::Error => StateKind::Error,
        }
    }
}

/// Coarse link status, for status indicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkStatus {
    Disconnected,
    Connected,
    Error,
}

// ---------------------------------------------------------------------------
// Timer
// ---------------------------------------------------------------------------

/// Resend timer for the single outstanding request.
#[derive(Debug, Clone, Default)]
pub struct Timer {
    deadline_ms: Option<u64>,
    expected: Option<Opcode>,
    request: heapless::Vec<u8, MAX_MESSAGE_SIZE>,
}

impl Timer {
    fn arm(&mut self, deadline_ms: u64, expected: Opcode, request: &[u8]) {
        self.deadline_ms = Some(deadline_ms);
        self.expected = Some(expected);
        self.request.clear();
        // Requests never exceed MAX_MESSAGE_SIZE.
        let _ = self.request.extend_from_slice(request);
    }

    fn disarm(&mut self) {
        self.deadline_ms = None;
        self.expected = None;
        self.request.clear();
    }

    pub fn is_armed(&self) -> bool {
        self.deadline_ms.is_some()
    }

    pub fn expired(&self, now_ms: u64) -> bool {
        self.deadline_ms.is_some_and(|d| now_ms >= d)
    }

    /// Response opcode that answers the outstanding request.
    pub fn expected(&self) -> Option<Opcode> {
        self.expected
    }

    /// Bytes of the outstanding request.
    pub fn request(&self) -> &[u8] {
        &self.request
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Non-zero random device id.
fn fresh_device_id() -> u64 {
    fastrand::u64(1..=u64::MAX)
}

/// The thing-side protocol engine.
pub struct Engine<S: IdentityStore, const N: usize> {
    config: ThingConfig,
    registry: Registry<N>,
    storage: S,
    clock: Box<dyn Clock>,
    state: State,
    timer: Timer,
    identity: DeviceIdentity,
}

impl<S: IdentityStore, const N: usize> Engine<S, N> {
    /// Create an engine over a populated registry.
    ///
    /// Starts in AUTH when `storage` holds an identity, else in REG with a
    /// fresh device id.
    pub fn new(
        config: ThingConfig,
        registry: Registry<N>,
        storage: S,
        clock: Box<dyn Clock>,
    ) -> Result<Self, ThingError> {
        config.validate()?;
        let mut engine = Self {
            config,
            registry,
            storage,
            clock,
            state: State::Error,
            timer: Timer::default(),
            identity: DeviceIdentity::new(0, Uuid::new(), Token::new()),
        };
        engine.restart()?;
        Ok(engine)
    }

    /// Re-evaluate the initial state from storage.
    pub fn restart(&mut self) -> Result<(), ThingError> {
        let next = match self.storage.load_identity()? {
            Some(identity) => {
                self.identity = identity;
                State::Auth
            }
            None => {
                self.identity = DeviceIdentity::new(fresh_device_id(), Uuid::new(), Token::new());
                State::Register
            }
        };
        self.enter(next);
        Ok(())
    }

    /// Tear down: move to ERROR and drop the outstanding request.
    pub fn stop(&mut self) {
        if self.state != State::Error {
            self.enter(State::Error);
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn link_status(&self) -> LinkStatus {
        match self.state.kind() {
            StateKind::Online => LinkStatus::Connected,
            StateKind::Error => LinkStatus::Error,
            _ => LinkStatus::Disconnected,
        }
    }

    pub fn config(&self) -> &ThingConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry<N> {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry<N> {
        &mut self.registry
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    /// Run one step.
    ///
    /// `inbound` holds at most one message (empty when nothing arrived).
    /// Returns the number of bytes written to `outbound`, 0 when there is
    /// nothing to send. Malformed input is dropped; errors only come from an
    /// `outbound` buffer too small for the message.
    pub fn run(&mut self, inbound: &[u8], outbound: &mut [u8]) -> Result<usize, ThingError> {
        let now = self.clock.now_ms();
        let msg = if inbound.is_empty() {
            None
        } else {
            match protocol::decode(inbound) {
                Ok(msg) => Some(msg),
                Err(e) => {
                    log::debug!("Dropping malformed message: {}", e);
                    None
                }
            }
        };

        match self.state {
            State::Register => self.run_register(msg, now, outbound),
            State::Auth => self.run_auth(msg, now, outbound),
            State::Schema { cursor } => self.run_schema(cursor, msg, now, outbound),
            State::Online { cursor, in_flight } => {
                self.run_online(cursor, in_flight, msg, now, outbound)
            }
            State::Error => Ok(0),
        }
    }

    // -----------------------------------------------------------------------
    // Strict states
    // -----------------------------------------------------------------------

    fn run_register(
        &mut self,
        msg: Option<Message>,
        now: u64,
        outbound: &mut [u8],
    ) -> Result<usize, ThingError> {
        if let Some(msg) = self.expected_response(msg) {
            match msg {
                Message::Credential {
                    result: RESULT_SUCCESS,
                    uuid,
                    token,
                } => {
                    log::info!("Registered as {}", uuid);
                    self.identity.uuid = uuid;
                    self.identity.token = token;
                    self.enter_schema();
                }
                other => {
                    log::error!("Registration refused: result={:?}", other.result());
                    self.enter(State::Error);
                }
            }
            return Ok(0);
        }

        if !self.timer.is_armed() {
            let n = protocol::encode_register(outbound, self.identity.device_id, &self.config.name)?;
            return Ok(self.send_request(now, outbound, n, Opcode::RegisterResp));
        }
        self.resend_if_expired(now, outbound)
    }

    fn run_auth(
        &mut self,
        msg: Option<Message>,
        now: u64,
        outbound: &mut [u8],
    ) -> Result<usize, ThingError> {
        if let Some(msg) = self.expected_response(msg) {
            if msg.result() == Some(RESULT_SUCCESS) {
                self.enter_online();
            } else {
                log::error!("Authentication refused: result={:?}", msg.result());
                self.enter(State::Error);
            }
            return Ok(0);
        }

        if !self.timer.is_armed() {
            let n = protocol::encode_auth(outbound, &self.identity.uuid, &self.identity.token)?;
            return Ok(self.send_request(now, outbound, n, Opcode::AuthResp));
        }
        self.resend_if_expired(now, outbound)
    }

    fn run_schema(
        &mut self,
        cursor: ItemId,
        msg: Option<Message>,
        now: u64,
        outbound: &mut [u8],
    ) -> Result<usize, ThingError> {
        if let Some(msg) = self.expected_response(msg) {
            if msg.result() != Some(RESULT_SUCCESS) {
                log::warn!(
                    "Schema of item {} rejected (result={:?}), resending",
                    cursor,
                    msg.result()
                );
                return self.resend(now, outbound);
            }
            if msg.opcode() == Opcode::SchemaEndResp {
                if let Err(e) = self.storage.save_identity(&self.identity) {
                    log::warn!("Failed to persist identity: {}", e);
                }
                self.enter_online();
                return Ok(0);
            }
            return match self.registry.next_registered(Some(cursor)) {
                Some(next) => {
                    self.timer.disarm();
                    self.state = State::Schema { cursor: next };
                    self.send_schema(next, now, outbound)
                }
                None => self.resend(now, outbound),
            };
        }

        if !self.timer.is_armed() {
            return self.send_schema(cursor, now, outbound);
        }
        self.resend_if_expired(now, outbound)
    }

    fn send_schema(
        &mut self,
        id: ItemId,
        now: u64,
        outbound: &mut [u8],
    ) -> Result<usize, ThingError> {
        let last = self.registry.next_registered(Some(id)).is_none();
        let n = match self.registry.schema_of(id) {
            Some(schema) => protocol::encode_schema(outbound, id.get(), schema, last)?,
            None => {
                log::error!("Item {} vanished during schema transfer", id);
                self.enter(State::Error);
                return Ok(0);
            }
        };
        let expected = if last {
            Opcode::SchemaEndResp
        } else {
            Opcode::SchemaResp
        };
        Ok(self.send_request(now, outbound, n, expected))
    }

    // -----------------------------------------------------------------------
    // Online
    // -----------------------------------------------------------------------

    fn run_online(
        &mut self,
        cursor: Option<ItemId>,
        in_flight: Option<ItemId>,
        msg: Option<Message>,
        now: u64,
        outbound: &mut [u8],
    ) -> Result<usize, ThingError> {
        // Gateway commands go through even while a push awaits its ack.
        if let Some(msg) = msg {
            match msg {
                Message::Data {
                    item_id,
                    value,
                    response: false,
                } => return self.handle_set(item_id, &value, outbound),
                Message::Poll { item_id } => {
                    return self.handle_get(item_id, cursor, in_flight, now, outbound)
                }
                Message::Config { item_id, config } => {
                    return self.handle_config(item_id, &config, outbound)
                }
                Message::Unregister => return self.handle_unregister(outbound),
                ack if ack.opcode() == Opcode::PushDataResp
                    && self.timer.expected() == Some(Opcode::PushDataResp) =>
                {
                    if let Message::Data { item_id, .. } = &ack {
                        if in_flight.map(ItemId::get) != Some(*item_id) {
                            log::debug!(
                                "Ignoring ack for item {} while awaiting {:?}",
                                item_id,
                                in_flight
                            );
                            return self.resend_if_expired(now, outbound);
                        }
                    }
                    // A value echo counts as success.
                    if matches!(ack.result(), None | Some(RESULT_SUCCESS)) {
                        if let Some(id) = in_flight {
                            self.registry.confirm_sent(id);
                        }
                        self.timer.disarm();
                        self.state = State::Online {
                            cursor,
                            in_flight: None,
                        };
                        return Ok(0);
                    }
                    log::warn!("Push of item {:?} rejected, resending", in_flight);
                    return self.resend(now, outbound);
                }
                other => log::debug!("Ignoring {:?} while online", other.opcode()),
            }
        }

        if self.timer.is_armed() {
            return self.resend_if_expired(now, outbound);
        }
        self.poll(cursor, now, outbound)
    }

    /// Push the first item after `cursor` whose send policy fires.
    fn poll(
        &mut self,
        cursor: Option<ItemId>,
        now: u64,
        outbound: &mut [u8],
    ) -> Result<usize, ThingError> {
        let start = cursor.map_or(0, |c| c.get() as usize + 1);
        let order: heapless::Vec<ItemId, N> = self
            .registry
            .ids()
            .filter(|id| id.get() as usize >= start)
            .chain(self.registry.ids().filter(|id| (id.get() as usize) < start))
            .collect();

        for id in order {
            let Some(value) = self.registry.read(id, true, now).cloned() else {
                continue;
            };
            match protocol::encode_data(outbound, id.get(), &value, false) {
                Ok(n) => {
                    self.state = State::Online {
                        cursor: Some(id),
                        in_flight: Some(id),
                    };
                    return Ok(self.send_request(now, outbound, n, Opcode::PushDataResp));
                }
                Err(CodecError::InvalidValue) => {
                    log::warn!("Item {} has no value to send", id);
                    self.registry.confirm_sent(id);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(0)
    }

    /// SET_DATA: apply a gateway write and echo the stored value.
    fn handle_set(
        &mut self,
        item_id: u8,
        bytes: &[u8],
        outbound: &mut [u8],
    ) -> Result<usize, ThingError> {
        let reject = |outbound: &mut [u8], code| {
            protocol::encode_error(outbound, Opcode::PushDataResp, code).map_err(ThingError::from)
        };

        let Some((id, value_type)) = self
            .registry
            .lookup(item_id)
            .and_then(|id| Some((id, self.registry.schema_of(id)?.value_type)))
        else {
            log::warn!("SET for unknown item {}", item_id);
            return reject(outbound, RESULT_ERR_INVALID);
        };
        let value = match Value::from_wire(value_type, bytes) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("SET for item {} with bad value: {}", id, e);
                return reject(outbound, RESULT_ERR_INVALID);
            }
        };

        match self.registry.write(id, value.clone()) {
            Ok(()) => {
                log::debug!("Item {} set by gateway", id);
                Ok(protocol::encode_data(outbound, item_id, &value, true)?)
            }
            Err(WriteError::CallbackRejected) => reject(outbound, RESULT_ERR_PERM),
            Err(e) => {
                log::warn!("SET for item {} failed: {}", id, e);
                reject(outbound, RESULT_ERR_INVALID)
            }
        }
    }

    /// GET_DATA: push the item now, or next if a push is already in flight.
    fn handle_get(
        &mut self,
        item_id: u8,
        cursor: Option<ItemId>,
        in_flight: Option<ItemId>,
        now: u64,
        outbound: &mut [u8],
    ) -> Result<usize, ThingError> {
        let Some(id) = self.registry.lookup(item_id) else {
            log::warn!("GET for unknown item {}", item_id);
            return Ok(protocol::encode_error(
                outbound,
                Opcode::PollDataResp,
                RESULT_ERR_INVALID,
            )?);
        };
        self.registry.force_send(id);
        if in_flight.is_some() || self.timer.is_armed() {
            return Ok(0);
        }

        let encoded = match self.registry.read(id, true, now).cloned() {
            Some(value) => protocol::encode_data(outbound, item_id, &value, false),
            None => Err(CodecError::InvalidValue),
        };
        match encoded {
            Ok(n) => {
                self.state = State::Online {
                    cursor,
                    in_flight: Some(id),
                };
                Ok(self.send_request(now, outbound, n, Opcode::PushDataResp))
            }
            Err(CodecError::InvalidValue) => {
                log::warn!("GET for item {}: no value available", id);
                self.registry.cancel_send(id);
                Ok(protocol::encode_error(
                    outbound,
                    Opcode::PollDataResp,
                    RESULT_ERR_INVALID,
                )?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// PUSH_CONFIG: replace the item's event configuration.
    fn handle_config(
        &mut self,
        item_id: u8,
        wire: &WireConfig,
        outbound: &mut [u8],
    ) -> Result<usize, ThingError> {
        let result = match self.registry.lookup(item_id) {
            Some(id) => {
                let value_type = self
                    .registry
                    .schema_of(id)
                    .map(|s| s.value_type)
                    .ok_or(ConfigError::NotRegistered(item_id));
                value_type
                    .and_then(|vt| EventConfig::from_wire(wire, vt))
                    .and_then(|cfg| self.registry.configure(id, cfg))
            }
            None => Err(ConfigError::NotRegistered(item_id)),
        };

        let code = match result {
            Ok(()) => {
                log::info!("Item {} reconfigured by gateway", item_id);
                RESULT_SUCCESS
            }
            Err(e) => {
                log::warn!("Config for item {} rejected: {}", item_id, e);
                RESULT_ERR_INVALID
            }
        };
        Ok(protocol::encode_error(outbound, Opcode::PushConfigResp, code)?)
    }

    /// UNREGISTER: acknowledge, forget the identity and register again.
    fn handle_unregister(&mut self, outbound: &mut [u8]) -> Result<usize, ThingError> {
        let n = protocol::encode_error(outbound, Opcode::UnregisterResp, RESULT_SUCCESS)?;
        if let Err(e) = self.storage.reset() {
            log::warn!("Failed to erase identity: {}", e);
        }
        log::info!("Unregistered by gateway");
        self.identity = DeviceIdentity::new(fresh_device_id(), Uuid::new(), Token::new());
        self.enter(State::Register);
        Ok(n)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn enter(&mut self, next: State) {
        if let State::Online {
            in_flight: Some(id),
            ..
        } = self.state
        {
            self.registry.confirm_sent(id);
        }
        self.timer.disarm();
        log::info!("State {:?} -> {:?}", self.state.kind(), next.kind());
        self.state = next;
    }

    fn enter_schema(&mut self) {
        match self.registry.next_registered(None) {
            Some(first) => self.enter(State::Schema { cursor: first }),
            None => {
                log::error!("No data items registered, cannot send schema");
                self.enter(State::Error);
            }
        }
    }

    fn enter_online(&mut self) {
        self.enter(State::Online {
            cursor: None,
            in_flight: None,
        });
    }

    /// The message if it answers the outstanding request.
    fn expected_response(&self, msg: Option<Message>) -> Option<Message> {
        let msg = msg?;
        if self.timer.expected() == Some(msg.opcode()) {
            Some(msg)
        } else {
            log::debug!(
                "Ignoring {:?} in state {:?}",
                msg.opcode(),
                self.state.kind()
            );
            None
        }
    }

    fn send_request(&mut self, now: u64, outbound: &[u8], n: usize, expected: Opcode) -> usize {
        self.timer
            .arm(now + self.config.resend_timeout_ms, expected, &outbound[..n]);
        log::debug!("Sent 0x{:02x} ({} bytes), expecting {:?}", outbound[0], n, expected);
        n
    }

    fn resend_if_expired(&mut self, now: u64, outbound: &mut [u8]) -> Result<usize, ThingError> {
        if self.timer.expired(now) {
            self.resend(now, outbound)
        } else {
            Ok(0)
        }
    }

    /// Re-emit the outstanding request unchanged and restart its window.
    fn resend(&mut self, now: u64, outbound: &mut [u8]) -> Result<usize, ThingError> {
        let n = self.timer.request.len();
        if n == 0 {
            return Ok(0);
        }
        let dst = outbound.get_mut(..n).ok_or(CodecError::BufferTooSmall)?;
        dst.copy_from_slice(&self.timer.request);
        self.timer.deadline_ms = Some(now + self.config.resend_timeout_ms);
        log::debug!("Resent 0x{:02x} ({} bytes)", dst[0], n);
        Ok(n)
    }
}
