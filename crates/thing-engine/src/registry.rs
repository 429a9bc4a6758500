// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Data item registry.
//!
//! A fixed-capacity arena of data items indexed by [`ItemId`]. Each item owns
//! its schema, the last value exchanged with the gateway, its event
//! configuration and the send state that decides when the value is pushed.
//!
//! The registry is not synchronized: it is driven from the protocol task
//! only. Application memory shared with other threads goes through
//! [`SharedCell`].
//!
//! # Send policy
//!
//! [`Registry::read`] samples the application value, then fires when any of
//! these holds:
//!
//! - the item is already pending (gateway GET or an unacknowledged push),
//! - the TIME period elapsed since the last time-triggered send (the first
//!   evaluation always fires),
//! - CHANGE is set and the value differs from the last value sent,
//! - a threshold is set and the value just crossed out of range. Crossing is
//!   edge-triggered: a value that stays above the upper limit fires once.

use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::error::{AppError, CodecError, ConfigError, RegisterError, WriteError};
use crate::protocol::WireConfig;
use crate::types::{schema_is_valid, RawValue, Schema, Value, ValueType, RAW_VALUE_SIZE};

/// Default TIME period for newly registered items (seconds).
pub const DEFAULT_PERIOD_SECS: u16 = 30;

// ---------------------------------------------------------------------------
// Item handle
// ---------------------------------------------------------------------------

/// Handle to a registered data item. Also its id on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(u8);

impl ItemId {
    pub fn get(self) -> u8 {
        self.0
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<ItemId> for u8 {
    fn from(id: ItemId) -> u8 {
        id.0
    }
}

impl core::fmt::Display for ItemId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Event configuration
// ---------------------------------------------------------------------------

bitflags! {
    /// Conditions that trigger a push.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventFlags: u8 {
        const TIME = 0x01;
        const LOWER_THRESHOLD = 0x02;
        const UPPER_THRESHOLD = 0x04;
        const CHANGE = 0x08;
    }
}

/// Threshold limit. The variant must match the item value type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Limit {
    Int(i32),
    Float(f32),
}

impl Limit {
    fn value_type(self) -> ValueType {
        match self {
            Self::Int(_) => ValueType::Int,
            Self::Float(_) => ValueType::Float,
        }
    }

    fn from_wire(value_type: ValueType, bytes: &[u8]) -> Result<Self, ConfigError> {
        match Value::from_wire(value_type, bytes) {
            Ok(Value::Int(v)) => Ok(Self::Int(v)),
            Ok(Value::Float(v)) => Ok(Self::Float(v)),
            _ => Err(ConfigError::ThresholdUnsupported),
        }
    }

    fn to_wire(self) -> [u8; RAW_VALUE_SIZE] {
        let mut out = [0u8; RAW_VALUE_SIZE];
        let bytes = match self {
            Self::Int(v) => v.to_le_bytes(),
            Self::Float(v) => v.to_le_bytes(),
        };
        out[..4].copy_from_slice(&bytes);
        out
    }

    /// `value > limit`; false across mismatched types.
    fn is_exceeded_by(self, value: &Value) -> bool {
        match (self, value) {
            (Self::Int(l), Value::Int(v)) => *v > l,
            (Self::Float(l), Value::Float(v)) => *v > l,
            _ => false,
        }
    }

    /// `value < limit`; false across mismatched types.
    fn is_undercut_by(self, value: &Value) -> bool {
        match (self, value) {
            (Self::Int(l), Value::Int(v)) => *v < l,
            (Self::Float(l), Value::Float(v)) => *v < l,
            _ => false,
        }
    }
}

/// When an item's value is pushed to the gateway.
///
/// Built with the chained setters and checked against the item's value type
/// by [`Registry::configure`]:
///
/// ```
/// use thing_engine::registry::{EventConfig, Limit};
///
/// let cfg = EventConfig::new().every(5).on_change().above(Limit::Int(40));
/// assert_eq!(cfg.period_secs, 5);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventConfig {
    pub flags: EventFlags,
    /// TIME period; non-zero iff TIME is set.
    pub period_secs: u16,
    /// Present iff LOWER_THRESHOLD is set.
    pub lower: Option<Limit>,
    /// Present iff UPPER_THRESHOLD is set.
    pub upper: Option<Limit>,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl EventConfig {
    /// No trigger at all; the item is only sent on request.
    pub const fn new() -> Self {
        Self {
            flags: EventFlags::empty(),
            period_secs: 0,
            lower: None,
            upper: None,
        }
    }

    /// TIME trigger with the given period.
    pub fn every(mut self, secs: u16) -> Self {
        self.flags |= EventFlags::TIME;
        self.period_secs = secs;
        self
    }

    pub fn on_change(mut self) -> Self {
        self.flags |= EventFlags::CHANGE;
        self
    }

    /// Push when the value rises above `limit`.
    pub fn above(mut self, limit: Limit) -> Self {
        self.flags |= EventFlags::UPPER_THRESHOLD;
        self.upper = Some(limit);
        self
    }

    /// Push when the value falls below `limit`.
    pub fn below(mut self, limit: Limit) -> Self {
        self.flags |= EventFlags::LOWER_THRESHOLD;
        self.lower = Some(limit);
        self
    }

    /// Check the configuration against an item of `value_type`.
    pub fn validate(&self, value_type: ValueType) -> Result<(), ConfigError> {
        let time = self.flags.contains(EventFlags::TIME);
        if time && self.period_secs == 0 {
            return Err(ConfigError::MissingPeriod);
        }
        if !time && self.period_secs != 0 {
            return Err(ConfigError::UnexpectedPeriod);
        }

        let thresholds = [
            (EventFlags::LOWER_THRESHOLD, self.lower),
            (EventFlags::UPPER_THRESHOLD, self.upper),
        ];
        for (flag, limit) in thresholds {
            match (self.flags.contains(flag), limit) {
                (true, None) => return Err(ConfigError::MissingLimit),
                (false, Some(_)) => return Err(ConfigError::UnexpectedLimit),
                (true, Some(limit)) => {
                    if !value_type.is_numeric() {
                        return Err(ConfigError::ThresholdUnsupported);
                    }
                    if limit.value_type() != value_type {
                        return Err(ConfigError::LimitTypeMismatch);
                    }
                }
                (false, None) => {}
            }
        }

        if let (Some(lower), Some(upper)) = (self.lower, self.upper) {
            let inverted = match (lower, upper) {
                (Limit::Int(l), Limit::Int(u)) => u < l,
                (Limit::Float(l), Limit::Float(u)) => u < l,
                _ => true,
            };
            if inverted {
                return Err(ConfigError::InvertedLimits);
            }
        }
        Ok(())
    }

    /// Build from a PUSH_CONFIG_REQ payload. Limits are only read for the
    /// threshold flags that are set.
    pub fn from_wire(wire: &WireConfig, value_type: ValueType) -> Result<Self, ConfigError> {
        let flags = EventFlags::from_bits(wire.event_flags)
            .ok_or(ConfigError::UnknownFlags(wire.event_flags))?;

        let limit = |flag: EventFlags, bytes: &[u8]| -> Result<Option<Limit>, ConfigError> {
            if !flags.contains(flag) {
                return Ok(None);
            }
            if !value_type.is_numeric() {
                return Err(ConfigError::ThresholdUnsupported);
            }
            Limit::from_wire(value_type, bytes).map(Some)
        };

        let cfg = Self {
            flags,
            period_secs: wire.time_sec,
            lower: limit(EventFlags::LOWER_THRESHOLD, &wire.lower_limit)?,
            upper: limit(EventFlags::UPPER_THRESHOLD, &wire.upper_limit)?,
        };
        cfg.validate(value_type)?;
        Ok(cfg)
    }

    pub fn to_wire(&self) -> WireConfig {
        WireConfig {
            event_flags: self.flags.bits(),
            time_sec: self.period_secs,
            lower_limit: self.lower.map(Limit::to_wire).unwrap_or_default(),
            upper_limit: self.upper.map(Limit::to_wire).unwrap_or_default(),
        }
    }
}

/// Per-item push bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendState {
    /// The value must be pushed.
    pub pending: bool,
    /// A push is in flight; re-triggering is suppressed until it is acked.
    pub waiting_response: bool,
    /// Last evaluated read was above the upper limit.
    pub above_upper: bool,
    /// Last evaluated read was below the lower limit.
    pub below_lower: bool,
    /// Clock time of the last TIME-triggered send.
    pub last_send_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Bindings
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct CellData {
    bytes: RawValue,
    capacity: usize,
}

/// Application memory bound to a data item.
///
/// Clones share the same storage. Fixed-size types hold their little-endian
/// encoding; raw cells hold up to `capacity` bytes.
#[derive(Debug, Clone)]
pub struct SharedCell {
    inner: Arc<Mutex<CellData>>,
}

impl SharedCell {
    fn with_bytes(bytes: &[u8], capacity: usize) -> Self {
        let mut stored = RawValue::new();
        let n = bytes.len().min(RAW_VALUE_SIZE);
        let _ = stored.extend_from_slice(&bytes[..n]);
        Self {
            inner: Arc::new(Mutex::new(CellData {
                bytes: stored,
                capacity,
            })),
        }
    }

    pub fn int(v: i32) -> Self {
        Self::with_bytes(&v.to_le_bytes(), 4)
    }

    pub fn float(v: f32) -> Self {
        Self::with_bytes(&v.to_le_bytes(), 4)
    }

    pub fn boolean(v: bool) -> Self {
        Self::with_bytes(&[u8::from(v)], 1)
    }

    /// Raw buffer of `capacity` bytes (1..=16), initially holding `initial`.
    pub fn raw(initial: &[u8], capacity: usize) -> Self {
        let n = initial.len().min(capacity);
        Self::with_bytes(&initial[..n], capacity)
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    pub fn get_int(&self) -> i32 {
        match self.load(ValueType::Int) {
            Ok(Value::Int(v)) => v,
            _ => 0,
        }
    }

    pub fn set_int(&self, v: i32) {
        self.replace(&v.to_le_bytes());
    }

    pub fn get_float(&self) -> f32 {
        match self.load(ValueType::Float) {
            Ok(Value::Float(v)) => v,
            _ => 0.0,
        }
    }

    pub fn set_float(&self, v: f32) {
        self.replace(&v.to_le_bytes());
    }

    pub fn get_bool(&self) -> bool {
        matches!(self.load(ValueType::Bool), Ok(Value::Bool(true)))
    }

    pub fn set_bool(&self, v: bool) {
        self.replace(&[u8::from(v)]);
    }

    pub fn get_raw(&self) -> RawValue {
        self.inner.lock().bytes.clone()
    }

    pub fn set_raw(&self, bytes: &[u8]) -> Result<(), WriteError> {
        let mut data = self.inner.lock();
        if bytes.len() > data.capacity {
            return Err(WriteError::TooLarge {
                len: bytes.len(),
                capacity: data.capacity,
            });
        }
        data.bytes.clear();
        let _ = data.bytes.extend_from_slice(bytes);
        Ok(())
    }

    fn replace(&self, bytes: &[u8]) {
        let mut data = self.inner.lock();
        data.bytes.clear();
        let _ = data.bytes.extend_from_slice(bytes);
    }

    fn load(&self, value_type: ValueType) -> Result<Value, CodecError> {
        Value::from_wire(value_type, &self.inner.lock().bytes)
    }

    fn store(&self, value: &Value) -> Result<(), WriteError> {
        match value {
            Value::Raw(raw) => self.set_raw(raw),
            other => {
                self.replace(&other.to_wire());
                Ok(())
            }
        }
    }

    /// Whether the cell fits an item of `value_type`.
    fn fits(&self, value_type: ValueType) -> bool {
        let capacity = self.capacity();
        match value_type.natural_size() {
            Some(size) => capacity == size,
            None => (1..=RAW_VALUE_SIZE).contains(&capacity),
        }
    }
}

/// Hooks around a bound cell.
///
/// `on_read` runs before the registry samples the cell (refresh it from the
/// hardware). `on_write` runs after a downlink value was stored (apply it to
/// the hardware); an error rolls the cell back.
pub trait ItemCallbacks: Send {
    fn on_read(&mut self, _id: ItemId, _cell: &SharedCell) -> Result<(), AppError> {
        Ok(())
    }

    fn on_write(&mut self, _id: ItemId, _cell: &SharedCell) -> Result<(), AppError> {
        Ok(())
    }
}

/// Item backed by application code rather than shared memory.
pub trait DataSource: Send {
    fn read(&mut self) -> Result<Value, AppError>;

    /// Apply a downlink value. On error the source keeps its previous value.
    fn write(&mut self, value: &Value) -> Result<(), AppError>;
}

/// Where a data item gets its value from.
pub enum Binding {
    Cell(SharedCell),
    CellWithCallbacks {
        cell: SharedCell,
        callbacks: Box<dyn ItemCallbacks>,
    },
    Source(Box<dyn DataSource>),
}

impl core::fmt::Debug for Binding {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Cell(cell) => f.debug_tuple("Cell").field(cell).finish(),
            Self::CellWithCallbacks { cell, .. } => {
                f.debug_struct("CellWithCallbacks").field("cell", cell).finish()
            }
            Self::Source(_) => f.write_str("Source"),
        }
    }
}

impl Binding {
    fn check(&self, value_type: ValueType) -> Result<(), RegisterError> {
        match self {
            Self::Cell(cell) | Self::CellWithCallbacks { cell, .. } => {
                if cell.fits(value_type) {
                    Ok(())
                } else {
                    Err(RegisterError::InvalidBinding {
                        len: cell.capacity(),
                    })
                }
            }
            Self::Source(_) => Ok(()),
        }
    }

    fn sample(&mut self, id: ItemId, value_type: ValueType) -> Result<Value, AppError> {
        let value = match self {
            Self::Cell(cell) => cell.load(value_type),
            Self::CellWithCallbacks { cell, callbacks } => {
                callbacks.on_read(id, cell)?;
                cell.load(value_type)
            }
            Self::Source(source) => return checked(source.read()?, value_type),
        };
        value.map_err(|e| AppError::new(e.to_string()))
    }

    fn apply(&mut self, id: ItemId, value: &Value) -> Result<(), WriteError> {
        match self {
            Self::Cell(cell) => cell.store(value),
            Self::CellWithCallbacks { cell, callbacks } => {
                let previous = cell.get_raw();
                cell.store(value)?;
                if let Err(e) = callbacks.on_write(id, cell) {
                    log::warn!("[REGISTRY] item {} write rejected: {}", id, e);
                    cell.replace(&previous);
                    return Err(WriteError::CallbackRejected);
                }
                Ok(())
            }
            Self::Source(source) => source.write(value).map_err(|e| {
                log::warn!("[REGISTRY] item {} write rejected: {}", id, e);
                WriteError::CallbackRejected
            }),
        }
    }
}

fn checked(value: Value, value_type: ValueType) -> Result<Value, AppError> {
    if value.value_type() == value_type {
        Ok(value)
    } else {
        Err(AppError::new("data source returned a value of the wrong type"))
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct DataItem {
    schema: Schema,
    /// Last sampled value.
    current: Value,
    /// Last value exchanged with the gateway (pushed or written).
    last_sent: Option<Value>,
    config: EventConfig,
    state: SendState,
    binding: Binding,
}

impl DataItem {
    /// Decide whether `self.current` must be sent now.
    fn should_send(&mut self, now_ms: u64) -> bool {
        let flags = self.config.flags;
        let mut send = self.state.pending;

        if flags.contains(EventFlags::TIME) {
            let period_ms = u64::from(self.config.period_secs) * 1000;
            let elapsed = match self.state.last_send_ms {
                None => true,
                Some(last) => now_ms.saturating_sub(last) >= period_ms,
            };
            if elapsed {
                self.state.last_send_ms = Some(now_ms);
                send = true;
            }
        }

        if flags.contains(EventFlags::CHANGE) && self.last_sent.as_ref() != Some(&self.current) {
            send = true;
        }

        let above = flags.contains(EventFlags::UPPER_THRESHOLD)
            && self
                .config
                .upper
                .is_some_and(|l| l.is_exceeded_by(&self.current));
        let below = flags.contains(EventFlags::LOWER_THRESHOLD)
            && self
                .config
                .lower
                .is_some_and(|l| l.is_undercut_by(&self.current));
        if (above && !self.state.above_upper) || (below && !self.state.below_lower) {
            send = true;
        }
        self.state.above_upper = above;
        self.state.below_lower = below;

        send
    }
}

/// Fixed-capacity table of data items. Ids are `u8`, so `N` must not
/// exceed 256; larger registries fail to build.
#[derive(Debug)]
pub struct Registry<const N: usize> {
    slots: [Option<DataItem>; N],
    default_period_secs: u16,
}

impl<const N: usize> Default for Registry<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Registry<N> {
    const FITS_ID_SPACE: () = assert!(N <= 256, "registry capacity exceeds the u8 id space");

    pub fn new() -> Self {
        Self::with_default_period(DEFAULT_PERIOD_SECS)
    }

    /// Registry whose new items get a TIME trigger of `secs`.
    pub fn with_default_period(secs: u16) -> Self {
        let () = Self::FITS_ID_SPACE;
        Self {
            slots: core::array::from_fn(|_| None),
            default_period_secs: secs.max(1),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Register data item `id`.
    ///
    /// The item starts with a TIME trigger at the default period. `name` is
    /// truncated to the wire field.
    pub fn register(
        &mut self,
        id: u8,
        name: &str,
        type_id: u16,
        value_type: ValueType,
        unit: u8,
        binding: Binding,
    ) -> Result<ItemId, RegisterError> {
        let slot = self
            .slots
            .get_mut(id as usize)
            .ok_or(RegisterError::OutOfRange { id, capacity: N })?;
        if slot.is_some() {
            return Err(RegisterError::DuplicateId(id));
        }
        if !schema_is_valid(type_id, value_type, unit) {
            return Err(RegisterError::InvalidSchema {
                type_id,
                value_type: value_type.as_u8(),
                unit,
            });
        }
        binding.check(value_type)?;

        *slot = Some(DataItem {
            schema: Schema::new(type_id, value_type, unit, name),
            current: Value::zero(value_type),
            last_sent: None,
            config: EventConfig::new().every(self.default_period_secs),
            state: SendState::default(),
            binding,
        });
        log::debug!(
            "[REGISTRY] item {} registered: type_id=0x{:04x} value_type={:?}",
            id,
            type_id,
            value_type
        );
        Ok(ItemId(id))
    }

    /// Replace the event configuration of `id`. On error the previous
    /// configuration is kept.
    pub fn configure(&mut self, id: ItemId, config: EventConfig) -> Result<(), ConfigError> {
        let item = self
            .item_mut(id)
            .ok_or(ConfigError::NotRegistered(id.get()))?;
        config.validate(item.schema.value_type)?;
        item.config = config;
        // Crossing history refers to the old limits.
        item.state.above_upper = false;
        item.state.below_lower = false;
        Ok(())
    }

    /// Sample `id` and apply the send policy at clock time `now_ms`.
    ///
    /// Returns the value to transmit when the policy fires. With
    /// `wait_for_response` the item stays pending (and further reads return
    /// `None`) until [`confirm_sent`](Self::confirm_sent). A failing read
    /// callback skips this poll.
    pub fn read(&mut self, id: ItemId, wait_for_response: bool, now_ms: u64) -> Option<&Value> {
        let item = self.item_mut(id)?;
        if item.state.pending && item.state.waiting_response {
            return None;
        }

        match item.binding.sample(id, item.schema.value_type) {
            Ok(value) => item.current = value,
            Err(e) => {
                log::warn!("[REGISTRY] item {} read failed: {}", id, e);
                return None;
            }
        }

        if !item.should_send(now_ms) {
            return None;
        }

        item.last_sent = Some(item.current.clone());
        item.state.pending = wait_for_response;
        item.state.waiting_response = wait_for_response;
        Some(&item.current)
    }

    /// Apply a downlink value to `id`.
    pub fn write(&mut self, id: ItemId, value: Value) -> Result<(), WriteError> {
        let item = self
            .item_mut(id)
            .ok_or(WriteError::NotRegistered(id.get()))?;
        if value.value_type() != item.schema.value_type {
            return Err(WriteError::TypeMismatch);
        }
        item.binding.apply(id, &value)?;
        item.current = value.clone();
        item.last_sent = Some(value);
        Ok(())
    }

    /// Mark `id` for sending on the next read, whatever its triggers say.
    ///
    /// Called while a push of `id` is in flight, the request survives that
    /// push's acknowledgement and the value is sent again.
    pub fn force_send(&mut self, id: ItemId) -> bool {
        match self.item_mut(id) {
            Some(item) => {
                item.state.pending = true;
                item.state.waiting_response = false;
                true
            }
            None => false,
        }
    }

    /// The gateway acknowledged the push of `id`.
    pub fn confirm_sent(&mut self, id: ItemId) {
        if let Some(item) = self.item_mut(id) {
            // Without waiting_response, pending is a newer force_send.
            if item.state.waiting_response {
                item.state.pending = false;
            }
            item.state.waiting_response = false;
        }
    }

    /// Drop any pending send of `id`.
    pub fn cancel_send(&mut self, id: ItemId) {
        if let Some(item) = self.item_mut(id) {
            item.state.pending = false;
            item.state.waiting_response = false;
        }
    }

    pub fn schema_of(&self, id: ItemId) -> Option<&Schema> {
        self.item(id).map(|item| &item.schema)
    }

    pub fn config_of(&self, id: ItemId) -> Option<&EventConfig> {
        self.item(id).map(|item| &item.config)
    }

    pub fn send_state(&self, id: ItemId) -> Option<&SendState> {
        self.item(id).map(|item| &item.state)
    }

    /// Last sampled (or written) value of `id`.
    pub fn value_of(&self, id: ItemId) -> Option<&Value> {
        self.item(id).map(|item| &item.current)
    }

    /// Handle of a registered item from its wire id.
    pub fn lookup(&self, raw: u8) -> Option<ItemId> {
        self.item(ItemId(raw)).map(|_| ItemId(raw))
    }

    pub fn highest_registered_id(&self) -> Option<ItemId> {
        self.ids().last()
    }

    /// Registered ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = ItemId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(i, _)| ItemId(i as u8))
    }

    /// First registered id strictly after `after` (from the start if `None`).
    pub fn next_registered(&self, after: Option<ItemId>) -> Option<ItemId> {
        let start = after.map_or(0, |id| id.index() + 1);
        self.ids().find(|id| id.index() >= start)
    }

    /// Invalidate every slot (factory reset).
    pub fn reset(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        log::info!("[REGISTRY] all data items cleared");
    }

    fn item(&self, id: ItemId) -> Option<&DataItem> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    fn item_mut(&mut self, id: ItemId) -> Option<&mut DataItem> {
        self.slots.get_mut(id.index()).and_then(Option::as_mut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{type_id, unit};

    fn thermo(reg: &mut Registry<4>, id: u8, cell: &SharedCell) -> ItemId {
        reg.register(
            id,
            "THERMO",
            type_id::TEMPERATURE,
            ValueType::Int,
            unit::TEMPERATURE_C,
            Binding::Cell(cell.clone()),
        )
        .unwrap()
    }

    struct Rejecting;

    impl ItemCallbacks for Rejecting {
        fn on_write(&mut self, _id: ItemId, _cell: &SharedCell) -> Result<(), AppError> {
            Err(AppError::new("actuator busy"))
        }
    }

    struct Failing;

    /// Source whose downlink writes are refused.
    struct ReadOnly(i32);

    impl DataSource for ReadOnly {
        fn read(&mut self) -> Result<Value, AppError> {
            Ok(Value::Int(self.0))
        }

        fn write(&mut self, _value: &Value) -> Result<(), AppError> {
            Err(AppError::new("read-only sensor"))
        }
    }

    impl DataSource for Failing {
        fn read(&mut self) -> Result<Value, AppError> {
            Err(AppError::new("sensor offline"))
        }

        fn write(&mut self, _value: &Value) -> Result<(), AppError> {
            Ok(())
        }
    }

    #[test]
    fn test_register_rejects_duplicates_and_keeps_original() {
        let mut reg = Registry::<4>::new();
        let cell = SharedCell::int(1);
        let id = thermo(&mut reg, 0, &cell);

        let err = reg
            .register(
                0,
                "LED",
                type_id::SWITCH,
                ValueType::Bool,
                0,
                Binding::Cell(SharedCell::boolean(false)),
            )
            .unwrap_err();
        assert_eq!(err, RegisterError::DuplicateId(0));
        assert_eq!(reg.schema_of(id).unwrap().name.as_str(), "THERMO");
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_register_validation_errors() {
        let mut reg = Registry::<4>::new();
        assert_eq!(
            reg.register(
                4,
                "x",
                type_id::SWITCH,
                ValueType::Bool,
                0,
                Binding::Cell(SharedCell::boolean(false))
            ),
            Err(RegisterError::OutOfRange { id: 4, capacity: 4 })
        );
        assert_eq!(
            reg.register(
                0,
                "x",
                type_id::TEMPERATURE,
                ValueType::Float,
                unit::TEMPERATURE_C,
                Binding::Cell(SharedCell::float(0.0))
            ),
            Err(RegisterError::InvalidSchema {
                type_id: type_id::TEMPERATURE,
                value_type: ValueType::Float.as_u8(),
                unit: unit::TEMPERATURE_C
            })
        );
        assert_eq!(
            reg.register(
                0,
                "x",
                type_id::SWITCH,
                ValueType::Bool,
                0,
                Binding::Cell(SharedCell::int(0))
            ),
            Err(RegisterError::InvalidBinding { len: 4 })
        );
        assert_eq!(
            reg.register(
                0,
                "x",
                type_id::COMMAND,
                ValueType::Raw,
                0,
                Binding::Cell(SharedCell::raw(&[], 17))
            ),
            Err(RegisterError::InvalidBinding { len: 17 })
        );
        assert!(reg.is_empty());
    }

    #[test]
    fn test_default_config_is_time_period() {
        let mut reg = Registry::<4>::with_default_period(12);
        let id = thermo(&mut reg, 1, &SharedCell::int(0));
        let cfg = reg.config_of(id).unwrap();
        assert_eq!(cfg.flags, EventFlags::TIME);
        assert_eq!(cfg.period_secs, 12);
    }

    #[test]
    fn test_configure_consistency() {
        let mut reg = Registry::<4>::new();
        let id = thermo(&mut reg, 0, &SharedCell::int(0));
        let before = *reg.config_of(id).unwrap();

        let cases = [
            (
                EventConfig {
                    flags: EventFlags::TIME,
                    period_secs: 0,
                    lower: None,
                    upper: None,
                },
                ConfigError::MissingPeriod,
            ),
            (
                EventConfig {
                    flags: EventFlags::CHANGE,
                    period_secs: 10,
                    lower: None,
                    upper: None,
                },
                ConfigError::UnexpectedPeriod,
            ),
            (
                EventConfig::new().above(Limit::Int(10)).below(Limit::Int(20)),
                ConfigError::InvertedLimits,
            ),
            (
                EventConfig::new().above(Limit::Float(1.0)),
                ConfigError::LimitTypeMismatch,
            ),
            (
                EventConfig {
                    flags: EventFlags::UPPER_THRESHOLD,
                    period_secs: 0,
                    lower: None,
                    upper: None,
                },
                ConfigError::MissingLimit,
            ),
            (
                EventConfig {
                    flags: EventFlags::CHANGE,
                    period_secs: 0,
                    lower: Some(Limit::Int(0)),
                    upper: None,
                },
                ConfigError::UnexpectedLimit,
            ),
        ];
        for (cfg, err) in cases {
            assert_eq!(reg.configure(id, cfg), Err(err));
            assert_eq!(reg.config_of(id), Some(&before));
        }

        let ok = EventConfig::new()
            .every(5)
            .below(Limit::Int(0))
            .above(Limit::Int(0));
        assert_eq!(reg.configure(id, ok), Ok(()));
        assert_eq!(reg.config_of(id), Some(&ok));
    }

    #[test]
    fn test_thresholds_rejected_for_bool() {
        let mut reg = Registry::<4>::new();
        let id = reg
            .register(
                0,
                "LED",
                type_id::SWITCH,
                ValueType::Bool,
                0,
                Binding::Cell(SharedCell::boolean(false)),
            )
            .unwrap();
        assert_eq!(
            reg.configure(id, EventConfig::new().above(Limit::Int(1))),
            Err(ConfigError::ThresholdUnsupported)
        );
    }

    #[test]
    fn test_config_from_wire() {
        let wire = EventConfig::new().every(5).above(Limit::Int(40)).to_wire();
        assert_eq!(wire.event_flags, 0x05);
        let cfg = EventConfig::from_wire(&wire, ValueType::Int).unwrap();
        assert_eq!(cfg.upper, Some(Limit::Int(40)));
        assert_eq!(cfg.lower, None);

        let mut bad = wire;
        bad.event_flags = 0x30;
        assert_eq!(
            EventConfig::from_wire(&bad, ValueType::Int),
            Err(ConfigError::UnknownFlags(0x30))
        );
        assert_eq!(
            EventConfig::from_wire(&wire, ValueType::Bool),
            Err(ConfigError::ThresholdUnsupported)
        );
    }

    #[test]
    fn test_time_trigger() {
        let mut reg = Registry::<4>::new();
        let id = thermo(&mut reg, 0, &SharedCell::int(21));
        reg.configure(id, EventConfig::new().every(5)).unwrap();

        // First evaluation fires.
        assert_eq!(reg.read(id, false, 0), Some(&Value::Int(21)));
        assert_eq!(reg.read(id, false, 4_999), None);
        assert_eq!(reg.read(id, false, 5_000), Some(&Value::Int(21)));
        assert_eq!(reg.send_state(id).unwrap().last_send_ms, Some(5_000));
    }

    #[test]
    fn test_waiting_suppresses_until_confirmed() {
        let mut reg = Registry::<4>::new();
        let cell = SharedCell::int(0);
        let id = thermo(&mut reg, 0, &cell);
        reg.configure(id, EventConfig::new().on_change()).unwrap();

        assert!(reg.read(id, true, 0).is_some());
        cell.set_int(5);
        assert_eq!(reg.read(id, true, 10), None);
        reg.confirm_sent(id);
        assert_eq!(reg.read(id, true, 20), Some(&Value::Int(5)));
    }

    #[test]
    fn test_change_compares_last_sent() {
        let mut reg = Registry::<4>::new();
        let cell = SharedCell::int(7);
        let id = thermo(&mut reg, 0, &cell);
        reg.configure(id, EventConfig::new().on_change()).unwrap();

        assert!(reg.read(id, false, 0).is_some());
        assert!(reg.read(id, false, 1).is_none());
        cell.set_int(8);
        assert_eq!(reg.read(id, false, 2), Some(&Value::Int(8)));
        assert!(reg.read(id, false, 3).is_none());
    }

    #[test]
    fn test_change_raw_bytes() {
        let mut reg = Registry::<4>::new();
        let cell = SharedCell::raw(b"ab", 4);
        let id = reg
            .register(
                3,
                "CMD",
                type_id::COMMAND,
                ValueType::Raw,
                0,
                Binding::Cell(cell.clone()),
            )
            .unwrap();
        reg.configure(id, EventConfig::new().on_change()).unwrap();

        assert_eq!(reg.read(id, false, 0), Some(&Value::raw(b"ab").unwrap()));
        cell.set_raw(b"ab").unwrap();
        assert!(reg.read(id, false, 1).is_none());
        cell.set_raw(b"ac").unwrap();
        assert_eq!(reg.read(id, false, 2), Some(&Value::raw(b"ac").unwrap()));
        // Same prefix, different length.
        cell.set_raw(b"acd").unwrap();
        assert_eq!(reg.read(id, false, 3), Some(&Value::raw(b"acd").unwrap()));
        assert!(reg.read(id, false, 4).is_none());
    }

    #[test]
    fn test_change_bool() {
        let mut reg = Registry::<4>::new();
        let cell = SharedCell::boolean(false);
        let id = reg
            .register(
                2,
                "DOOR",
                type_id::PRESENCE,
                ValueType::Bool,
                0,
                Binding::Cell(cell.clone()),
            )
            .unwrap();
        reg.configure(id, EventConfig::new().on_change()).unwrap();

        assert_eq!(reg.read(id, false, 0), Some(&Value::Bool(false)));
        assert!(reg.read(id, false, 1).is_none());
        cell.set_bool(true);
        assert_eq!(reg.read(id, false, 2), Some(&Value::Bool(true)));
        assert!(reg.read(id, false, 3).is_none());
        cell.set_bool(false);
        assert_eq!(reg.read(id, false, 4), Some(&Value::Bool(false)));
    }

    #[test]
    fn test_upper_threshold_is_edge_triggered() {
        let mut reg = Registry::<4>::new();
        let cell = SharedCell::int(10);
        let id = thermo(&mut reg, 0, &cell);
        reg.configure(id, EventConfig::new().above(Limit::Int(30)))
            .unwrap();

        assert!(reg.read(id, false, 0).is_none());
        let mut sends = 0;
        for (t, v) in [31, 35, 40, 33, 31].into_iter().enumerate() {
            cell.set_int(v);
            if reg.read(id, false, t as u64 + 1).is_some() {
                sends += 1;
            }
        }
        assert_eq!(sends, 1);

        // Back inside, then out again: one more push.
        cell.set_int(20);
        assert!(reg.read(id, false, 100).is_none());
        cell.set_int(50);
        assert!(reg.read(id, false, 101).is_some());
    }

    #[test]
    fn test_lower_threshold_float() {
        let mut reg = Registry::<4>::new();
        let cell = SharedCell::float(1.0);
        let id = reg
            .register(
                2,
                "TILT",
                type_id::ANGLE,
                ValueType::Float,
                unit::ANGLE_DEGREE,
                Binding::Cell(cell.clone()),
            )
            .unwrap();
        reg.configure(id, EventConfig::new().below(Limit::Float(0.5)))
            .unwrap();
        assert!(reg.read(id, false, 0).is_none());
        cell.set_float(0.25);
        assert_eq!(reg.read(id, false, 1), Some(&Value::Float(0.25)));
        cell.set_float(0.1);
        assert!(reg.read(id, false, 2).is_none());
    }

    #[test]
    fn test_force_send_overrides_policy() {
        let mut reg = Registry::<4>::new();
        let id = thermo(&mut reg, 0, &SharedCell::int(3));
        reg.configure(id, EventConfig::new()).unwrap();
        assert!(reg.read(id, false, 0).is_none());
        assert!(reg.force_send(id));
        assert_eq!(reg.read(id, false, 1), Some(&Value::Int(3)));
        assert!(!reg.send_state(id).unwrap().pending);
    }

    #[test]
    fn test_force_send_survives_in_flight_ack() {
        let mut reg = Registry::<4>::new();
        let cell = SharedCell::int(1);
        let id = thermo(&mut reg, 0, &cell);
        reg.configure(id, EventConfig::new()).unwrap();

        assert!(reg.force_send(id));
        assert_eq!(reg.read(id, true, 0), Some(&Value::Int(1)));

        // Requested again before the first push is acknowledged.
        cell.set_int(99);
        assert!(reg.force_send(id));
        reg.confirm_sent(id);
        assert!(reg.send_state(id).unwrap().pending);
        assert_eq!(reg.read(id, true, 1), Some(&Value::Int(99)));

        reg.confirm_sent(id);
        assert!(!reg.send_state(id).unwrap().pending);
        assert!(reg.read(id, true, 2).is_none());
    }

    #[test]
    fn test_cancel_send() {
        let mut reg = Registry::<4>::new();
        let id = thermo(&mut reg, 0, &SharedCell::int(1));
        reg.configure(id, EventConfig::new()).unwrap();
        reg.force_send(id);
        reg.cancel_send(id);
        assert_eq!(reg.send_state(id), Some(&SendState::default()));
        assert!(reg.read(id, true, 0).is_none());
    }

    #[test]
    fn test_write_rollback_on_callback_failure() {
        let mut reg = Registry::<4>::new();
        let cell = SharedCell::boolean(true);
        let id = reg
            .register(
                1,
                "RELAY",
                type_id::SWITCH,
                ValueType::Bool,
                0,
                Binding::CellWithCallbacks {
                    cell: cell.clone(),
                    callbacks: Box::new(Rejecting),
                },
            )
            .unwrap();

        assert_eq!(
            reg.write(id, Value::Bool(false)),
            Err(WriteError::CallbackRejected)
        );
        assert!(cell.get_bool());
    }

    #[test]
    fn test_write_checks_type_and_size() {
        let mut reg = Registry::<4>::new();
        let cell = SharedCell::raw(b"ab", 4);
        let id = reg
            .register(
                3,
                "CMD",
                type_id::COMMAND,
                ValueType::Raw,
                0,
                Binding::Cell(cell.clone()),
            )
            .unwrap();

        assert_eq!(reg.write(id, Value::Int(1)), Err(WriteError::TypeMismatch));
        assert_eq!(
            reg.write(id, Value::raw(b"hello").unwrap()),
            Err(WriteError::TooLarge {
                len: 5,
                capacity: 4
            })
        );
        assert_eq!(cell.get_raw().as_slice(), b"ab");

        reg.write(id, Value::raw(b"go").unwrap()).unwrap();
        assert_eq!(cell.get_raw().as_slice(), b"go");
        assert_eq!(reg.value_of(id), Some(&Value::raw(b"go").unwrap()));
    }

    #[test]
    fn test_source_write_rejected() {
        let mut reg = Registry::<4>::new();
        let id = reg
            .register(
                1,
                "ADC",
                type_id::ANALOG,
                ValueType::Int,
                0,
                Binding::Source(Box::new(ReadOnly(7))),
            )
            .unwrap();
        assert_eq!(reg.read(id, false, 0), Some(&Value::Int(7)));

        assert_eq!(
            reg.write(id, Value::Int(5)),
            Err(WriteError::CallbackRejected)
        );
        assert_eq!(reg.value_of(id), Some(&Value::Int(7)));
    }

    #[test]
    fn test_failing_source_skips_poll() {
        let mut reg = Registry::<4>::new();
        let id = reg
            .register(
                0,
                "ADC",
                type_id::ANALOG,
                ValueType::Int,
                0,
                Binding::Source(Box::new(Failing)),
            )
            .unwrap();
        assert!(reg.force_send(id));
        assert!(reg.read(id, true, 0).is_none());
        // Still pending for the next poll.
        assert!(reg.send_state(id).unwrap().pending);
    }

    #[test]
    fn test_iteration_and_reset() {
        let mut reg = Registry::<4>::new();
        thermo(&mut reg, 3, &SharedCell::int(0));
        thermo(&mut reg, 1, &SharedCell::int(0));

        assert_eq!(reg.highest_registered_id().map(ItemId::get), Some(3));
        assert_eq!(reg.next_registered(None).map(ItemId::get), Some(1));
        let one = reg.lookup(1).unwrap();
        assert_eq!(reg.next_registered(Some(one)).map(ItemId::get), Some(3));
        let three = reg.lookup(3).unwrap();
        assert_eq!(reg.next_registered(Some(three)), None);
        assert_eq!(reg.lookup(2), None);
        assert_eq!(reg.lookup(200), None);

        reg.reset();
        assert!(reg.is_empty());
        assert_eq!(reg.highest_registered_id(), None);
    }

    #[test]
    fn test_full_id_space() {
        let mut reg = Registry::<256>::new();
        let id = thermo_at(&mut reg, 255);
        assert_eq!(reg.highest_registered_id(), Some(id));
        assert_eq!(reg.capacity(), 256);
    }

    fn thermo_at<const N: usize>(reg: &mut Registry<N>, id: u8) -> ItemId {
        reg.register(
            id,
            "THERMO",
            type_id::TEMPERATURE,
            ValueType::Int,
            unit::TEMPERATURE_C,
            Binding::Cell(SharedCell::int(0)),
        )
        .unwrap()
    }
}
