// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Data item semantics: value types, type-id families, units and schemas.
//!
//! A schema is valid only if its `(type_id, value_type, unit)` triple is
//! listed in the static tables below. The tables are shared with the
//! gateway and must not drift.

use crate::error::CodecError;

/// Maximum size of a raw value (bytes).
pub const RAW_VALUE_SIZE: usize = 16;

/// Maximum size of a data item name (bytes).
pub const ITEM_NAME_LEN: usize = 23;

/// Raw value payload.
pub type RawValue = heapless::Vec<u8, RAW_VALUE_SIZE>;

/// Bounded data item name.
pub type ItemName = heapless::String<ITEM_NAME_LEN>;

// ---------------------------------------------------------------------------
// Value type
// ---------------------------------------------------------------------------

pub const VALUE_TYPE_INT: u8 = 0x01;
pub const VALUE_TYPE_FLOAT: u8 = 0x02;
pub const VALUE_TYPE_BOOL: u8 = 0x03;
pub const VALUE_TYPE_RAW: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueType {
    Int = VALUE_TYPE_INT,
    Float = VALUE_TYPE_FLOAT,
    Bool = VALUE_TYPE_BOOL,
    Raw = VALUE_TYPE_RAW,
}

impl ValueType {
    pub fn from_u8(v: u8) -> Result<Self, CodecError> {
        match v {
            VALUE_TYPE_INT => Ok(Self::Int),
            VALUE_TYPE_FLOAT => Ok(Self::Float),
            VALUE_TYPE_BOOL => Ok(Self::Bool),
            VALUE_TYPE_RAW => Ok(Self::Raw),
            other => Err(CodecError::UnknownValueType(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Natural wire size, `None` for raw (variable length).
    pub const fn natural_size(self) -> Option<usize> {
        match self {
            Self::Int | Self::Float => Some(4),
            Self::Bool => Some(1),
            Self::Raw => None,
        }
    }

    /// Whether threshold events make sense for this type.
    pub const fn is_numeric(self) -> bool {
        matches!(self, Self::Int | Self::Float)
    }
}

// ---------------------------------------------------------------------------
// Type ids
// ---------------------------------------------------------------------------

pub mod type_id {
    pub const NONE: u16 = 0x0000;
    pub const VOLTAGE: u16 = 0x0001;
    pub const CURRENT: u16 = 0x0002;
    pub const RESISTENCE: u16 = 0x0003;
    pub const POWER: u16 = 0x0004;
    pub const TEMPERATURE: u16 = 0x0005;
    pub const RELATIVE_HUMIDITY: u16 = 0x0006;
    pub const LUMINOSITY: u16 = 0x0007;
    pub const TIME: u16 = 0x0008;
    pub const MASS: u16 = 0x0009;
    pub const PRESSURE: u16 = 0x000A;
    pub const DISTANCE: u16 = 0x000B;
    pub const ANGLE: u16 = 0x000C;
    pub const VOLUME: u16 = 0x000D;
    pub const AREA: u16 = 0x000E;
    pub const RAIN: u16 = 0x000F;
    pub const DENSITY: u16 = 0x0010;
    pub const LATITUDE: u16 = 0x0011;
    pub const LONGITUDE: u16 = 0x0012;
    pub const SPEED: u16 = 0x0013;
    pub const VOLUMEFLOW: u16 = 0x0014;
    pub const ENERGY: u16 = 0x0015;

    pub const PRESENCE: u16 = 0xFFF0;
    pub const SWITCH: u16 = 0xFFF1;
    pub const COMMAND: u16 = 0xFFF2;

    pub const ANALOG: u16 = 0xFF10;
}

/// Units. Values are only meaningful together with a basic type id.
pub mod unit {
    pub const NOT_APPLICABLE: u8 = 0x00;
    pub const VOLTAGE_V: u8 = 0x01;
    pub const VOLTAGE_MV: u8 = 0x02;
    pub const VOLTAGE_KV: u8 = 0x03;
    pub const CURRENT_A: u8 = 0x01;
    pub const CURRENT_MA: u8 = 0x02;
    pub const RESISTENCE_OHM: u8 = 0x01;
    pub const POWER_W: u8 = 0x01;
    pub const POWER_KW: u8 = 0x02;
    pub const POWER_MW: u8 = 0x03;
    pub const TEMPERATURE_C: u8 = 0x01;
    pub const TEMPERATURE_F: u8 = 0x02;
    pub const TEMPERATURE_K: u8 = 0x03;
    pub const RELATIVE_HUMIDITY: u8 = 0x01;
    pub const LUMINOSITY_LM: u8 = 0x01;
    pub const LUMINOSITY_CD: u8 = 0x02;
    pub const LUMINOSITY_LX: u8 = 0x03;
    pub const TIME_S: u8 = 0x01;
    pub const TIME_MS: u8 = 0x02;
    pub const TIME_US: u8 = 0x03;
    pub const MASS_KG: u8 = 0x01;
    pub const MASS_G: u8 = 0x02;
    pub const MASS_LB: u8 = 0x03;
    pub const MASS_OZ: u8 = 0x04;
    pub const PRESSURE_PA: u8 = 0x01;
    pub const PRESSURE_PSI: u8 = 0x02;
    pub const PRESSURE_BAR: u8 = 0x03;
    pub const DISTANCE_M: u8 = 0x01;
    pub const DISTANCE_CM: u8 = 0x02;
    pub const DISTANCE_MI: u8 = 0x03;
    pub const DISTANCE_IN: u8 = 0x04;
    pub const ANGLE_RAD: u8 = 0x01;
    pub const ANGLE_DEGREE: u8 = 0x02;
    pub const VOLUME_L: u8 = 0x01;
    pub const VOLUME_ML: u8 = 0x02;
    pub const VOLUME_FLOZ: u8 = 0x03;
    pub const VOLUME_GAL: u8 = 0x04;
    pub const AREA_M2: u8 = 0x01;
    pub const AREA_HA: u8 = 0x02;
    pub const AREA_AC: u8 = 0x03;
    pub const RAIN_MM: u8 = 0x01;
    pub const DENSITY_KGM3: u8 = 0x01;
    pub const LATITUDE_DEGREE: u8 = 0x01;
    pub const LONGITUDE_DEGREE: u8 = 0x01;
    pub const SPEED_MS: u8 = 0x01;
    pub const SPEED_CMS: u8 = 0x02;
    pub const SPEED_KMH: u8 = 0x03;
    pub const SPEED_MIH: u8 = 0x04;
    pub const VOLUMEFLOW_M3S: u8 = 0x01;
    pub const VOLUMEFLOW_SCMM: u8 = 0x02;
    pub const VOLUMEFLOW_LS: u8 = 0x03;
    pub const VOLUMEFLOW_LM: u8 = 0x04;
    pub const VOLUMEFLOW_FT3S: u8 = 0x05;
    pub const VOLUMEFLOW_GALM: u8 = 0x06;
    pub const ENERGY_J: u8 = 0x01;
    pub const ENERGY_NM: u8 = 0x02;
    pub const ENERGY_WH: u8 = 0x03;
    pub const ENERGY_KWH: u8 = 0x04;
    pub const ENERGY_CAL: u8 = 0x05;
    pub const ENERGY_KCAL: u8 = 0x06;
}

/// Semantic family a type id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeFamily {
    /// Physical quantities (0x0000..=0x0015).
    Basic,
    /// Booleans and commands (0xFFF0..=0xFFF2).
    Logic,
    /// Generic analog (0xFF10).
    Generic,
}

impl TypeFamily {
    pub fn of(id: u16) -> Option<Self> {
        if (id as usize) < BASIC_TYPES.len() {
            Some(Self::Basic)
        } else if (type_id::PRESENCE..=type_id::COMMAND).contains(&id) {
            Some(Self::Logic)
        } else if id == type_id::ANALOG {
            Some(Self::Generic)
        } else {
            None
        }
    }
}

const fn units(list: &[u8]) -> u32 {
    let mut mask = 0u32;
    let mut i = 0;
    while i < list.len() {
        mask |= 1u32 << list[i];
        i += 1;
    }
    mask
}

/// Basic family table, indexed by type id: (value type, allowed unit mask).
const BASIC_TYPES: [(ValueType, u32); 22] = [
    (ValueType::Raw, 0xFFFF),
    (ValueType::Int, units(&[1, 2, 3])),
    (ValueType::Int, units(&[1, 2])),
    (ValueType::Int, units(&[1])),
    (ValueType::Int, units(&[1, 2, 3])),
    (ValueType::Int, units(&[1, 2, 3])),
    (ValueType::Int, units(&[1])),
    (ValueType::Int, units(&[1, 2, 3])),
    (ValueType::Int, units(&[1, 2, 3])),
    (ValueType::Int, units(&[1, 2, 3, 4])),
    (ValueType::Int, units(&[1, 2, 3])),
    (ValueType::Int, units(&[1, 2, 3, 4])),
    (ValueType::Float, units(&[1, 2])),
    (ValueType::Float, units(&[1, 2, 3, 4])),
    (ValueType::Float, units(&[1, 2, 3])),
    (ValueType::Float, units(&[1])),
    (ValueType::Float, units(&[1])),
    (ValueType::Float, units(&[1])),
    (ValueType::Float, units(&[1])),
    (ValueType::Int, units(&[1, 2, 3, 4])),
    (ValueType::Float, units(&[1, 2, 3, 4, 5, 6])),
    (ValueType::Int, units(&[1, 2, 3, 4, 5, 6])),
];

/// Logic family, indexed by the low nibble of the type id.
const LOGIC_TYPES: [ValueType; 3] = [ValueType::Bool, ValueType::Bool, ValueType::Raw];

/// Generic family, indexed by the low nibble of the type id.
const GENERIC_TYPES: [ValueType; 1] = [ValueType::Int];

/// Check a `(type_id, value_type, unit)` triple against the static tables.
///
/// Units are only constrained for the basic family.
pub fn schema_is_valid(id: u16, value_type: ValueType, unit: u8) -> bool {
    let index = (id & 0x000F) as usize;
    match TypeFamily::of(id) {
        Some(TypeFamily::Basic) => {
            let (expected, mask) = BASIC_TYPES[id as usize];
            expected == value_type && unit < 32 && mask & (1u32 << unit) != 0
        }
        Some(TypeFamily::Logic) => LOGIC_TYPES[index] == value_type,
        Some(TypeFamily::Generic) => GENERIC_TYPES[index] == value_type,
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Type/unit/name descriptor of a data item. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    pub value_type: ValueType,
    pub unit: u8,
    pub type_id: u16,
    pub name: ItemName,
}

impl Schema {
    /// Build a schema, truncating `name` to [`ITEM_NAME_LEN`] bytes.
    pub fn new(type_id: u16, value_type: ValueType, unit: u8, name: &str) -> Self {
        Self {
            value_type,
            unit,
            type_id,
            name: truncate_str(name),
        }
    }

    pub fn is_valid(&self) -> bool {
        schema_is_valid(self.type_id, self.value_type, self.unit)
    }
}

/// Copy the longest prefix of `s` that fits `N` bytes on a char boundary.
pub fn truncate_str<const N: usize>(s: &str) -> heapless::String<N> {
    let mut end = s.len().min(N);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = heapless::String::new();
    // Cannot fail: end <= N.
    let _ = out.push_str(&s[..end]);
    out
}

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// Live value of a data item. The variant always matches the schema.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i32),
    Float(f32),
    Bool(bool),
    Raw(RawValue),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::Int(_) => ValueType::Int,
            Self::Float(_) => ValueType::Float,
            Self::Bool(_) => ValueType::Bool,
            Self::Raw(_) => ValueType::Raw,
        }
    }

    /// Zero value of the given type.
    pub fn zero(value_type: ValueType) -> Self {
        match value_type {
            ValueType::Int => Self::Int(0),
            ValueType::Float => Self::Float(0.0),
            ValueType::Bool => Self::Bool(false),
            ValueType::Raw => Self::Raw(RawValue::new()),
        }
    }

    /// Build a raw value, failing if `bytes` exceeds [`RAW_VALUE_SIZE`].
    pub fn raw(bytes: &[u8]) -> Result<Self, CodecError> {
        RawValue::from_slice(bytes)
            .map(Self::Raw)
            .map_err(|_| CodecError::InvalidValue)
    }

    /// Number of bytes this value occupies on the wire.
    pub fn wire_len(&self) -> usize {
        match self {
            Self::Int(_) | Self::Float(_) => 4,
            Self::Bool(_) => 1,
            Self::Raw(raw) => raw.len(),
        }
    }

    /// Little-endian wire bytes.
    pub fn to_wire(&self) -> RawValue {
        let mut out = RawValue::new();
        // Every variant fits RAW_VALUE_SIZE.
        let _ = match self {
            Self::Int(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Float(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Bool(v) => out.push(u8::from(*v)).map_err(|_| ()),
            Self::Raw(raw) => out.extend_from_slice(raw),
        };
        out
    }

    /// Interpret wire bytes according to the item's value type.
    ///
    /// Fixed-size types read their natural width and ignore trailing bytes
    /// (the wire union is 16 bytes wide).
    pub fn from_wire(value_type: ValueType, bytes: &[u8]) -> Result<Self, CodecError> {
        match value_type {
            ValueType::Int => {
                let b: [u8; 4] = take4(bytes)?;
                Ok(Self::Int(i32::from_le_bytes(b)))
            }
            ValueType::Float => {
                let b: [u8; 4] = take4(bytes)?;
                Ok(Self::Float(f32::from_le_bytes(b)))
            }
            ValueType::Bool => match bytes.first() {
                Some(b) => Ok(Self::Bool(*b != 0)),
                None => Err(CodecError::InvalidValue),
            },
            ValueType::Raw => Self::raw(bytes),
        }
    }
}

fn take4(bytes: &[u8]) -> Result<[u8; 4], CodecError> {
    bytes
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or(CodecError::InvalidValue)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_family_units() {
        assert!(schema_is_valid(
            type_id::TEMPERATURE,
            ValueType::Int,
            unit::TEMPERATURE_C
        ));
        assert!(schema_is_valid(
            type_id::TEMPERATURE,
            ValueType::Int,
            unit::TEMPERATURE_K
        ));
        // Kelvin is the last temperature unit
        assert!(!schema_is_valid(type_id::TEMPERATURE, ValueType::Int, 0x04));
        assert!(!schema_is_valid(
            type_id::TEMPERATURE,
            ValueType::Float,
            unit::TEMPERATURE_C
        ));
        assert!(!schema_is_valid(
            type_id::TEMPERATURE,
            ValueType::Int,
            unit::NOT_APPLICABLE
        ));
        assert!(schema_is_valid(
            type_id::VOLUMEFLOW,
            ValueType::Float,
            unit::VOLUMEFLOW_GALM
        ));
        assert!(schema_is_valid(type_id::ENERGY, ValueType::Int, unit::ENERGY_KCAL));
    }

    #[test]
    fn test_type_none_accepts_raw_with_any_low_unit() {
        for u in 0..16 {
            assert!(schema_is_valid(type_id::NONE, ValueType::Raw, u));
        }
        assert!(!schema_is_valid(type_id::NONE, ValueType::Raw, 16));
        assert!(!schema_is_valid(type_id::NONE, ValueType::Int, 0));
    }

    #[test]
    fn test_logic_and_generic_families() {
        assert!(schema_is_valid(type_id::SWITCH, ValueType::Bool, 0));
        assert!(schema_is_valid(type_id::PRESENCE, ValueType::Bool, 0x7F));
        assert!(schema_is_valid(type_id::COMMAND, ValueType::Raw, 0));
        assert!(!schema_is_valid(type_id::COMMAND, ValueType::Bool, 0));
        assert!(schema_is_valid(type_id::ANALOG, ValueType::Int, 0));
        assert!(!schema_is_valid(type_id::ANALOG, ValueType::Float, 0));
    }

    #[test]
    fn test_unknown_type_ids_are_rejected() {
        for id in [0x0016u16, 0x0100, 0xFF11, 0xFFF3, 0xFFFF] {
            assert_eq!(TypeFamily::of(id), None);
            for vt in [ValueType::Int, ValueType::Float, ValueType::Bool, ValueType::Raw] {
                assert!(!schema_is_valid(id, vt, 1));
            }
        }
    }

    #[test]
    fn test_unit_shift_does_not_overflow() {
        assert!(!schema_is_valid(type_id::VOLTAGE, ValueType::Int, 0xFF));
    }

    #[test]
    fn test_schema_name_truncated() {
        let schema = Schema::new(
            type_id::SWITCH,
            ValueType::Bool,
            0,
            "a-very-long-data-item-name-that-overflows",
        );
        assert_eq!(schema.name.len(), ITEM_NAME_LEN);
        assert_eq!(schema.name.as_str(), "a-very-long-data-item-n");
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        let s: heapless::String<4> = truncate_str("abcé");
        assert_eq!(s.as_str(), "abc");
    }

    #[test]
    fn test_value_wire_conversion() {
        let v = Value::Int(-2);
        assert_eq!(v.to_wire().as_slice(), &[0xFE, 0xFF, 0xFF, 0xFF]);
        assert_eq!(Value::from_wire(ValueType::Int, &v.to_wire()).unwrap(), v);

        assert_eq!(
            Value::from_wire(ValueType::Bool, &[2]).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            Value::from_wire(ValueType::Float, &[0, 0]),
            Err(CodecError::InvalidValue)
        );
        assert_eq!(
            Value::from_wire(ValueType::Raw, &[0u8; 17]),
            Err(CodecError::InvalidValue)
        );
    }
}
