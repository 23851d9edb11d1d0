// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Register word codecs
//!
//! Raw register words go through two conversions on the way in: assembly
//! into the register's data type, then scaling.  Scaled integer types are
//! truncated toward zero, which is what the device documentation specifies
//! (a `battery_voltage` of 48.5 V at scale 0.1 reads as 48).  `F32` keeps
//! its fraction.
//!
//! On the way out only the 16-bit types can be encoded; the device accepts
//! single-register writes only.

use serde::Serialize;
use thiserror::Error;

/// Interpretation of one or two register words.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    U16,
    I16,
    U32,
    I32,
    F32,
    Bool,
}

impl DataType {
    /// Number of consecutive words occupied by a value of this type.
    pub fn word_count(self) -> u16 {
        match self {
            DataType::U32 | DataType::I32 | DataType::F32 => 2,
            _ => 1,
        }
    }
}

impl core::fmt::Display for DataType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            DataType::U16 => "u16",
            DataType::I16 => "i16",
            DataType::U32 => "u32",
            DataType::I32 => "i32",
            DataType::F32 => "f32",
            DataType::Bool => "bool",
        };
        write!(f, "{}", name)
    }
}

/// A decoded, scaled register value.
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl Value {
    /// Numeric view; `None` for booleans.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Bool(_) => None,
        }
    }
}

impl core::fmt::Display for Value {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Value::Integer(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Integer(v) => serde_json::Value::from(v),
            Value::Float(v) => serde_json::Value::from(v),
            Value::Bool(v) => serde_json::Value::from(v),
        }
    }
}

#[derive(Copy, Clone, Debug, Error, Eq, PartialEq)]
pub enum EncodeError {
    /// Only single-word writes are implemented.
    #[error("writing {0} registers is not implemented")]
    Unsupported(DataType),
    /// The scaled value does not fit the register.
    #[error("value does not fit a {0} register")]
    OutOfRange(DataType),
}

/// Decodes raw words into a scaled value.  A short buffer yields `None`
/// rather than an error; callers treat the value as absent.
pub fn decode(words: &[u16], ty: DataType, scale: f64) -> Option<Value> {
    if words.len() < ty.word_count() as usize {
        return None;
    }

    let value = match ty {
        DataType::U16 => Value::Integer((f64::from(words[0]) * scale).trunc() as i64),
        DataType::I16 => {
            let signed = words[0] as i16;
            Value::Integer((f64::from(signed) * scale).trunc() as i64)
        }
        DataType::U32 => {
            // First word is the high half.
            let raw = (u32::from(words[0]) << 16) | u32::from(words[1]);
            Value::Integer((f64::from(raw) * scale).trunc() as i64)
        }
        DataType::I32 => {
            let raw = ((u32::from(words[0]) << 16) | u32::from(words[1])) as i32;
            Value::Integer((f64::from(raw) * scale).trunc() as i64)
        }
        DataType::F32 => {
            let raw = f32::from_bits((u32::from(words[0]) << 16) | u32::from(words[1]));
            Value::Float(f64::from(raw) * scale)
        }
        DataType::Bool => Value::Bool(words[0] != 0),
    };

    Some(value)
}

/// Encodes a caller-supplied value into a single register word, dividing by
/// the scale and truncating.
pub fn encode(value: f64, ty: DataType, scale: f64) -> Result<u16, EncodeError> {
    let scaled = (value / scale).trunc();

    match ty {
        DataType::U16 => {
            if scaled < 0.0 || scaled > f64::from(u16::MAX) {
                return Err(EncodeError::OutOfRange(ty));
            }
            Ok(scaled as u16)
        }
        DataType::I16 => {
            if scaled < f64::from(i16::MIN) || scaled > f64::from(i16::MAX) {
                return Err(EncodeError::OutOfRange(ty));
            }
            Ok(scaled as i16 as u16)
        }
        _ => Err(EncodeError::Unsupported(ty)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn u16_scaling_truncates() {
        // 485 at scale 0.1 is 48.5, reported as 48.
        assert_eq!(decode(&[485], DataType::U16, 0.1), Some(Value::Integer(48)));
        assert_eq!(decode(&[76], DataType::U16, 1.0), Some(Value::Integer(76)));
        assert_eq!(
            decode(&[6000], DataType::U16, 0.01),
            Some(Value::Integer(60))
        );
    }

    #[test]
    fn i16_is_twos_complement() {
        assert_eq!(
            decode(&[0xffff], DataType::I16, 1.0),
            Some(Value::Integer(-1))
        );
        assert_eq!(
            decode(&[0x8000], DataType::I16, 1.0),
            Some(Value::Integer(-32768))
        );
        // -123 at scale 0.1 truncates toward zero: -12.3 -> -12.
        assert_eq!(
            decode(&[(-123i16) as u16], DataType::I16, 0.1),
            Some(Value::Integer(-12))
        );
    }

    #[test]
    fn u32_assembles_high_then_low() {
        assert_eq!(
            decode(&[0x0001, 0x0000], DataType::U32, 1.0),
            Some(Value::Integer(65536))
        );
        assert_eq!(
            decode(&[0xffff, 0xffff], DataType::U32, 1.0),
            Some(Value::Integer(4294967295))
        );
    }

    #[test]
    fn i32_sign_carries_through_scale() {
        assert_eq!(
            decode(&[0xffff, 0xffff], DataType::I32, 1.0),
            Some(Value::Integer(-1))
        );
        assert_eq!(
            decode(&[0xffff, 0xff38], DataType::I32, 0.1),
            Some(Value::Integer(-20))
        );
    }

    #[test]
    fn f32_is_ieee754_big_endian() {
        let bits = 1.5f32.to_bits();
        let words = [(bits >> 16) as u16, bits as u16];
        assert_eq!(decode(&words, DataType::F32, 2.0), Some(Value::Float(3.0)));
    }

    #[test]
    fn bool_is_nonzero() {
        assert_eq!(decode(&[0], DataType::Bool, 1.0), Some(Value::Bool(false)));
        assert_eq!(decode(&[7], DataType::Bool, 1.0), Some(Value::Bool(true)));
    }

    #[test]
    fn short_buffers_are_absent_not_fatal() {
        assert_eq!(decode(&[], DataType::U16, 1.0), None);
        assert_eq!(decode(&[1], DataType::U32, 1.0), None);
        assert_eq!(decode(&[1], DataType::F32, 1.0), None);
    }

    #[test]
    fn encode_divides_by_scale() {
        // 48.0 V at scale 0.1 becomes the raw word 480.
        assert_eq!(encode(48.0, DataType::U16, 0.1), Ok(480));
        assert_eq!(encode(1.0, DataType::U16, 1.0), Ok(1));
        assert_eq!(encode(1430.0, DataType::U16, 1.0), Ok(1430));
        assert_eq!(encode(-5.0, DataType::I16, 1.0), Ok((-5i16) as u16));
    }

    #[test]
    fn encode_rejects_wide_types_and_overflow() {
        assert_eq!(
            encode(1.0, DataType::U32, 1.0),
            Err(EncodeError::Unsupported(DataType::U32))
        );
        assert_eq!(
            encode(1.0, DataType::F32, 1.0),
            Err(EncodeError::Unsupported(DataType::F32))
        );
        assert_eq!(
            encode(70000.0, DataType::U16, 1.0),
            Err(EncodeError::OutOfRange(DataType::U16))
        );
        assert_eq!(
            encode(-1.0, DataType::U16, 1.0),
            Err(EncodeError::OutOfRange(DataType::U16))
        );
        assert_eq!(
            encode(40000.0, DataType::I16, 1.0),
            Err(EncodeError::OutOfRange(DataType::I16))
        );
    }

    proptest! {
        #[test]
        fn decode_never_panics(words in proptest::collection::vec(any::<u16>(), 0..4),
                               scale in prop_oneof![Just(0.01), Just(0.1), Just(1.0)]) {
            for ty in [DataType::U16, DataType::I16, DataType::U32,
                       DataType::I32, DataType::F32, DataType::Bool] {
                let _ = decode(&words, ty, scale);
            }
        }

        #[test]
        fn unscaled_u16_roundtrips(word in any::<u16>()) {
            let decoded = decode(&[word], DataType::U16, 1.0).unwrap();
            let Value::Integer(v) = decoded else { panic!() };
            prop_assert_eq!(encode(v as f64, DataType::U16, 1.0), Ok(word));
        }

        #[test]
        fn unscaled_i16_roundtrips(word in any::<u16>()) {
            let decoded = decode(&[word], DataType::I16, 1.0).unwrap();
            let Value::Integer(v) = decoded else { panic!() };
            prop_assert_eq!(encode(v as f64, DataType::I16, 1.0), Ok(word));
        }

        #[test]
        fn i16_decode_is_symmetric_around_zero(mag in 1i16..=i16::MAX) {
            let pos = decode(&[mag as u16], DataType::I16, 0.1).unwrap();
            let neg = decode(&[(-mag) as u16], DataType::I16, 0.1).unwrap();
            let (Value::Integer(p), Value::Integer(n)) = (pos, neg) else { panic!() };
            prop_assert_eq!(p, -n);
        }
    }
}
