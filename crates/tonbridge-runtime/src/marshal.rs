//! Value marshalling between native structured values and guest values.
//!
//! Encoding serializes domain records straight into guest values, so an
//! absent `Option` stays distinguishable from an explicit null at any
//! nesting depth. Decoding goes through `serde_json::Value` as the
//! interchange shape. Two rules hold everywhere:
//!
//! - null and undefined never collapse into each other. A `None` optional
//!   encodes as guest *undefined* (skipped as a record member); JSON null
//!   encodes as guest *null*; decoding tags the failure with which of the
//!   two it saw.
//! - Decoding is all-or-nothing. A failure anywhere inside a nested record
//!   aborts the whole decode; partially populated values are never returned.
//!
//! Domain-specific scalar conversions (such as big integers carried as
//! decimal strings) are explicit converters layered on top of this module,
//! never special cases inside the generic path.

use std::fmt;

use num_bigint::BigUint;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as Json;
use thiserror::Error;
use tonbridge_core::{GuestObjectRef, GuestValue, ScriptContext};

/// Why a value conversion failed. The three causes are semantically
/// different and are never folded into one message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MarshalError {
    #[error("guest value was null")]
    Null,

    #[error("guest value was undefined")]
    Undefined,

    #[error("type mismatch: expected {0}")]
    TypeMismatch(&'static str),
}

/// Materialize a JSON tree as a guest value.
pub fn encode_json(ctx: &dyn ScriptContext, value: &Json) -> GuestValue {
    match value {
        Json::Null => GuestValue::Null,
        Json::Bool(b) => GuestValue::Bool(*b),
        Json::Number(n) => GuestValue::Number(n.as_f64().unwrap_or(f64::NAN)),
        Json::String(s) => GuestValue::String(s.clone()),
        Json::Array(items) => {
            GuestValue::Array(items.iter().map(|item| encode_json(ctx, item)).collect())
        }
        Json::Object(map) => {
            let object = ctx.create_object();
            for (key, item) in map {
                object.set_member(key, encode_json(ctx, item));
            }
            GuestValue::Object(object)
        }
    }
}

/// Encode a serializable domain value.
///
/// `None` optionals encode as guest *undefined* at every nesting depth:
/// undefined record members are skipped, undefined array slots become null
/// (arrays have no absence). An explicit `serde_json::Value::Null` member
/// stays guest null.
pub fn encode<T: Serialize>(ctx: &dyn ScriptContext, value: &T) -> Result<GuestValue, MarshalError> {
    value
        .serialize(GuestSerializer { ctx })
        .map_err(|_| MarshalError::TypeMismatch("serializable value"))
}

/// Encode an optional domain value. `None` becomes guest *undefined*, never
/// null — the two must stay distinguishable across the boundary.
pub fn encode_opt<T: Serialize>(
    ctx: &dyn ScriptContext,
    value: &Option<T>,
) -> Result<GuestValue, MarshalError> {
    match value {
        Some(value) => encode(ctx, value),
        None => Ok(GuestValue::Undefined),
    }
}

/// Serializer error; folded into [`MarshalError::TypeMismatch`] by `encode`.
#[derive(Debug)]
struct EncodeError(String);

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for EncodeError {}

impl serde::ser::Error for EncodeError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        Self(msg.to_string())
    }
}

/// Serializes directly into guest values. `serialize_none` is the one place
/// the serde data model distinguishes an absent optional from an explicit
/// null (`serialize_unit`), so this is where undefined is produced.
#[derive(Clone, Copy)]
struct GuestSerializer<'a> {
    ctx: &'a dyn ScriptContext,
}

struct SeqEncoder<'a> {
    ctx: &'a dyn ScriptContext,
    items: Vec<GuestValue>,
    variant: Option<&'static str>,
}

struct MapEncoder<'a> {
    ctx: &'a dyn ScriptContext,
    object: GuestObjectRef,
    key: Option<String>,
    variant: Option<&'static str>,
}

impl<'a> serde::Serializer for GuestSerializer<'a> {
    type Ok = GuestValue;
    type Error = EncodeError;
    type SerializeSeq = SeqEncoder<'a>;
    type SerializeTuple = SeqEncoder<'a>;
    type SerializeTupleStruct = SeqEncoder<'a>;
    type SerializeTupleVariant = SeqEncoder<'a>;
    type SerializeMap = MapEncoder<'a>;
    type SerializeStruct = MapEncoder<'a>;
    type SerializeStructVariant = MapEncoder<'a>;

    fn serialize_bool(self, v: bool) -> Result<GuestValue, EncodeError> {
        Ok(GuestValue::Bool(v))
    }

    fn serialize_i8(self, v: i8) -> Result<GuestValue, EncodeError> {
        Ok(GuestValue::Number(v as f64))
    }

    fn serialize_i16(self, v: i16) -> Result<GuestValue, EncodeError> {
        Ok(GuestValue::Number(v as f64))
    }

    fn serialize_i32(self, v: i32) -> Result<GuestValue, EncodeError> {
        Ok(GuestValue::Number(v as f64))
    }

    fn serialize_i64(self, v: i64) -> Result<GuestValue, EncodeError> {
        Ok(GuestValue::Number(v as f64))
    }

    fn serialize_u8(self, v: u8) -> Result<GuestValue, EncodeError> {
        Ok(GuestValue::Number(v as f64))
    }

    fn serialize_u16(self, v: u16) -> Result<GuestValue, EncodeError> {
        Ok(GuestValue::Number(v as f64))
    }

    fn serialize_u32(self, v: u32) -> Result<GuestValue, EncodeError> {
        Ok(GuestValue::Number(v as f64))
    }

    fn serialize_u64(self, v: u64) -> Result<GuestValue, EncodeError> {
        Ok(GuestValue::Number(v as f64))
    }

    fn serialize_f32(self, v: f32) -> Result<GuestValue, EncodeError> {
        Ok(GuestValue::Number(v as f64))
    }

    fn serialize_f64(self, v: f64) -> Result<GuestValue, EncodeError> {
        Ok(GuestValue::Number(v))
    }

    fn serialize_char(self, v: char) -> Result<GuestValue, EncodeError> {
        Ok(GuestValue::String(v.to_string()))
    }

    fn serialize_str(self, v: &str) -> Result<GuestValue, EncodeError> {
        Ok(GuestValue::String(v.to_string()))
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<GuestValue, EncodeError> {
        Ok(GuestValue::Bytes(v.to_vec()))
    }

    fn serialize_none(self) -> Result<GuestValue, EncodeError> {
        Ok(GuestValue::Undefined)
    }

    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<GuestValue, EncodeError> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<GuestValue, EncodeError> {
        Ok(GuestValue::Null)
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<GuestValue, EncodeError> {
        Ok(GuestValue::Null)
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
    ) -> Result<GuestValue, EncodeError> {
        Ok(GuestValue::String(variant.to_string()))
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<GuestValue, EncodeError> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<GuestValue, EncodeError> {
        let inner = value.serialize(self)?;
        let object = self.ctx.create_object();
        object.set_member(variant, inner);
        Ok(GuestValue::Object(object))
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<SeqEncoder<'a>, EncodeError> {
        Ok(SeqEncoder {
            ctx: self.ctx,
            items: Vec::with_capacity(len.unwrap_or(0)),
            variant: None,
        })
    }

    fn serialize_tuple(self, len: usize) -> Result<SeqEncoder<'a>, EncodeError> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> Result<SeqEncoder<'a>, EncodeError> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<SeqEncoder<'a>, EncodeError> {
        Ok(SeqEncoder {
            ctx: self.ctx,
            items: Vec::with_capacity(len),
            variant: Some(variant),
        })
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<MapEncoder<'a>, EncodeError> {
        Ok(MapEncoder {
            ctx: self.ctx,
            object: self.ctx.create_object(),
            key: None,
            variant: None,
        })
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<MapEncoder<'a>, EncodeError> {
        self.serialize_map(None)
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<MapEncoder<'a>, EncodeError> {
        Ok(MapEncoder {
            ctx: self.ctx,
            object: self.ctx.create_object(),
            key: None,
            variant: Some(variant),
        })
    }
}

impl SeqEncoder<'_> {
    fn push(&mut self, value: &(impl Serialize + ?Sized)) -> Result<(), EncodeError> {
        let item = value.serialize(GuestSerializer { ctx: self.ctx })?;
        // Array slots have no absence; an undefined element becomes null.
        self.items.push(if item.is_undefined() {
            GuestValue::Null
        } else {
            item
        });
        Ok(())
    }

    fn finish(self) -> GuestValue {
        let array = GuestValue::Array(self.items);
        match self.variant {
            Some(name) => {
                let object = self.ctx.create_object();
                object.set_member(name, array);
                GuestValue::Object(object)
            }
            None => array,
        }
    }
}

impl serde::ser::SerializeSeq for SeqEncoder<'_> {
    type Ok = GuestValue;
    type Error = EncodeError;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), EncodeError> {
        self.push(value)
    }

    fn end(self) -> Result<GuestValue, EncodeError> {
        Ok(self.finish())
    }
}

impl serde::ser::SerializeTuple for SeqEncoder<'_> {
    type Ok = GuestValue;
    type Error = EncodeError;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), EncodeError> {
        self.push(value)
    }

    fn end(self) -> Result<GuestValue, EncodeError> {
        Ok(self.finish())
    }
}

impl serde::ser::SerializeTupleStruct for SeqEncoder<'_> {
    type Ok = GuestValue;
    type Error = EncodeError;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), EncodeError> {
        self.push(value)
    }

    fn end(self) -> Result<GuestValue, EncodeError> {
        Ok(self.finish())
    }
}

impl serde::ser::SerializeTupleVariant for SeqEncoder<'_> {
    type Ok = GuestValue;
    type Error = EncodeError;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), EncodeError> {
        self.push(value)
    }

    fn end(self) -> Result<GuestValue, EncodeError> {
        Ok(self.finish())
    }
}

impl MapEncoder<'_> {
    /// Undefined members are skipped entirely, like `JSON.stringify`.
    fn set(&mut self, key: &str, value: &(impl Serialize + ?Sized)) -> Result<(), EncodeError> {
        let member = value.serialize(GuestSerializer { ctx: self.ctx })?;
        if !member.is_undefined() {
            self.object.set_member(key, member);
        }
        Ok(())
    }

    fn finish(self) -> GuestValue {
        match self.variant {
            Some(name) => {
                let outer = self.ctx.create_object();
                outer.set_member(name, GuestValue::Object(self.object));
                GuestValue::Object(outer)
            }
            None => GuestValue::Object(self.object),
        }
    }
}

impl serde::ser::SerializeMap for MapEncoder<'_> {
    type Ok = GuestValue;
    type Error = EncodeError;

    fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> Result<(), EncodeError> {
        let key = match key.serialize(GuestSerializer { ctx: self.ctx })? {
            GuestValue::String(s) => s,
            GuestValue::Number(n) if n.fract() == 0.0 => (n as i64).to_string(),
            _ => return Err(EncodeError("map key must be a string".to_string())),
        };
        self.key = Some(key);
        Ok(())
    }

    fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), EncodeError> {
        let key = self
            .key
            .take()
            .ok_or_else(|| EncodeError("map value without a key".to_string()))?;
        self.set(&key, value)
    }

    fn end(self) -> Result<GuestValue, EncodeError> {
        Ok(self.finish())
    }
}

impl serde::ser::SerializeStruct for MapEncoder<'_> {
    type Ok = GuestValue;
    type Error = EncodeError;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), EncodeError> {
        self.set(key, value)
    }

    fn end(self) -> Result<GuestValue, EncodeError> {
        Ok(self.finish())
    }
}

impl serde::ser::SerializeStructVariant for MapEncoder<'_> {
    type Ok = GuestValue;
    type Error = EncodeError;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), EncodeError> {
        self.set(key, value)
    }

    fn end(self) -> Result<GuestValue, EncodeError> {
        Ok(self.finish())
    }
}

/// Convert a guest value to a JSON tree.
///
/// Follows `JSON.stringify` shape rules: undefined object members are
/// skipped, undefined array slots become null. A top-level undefined is an
/// error, as are functions and promises (they are not data).
pub fn guest_to_json(value: &GuestValue) -> Result<Json, MarshalError> {
    match value {
        GuestValue::Undefined => Err(MarshalError::Undefined),
        GuestValue::Null => Ok(Json::Null),
        GuestValue::Bool(b) => Ok(Json::Bool(*b)),
        GuestValue::Number(n) => number_to_json(*n),
        GuestValue::String(s) => Ok(Json::String(s.clone())),
        GuestValue::Bytes(bytes) => Ok(Json::Array(
            bytes.iter().map(|b| Json::Number((*b).into())).collect(),
        )),
        GuestValue::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                if item.is_undefined() {
                    out.push(Json::Null);
                } else {
                    out.push(guest_to_json(item)?);
                }
            }
            Ok(Json::Array(out))
        }
        GuestValue::Object(object) => {
            let mut map = serde_json::Map::new();
            for name in object.member_names() {
                let member = object.get_member(&name).unwrap_or(GuestValue::Undefined);
                if member.is_undefined() {
                    continue;
                }
                map.insert(name, guest_to_json(&member)?);
            }
            Ok(Json::Object(map))
        }
        GuestValue::Function(_) | GuestValue::Promise(_) => {
            Err(MarshalError::TypeMismatch("data value"))
        }
    }
}

fn number_to_json(n: f64) -> Result<Json, MarshalError> {
    // Keep whole numbers integral so they decode into integer fields.
    if n.fract() == 0.0 && n >= i64::MIN as f64 && n <= i64::MAX as f64 {
        return Ok(Json::Number((n as i64).into()));
    }
    serde_json::Number::from_f64(n)
        .map(Json::Number)
        .ok_or(MarshalError::TypeMismatch("finite number"))
}

/// Decode a guest value into a required native type.
///
/// Script-null fails with [`MarshalError::Null`], script-undefined with
/// [`MarshalError::Undefined`], and a present value of the wrong shape with
/// [`MarshalError::TypeMismatch`].
pub fn decode<T: DeserializeOwned>(value: &GuestValue) -> Result<T, MarshalError> {
    match value {
        GuestValue::Undefined => Err(MarshalError::Undefined),
        GuestValue::Null => Err(MarshalError::Null),
        other => {
            let json = guest_to_json(other)?;
            serde_json::from_value(json)
                .map_err(|_| MarshalError::TypeMismatch(std::any::type_name::<T>()))
        }
    }
}

/// Decode a guest value into an optional native type. Both script-null and
/// script-undefined become `None`; anything else decodes as required.
pub fn decode_opt<T: DeserializeOwned>(value: &GuestValue) -> Result<Option<T>, MarshalError> {
    if value.is_nullish() {
        return Ok(None);
    }
    decode(value).map(Some)
}

/// Decode an arbitrary-precision unsigned integer carried as a decimal
/// string on the wire. Explicit converter; the generic path never guesses.
pub fn decode_big_uint(value: &GuestValue) -> Result<BigUint, MarshalError> {
    let text: String = decode(value)?;
    text.parse::<BigUint>()
        .map_err(|_| MarshalError::TypeMismatch("decimal integer string"))
}

/// Encode an arbitrary-precision unsigned integer as its decimal string.
pub fn encode_big_uint(value: &BigUint) -> GuestValue {
    GuestValue::String(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use tonbridge_core::mock::MockContext;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Transfer {
        to: String,
        amount: u64,
        comment: Option<String>,
    }

    #[test]
    fn decode_distinguishes_null_and_undefined() {
        assert_eq!(
            decode::<String>(&GuestValue::Undefined),
            Err(MarshalError::Undefined)
        );
        assert_eq!(decode::<String>(&GuestValue::Null), Err(MarshalError::Null));
        assert!(matches!(
            decode::<String>(&GuestValue::Number(4.0)),
            Err(MarshalError::TypeMismatch(_))
        ));
    }

    #[test]
    fn decode_opt_absorbs_both_nullish_values() {
        assert_eq!(decode_opt::<String>(&GuestValue::Undefined), Ok(None));
        assert_eq!(decode_opt::<String>(&GuestValue::Null), Ok(None));
        assert_eq!(
            decode_opt::<String>(&GuestValue::String("x".into())),
            Ok(Some("x".into()))
        );
    }

    #[test]
    fn encode_none_is_undefined_not_null() {
        let ctx = MockContext::new();
        let absent = encode_opt::<String>(&*ctx, &None).unwrap();
        assert!(absent.is_undefined());
        assert!(!absent.is_null());
    }

    #[test]
    fn nested_none_members_encode_as_undefined() {
        let ctx = MockContext::new();
        let transfer = Transfer {
            to: "EQabc".into(),
            amount: 1,
            comment: None,
        };
        let guest = encode(&*ctx, &transfer).unwrap();
        let object = guest.as_object().unwrap();
        assert!(object.get_member("comment").is_none());
        assert_eq!(object.get_member("to").unwrap().as_str(), Some("EQabc"));

        // An explicit domain null is not an absent optional.
        let guest = encode(&*ctx, &json!({"comment": null})).unwrap();
        let comment = guest.as_object().unwrap().get_member("comment").unwrap();
        assert!(comment.is_null());

        // Arrays have no absence; a None slot becomes null.
        let guest = encode(&*ctx, &vec![Some(1u32), None]).unwrap();
        match guest {
            GuestValue::Array(items) => {
                assert_eq!(items[0].as_f64(), Some(1.0));
                assert!(items[1].is_null());
            }
            other => panic!("expected array, got {other:?}"),
        }
    }

    #[test]
    fn record_round_trip() {
        let ctx = MockContext::new();
        let transfer = Transfer {
            to: "EQabc".into(),
            amount: 1_000_000,
            comment: None,
        };
        let guest = encode(&*ctx, &transfer).unwrap();
        let back: Transfer = decode(&guest).unwrap();
        assert_eq!(back, transfer);
    }

    #[test]
    fn nested_decode_is_all_or_nothing() {
        let ctx = MockContext::new();
        // amount is a string, so the whole record must fail to decode.
        let guest = encode_json(
            &*ctx,
            &json!({"to": "EQabc", "amount": "not-a-number", "comment": null}),
        );
        assert!(matches!(
            decode::<Transfer>(&guest),
            Err(MarshalError::TypeMismatch(_))
        ));
    }

    #[test]
    fn undefined_members_are_skipped_in_records() {
        let ctx = MockContext::new();
        let object = ctx.create_object();
        object.set_member("keep", GuestValue::Number(1.0));
        object.set_member("drop", GuestValue::Undefined);
        let json = guest_to_json(&GuestValue::Object(object)).unwrap();
        assert_eq!(json, json!({"keep": 1}));
    }

    #[test]
    fn whole_numbers_stay_integral() {
        assert_eq!(guest_to_json(&GuestValue::Number(42.0)).unwrap(), json!(42));
        assert_eq!(
            guest_to_json(&GuestValue::Number(1.5)).unwrap(),
            json!(1.5)
        );
    }

    #[test]
    fn big_uint_decimal_string_converter() {
        let value = GuestValue::String("340282366920938463463374607431768211456".into());
        let big = decode_big_uint(&value).unwrap();
        assert_eq!(big.to_string(), "340282366920938463463374607431768211456");
        assert!(matches!(
            decode_big_uint(&GuestValue::String("12abc".into())),
            Err(MarshalError::TypeMismatch(_))
        ));
        match encode_big_uint(&big) {
            GuestValue::String(s) => {
                assert_eq!(s, "340282366920938463463374607431768211456")
            }
            other => panic!("expected string, got {other:?}"),
        }
    }
}
