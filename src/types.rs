use crate::error::Error;
use bytes::Bytes;
use bytes_utils::Str;
use float_cmp::approx_eq;
use std::borrow::Cow;
use std::str;

/// A value in a request argument or response position.
///
/// Responses only produce `String`, `Bytes`, `Integer`, `Array`, `Null` and,
/// nested inside `Array` results such as EXEC replies, `Error`. The remaining
/// variants exist for request arguments and serialize to the textual forms
/// Redis expects: booleans as `1`/`0`, doubles as their shortest
/// non-scientific decimal, `Null` as an empty bulk string.
#[derive(Clone, Debug)]
pub enum Value {
  Boolean(bool),
  Integer(i64),
  Double(f64),
  String(Str),
  Bytes(Bytes),
  Null,
  Array(Vec<Value>),
  /// An error reply nested inside an array response.
  Error(Error),
}

impl Value {
  /// A helpful name for the variant, used in error context.
  pub fn type_name(&self) -> &'static str {
    match *self {
      Value::Boolean(_) => "boolean",
      Value::Integer(_) => "integer",
      Value::Double(_) => "double",
      Value::String(_) => "string",
      Value::Bytes(_) => "bytes",
      Value::Null => "null",
      Value::Array(_) => "array",
      Value::Error(_) => "error",
    }
  }

  pub fn is_null(&self) -> bool {
    matches!(*self, Value::Null)
  }

  /// Read the value as a string slice, if possible.
  pub fn as_str(&self) -> Option<Cow<'_, str>> {
    match *self {
      Value::String(ref s) => Some(Cow::Borrowed(&**s)),
      Value::Bytes(ref b) => str::from_utf8(b).ok().map(Cow::Borrowed),
      _ => None,
    }
  }

  /// Read the value as raw bytes, if possible.
  pub fn as_bytes(&self) -> Option<&[u8]> {
    match *self {
      Value::String(ref s) => Some(s.as_bytes()),
      Value::Bytes(ref b) => Some(b),
      _ => None,
    }
  }

  /// Read the value as an integer, if possible.
  pub fn as_i64(&self) -> Option<i64> {
    match *self {
      Value::Integer(i) => Some(i),
      _ => None,
    }
  }
}

impl PartialEq for Value {
  fn eq(&self, other: &Self) -> bool {
    match *self {
      Value::Boolean(ref s) => match *other {
        Value::Boolean(ref o) => s == o,
        _ => false,
      },
      Value::Integer(ref s) => match *other {
        Value::Integer(ref o) => s == o,
        _ => false,
      },
      Value::Double(ref s) => match *other {
        Value::Double(ref o) => approx_eq!(f64, *s, *o, ulps = 2),
        _ => false,
      },
      Value::String(ref s) => match *other {
        Value::String(ref o) => s == o,
        _ => false,
      },
      Value::Bytes(ref s) => match *other {
        Value::Bytes(ref o) => s == o,
        _ => false,
      },
      Value::Null => other.is_null(),
      Value::Array(ref s) => match *other {
        Value::Array(ref o) => s == o,
        _ => false,
      },
      Value::Error(ref s) => match *other {
        Value::Error(ref o) => s == o,
        _ => false,
      },
    }
  }
}

impl From<bool> for Value {
  fn from(v: bool) -> Value {
    Value::Boolean(v)
  }
}

macro_rules! impl_integer_value(
  ($t:ty) => {
    impl From<$t> for Value {
      fn from(v: $t) -> Value {
        Value::Integer(v as i64)
      }
    }
  }
);

impl_integer_value!(i8);
impl_integer_value!(i16);
impl_integer_value!(i32);
impl_integer_value!(i64);
impl_integer_value!(isize);
impl_integer_value!(u8);
impl_integer_value!(u16);
impl_integer_value!(u32);

impl From<u64> for Value {
  fn from(v: u64) -> Value {
    if v <= i64::MAX as u64 {
      Value::Integer(v as i64)
    } else {
      // too wide for the integer variant; the decimal digits are what ends up
      // on the wire either way
      Value::String(Str::from(v.to_string()))
    }
  }
}

impl From<usize> for Value {
  fn from(v: usize) -> Value {
    (v as u64).into()
  }
}

impl From<f64> for Value {
  fn from(v: f64) -> Value {
    Value::Double(v)
  }
}

impl From<f32> for Value {
  fn from(v: f32) -> Value {
    // render with 32-bit precision up front so the serialized form stays the
    // shortest decimal for the original float, not for its f64 widening
    Value::String(Str::from(v.to_string()))
  }
}

impl From<&str> for Value {
  fn from(v: &str) -> Value {
    Value::String(Str::from(v))
  }
}

impl From<String> for Value {
  fn from(v: String) -> Value {
    Value::String(Str::from(v))
  }
}

impl From<Str> for Value {
  fn from(v: Str) -> Value {
    Value::String(v)
  }
}

impl From<Bytes> for Value {
  fn from(v: Bytes) -> Value {
    Value::Bytes(v)
  }
}

impl From<Vec<u8>> for Value {
  fn from(v: Vec<u8>) -> Value {
    Value::Bytes(Bytes::from(v))
  }
}

impl From<&[u8]> for Value {
  fn from(v: &[u8]) -> Value {
    Value::Bytes(Bytes::copy_from_slice(v))
  }
}

impl From<Vec<Value>> for Value {
  fn from(v: Vec<Value>) -> Value {
    Value::Array(v)
  }
}

impl<T: Into<Value>> From<Option<T>> for Value {
  fn from(v: Option<T>) -> Value {
    match v {
      Some(v) => v.into(),
      None => Value::Null,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn should_convert_wide_unsigned_to_decimal_string() {
    let small: Value = 42u64.into();
    let wide: Value = u64::MAX.into();

    assert_eq!(small, Value::Integer(42));
    assert_eq!(wide, Value::String(Str::from("18446744073709551615")));
  }

  #[test]
  fn should_render_f32_with_32_bit_precision() {
    let v: Value = 0.1f32.into();
    assert_eq!(v, Value::String(Str::from("0.1")));
  }

  #[test]
  fn should_compare_doubles_approximately() {
    let a = Value::Double(0.1 + 0.2);
    let b = Value::Double(0.3);
    assert_eq!(a, b);
  }

  #[test]
  fn should_convert_option_to_null() {
    let none: Value = Option::<i64>::None.into();
    let some: Value = Some(7i64).into();

    assert!(none.is_null());
    assert_eq!(some, Value::Integer(7));
  }

  #[test]
  fn should_read_strings_from_both_variants() {
    let s = Value::String(Str::from("PONG"));
    let b = Value::Bytes(Bytes::from_static(b"PONG"));

    assert_eq!(s.as_str().as_deref(), Some("PONG"));
    assert_eq!(b.as_str().as_deref(), Some("PONG"));
    assert_eq!(s.as_bytes(), Some(&b"PONG"[..]));
  }
}
