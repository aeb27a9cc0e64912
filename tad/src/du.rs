//! Data units, the typed atoms of templates and patterns.
//!
//! Every header field of a PDU holds one [`DataUnit`]. On the send side a unit must resolve to a
//! concrete value (or leave the field to the layer default), on the receive side it decides
//! whether the field bytes of a frame are acceptable. The latter is the universal matcher, see
//! [`DataUnit::matches`].
//!
//! [`DataUnit`]: enum.DataUnit.html
//! [`DataUnit::matches`]: enum.DataUnit.html#method.matches
use core::{convert::TryFrom, fmt};

use byteorder::{ByteOrder, NetworkEndian};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::args::Arg;
use crate::error::{Error, Result};
use crate::expr::Expr;
use crate::wire::Octets;

/// Prefix of the only supported script language.
pub const SCRIPT_EXPR_PREFIX: &str = "expr:";

/// One typed field value of a template or pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum DataUnit {
    Int32(i32),
    Int64(i64),
    String(String),
    Bytes(Vec<u8>),
    /// Accept field bytes equal to `value` wherever `mask` has bits set.
    Mask {
        mask: Vec<u8>,
        value: Vec<u8>,
    },
    /// Accept integers inside any of the inclusive intervals.
    Intervals(Vec<Interval>),
    Expr(Expr),
    /// A script, of which only the `expr:` language exists.
    Script(Expr),
    /// Leave the integer field to the layer, accept anything.
    IntUndef,
    /// Leave the octet field to the layer, accept anything.
    BytesUndef,
}

/// An inclusive range of integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    /// First accepted value.
    pub b: i64,
    /// Last accepted value.
    pub e: i64,
}

impl DataUnit {
    /// The integer variant of the smallest fitting width.
    pub fn int(value: i64) -> Self {
        match i32::try_from(value) {
            Ok(small) => DataUnit::Int32(small),
            Err(_) => DataUnit::Int64(value),
        }
    }

    /// An octet string unit.
    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        DataUnit::Bytes(data.into())
    }

    /// A script unit, only `expr:` scripts are understood.
    pub fn script(source: &str) -> Result<Self> {
        if !source.starts_with(SCRIPT_EXPR_PREFIX) {
            return Err(Error::NotImplemented("script languages other than expr"));
        }
        let expr = source[SCRIPT_EXPR_PREFIX.len()..].parse()?;
        Ok(DataUnit::Script(expr))
    }

    /// A mask unit, `mask` and `value` need the same length.
    pub fn mask(mask: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Result<Self> {
        let (mask, value) = (mask.into(), value.into());
        if mask.len() != value.len() {
            return Err(Error::BadNds(format!(
                "mask of {} octets with value of {} octets", mask.len(), value.len())));
        }
        Ok(DataUnit::Mask { mask, value })
    }

    /// Whether the unit leaves the value to the layer.
    pub fn is_undef(&self) -> bool {
        match self {
            DataUnit::IntUndef | DataUnit::BytesUndef => true,
            _ => false,
        }
    }

    /// Whether the unit can only be used to match.
    pub fn is_pattern_only(&self) -> bool {
        match self {
            DataUnit::Mask { .. } | DataUnit::Intervals(_) => true,
            _ => false,
        }
    }

    /// Resolve the unit to an integer for sending.
    ///
    /// Undefined units yield `None`, the layer decides then.
    pub fn to_int(&self, args: &[Arg]) -> Result<Option<i64>> {
        match self {
            DataUnit::Int32(value) => Ok(Some(i64::from(*value))),
            DataUnit::Int64(value) => Ok(Some(*value)),
            DataUnit::Expr(expr) | DataUnit::Script(expr) => expr.eval(args).map(Some),
            DataUnit::IntUndef | DataUnit::BytesUndef => Ok(None),
            DataUnit::String(_) | DataUnit::Bytes(_) => {
                Err(Error::GenerateFailed(format!("{} is not an integer", self)))
            },
            DataUnit::Mask { .. } | DataUnit::Intervals(_) => {
                Err(Error::GenerateFailed(format!("{} can not be sent", self)))
            },
        }
    }

    /// Resolve the unit to `len` octets for sending.
    ///
    /// Integers are written in network byte order and must fit. Strings and octet strings must
    /// have exactly the requested length when one is given.
    pub fn to_octets(&self, args: &[Arg], len: Option<usize>) -> Result<Option<Vec<u8>>> {
        let octets = match self {
            DataUnit::Bytes(data) => data.clone(),
            DataUnit::String(text) => text.as_bytes().to_vec(),
            DataUnit::IntUndef | DataUnit::BytesUndef => return Ok(None),
            DataUnit::Mask { .. } | DataUnit::Intervals(_) => {
                return Err(Error::GenerateFailed(format!("{} can not be sent", self)));
            },
            _ => {
                let value = self.to_int(args)?.unwrap_or_default();
                let len = len.ok_or_else(|| Error::GenerateFailed(
                    "integer for a field of unknown width".into()))?;
                return int_to_octets(value, len).map(Some);
            },
        };

        match len {
            Some(len) if len != octets.len() => Err(Error::GenerateFailed(format!(
                "value of {} octets for a field of {} octets", octets.len(), len))),
            _ => Ok(Some(octets)),
        }
    }

    /// Match the bytes of a received field.
    ///
    /// Returns the field in its plain form on success: integers as numbers, everything else as
    /// the received octets. Integer fields must be 1, 2 or 4 octets wide. Strings, octet strings
    /// and masks require exactly the same length.
    pub fn matches(&self, data: &[u8], args: &[Arg]) -> Result<DataUnit> {
        match self {
            DataUnit::Int32(_) | DataUnit::Int64(_) | DataUnit::Expr(_) | DataUnit::Script(_) => {
                let expected = self.to_int(args)?.unwrap_or_default();
                if expected > i64::from(u32::max_value()) || expected < i64::from(i32::min_value()) {
                    return Err(Error::NotImplemented("64-bit values in matched fields"));
                }
                let received = read_network_int(data)?;
                // Negative 32-bit patterns compare by their bit pattern.
                let expected = u64::from(expected as u32);
                if expected == received {
                    Ok(DataUnit::int(received as i64))
                } else {
                    Err(Error::MatchNotFound)
                }
            },
            DataUnit::IntUndef => Ok(DataUnit::int(read_network_int(data)? as i64)),
            DataUnit::String(text) => {
                if text.as_bytes() == data {
                    Ok(DataUnit::String(text.clone()))
                } else {
                    Err(Error::MatchNotFound)
                }
            },
            DataUnit::Bytes(expected) => {
                if expected.as_slice() == data {
                    Ok(DataUnit::Bytes(data.to_vec()))
                } else {
                    Err(Error::MatchNotFound)
                }
            },
            DataUnit::Mask { mask, value } => {
                if mask.len() != value.len() {
                    return Err(Error::BadNds("mask and value lengths differ".into()));
                }
                if data.len() != mask.len() {
                    return Err(Error::MatchNotFound);
                }
                let hit = data.iter()
                    .zip(mask.iter().zip(value))
                    .all(|(input, (mask, value))| input & mask == value & mask);
                if hit {
                    Ok(DataUnit::Bytes(data.to_vec()))
                } else {
                    Err(Error::MatchNotFound)
                }
            },
            DataUnit::Intervals(intervals) => {
                let received = read_network_int(data)? as i64;
                if intervals.iter().any(|i| i.b <= received && received <= i.e) {
                    Ok(DataUnit::int(received))
                } else {
                    Err(Error::MatchNotFound)
                }
            },
            DataUnit::BytesUndef => Ok(DataUnit::Bytes(data.to_vec())),
        }
    }
}

fn check_int_width(data: &[u8]) -> Result<()> {
    match data.len() {
        1 | 2 | 4 => Ok(()),
        _ => Err(Error::NotImplemented("integer fields other than 1, 2 or 4 octets")),
    }
}

fn read_network_int(data: &[u8]) -> Result<u64> {
    check_int_width(data)?;
    Ok(NetworkEndian::read_uint(data, data.len()))
}

/// Encode an integer into `len` octets, network byte order.
///
/// Negative values are encoded in two's complement of the field width.
pub fn int_to_octets(value: i64, len: usize) -> Result<Vec<u8>> {
    if len == 0 || len > 8 {
        return Err(Error::GenerateFailed(format!("integer field of {} octets", len)));
    }
    let bits = 8 * len as u32;
    let fits = if bits == 64 {
        true
    } else {
        let unsigned_max = (1u64 << bits) - 1;
        let signed_min = -(1i64 << (bits - 1));
        value >= signed_min && value as i128 <= i128::from(unsigned_max)
    };
    if !fits {
        return Err(Error::GenerateFailed(format!(
            "value {} does not fit into {} octets", value, len)));
    }

    let mut octets = vec![0; len];
    NetworkEndian::write_uint(&mut octets, value as u64 & mask_of(bits), len);
    Ok(octets)
}

fn mask_of(bits: u32) -> u64 {
    if bits >= 64 {
        u64::max_value()
    } else {
        (1u64 << bits) - 1
    }
}

impl TryFrom<Value> for DataUnit {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        let bad = |what: &str| Error::BadNds(format!("data unit: {}", what));

        match value {
            Value::Number(number) => number.as_i64()
                .map(DataUnit::int)
                .ok_or_else(|| bad("integer out of range")),
            Value::String(text) => Ok(DataUnit::String(text)),
            Value::Object(map) => {
                let mut entries = map.into_iter();
                let (key, inner) = match (entries.next(), entries.next()) {
                    (Some(entry), None) => entry,
                    _ => return Err(bad("expected an object with exactly one key")),
                };
                match (key.as_str(), inner) {
                    ("bytes", Value::String(text)) => text.parse::<Octets>()
                        .map(|octets| DataUnit::Bytes(octets.0))
                        .map_err(|err| bad(&err.to_string())),
                    ("mask", Value::Object(mut parts)) => {
                        let mut octets = |name: &str| match parts.remove(name) {
                            Some(Value::String(text)) => text.parse::<Octets>()
                                .map_err(|err| bad(&err.to_string())),
                            _ => Err(bad("mask needs string fields m and v")),
                        };
                        let mask = octets("m")?;
                        let value = octets("v")?;
                        DataUnit::mask(mask.0, value.0)
                    },
                    ("intervals", list @ Value::Array(_)) => {
                        serde_json::from_value::<Vec<Interval>>(list)
                            .map(DataUnit::Intervals)
                            .map_err(|err| bad(&err.to_string()))
                    },
                    ("expr", Value::String(text)) => Ok(DataUnit::Expr(text.parse()?)),
                    ("script", Value::String(text)) => DataUnit::script(&text),
                    ("int-undef", Value::Null) => Ok(DataUnit::IntUndef),
                    ("bytes-undef", Value::Null) => Ok(DataUnit::BytesUndef),
                    (other, _) => Err(bad(&format!("unknown or malformed choice '{}'", other))),
                }
            },
            _ => Err(bad("unsupported value")),
        }
    }
}

impl From<DataUnit> for Value {
    fn from(du: DataUnit) -> Value {
        match du {
            DataUnit::Int32(value) => json!(value),
            DataUnit::Int64(value) => json!(value),
            DataUnit::String(text) => Value::String(text),
            DataUnit::Bytes(data) => json!({ "bytes": Octets(data).to_string() }),
            DataUnit::Mask { mask, value } => json!({
                "mask": { "m": Octets(mask).to_string(), "v": Octets(value).to_string() }
            }),
            DataUnit::Intervals(list) => json!({ "intervals": list }),
            DataUnit::Expr(expr) => json!({ "expr": expr.to_string() }),
            DataUnit::Script(expr) => json!({ "script": format!("{}{}", SCRIPT_EXPR_PREFIX, expr) }),
            DataUnit::IntUndef => single("int-undef", Value::Null),
            DataUnit::BytesUndef => single("bytes-undef", Value::Null),
        }
    }
}

fn single(key: &str, value: Value) -> Value {
    let mut map = Map::new();
    map.insert(key.to_owned(), value);
    Value::Object(map)
}

impl fmt::Display for DataUnit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", Value::from(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn du(text: &str) -> DataUnit {
        serde_json::from_str(text).unwrap()
    }

    #[test]
    fn integer_widths() {
        let pattern = DataUnit::int(0x0800);
        assert_eq!(pattern.matches(&[0x08, 0x00], &[]), Ok(DataUnit::Int32(0x800)));
        assert_eq!(pattern.matches(&[0x00, 0x00, 0x08, 0x00], &[]), Ok(DataUnit::Int32(0x800)));
        assert_eq!(pattern.matches(&[0x08, 0x01], &[]), Err(Error::MatchNotFound));
        assert_eq!(DataUnit::int(8).matches(&[8], &[]), Ok(DataUnit::Int32(8)));

        let wide = [0u8; 8];
        assert!(matches!(pattern.matches(&wide, &[]), Err(Error::NotImplemented(_))));
        assert!(matches!(pattern.matches(&wide[..3], &[]), Err(Error::NotImplemented(_))));
    }

    #[test]
    fn no_silent_truncation() {
        let pattern = DataUnit::Int64(0x1_0000_0001);
        assert!(matches!(pattern.matches(&[0, 0, 0, 1], &[]), Err(Error::NotImplemented(_))));
        let full = DataUnit::Int64(0xffff_ffff);
        assert_eq!(full.matches(&[0xff; 4], &[]), Ok(DataUnit::Int64(0xffff_ffff)));
        assert_eq!(DataUnit::Int32(-1).matches(&[0xff; 4], &[]), Ok(DataUnit::Int64(0xffff_ffff)));
    }

    #[test]
    fn exact_lengths() {
        let string = DataUnit::String("abc".into());
        assert!(string.matches(b"abc", &[]).is_ok());
        assert_eq!(string.matches(b"ab", &[]), Err(Error::MatchNotFound));
        assert_eq!(string.matches(b"abcd", &[]), Err(Error::MatchNotFound));

        let bytes = DataUnit::bytes(vec![1, 2]);
        assert_eq!(bytes.matches(&[1, 2], &[]), Ok(DataUnit::bytes(vec![1, 2])));
        assert_eq!(bytes.matches(&[1, 2, 3], &[]), Err(Error::MatchNotFound));

        let mask = DataUnit::mask(vec![0xff, 0x00], vec![0x01, 0x00]).unwrap();
        assert!(mask.matches(&[0x01, 0x77], &[]).is_ok());
        assert_eq!(mask.matches(&[0x02, 0x77], &[]), Err(Error::MatchNotFound));
        assert_eq!(mask.matches(&[0x01], &[]), Err(Error::MatchNotFound));
        assert_eq!(mask.matches(&[0x01, 0x00, 0x00], &[]), Err(Error::MatchNotFound));
    }

    #[test]
    fn intervals_compare_field_values() {
        let pattern = DataUnit::Intervals(vec![Interval { b: 10, e: 20 }, Interval { b: 100, e: 100 }]);
        assert_eq!(pattern.matches(&[0, 15], &[]), Ok(DataUnit::Int32(15)));
        assert!(pattern.matches(&[0, 100], &[]).is_ok());
        assert!(pattern.matches(&[100], &[]).is_ok());
        assert!(pattern.matches(&[0, 0, 0, 20], &[]).is_ok());
        assert_eq!(pattern.matches(&[0, 21], &[]), Err(Error::MatchNotFound));
        // 15 in the wrong byte order is 0x0f00.
        assert_eq!(pattern.matches(&[15, 0], &[]), Err(Error::MatchNotFound));

        let ether_types = DataUnit::Intervals(vec![Interval { b: 0x0800, e: 0x0806 }]);
        assert_eq!(ether_types.matches(&[0x08, 0x00], &[]), Ok(DataUnit::Int32(0x0800)));
        assert_eq!(ether_types.matches(&[0x08, 0x06], &[]), Ok(DataUnit::Int32(0x0806)));
        assert_eq!(ether_types.matches(&[0x86, 0xdd], &[]), Err(Error::MatchNotFound));
    }

    #[test]
    fn undefined_accepts_anything() {
        assert_eq!(DataUnit::IntUndef.matches(&[0, 7], &[]), Ok(DataUnit::Int32(7)));
        assert_eq!(DataUnit::BytesUndef.matches(&[9, 9, 9], &[]), Ok(DataUnit::bytes(vec![9, 9, 9])));
        assert!(matches!(DataUnit::IntUndef.matches(&[0; 3], &[]), Err(Error::NotImplemented(_))));
    }

    #[test]
    fn expressions_evaluate() {
        let pattern = du(r#"{"expr": "($1 + 1)"}"#);
        assert!(pattern.matches(&[0, 5], &[Arg::Int(4)]).is_ok());
        assert_eq!(pattern.matches(&[0, 5], &[Arg::Int(3)]), Err(Error::MatchNotFound));
        assert_eq!(pattern.to_int(&[Arg::Int(41)]), Ok(Some(42)));

        let script = du(r#"{"script": "expr:(2 * 3)"}"#);
        assert_eq!(script.to_int(&[]), Ok(Some(6)));
        let perl: Result<DataUnit> = DataUnit::try_from(json!({"script": "perl:1"}));
        assert!(matches!(perl, Err(Error::NotImplemented(_))));
    }

    #[test]
    fn send_side() {
        assert_eq!(DataUnit::int(0x0800).to_octets(&[], Some(2)), Ok(Some(vec![0x08, 0x00])));
        assert_eq!(DataUnit::int(-1).to_octets(&[], Some(2)), Ok(Some(vec![0xff, 0xff])));
        assert!(DataUnit::int(0x1_0000).to_octets(&[], Some(2)).is_err());
        assert_eq!(DataUnit::IntUndef.to_octets(&[], Some(2)), Ok(None));
        assert!(DataUnit::bytes(vec![1]).to_octets(&[], Some(2)).is_err());
        let mask = DataUnit::mask(vec![0xff], vec![0x01]).unwrap();
        assert!(mask.to_int(&[]).is_err());
        assert!(mask.is_pattern_only());
    }

    #[test]
    fn text_forms() {
        let cases = [
            r#"5"#,
            r#"5000000000"#,
            r#""text""#,
            r#"{"bytes":"00:11:22"}"#,
            r#"{"mask":{"m":"ff:00","v":"01:00"}}"#,
            r#"{"intervals":[{"b":1,"e":5}]}"#,
            r#"{"expr":"($1 + 1)"}"#,
            r#"{"script":"expr:($1 - 1)"}"#,
            r#"{"int-undef":null}"#,
            r#"{"bytes-undef":null}"#,
        ];
        for case in cases.iter() {
            let unit = du(case);
            let value: Value = serde_json::from_str(case).unwrap();
            assert_eq!(Value::from(unit), value, "{}", case);
        }
        assert_eq!(du("5000000000"), DataUnit::Int64(5_000_000_000));

        for bad in &[r#"{"mask":{"m":"ff","v":"01:00"}}"#, r#"{"bytes":"zz"}"#, r#"{"a":1,"b":2}"#, "1.5", "null"] {
            assert!(serde_json::from_str::<DataUnit>(bad).is_err(), "{}", bad);
        }
    }
}
