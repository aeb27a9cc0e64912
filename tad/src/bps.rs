//! Bit-packed header descriptions.
//!
//! Most protocol headers are a fixed sequence of fields, each some number of bits wide. A layer
//! describes its header once as a list of [`FieldDef`] and gets confirm, generate and match from
//! this module. Fields are either integers (up to 64 bits, at any bit offset) or octet strings
//! (whole octets).
//!
//! Every field has separate defaults for sending and for receiving. A default is either a
//! constant or the name of a CSAP layer parameter, so that for example the source address of an
//! outgoing frame and the destination address of an accepted frame both come from the
//! `local-addr` parameter.
//!
//! [`FieldDef`]: struct.FieldDef.html
use crate::args::Arg;
use crate::du::DataUnit;
use crate::error::{Error, Result};
use crate::nds::Pdu;
use crate::wire::{read_bits, BitWriter, Octets};

/// The contents of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// An unsigned integer in network bit order.
    Int,
    /// An opaque octet string, the width is a multiple of eight bits.
    Octets,
}

/// Where a field gets its value when the unit does not give one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldDefault {
    /// No default, the unit must set the field.
    None,
    Const(i64),
    /// The value of a parameter of the CSAP layer, if present.
    Param(&'static str),
}

/// One field of a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDef {
    pub label: &'static str,
    pub bits: usize,
    pub kind: FieldKind,
    pub tx_def: FieldDefault,
    pub rx_def: FieldDefault,
}

/// Which way a unit is going to be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// A template PDU.
    Send,
    /// A pattern PDU.
    Recv,
}

/// The result of parsing a header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parsed {
    /// Every field in plain form.
    pub pdu: Pdu,
    /// Length of the header in octets.
    pub len: usize,
}

impl FieldDef {
    /// An integer field without defaults.
    pub const fn int(label: &'static str, bits: usize) -> Self {
        FieldDef {
            label,
            bits,
            kind: FieldKind::Int,
            tx_def: FieldDefault::None,
            rx_def: FieldDefault::None,
        }
    }

    /// An octet field without defaults.
    pub const fn octets(label: &'static str, len: usize) -> Self {
        FieldDef {
            label,
            bits: len * 8,
            kind: FieldKind::Octets,
            tx_def: FieldDefault::None,
            rx_def: FieldDefault::None,
        }
    }

    /// Replace the send default.
    pub const fn tx(mut self, default: FieldDefault) -> Self {
        self.tx_def = default;
        self
    }

    /// Replace the receive default.
    pub const fn rx(mut self, default: FieldDefault) -> Self {
        self.rx_def = default;
        self
    }

    /// Replace both defaults.
    pub const fn both(self, default: FieldDefault) -> Self {
        self.tx(default).rx(default)
    }

    fn default_for(&self, direction: Direction) -> FieldDefault {
        match direction {
            Direction::Send => self.tx_def,
            Direction::Recv => self.rx_def,
        }
    }

    /// Bring a unit into the canonical form for this field.
    ///
    /// Octet fields accept strings in colon hex notation.
    fn normalize(&self, unit: &DataUnit) -> DataUnit {
        match (self.kind, unit) {
            (FieldKind::Octets, DataUnit::String(text)) => match text.parse::<Octets>() {
                Ok(octets) if octets.0.len() * 8 == self.bits => DataUnit::Bytes(octets.0),
                _ => unit.clone(),
            },
            _ => unit.clone(),
        }
    }
}

/// Total width of a header, in bits.
pub fn header_bits(defs: &[FieldDef]) -> usize {
    defs.iter().map(|def| def.bits).sum()
}

/// Check a unit and fill unset fields from the defaults.
///
/// Fields of the unit that are not part of `defs` are left alone, the layer may use them for
/// other purposes. For sending, pattern-only units are rejected as are fields without any value.
pub fn confirm(layer: &str, defs: &[FieldDef], params: &Pdu, pdu: &mut Pdu, direction: Direction) -> Result<()> {
    for def in defs {
        let unit = match pdu.get(def.label) {
            Some(unit) if !unit.is_undef() => Some(def.normalize(unit)),
            _ => match def.default_for(direction) {
                FieldDefault::None => None,
                FieldDefault::Const(value) => Some(DataUnit::int(value)),
                FieldDefault::Param(name) => params.get(name).map(|unit| def.normalize(unit)),
            },
        };

        let unit = match (unit, direction) {
            (Some(unit), _) => unit,
            (None, Direction::Send) => {
                return Err(Error::confirm(layer, format!("no value for '{}'", def.label)));
            },
            (None, Direction::Recv) => {
                pdu.remove(def.label);
                continue;
            },
        };

        if direction == Direction::Send && unit.is_pattern_only() {
            return Err(Error::confirm(layer, format!("'{}' holds {} which can not be sent", def.label, unit)));
        }
        if def.kind == FieldKind::Octets {
            if let DataUnit::Bytes(data) = &unit {
                if data.len() * 8 != def.bits {
                    return Err(Error::confirm(layer, format!(
                        "'{}' needs {} octets, got {}", def.label, def.bits / 8, data.len())));
                }
            }
        }
        pdu.set(def.label, unit);
    }
    Ok(())
}

/// Encode the header described by `pdu`.
pub fn build(defs: &[FieldDef], pdu: &Pdu, args: &[Arg], writer: &mut BitWriter) -> Result<()> {
    for def in defs {
        let unit = pdu.get(def.label)
            .map(|unit| def.normalize(unit))
            .ok_or_else(|| Error::GenerateFailed(format!("no value for '{}'", def.label)))?;

        match def.kind {
            FieldKind::Int => {
                let value = unit.to_int(args)?
                    .ok_or_else(|| Error::GenerateFailed(format!("undefined '{}'", def.label)))?;
                if !fits(value, def.bits) {
                    return Err(Error::GenerateFailed(format!(
                        "value {} does not fit into the {} bits of '{}'", value, def.bits, def.label)));
                }
                writer.push(value as u64, def.bits);
            },
            FieldKind::Octets => {
                let octets = unit.to_octets(args, Some(def.bits / 8))?
                    .ok_or_else(|| Error::GenerateFailed(format!("undefined '{}'", def.label)))?;
                writer.push_octets(&octets);
            },
        }
    }
    Ok(())
}

fn fits(value: i64, bits: usize) -> bool {
    if value < 0 {
        return false;
    }
    bits >= 63 || (value as u64) < (1u64 << bits)
}

/// Parse and match the header at the start of `data`.
///
/// Fields without a unit in `pattern` match anything. Every field is written into the parsed
/// PDU in plain form: integers as numbers, octet strings as bytes.
pub fn parse(defs: &[FieldDef], tag: &str, pattern: &Pdu, data: &[u8], args: &[Arg]) -> Result<Parsed> {
    let mut parsed = Pdu::new(tag);
    let mut offset = 0;

    for def in defs {
        let plain = match def.kind {
            FieldKind::Int => {
                let value = read_bits(data, offset, def.bits).ok_or(Error::MatchLessData)?;
                match pattern.get(def.label) {
                    Some(unit) => unit.matches(&int_field(value, def.bits), args)?,
                    None => DataUnit::int(value as i64),
                }
            },
            FieldKind::Octets => {
                let field = (0..def.bits / 8)
                    .map(|idx| read_bits(data, offset + 8 * idx, 8).map(|octet| octet as u8))
                    .collect::<Option<Vec<u8>>>()
                    .ok_or(Error::MatchLessData)?;
                match pattern.get(def.label) {
                    Some(unit) => def.normalize(unit).matches(&field, args)?,
                    None => DataUnit::Bytes(field),
                }
            },
        };
        parsed.set(def.label, plain);
        offset += def.bits;
    }

    Ok(Parsed {
        pdu: parsed,
        len: (offset + 7) / 8,
    })
}

/// Place an integer into the smallest of 1, 2 or 4 octets that holds it, network order.
fn int_field(value: u64, bits: usize) -> Vec<u8> {
    let len = match bits {
        0..=8 => 1,
        9..=16 => 2,
        17..=32 => 4,
        _ => 8,
    };
    value.to_be_bytes()[8 - len..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::du::Interval;

    const HEADER: [FieldDef; 4] = [
        FieldDef::int("version", 4).tx(FieldDefault::Const(4)),
        FieldDef::int("flags", 4),
        FieldDef::int("length", 16),
        FieldDef::octets("addr", 2).both(FieldDefault::Param("local-addr")),
    ];

    fn params() -> Pdu {
        Pdu::new("test").with("local-addr", DataUnit::String("0a:0b".into()))
    }

    #[test]
    fn defaults_and_build() {
        let mut pdu = Pdu::new("test")
            .with("flags", DataUnit::int(2))
            .with("length", DataUnit::Expr("($1 * 2)".parse().unwrap()));
        confirm("test", &HEADER, &params(), &mut pdu, Direction::Send).unwrap();
        assert_eq!(pdu.get("version"), Some(&DataUnit::Int32(4)));
        assert_eq!(pdu.get("addr"), Some(&DataUnit::bytes(vec![0x0a, 0x0b])));

        let mut writer = BitWriter::new();
        build(&HEADER, &pdu, &[Arg::Int(3)], &mut writer).unwrap();
        assert_eq!(writer.finish(), vec![0x42, 0x00, 0x06, 0x0a, 0x0b]);
        assert_eq!(header_bits(&HEADER), 40);
    }

    #[test]
    fn send_rejects() {
        let mut missing = Pdu::new("test");
        assert!(matches!(confirm("test", &HEADER, &params(), &mut missing, Direction::Send),
                         Err(Error::ConfirmFailed { .. })));

        let mut masked = Pdu::new("test")
            .with("flags", DataUnit::mask(vec![0xff], vec![1]).unwrap())
            .with("length", DataUnit::int(1));
        assert!(confirm("test", &HEADER, &params(), &mut masked, Direction::Send).is_err());

        let pdu = Pdu::new("test")
            .with("version", DataUnit::int(16))
            .with("flags", DataUnit::int(0))
            .with("length", DataUnit::int(0))
            .with("addr", DataUnit::bytes(vec![0, 0]));
        let mut writer = BitWriter::new();
        assert!(matches!(build(&HEADER, &pdu, &[], &mut writer), Err(Error::GenerateFailed(_))));
    }

    #[test]
    fn parse_and_match() {
        let data = [0x42, 0x00, 0x06, 0x0a, 0x0b, 0xff];

        let mut pattern = Pdu::new("test").with("flags", DataUnit::int(2));
        confirm("test", &HEADER, &params(), &mut pattern, Direction::Recv).unwrap();
        assert!(pattern.get("version").is_none());

        let parsed = parse(&HEADER, "test", &pattern, &data, &[]).unwrap();
        assert_eq!(parsed.len, 5);
        assert_eq!(parsed.pdu.get("version"), Some(&DataUnit::Int32(4)));
        assert_eq!(parsed.pdu.get("length"), Some(&DataUnit::Int32(6)));
        assert_eq!(parsed.pdu.get("addr"), Some(&DataUnit::bytes(vec![0x0a, 0x0b])));

        let other = Pdu::new("test").with("flags", DataUnit::int(3));
        assert_eq!(parse(&HEADER, "test", &other, &data, &[]), Err(Error::MatchNotFound));
        assert_eq!(parse(&HEADER, "test", &pattern, &data[..4], &[]), Err(Error::MatchLessData));

        let wrong_addr = Pdu::new("test").with("addr", DataUnit::bytes(vec![0x0a, 0x0c]));
        assert_eq!(parse(&HEADER, "test", &wrong_addr, &data, &[]), Err(Error::MatchNotFound));
    }

    #[test]
    fn intervals_on_wide_fields() {
        let data = [0x42, 0x00, 0x06, 0x0a, 0x0b];
        let length = |b, e| Pdu::new("test").with("length", DataUnit::Intervals(vec![Interval { b, e }]));

        let parsed = parse(&HEADER, "test", &length(1, 10), &data, &[]).unwrap();
        assert_eq!(parsed.pdu.get("length"), Some(&DataUnit::Int32(6)));
        // 0x0600 is the length read in the wrong byte order.
        assert_eq!(parse(&HEADER, "test", &length(0x0600, 0x0600), &data, &[]), Err(Error::MatchNotFound));

        let flags = Pdu::new("test").with("flags", DataUnit::Intervals(vec![
            Interval { b: 0, e: 0 },
            Interval { b: 2, e: 3 },
        ]));
        assert!(parse(&HEADER, "test", &flags, &data, &[]).is_ok());
    }
}
