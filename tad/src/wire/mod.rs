/*! Low-level octet access shared by all layers.

# Bit fields

Protocol headers described through [`bps`] are not byte aligned in general, the 802.1Q tag
control information packs three fields into two octets. The [`BitWriter`] and [`read_bits`]
functions move values of at most 64 bits to and from arbitrary bit offsets, most significant bit
first, which is the network convention.

# Octet strings

Addresses and other opaque octet strings use the familiar colon separated hex notation
`00:11:22:33:44:55` in every textual representation. [`Octets`] parses and prints it.

[`bps`]: ../bps/index.html
[`BitWriter`]: struct.BitWriter.html
[`read_bits`]: fn.read_bits.html
[`Octets`]: struct.Octets.html
*/
use core::{convert::TryFrom, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

pub mod ethernet;

pub use self::ethernet::{
    ethernet as ethernet_frame,
    Address as EthernetAddress,
    EtherType,
    MIN_FRAME_LEN};

mod field {
    pub(crate) type Field = ::core::ops::Range<usize>;
    pub(crate) type Rest  = ::core::ops::RangeFrom<usize>;
}

/// Read `bits` bits starting at bit `offset` of `data` as a big-endian number.
///
/// Returns `None` when the requested range is not contained in `data` or wider than 64 bits.
pub fn read_bits(data: &[u8], offset: usize, bits: usize) -> Option<u64> {
    if bits > 64 || offset.checked_add(bits)? > data.len() * 8 {
        return None;
    }

    let mut value = 0u64;
    for bit in offset..offset + bits {
        let byte = data[bit / 8];
        let set = (byte >> (7 - bit % 8)) & 1;
        value = (value << 1) | u64::from(set);
    }

    Some(value)
}

/// Appends bit fields to an octet buffer, most significant bit first.
#[derive(Debug, Default, Clone)]
pub struct BitWriter {
    buffer: Vec<u8>,
    bits: usize,
}

impl BitWriter {
    /// An empty writer.
    pub fn new() -> Self {
        BitWriter::default()
    }

    /// Append the low `bits` bits of `value`.
    ///
    /// # Panics
    /// This function panics if `bits` is larger than 64.
    pub fn push(&mut self, value: u64, bits: usize) {
        assert!(bits <= 64);
        for idx in (0..bits).rev() {
            let set = (value >> idx) & 1 == 1;
            self.push_bit(set);
        }
    }

    /// Append whole octets.
    ///
    /// Works at any bit offset, not only at octet boundaries.
    pub fn push_octets(&mut self, octets: &[u8]) {
        if self.bits % 8 == 0 {
            self.buffer.extend_from_slice(octets);
            self.bits += octets.len() * 8;
        } else {
            for &octet in octets {
                self.push(u64::from(octet), 8);
            }
        }
    }

    /// Number of bits written so far.
    pub fn bit_len(&self) -> usize {
        self.bits
    }

    /// Return the buffer, with a partial last octet padded by zero bits.
    pub fn finish(self) -> Vec<u8> {
        self.buffer
    }

    fn push_bit(&mut self, set: bool) {
        if self.bits % 8 == 0 {
            self.buffer.push(0);
        }
        if set {
            let last = self.buffer.len() - 1;
            self.buffer[last] |= 0x80 >> (self.bits % 8);
        }
        self.bits += 1;
    }
}

/// An owned octet string with colon separated hex notation.
#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Octets(pub Vec<u8>);

/// The error of parsing [`Octets`].
///
/// [`Octets`]: struct.Octets.html
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseOctetsError {
    component: usize,
}

impl Octets {
    /// View the octets.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Octets {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (idx, byte) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Display for ParseOctetsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid hex octet at component {}", self.component)
    }
}

impl std::error::Error for ParseOctetsError {}

impl FromStr for Octets {
    type Err = ParseOctetsError;

    fn from_str(src: &str) -> Result<Self, ParseOctetsError> {
        if src.is_empty() {
            return Ok(Octets(Vec::new()));
        }

        src.split(':')
            .enumerate()
            .map(|(component, part)| {
                if part.is_empty() || part.len() > 2 {
                    return Err(ParseOctetsError { component });
                }
                u8::from_str_radix(part, 16)
                    .map_err(|_| ParseOctetsError { component })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Octets)
    }
}

impl TryFrom<String> for Octets {
    type Error = ParseOctetsError;

    fn try_from(text: String) -> Result<Self, ParseOctetsError> {
        text.parse()
    }
}

impl From<Octets> for String {
    fn from(octets: Octets) -> String {
        octets.to_string()
    }
}

impl From<Vec<u8>> for Octets {
    fn from(bytes: Vec<u8>) -> Self {
        Octets(bytes)
    }
}

impl From<&'_ [u8]> for Octets {
    fn from(bytes: &[u8]) -> Self {
        Octets(bytes.to_vec())
    }
}
