// Copyright (C) 2016 whitequark@whitequark.org
// Copyright (C) 2019 Andreas Molzer <andreas.molzer@tum.de>
//
// in large parts from `smoltcp` originally distributed under 0-clause BSD
use byteorder::{ByteOrder, NetworkEndian};

use crate::error::{Error, Result};

enum_with_unknown! {
    /// Ethernet protocol type.
    pub enum EtherType(u16) {
        Ipv4 = 0x0800,
        Arp  = 0x0806,
        Vlan = 0x8100,
        Ipv6 = 0x86DD,
    }
}

impl EtherType {
    /// Guess the type field from the tag of the layer carried inside the frame.
    pub fn for_upper_layer(tag: &str) -> Option<Self> {
        match tag {
            "ip4" => Some(EtherType::Ipv4),
            "arp" => Some(EtherType::Arp),
            "ip6" => Some(EtherType::Ipv6),
            _ => None,
        }
    }
}

/// A six-octet Ethernet II address.
#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy, Default)]
pub struct Address(pub [u8; 6]);

impl Address {
    /// Return an Ethernet address as a sequence of octets, in big-endian.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

byte_wrapper! {
    /// A byte sequence representing an Ethernet II frame, possibly 802.1Q tagged.
    #[derive(Debug, PartialEq, Eq)]
    pub struct ethernet([u8]);
}

mod field {
    use crate::wire::field::*;

    pub(crate) const DESTINATION: Field =  0..6;
    pub(crate) const SOURCE:      Field =  6..12;
    pub(crate) const ETHERTYPE:   Field = 12..14;
    pub(crate) const PAYLOAD:     Rest  = 14..;

    pub(crate) const TAGGED_PAYLOAD: Rest = 18..;
}

/// Frames shorter than this, without the frame check sequence, are padded on emission.
pub const MIN_FRAME_LEN: usize = 60;

impl ethernet {
    /// Imbue a raw octet buffer with Ethernet II frame structure.
    pub fn new_unchecked(data: &[u8]) -> &Self {
        Self::__from_macro_new_unchecked(data)
    }

    /// Imbue a mutable octet buffer with Ethernet II frame structure.
    pub fn new_unchecked_mut(data: &mut [u8]) -> &mut Self {
        Self::__from_macro_new_unchecked_mut(data)
    }

    /// Wrap a buffer after checking that no accessor will panic.
    pub fn new_checked(data: &[u8]) -> Result<&Self> {
        Self::new_unchecked(data).check_len()?;
        Ok(Self::new_unchecked(data))
    }

    /// Wrap a mutable buffer after checking that no accessor will panic.
    pub fn new_checked_mut(data: &mut [u8]) -> Result<&mut Self> {
        Self::new_checked(&data[..])?;
        Ok(Self::new_unchecked_mut(data))
    }

    /// Ensure that no accessor method will panic if called.
    /// Returns `Err(Error::MatchLessData)` if the buffer is too short.
    pub fn check_len(&self) -> Result<()> {
        let len = self.0.len();
        if len < field::PAYLOAD.start {
            Err(Error::MatchLessData)
        } else if self.is_tagged() && len < field::TAGGED_PAYLOAD.start {
            Err(Error::MatchLessData)
        } else {
            Ok(())
        }
    }

    /// Return the destination address field.
    pub fn dst_addr(&self) -> Address {
        let mut bytes = [0; 6];
        bytes.copy_from_slice(&self.0[field::DESTINATION]);
        Address(bytes)
    }

    /// Return the source address field.
    pub fn src_addr(&self) -> Address {
        let mut bytes = [0; 6];
        bytes.copy_from_slice(&self.0[field::SOURCE]);
        Address(bytes)
    }

    /// Return the EtherType field, without checking for 802.1Q.
    pub fn ethertype(&self) -> EtherType {
        let raw = NetworkEndian::read_u16(&self.0[field::ETHERTYPE]);
        EtherType::from(raw)
    }

    /// Whether the frame carries an 802.1Q tag.
    pub fn is_tagged(&self) -> bool {
        self.0.len() >= field::ETHERTYPE.end && self.ethertype() == EtherType::Vlan
    }

    /// Length of the header, including a tag if present.
    pub fn header_len(&self) -> usize {
        if self.is_tagged() {
            field::TAGGED_PAYLOAD.start
        } else {
            field::PAYLOAD.start
        }
    }

    /// Set the destination address field.
    pub fn set_dst_addr(&mut self, value: Address) {
        self.0[field::DESTINATION].copy_from_slice(value.as_bytes())
    }

    /// Set the source address field.
    pub fn set_src_addr(&mut self, value: Address) {
        self.0[field::SOURCE].copy_from_slice(value.as_bytes())
    }

    /// Return the payload as a byte slice, after a tag if present.
    pub fn payload_slice(&self) -> &[u8] {
        &self.0[self.header_len()..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static FRAME: [u8; 20] = [
        0x00, 0x11, 0x22, 0x33, 0x44, 0x55,
        0x02, 0x00, 0x00, 0x00, 0x00, 0x01,
        0x81, 0x00, 0x60, 0x64, 0x08, 0x00,
        b'x', b'y',
    ];

    #[test]
    fn tagged_frame() {
        let frame = ethernet::new_checked(&FRAME).unwrap();
        assert!(frame.is_tagged());
        assert_eq!(frame.ethertype(), EtherType::Vlan);
        assert_eq!(frame.header_len(), 18);
        assert_eq!(frame.dst_addr(), Address([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]));
        assert_eq!(frame.payload_slice(), b"xy");
    }

    #[test]
    fn untagged_frame() {
        let mut data = FRAME;
        data[12..14].copy_from_slice(&[0x08, 0x06]);
        let frame = ethernet::new_checked(&data[..14]).unwrap();
        assert!(!frame.is_tagged());
        assert_eq!(frame.ethertype(), EtherType::Arp);
        assert_eq!(frame.payload_slice(), b"");
    }

    #[test]
    fn truncated() {
        assert_eq!(ethernet::new_checked(&FRAME[..13]), Err(Error::MatchLessData));
        assert_eq!(ethernet::new_checked(&FRAME[..16]), Err(Error::MatchLessData));
    }

    #[test]
    fn swap_addresses() {
        let mut data = FRAME;
        let frame = ethernet::new_checked_mut(&mut data).unwrap();
        let (src, dst) = (frame.src_addr(), frame.dst_addr());
        frame.set_src_addr(dst);
        frame.set_dst_addr(src);
        assert_eq!(&data[..6], &FRAME[6..12]);
    }
}
