//! ARP over Ethernet, RFC 826.
//!
//! Only the Ethernet/IPv4 flavour has defaults, other hardware or protocol types work when every
//! field is given. The layer adds no trailer, the payload of the template (usually empty) follows
//! the message.
use crate::args::Arg;
use crate::bps::{self, Direction, FieldDef, FieldDefault};
use crate::du::DataUnit;
use crate::error::{Error, Result};
use crate::nds::Pdu;
use crate::spt::{no_destroy, no_state, Layer, LayerCtx, Matched, Neighbor};
use crate::wire::BitWriter;

/// The protocol tag.
pub const TAG: &str = "arp";

const HEADER: [FieldDef; 9] = [
    FieldDef::int("hw-type", 16).tx(FieldDefault::Const(1)),
    FieldDef::int("proto-type", 16).tx(FieldDefault::Const(0x0800)),
    FieldDef::int("hw-size", 8).tx(FieldDefault::Const(6)),
    FieldDef::int("proto-size", 8).tx(FieldDefault::Const(4)),
    FieldDef::int("opcode", 16),
    FieldDef::octets("snd-hw-addr", 6),
    FieldDef::octets("snd-proto-addr", 4),
    FieldDef::octets("tgt-hw-addr", 6).tx(FieldDefault::Const(0)),
    FieldDef::octets("tgt-proto-addr", 4),
];

/// Opcode of a request.
pub const OP_REQUEST: i64 = 1;
/// Opcode of a reply.
pub const OP_REPLY: i64 = 2;

/// The ARP layer plugin.
pub struct Arp {
    neighbors: [Neighbor; 1],
}

impl Arp {
    pub fn new() -> Self {
        Arp {
            neighbors: [Neighbor { lower: super::eth::TAG, init: no_state, destroy: no_destroy }],
        }
    }
}

impl Default for Arp {
    fn default() -> Self {
        Arp::new()
    }
}

impl Layer for Arp {
    fn tag(&self) -> &'static str {
        TAG
    }

    fn neighbors(&self) -> &[Neighbor] {
        &self.neighbors
    }

    fn confirm(&self, ctx: &LayerCtx, pdu: &mut Pdu, direction: Direction) -> Result<()> {
        if direction == Direction::Send && !pdu.contains("snd-hw-addr") {
            if let Some(addr) = ctx.media.hardware_addr() {
                pdu.set("snd-hw-addr", DataUnit::bytes(addr.to_vec()));
            }
        }
        bps::confirm(TAG, &HEADER, ctx.params, pdu, direction)
    }

    fn generate(&self, _: &LayerCtx, pdu: &Pdu, args: &[Arg], upper: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>> {
        upper.into_iter().map(|payload| {
            let mut writer = BitWriter::new();
            bps::build(&HEADER, pdu, args, &mut writer)?;
            writer.push_octets(&payload);
            Ok(writer.finish())
        }).collect()
    }

    fn match_frame<'f>(&self, _: &LayerCtx, pattern: &Pdu, frame: &'f [u8]) -> Result<Matched<'f>> {
        let parsed = bps::parse(&HEADER, TAG, pattern, frame, &[])?;
        Ok(Matched {
            parsed: parsed.pdu,
            payload: &frame[parsed.len..],
        })
    }

    fn gen_pattern(&self, _: &LayerCtx, template: &Pdu) -> Result<Pdu> {
        let mut pattern = Pdu::new(TAG);
        for label in &["hw-type", "proto-type", "hw-size", "proto-size"] {
            let unit = template.get(label)
                .ok_or_else(|| Error::confirm(TAG, format!("template without '{}'", label)))?;
            pattern.set(label, unit.clone());
        }
        Ok(pattern)
    }
}
