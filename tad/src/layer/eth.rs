//! The Ethernet II layer, with optional 802.1Q tag.
//!
//! This is the usual bottom of a stack and attaches the medium of the CSAP. The `interface`
//! parameter chooses it: `hub:<name>` plugs into an in-memory hub, any other name opens a raw
//! socket on that interface. In a data-CSAP the medium is a pipe instead.
//!
//! Header fields of templates and patterns are `dst-addr`, `src-addr`, `eth-type` and, for tagged
//! frames, `tpid`, `priority`, `cfi` and `vlan-id`. A frame is tagged as soon as any of the tag
//! fields is given by the unit or the CSAP parameters.
use std::sync::Arc;

use tracing::debug;

use crate::args::Arg;
use crate::bps::{self, Direction, FieldDef, FieldDefault};
use crate::du::DataUnit;
use crate::error::{Error, Result};
use crate::media::{Media, Pipe};
use crate::nds::Pdu;
use crate::spt::{Layer, LayerCtx, LayerInit, LayerState, Matched, Neighbor, DATA, SINGLE};
use crate::wire::{ethernet_frame, BitWriter, EtherType, Octets, MIN_FRAME_LEN};

/// The protocol tag.
pub const TAG: &str = "eth";

/// Prefix of interface names designating an in-memory hub.
pub const HUB_PREFIX: &str = "hub:";

const DST: FieldDef = FieldDef::octets("dst-addr", 6)
    .tx(FieldDefault::Param("remote-addr"))
    .rx(FieldDefault::Param("local-addr"));
const SRC: FieldDef = FieldDef::octets("src-addr", 6)
    .tx(FieldDefault::Param("local-addr"))
    .rx(FieldDefault::Param("remote-addr"));
const TPID: FieldDef = FieldDef::int("tpid", 16).both(FieldDefault::Const(0x8100));
const PRIORITY: FieldDef = FieldDef::int("priority", 3).both(FieldDefault::Param("priority"));
const CFI: FieldDef = FieldDef::int("cfi", 1).both(FieldDefault::Param("cfi"));
const VLAN_ID: FieldDef = FieldDef::int("vlan-id", 12).both(FieldDefault::Param("vlan-id"));
const ETH_TYPE: FieldDef = FieldDef::int("eth-type", 16).both(FieldDefault::Param("eth-type"));

const UNTAGGED: [FieldDef; 3] = [DST, SRC, ETH_TYPE];
const TAGGED: [FieldDef; 7] = [DST, SRC, TPID, PRIORITY, CFI, VLAN_ID, ETH_TYPE];

const TAG_FIELDS: [&str; 4] = ["tpid", "priority", "cfi", "vlan-id"];

/// The Ethernet layer plugin.
pub struct Eth {
    neighbors: [Neighbor; 2],
}

/// Per-CSAP state: where the medium came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthState {
    pub interface: String,
}

impl Eth {
    pub fn new() -> Self {
        Eth {
            neighbors: [
                Neighbor { lower: SINGLE, init: init_interface, destroy },
                Neighbor { lower: DATA, init: init_data, destroy },
            ],
        }
    }
}

impl Default for Eth {
    fn default() -> Self {
        Eth::new()
    }
}

fn init_interface(init: &mut LayerInit) -> Result<LayerState> {
    let interface = init.params.read_str("interface")?
        .ok_or_else(|| Error::BadNds("eth layer needs an 'interface' parameter".into()))?
        .to_owned();

    let media: Arc<dyn Media> = if interface.starts_with(HUB_PREFIX) {
        let hub = init.hubs.get(&interface[HUB_PREFIX.len()..]);
        Arc::new(hub.attach())
    } else {
        open_raw_socket(&interface)?
    };

    debug!(csap = init.csap, interface = %interface, "eth medium attached");
    init.attach_media(media);
    Ok(Box::new(EthState { interface }))
}

#[cfg(all(feature = "std", target_os = "linux"))]
fn open_raw_socket(interface: &str) -> Result<Arc<dyn Media>> {
    let socket = crate::media::sys::RawSocket::new(interface)?;
    Ok(Arc::new(socket))
}

#[cfg(not(all(feature = "std", target_os = "linux")))]
fn open_raw_socket(_: &str) -> Result<Arc<dyn Media>> {
    Err(Error::NotImplemented("raw sockets on this platform"))
}

fn init_data(init: &mut LayerInit) -> Result<LayerState> {
    init.attach_media(Arc::new(Pipe::new()));
    Ok(Box::new(EthState { interface: DATA.to_owned() }))
}

fn destroy(state: &LayerState) -> Result<()> {
    if let Some(state) = state.downcast_ref::<EthState>() {
        debug!(interface = %state.interface, "eth layer destroyed");
    }
    Ok(())
}

/// Whether frames of this unit carry an 802.1Q tag.
fn is_tagged(ctx: &LayerCtx, pdu: &Pdu) -> bool {
    TAG_FIELDS.iter().any(|label| pdu.contains(label) || ctx.params.contains(label))
}

fn header(tagged: bool) -> &'static [FieldDef] {
    if tagged {
        &TAGGED
    } else {
        &UNTAGGED
    }
}

fn padding(ctx: &LayerCtx) -> bool {
    match ctx.params.get("padding") {
        Some(unit) => unit.to_int(&[]).ok().flatten() != Some(0),
        None => true,
    }
}

impl Layer for Eth {
    fn tag(&self) -> &'static str {
        TAG
    }

    fn neighbors(&self) -> &[Neighbor] {
        &self.neighbors
    }

    fn confirm(&self, ctx: &LayerCtx, pdu: &mut Pdu, direction: Direction) -> Result<()> {
        let tagged = is_tagged(ctx, pdu);

        if direction == Direction::Send {
            if !pdu.contains("src-addr") && !ctx.params.contains("local-addr") {
                let addr = ctx.media.hardware_addr()
                    .ok_or_else(|| Error::confirm(TAG, "no source address and the medium has none"))?;
                pdu.set("src-addr", DataUnit::bytes(addr.to_vec()));
            }
            if tagged {
                for label in &["priority", "cfi"] {
                    if !pdu.contains(label) && !ctx.params.contains(label) {
                        pdu.set(label, DataUnit::int(0));
                    }
                }
            }
        }

        if !pdu.contains("eth-type") && !ctx.params.contains("eth-type") {
            let upper = ctx.index.checked_sub(1).and_then(|idx| ctx.stack.get(idx));
            match upper.and_then(|tag| EtherType::for_upper_layer(tag)) {
                Some(guess) => pdu.set("eth-type", DataUnit::int(i64::from(u16::from(guess)))),
                None if direction == Direction::Send => {
                    return Err(Error::confirm(TAG, "no eth-type and no upper layer to guess it from"));
                },
                None => (),
            }
        }

        bps::confirm(TAG, header(tagged), ctx.params, pdu, direction)
    }

    fn generate(&self, ctx: &LayerCtx, pdu: &Pdu, args: &[Arg], upper: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>> {
        let defs = header(is_tagged(ctx, pdu));
        let pad = padding(ctx);

        upper.into_iter().map(|payload| {
            let mut writer = BitWriter::new();
            bps::build(defs, pdu, args, &mut writer)?;
            writer.push_octets(&payload);
            let mut frame = writer.finish();
            if pad && frame.len() < MIN_FRAME_LEN {
                frame.resize(MIN_FRAME_LEN, 0);
            }
            Ok(frame)
        }).collect()
    }

    fn match_frame<'f>(&self, ctx: &LayerCtx, pattern: &Pdu, frame: &'f [u8]) -> Result<Matched<'f>> {
        let eth = ethernet_frame::new_checked(frame)?;
        let tagged = eth.is_tagged();
        if !tagged && is_tagged(ctx, pattern) {
            return Err(Error::MatchNotFound);
        }

        let parsed = bps::parse(header(tagged), TAG, pattern, frame, &[])?;
        debug_assert_eq!(parsed.len, eth.header_len());
        Ok(Matched {
            parsed: parsed.pdu,
            payload: eth.payload_slice(),
        })
    }

    fn gen_pattern(&self, _: &LayerCtx, template: &Pdu) -> Result<Pdu> {
        let mut pattern = Pdu::new(TAG);
        for label in TAG_FIELDS.iter().chain(&["eth-type"]) {
            if let Some(unit) = template.get(label) {
                pattern.set(label, unit.clone());
            }
        }
        Ok(pattern)
    }

    fn echo(&self, _: &LayerCtx, frame: &[u8]) -> Result<Vec<u8>> {
        let mut echo = frame.to_vec();
        let header = ethernet_frame::new_checked_mut(&mut echo)?;
        let (src, dst) = (header.src_addr(), header.dst_addr());
        header.set_dst_addr(src);
        header.set_src_addr(dst);
        Ok(echo)
    }

    fn get_param(&self, ctx: &LayerCtx, name: &str) -> Option<String> {
        match name {
            "interface" => ctx.state::<EthState>().map(|state| state.interface.clone()),
            "local-addr" => match ctx.params.read_octets("local-addr", Some(6)) {
                Ok(Some(addr)) => Some(Octets(addr).to_string()),
                _ => ctx.media.hardware_addr().map(|addr| Octets(addr.to_vec()).to_string()),
            },
            _ => None,
        }
    }
}
