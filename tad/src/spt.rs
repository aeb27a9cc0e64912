//! The protocol support table.
//!
//! Every protocol the engine can put into a CSAP stack is a [`Layer`] plugin registered here under
//! its tag. A plugin lists the protocols it may sit on top of as [`Neighbor`] records, each with
//! the initializer and destructor of the per-CSAP layer state for that combination. The bottom
//! layer of a stack names one of the markers [`SINGLE`] (a normal CSAP, the layer attaches a
//! medium itself) or [`DATA`] (a data-CSAP, the medium is an in-process pipe).
//!
//! A stack `t0.t1. ... .tn` is supported iff every `ti` is registered and lists `ti+1` as a
//! neighbor, and `tn` lists the marker matching the kind of CSAP.
//!
//! [`Layer`]: trait.Layer.html
//! [`Neighbor`]: struct.Neighbor.html
//! [`SINGLE`]: constant.SINGLE.html
//! [`DATA`]: constant.DATA.html
use core::any::Any;
use std::sync::Arc;

use tracing::debug;

use crate::args::Arg;
use crate::bps::Direction;
use crate::csap::CsapId;
use crate::error::{Error, Result};
use crate::media::{Hubs, Media};
use crate::nds::Pdu;

/// Neighbor label of a bottom layer in a normal CSAP.
pub const SINGLE: &str = "single";

/// Neighbor label of a bottom layer in a data-CSAP.
pub const DATA: &str = "data";

/// Opaque per-CSAP state of one layer.
pub type LayerState = Box<dyn Any + Send + Sync>;

/// Allocate the state of a layer in a new CSAP.
pub type InitFn = fn(&mut LayerInit) -> Result<LayerState>;

/// Release the state of a layer when its CSAP is destroyed.
pub type DestroyFn = fn(&LayerState) -> Result<()>;

/// One admissible lower neighbor of a layer.
#[derive(Clone, Copy)]
pub struct Neighbor {
    /// Tag of the lower layer, or one of the markers.
    pub lower: &'static str,
    pub init: InitFn,
    pub destroy: DestroyFn,
}

/// A state-less initializer for layers without per-CSAP state.
pub fn no_state(_: &mut LayerInit) -> Result<LayerState> {
    Ok(Box::new(()))
}

/// The destructor matching `no_state`.
pub fn no_destroy(_: &LayerState) -> Result<()> {
    Ok(())
}

/// What an initializer gets to see.
pub struct LayerInit<'a> {
    pub csap: CsapId,
    /// Position of the layer in the stack, 0 is the top.
    pub index: usize,
    pub stack: &'a [String],
    /// The parameters of this layer from the CSAP spec.
    pub params: &'a Pdu,
    pub hubs: &'a Hubs,
    media: Option<Arc<dyn Media>>,
}

/// What a layer callback gets to see of its CSAP.
pub struct LayerCtx<'a> {
    pub csap: CsapId,
    pub index: usize,
    pub stack: &'a [String],
    pub params: &'a Pdu,
    pub state: &'a LayerState,
    pub media: &'a dyn Media,
}

/// The result of matching one layer of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matched<'f> {
    /// The header in plain form.
    pub parsed: Pdu,
    /// What is left for the upper layer.
    pub payload: &'f [u8],
}

/// A protocol plugin.
pub trait Layer: Send + Sync {
    /// The protocol tag.
    fn tag(&self) -> &'static str;

    /// The admissible lower neighbors.
    fn neighbors(&self) -> &[Neighbor];

    /// Validate a template or pattern PDU and fill in the defaults.
    ///
    /// Must be idempotent: confirming a confirmed PDU changes nothing.
    fn confirm(&self, ctx: &LayerCtx, pdu: &mut Pdu, direction: Direction) -> Result<()>;

    /// Produce the frames of this layer carrying the payloads of the upper layer.
    fn generate(&self, ctx: &LayerCtx, pdu: &Pdu, args: &[Arg], upper: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>>;

    /// Parse and match the start of a frame.
    ///
    /// Mismatches are `MatchNotFound`, truncated frames `MatchLessData`.
    fn match_frame<'f>(&self, ctx: &LayerCtx, pattern: &Pdu, frame: &'f [u8]) -> Result<Matched<'f>>;

    /// Derive a pattern accepting answers to the given template PDU.
    fn gen_pattern(&self, _ctx: &LayerCtx, _template: &Pdu) -> Result<Pdu> {
        Err(Error::NotImplemented("pattern generation"))
    }

    /// Turn a received frame into the frame to echo.
    fn echo(&self, _ctx: &LayerCtx, frame: &[u8]) -> Result<Vec<u8>> {
        Ok(frame.to_vec())
    }

    /// A layer specific CSAP parameter.
    fn get_param(&self, _ctx: &LayerCtx, _name: &str) -> Option<String> {
        None
    }
}

impl<'a> LayerInit<'a> {
    pub(crate) fn new(csap: CsapId, index: usize, stack: &'a [String], params: &'a Pdu, hubs: &'a Hubs) -> Self {
        LayerInit {
            csap,
            index,
            stack,
            params,
            hubs,
            media: None,
        }
    }

    /// Whether this layer is at the bottom of the stack.
    pub fn is_bottom(&self) -> bool {
        self.index + 1 == self.stack.len()
    }

    /// Attach the medium of the CSAP, which makes this the read/write layer.
    pub fn attach_media(&mut self, media: Arc<dyn Media>) {
        self.media = Some(media);
    }

    pub(crate) fn take_media(&mut self) -> Option<Arc<dyn Media>> {
        self.media.take()
    }
}

impl LayerCtx<'_> {
    /// Downcast the layer state.
    pub fn state<T: Any>(&self) -> Option<&T> {
        self.state.downcast_ref()
    }
}

/// The registry of layers.
#[derive(Default)]
pub struct Spt {
    layers: Vec<Arc<dyn Layer>>,
}

impl Spt {
    /// An empty table.
    pub fn new() -> Self {
        Spt::default()
    }

    /// A table holding all layers of this crate.
    pub fn with_builtin() -> Self {
        let mut spt = Spt::new();
        for layer in crate::layer::builtin() {
            // Built-in tags are distinct.
            let _ = spt.register(layer);
        }
        spt
    }

    /// Add a layer. Tags must be unique.
    pub fn register(&mut self, layer: Arc<dyn Layer>) -> Result<()> {
        if self.find(layer.tag()).is_some() {
            return Err(Error::InvalidArgument(format!("layer '{}' registered twice", layer.tag())));
        }
        debug!(tag = layer.tag(), "layer registered");
        self.layers.push(layer);
        Ok(())
    }

    /// Look up a layer by tag.
    pub fn find(&self, tag: &str) -> Option<Arc<dyn Layer>> {
        self.layers.iter().find(|layer| layer.tag() == tag).cloned()
    }

    /// The tags of all registered layers, in registration order.
    pub fn tags(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.layers.iter().map(|layer| layer.tag())
    }

    /// Resolve a stack to its layers and the neighbor records binding them.
    pub fn resolve(&self, stack: &[String], data: bool) -> Result<Vec<(Arc<dyn Layer>, Neighbor)>> {
        if stack.is_empty() {
            return Err(Error::StackNotSupported(String::new()));
        }

        stack.iter().enumerate().map(|(idx, tag)| {
            let layer = self.find(tag)
                .ok_or_else(|| Error::ProtoNotSupported(tag.clone()))?;
            let lower = match stack.get(idx + 1) {
                Some(lower) => lower.as_str(),
                None if data => DATA,
                None => SINGLE,
            };
            let neighbor = neighbor_init(layer.as_ref(), lower)
                .ok_or_else(|| Error::StackNotSupported(stack.join(".")))?;
            Ok((layer, neighbor))
        }).collect()
    }
}

/// Select the neighbor record for a lower tag.
///
/// The empty string selects the `single` marker.
pub fn neighbor_init(layer: &dyn Layer, lower: &str) -> Option<Neighbor> {
    let lower = if lower.is_empty() { SINGLE } else { lower };
    layer.neighbors().iter().find(|neighbor| neighbor.lower == lower).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy(&'static str, Vec<Neighbor>);

    impl Layer for Dummy {
        fn tag(&self) -> &'static str {
            self.0
        }

        fn neighbors(&self) -> &[Neighbor] {
            &self.1
        }

        fn confirm(&self, _: &LayerCtx, _: &mut Pdu, _: Direction) -> Result<()> {
            Ok(())
        }

        fn generate(&self, _: &LayerCtx, _: &Pdu, _: &[Arg], upper: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>> {
            Ok(upper)
        }

        fn match_frame<'f>(&self, _: &LayerCtx, _: &Pdu, frame: &'f [u8]) -> Result<Matched<'f>> {
            Ok(Matched { parsed: Pdu::new(self.0), payload: frame })
        }
    }

    fn neighbor(lower: &'static str) -> Neighbor {
        Neighbor { lower, init: no_state, destroy: no_destroy }
    }

    fn table() -> Spt {
        let mut spt = Spt::new();
        spt.register(Arc::new(Dummy("low", vec![neighbor(SINGLE), neighbor(DATA)]))).unwrap();
        spt.register(Arc::new(Dummy("high", vec![neighbor("low")]))).unwrap();
        spt
    }

    fn stack(text: &str) -> Vec<String> {
        text.split('.').map(String::from).collect()
    }

    #[test]
    fn resolve_stacks() {
        let spt = table();
        assert_eq!(spt.resolve(&stack("high.low"), false).map(|layers| layers.len()), Ok(2));
        assert!(spt.resolve(&stack("low"), true).is_ok());
        assert_eq!(spt.resolve(&stack("high"), false).err(), Some(Error::StackNotSupported("high".into())));
        assert_eq!(spt.resolve(&stack("low.high"), false).err(), Some(Error::StackNotSupported("low.high".into())));
        assert_eq!(spt.resolve(&stack("nope"), false).err(), Some(Error::ProtoNotSupported("nope".into())));
    }

    #[test]
    fn single_marker() {
        let spt = table();
        let low = spt.find("low").unwrap();
        assert_eq!(neighbor_init(low.as_ref(), "").map(|n| n.lower), Some(SINGLE));
        assert_eq!(neighbor_init(low.as_ref(), DATA).map(|n| n.lower), Some(DATA));
        assert!(neighbor_init(low.as_ref(), "high").is_none());
    }

    #[test]
    fn duplicates_rejected() {
        let mut spt = table();
        assert!(spt.register(Arc::new(Dummy("low", vec![]))).is_err());
        assert_eq!(spt.tags().collect::<Vec<_>>(), vec!["low", "high"]);
    }
}
