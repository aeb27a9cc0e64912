//! The built-in protocol layers.
//!
//! Each layer is a [`Layer`] plugin. They are registered by [`Spt::with_builtin`], other crates
//! may add their own plugins next to them with [`Spt::register`].
//!
//! * [`eth`]: Ethernet II with optional 802.1Q tag, the bottom of most stacks.
//! * [`arp`]: ARP messages over `eth`.
//!
//! [`Layer`]: ../spt/trait.Layer.html
//! [`Spt::with_builtin`]: ../spt/struct.Spt.html#method.with_builtin
//! [`Spt::register`]: ../spt/struct.Spt.html#method.register
//! [`eth`]: eth/index.html
//! [`arp`]: arp/index.html
use std::sync::Arc;

use crate::spt::Layer;

pub mod arp;
pub mod eth;

#[cfg(test)]
mod tests;

/// All layers of this crate.
pub fn builtin() -> Vec<Arc<dyn Layer>> {
    vec![
        Arc::new(eth::Eth::new()),
        Arc::new(arp::Arp::new()),
    ]
}
