//! The send and receive engines.
//!
//! Each operation of a CSAP runs on its own detached worker thread. The command handler checks
//! that the CSAP is idle, prepares the operation (which confirms the units against the layers, so
//! that malformed requests fail synchronously), sets the command and state bits and spawns the
//! worker. From then on the worker owns the operation and observes further commands only through
//! the bits, at the boundaries of its loops.
use std::thread;
use std::time::{Duration, Instant};

use tracing::error;

use crate::bps::Direction;
use crate::ch::Responder;
use crate::csap::{Command, Csap, Shared};
use crate::error::{Error, ErrorKind, Result};
use crate::nds::{Packet, Pdu};

mod recv;
mod send;
mod send_recv;

pub(crate) use self::recv::{start_recv, RecvTask};
pub(crate) use self::send::{start_send, SendTask};
pub(crate) use self::send_recv::{start_send_recv, SendRecvTask};

/// The timeout of a receive operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvTimeout {
    /// Run until stopped or until enough packets arrived.
    Infinite,
    Millis(u64),
}

impl RecvTimeout {
    /// The absolute deadline of an operation starting now.
    ///
    /// Without packet limit a zero timeout is infinite as well.
    pub(crate) fn deadline(self, num_packets: usize) -> Option<Instant> {
        match self {
            RecvTimeout::Infinite => None,
            RecvTimeout::Millis(0) if num_packets == 0 => None,
            RecvTimeout::Millis(ms) => Some(Instant::now() + Duration::from_millis(ms)),
        }
    }
}

/// Bring the per-layer PDUs of a unit into the shape of the stack and confirm them, top down.
///
/// Missing trailing PDUs are created empty so that the layer defaults apply.
pub(crate) fn confirm_pdus(csap: &Csap, pdus: &mut Vec<Pdu>, direction: Direction) -> Result<()> {
    if pdus.len() > csap.depth() {
        return Err(Error::BadNds(format!(
            "{} PDUs for a stack of depth {}", pdus.len(), csap.depth())));
    }
    for (index, tag) in csap.stack().iter().enumerate() {
        if index == pdus.len() {
            pdus.push(Pdu::new(tag.as_str()));
        }
        if pdus[index].tag() != tag {
            return Err(Error::BadNds(format!(
                "PDU '{}' in place of layer '{}'", pdus[index].tag(), tag)));
        }
        let layer = &csap.layer(index).layer;
        layer.confirm(&csap.ctx(index), &mut pdus[index], direction)?;
    }
    Ok(())
}

/// Start a detached worker.
pub(crate) fn spawn<F>(csap: &Csap, what: &str, work: F) -> Result<()>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(format!("tad-{}-{}", what, csap.id()))
        .spawn(work)
        .map(drop)
        .map_err(|err| {
            error!(csap = csap.id(), error = %err, "failed to spawn worker");
            Error::from(err)
        })
}

/// Sleep until `deadline` unless a stop is requested first.
///
/// Returns `true` when stopped.
pub(crate) fn sleep_unless_stopped(csap: &Csap, deadline: Instant) -> bool {
    let mut shared = csap.lock();
    loop {
        if shared.command.contains(Command::STOP) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        csap.wait_until(&mut shared, deadline);
    }
}

/// The error code part of a final answer.
pub(crate) fn final_error(shared: &Shared) -> Option<&Error> {
    shared.last_error.as_ref()
}

/// Answers produced under the CSAP lock, delivered after it was released.
///
/// Writing to a slow peer must not hold up the command handler, which takes the same lock.
#[derive(Default)]
pub(crate) struct Outbox(Vec<(Responder, Outgoing)>);

enum Outgoing {
    Packet(Packet),
    Answer(Option<ErrorKind>, Vec<String>),
}

impl Outbox {
    pub(crate) fn packet(&mut self, reply: &Responder, packet: Packet) {
        self.0.push((reply.clone(), Outgoing::Packet(packet)));
    }

    pub(crate) fn answer(&mut self, reply: &Responder, rc: Option<ErrorKind>, values: Vec<String>) {
        self.0.push((reply.clone(), Outgoing::Answer(rc, values)));
    }

    /// Queue the final answer of an operation for everyone waiting on it.
    pub(crate) fn final_answer(&mut self, shared: &Shared, values: Vec<String>) {
        let rc = final_error(shared).map(Error::kind);
        for reply in shared.final_reply.iter().chain(shared.stop_reply.iter()) {
            self.answer(reply, rc, values.clone());
        }
    }

    /// Send everything, in the order it was queued. Call without holding the CSAP lock.
    pub(crate) fn deliver(self) {
        for (reply, outgoing) in self.0 {
            match outgoing {
                Outgoing::Packet(packet) => reply.packet(&packet),
                Outgoing::Answer(rc, values) => reply.answer(rc, values),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadlines() {
        assert_eq!(RecvTimeout::Infinite.deadline(1), None);
        assert_eq!(RecvTimeout::Millis(0).deadline(0), None);
        let now = Instant::now();
        let poll = RecvTimeout::Millis(0).deadline(1).unwrap();
        assert!(poll >= now && poll <= Instant::now());
        let later = RecvTimeout::Millis(100).deadline(0).unwrap();
        assert!(later > Instant::now());
    }

    #[test]
    fn outbox_keeps_order() {
        let (reply, answers) = crate::ch::ChannelReply::new();
        let responder = Responder::new("4", reply);
        let packet = Packet {
            received: Default::default(),
            match_unit: Some(0),
            pdus: Vec::new(),
            payload: None,
        };

        let mut outbox = Outbox::default();
        outbox.packet(&responder, packet);
        outbox.answer(&responder, None, vec!["1".into()]);
        assert!(answers.try_recv().is_err());

        outbox.deliver();
        assert_eq!(answers.recv().unwrap().values, vec!["packet".to_owned()]);
        assert_eq!(answers.recv().unwrap().to_string(), "4 0 1");
    }
}
