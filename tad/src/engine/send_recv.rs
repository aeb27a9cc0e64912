//! The fused request/reply operation.
//!
//! One frame is built from a template and written, then the answer is awaited with a pattern the
//! layers derive from the same template. The operation is always in the foreground and counts at
//! most one packet.
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::recv::report;
use super::{confirm_pdus, spawn, Outbox, RecvTask, RecvTimeout, SendTask};
use crate::args::ArgIter;
use crate::bps::Direction;
use crate::ch::{Responder, Symbols};
use crate::csap::{Command, Csap, CsapDb, State};
use crate::error::{Error, Result};
use crate::nds::{Packet, Pattern, PatternUnit, Pdu, Template, Timestamp};

/// The request frame and the pattern for its answer.
pub(crate) struct SendRecvTask {
    frame: Vec<u8>,
    answer: RecvTask,
}

impl SendRecvTask {
    /// Build the request and derive the answer pattern.
    ///
    /// The first argument tuple of the template is used, the template must yield one frame.
    pub(crate) fn prepare(csap: &Csap, template: Template, symbols: &Symbols, db: Arc<Mutex<CsapDb>>) -> Result<Self> {
        let mut send = SendTask::prepare(csap, template, symbols)?;
        let specs = send.template().arg_sets.clone();
        let args = ArgIter::new(&specs).next().unwrap_or_default();

        let mut frames = send.frames(csap, &args)?;
        if frames.len() != 1 {
            return Err(Error::GenerateFailed(format!(
                "request yields {} frames instead of one", frames.len())));
        }
        let frame = frames.remove(0);

        let mut pdus = Vec::with_capacity(csap.depth());
        for (index, tag) in csap.stack().iter().enumerate() {
            let layer = &csap.layer(index).layer;
            let pdu = match layer.gen_pattern(&csap.ctx(index), &send.template().pdus[index]) {
                Ok(pdu) => pdu,
                Err(Error::NotImplemented(_)) => Pdu::new(tag.as_str()),
                Err(err) => return Err(err),
            };
            pdus.push(pdu);
        }
        confirm_pdus(csap, &mut pdus, Direction::Recv)?;

        let pattern = Pattern(vec![PatternUnit { pdus, ..PatternUnit::default() }]);
        Ok(SendRecvTask {
            frame,
            answer: RecvTask::from_units(pattern, db),
        })
    }
}

/// Start the fused operation on an idle CSAP. It always answers through `reply`.
pub(crate) fn start_send_recv(
    csap: Arc<Csap>,
    task: SendRecvTask,
    reply: Responder,
    timeout: RecvTimeout,
    report: Command,
) -> Result<()> {
    {
        let mut shared = csap.lock();
        if !shared.is_idle() {
            return Err(Error::CsapBusy(csap.id()));
        }
        let command = Command::SEND | Command::RECV | report;
        shared.begin(command, State::SEND | State::RECV | State::FOREGROUND, Some(reply));
        shared.num_packets = 1;
        shared.wait_for = timeout.deadline(1);
    }

    let worker = csap.clone();
    if let Err(err) = spawn(&csap, "send-recv", move || send_recv_worker(worker, task)) {
        csap.lock().finish();
        return Err(err);
    }
    Ok(())
}

fn send_recv_worker(csap: Arc<Csap>, task: SendRecvTask) {
    debug!(csap = csap.id(), "send-recv started");
    let result = exchange(&csap, &task);
    if let Err(err) = csap.media().release() {
        warn!(csap = csap.id(), error = %err, "release after send-recv failed");
    }

    let mut outbox = Outbox::default();
    {
        let mut shared = csap.lock();
        match result {
            Ok(_) => (),
            Err(Error::Timeout) => {
                debug!(csap = csap.id(), "send-recv timed out");
                shared.fail(Error::Timeout);
            },
            Err(err) => {
                warn!(csap = csap.id(), error = %err, "send-recv failed");
                shared.fail(err);
            },
        }
        debug!(csap = csap.id(), answered = shared.pkt_count, "send-recv finished");
        outbox.final_answer(&shared, vec![shared.pkt_count.to_string()]);
        shared.finish();
    }
    outbox.deliver();
}

/// Write the request and wait for a matching answer.
///
/// Returns whether the answer came. A stop ends the wait early and is no failure, reaching the
/// deadline is a timeout.
fn exchange(csap: &Csap, task: &SendRecvTask) -> Result<bool> {
    csap.media().prepare_send()?;
    csap.media().prepare_recv()?;

    let first_wait = read_timeout(csap, Instant::now());
    trace!(csap = csap.id(), len = task.frame.len(), "write");
    let mut frame = csap.media().write_read(&task.frame, first_wait)?;
    {
        let mut shared = csap.lock();
        let now = Timestamp::now();
        shared.first_pkt_time = now;
        shared.last_pkt_time = now;
        shared.sent = 1;
        shared.total_bytes += task.frame.len() as u64;
    }

    loop {
        if let Some(received) = frame.take() {
            trace!(csap = csap.id(), len = received.len(), "read");
            let hit = task.answer.match_frame(csap, &received)?;

            let mut outbox = Outbox::default();
            let answered = {
                let mut shared = csap.lock();
                match hit {
                    Some(hit) => {
                        shared.pkt_count = 1;
                        shared.last_pkt_time = hit.packet.received;
                        shared.total_bytes += received.len() as u64;
                        report(&mut shared, &mut outbox, hit.packet);
                        true
                    },
                    None => {
                        shared.no_match_pkts += 1;
                        if shared.command.contains(Command::MISMATCH) {
                            report(&mut shared, &mut outbox, Packet::unmatched(received));
                        }
                        false
                    },
                }
            };
            outbox.deliver();
            if answered {
                return Ok(true);
            }
        }

        let now = Instant::now();
        {
            let shared = csap.lock();
            if shared.command.contains(Command::STOP) {
                debug!(csap = csap.id(), "send-recv stopped");
                return Ok(false);
            }
            if matches!(shared.wait_for, Some(deadline) if deadline <= now) {
                return Err(Error::Timeout);
            }
        }
        frame = csap.media().read(read_timeout(csap, now))?;
    }
}

fn read_timeout(csap: &Csap, now: Instant) -> Duration {
    match csap.lock().wait_for {
        Some(deadline) => csap.receive_timeout().min(deadline.saturating_duration_since(now)),
        None => csap.receive_timeout(),
    }
}
