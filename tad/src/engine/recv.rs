//! The receive engine.
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use super::{confirm_pdus, spawn, Outbox, RecvTimeout};
use crate::bps::Direction;
use crate::ch::{ActionFn, Responder, Symbols};
use crate::csap::{Command, Csap, CsapDb, CsapId, Shared, State};
use crate::error::{Error, Result};
use crate::nds::{Action, Packet, Pattern, PatternUnit, Pdu, Timestamp};
use crate::wire::Octets;

/// A confirmed pattern with its resolved actions.
pub(crate) struct RecvTask {
    pattern: Pattern,
    functions: Vec<Vec<Option<(String, ActionFn)>>>,
    db: Arc<Mutex<CsapDb>>,
}

/// The result of matching a frame against a whole pattern.
pub(crate) struct Hit {
    pub(crate) unit: usize,
    pub(crate) packet: Packet,
}

impl RecvTask {
    /// Confirm every unit against the layers, the confirmed PDUs replace the given ones.
    pub(crate) fn prepare(csap: &Csap, mut pattern: Pattern, symbols: &Symbols, db: Arc<Mutex<CsapDb>>) -> Result<Self> {
        if pattern.0.is_empty() {
            pattern.0.push(PatternUnit::default());
        }

        let mut functions = Vec::with_capacity(pattern.0.len());
        for unit in &mut pattern.0 {
            confirm_pdus(csap, &mut unit.pdus, Direction::Recv)?;
            let resolved = unit.actions.iter().map(|action| match action {
                Action::Function(spec) => {
                    let name = spec.split(':').next().unwrap_or_default();
                    symbols.action_fn(name)
                        .map(|function| Some((spec.clone(), function)))
                        .ok_or_else(|| Error::NoSuchName(name.to_owned()))
                },
                _ => Ok(None),
            }).collect::<Result<Vec<_>>>()?;
            functions.push(resolved);
        }

        Ok(RecvTask { pattern, functions, db })
    }

    pub(crate) fn from_units(pattern: Pattern, db: Arc<Mutex<CsapDb>>) -> Self {
        let functions = pattern.0.iter().map(|unit| vec![None; unit.actions.len()]).collect();
        RecvTask { pattern, functions, db }
    }

    /// Match a frame against the units in order, the first hit wins.
    pub(crate) fn match_frame(&self, csap: &Csap, frame: &[u8]) -> Result<Option<Hit>> {
        for (idx, unit) in self.pattern.0.iter().enumerate() {
            match match_unit(csap, unit, frame) {
                Ok((pdus, payload)) => {
                    return Ok(Some(Hit {
                        unit: idx,
                        packet: Packet {
                            received: Timestamp::now(),
                            match_unit: Some(idx),
                            pdus,
                            payload: Some(Octets(payload)),
                        },
                    }));
                },
                Err(err) if err.is_mismatch() => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    /// Run the actions of a matched unit.
    ///
    /// Failures are logged, they never end the operation. Returns whether to break and whether
    /// to report the packet.
    fn act(&self, csap: &Csap, hit: &Hit, frame: &[u8]) -> (bool, bool) {
        let unit = &self.pattern.0[hit.unit];
        let mut stop = false;
        let mut report = true;

        for (action, function) in unit.actions.iter().zip(&self.functions[hit.unit]) {
            let result = match action {
                Action::Echo => echo(csap, frame),
                Action::Break => {
                    stop = true;
                    Ok(())
                },
                Action::NoReport => {
                    report = false;
                    Ok(())
                },
                Action::ForwardPayload(target) => {
                    let payload = hit.packet.payload.as_ref().map_or(&[][..], Octets::as_bytes);
                    self.forward(*target, payload)
                },
                Action::Function(_) => match function {
                    Some((spec, function)) => {
                        let opaque = spec.splitn(2, ':').nth(1).unwrap_or("");
                        function(csap.id(), opaque, frame)
                    },
                    None => Ok(()),
                },
            };
            if let Err(err) = result {
                warn!(csap = csap.id(), action = ?action, error = %err, "action failed");
            }
        }

        (stop, report)
    }

    fn forward(&self, target: CsapId, payload: &[u8]) -> Result<()> {
        let target = self.db.lock().find(target).ok_or(Error::NoSuchCsap(target))?;
        target.media().write(payload)
    }
}

/// Match all layers of one unit, bottom up.
fn match_unit(csap: &Csap, unit: &PatternUnit, frame: &[u8]) -> Result<(Vec<Pdu>, Vec<u8>)> {
    let depth = csap.depth();
    let mut parsed = vec![Pdu::default(); depth];
    let mut rest = frame;

    for index in (0..depth).rev() {
        let layer = &csap.layer(index).layer;
        let matched = layer.match_frame(&csap.ctx(index), &unit.pdus[index], rest)?;
        parsed[index] = matched.parsed;
        rest = matched.payload;
    }

    if let Some(payload) = &unit.payload {
        payload.matches(rest)?;
    }
    Ok((parsed, rest.to_vec()))
}

fn echo(csap: &Csap, frame: &[u8]) -> Result<()> {
    let rw = csap.rw_layer();
    let echo = csap.layer(rw).layer.echo(&csap.ctx(rw), frame)?;
    csap.media().write(&echo)
}

/// Start a receive operation on an idle CSAP.
pub(crate) fn start_recv(
    csap: Arc<Csap>,
    task: RecvTask,
    reply: Responder,
    num_packets: usize,
    timeout: RecvTimeout,
    report: Command,
    foreground: bool,
) -> Result<()> {
    {
        let mut shared = csap.lock();
        if !shared.is_idle() {
            return Err(Error::CsapBusy(csap.id()));
        }
        let command = Command::RECV | report;
        let state = if foreground { State::RECV | State::FOREGROUND } else { State::RECV };
        shared.begin(command, state, if foreground { Some(reply.clone()) } else { None });
        shared.num_packets = num_packets;
        shared.wait_for = timeout.deadline(num_packets);
    }

    let worker = csap.clone();
    if let Err(err) = spawn(&csap, "recv", move || recv_worker(worker, task)) {
        csap.lock().finish();
        return Err(err);
    }

    if !foreground {
        reply.ok(vec!["0".into()]);
    }
    Ok(())
}

fn recv_worker(csap: Arc<Csap>, task: RecvTask) {
    debug!(csap = csap.id(), "receive started");

    if let Err(err) = prepare_media(&csap, &task) {
        error!(csap = csap.id(), error = %err, "media preparation failed");
        let mut shared = csap.lock();
        shared.fail(err);
        shared.state.insert(State::COMPLETE);
    }

    recv_loop(&csap, &task);

    if let Err(err) = csap.media().release() {
        warn!(csap = csap.id(), error = %err, "release after receive failed");
    }

    let mut outbox = Outbox::default();
    {
        let mut shared = csap.lock();
        flush(&mut shared, &mut outbox);
        debug!(csap = csap.id(), packets = shared.pkt_count, error = ?shared.last_error, "receive finished");
        outbox.final_answer(&shared, vec![shared.pkt_count.to_string()]);
        shared.finish();
    }
    outbox.deliver();
}

fn prepare_media(csap: &Csap, task: &RecvTask) -> Result<()> {
    csap.media().prepare_recv()?;
    if task.pattern.echoes() {
        csap.media().prepare_send()?;
    }
    Ok(())
}

/// Hand queued packets to whoever waits for the final answer.
fn flush(shared: &mut Shared, outbox: &mut Outbox) {
    let packets = shared.results.drain(..);
    if let Some(reply) = &shared.final_reply {
        for packet in packets {
            outbox.packet(reply, packet);
        }
    }
}

/// Report a packet, or queue it for a later `get` or `wait`.
pub(super) fn report(shared: &mut Shared, outbox: &mut Outbox, mut packet: Packet) {
    if !shared.command.contains(Command::RESULTS) {
        return;
    }
    if shared.command.contains(Command::NO_PAYLOAD) {
        packet.payload = None;
    }
    if shared.state.contains(State::FOREGROUND) {
        if let Some(reply) = &shared.final_reply {
            outbox.packet(reply, packet);
        }
    } else {
        shared.results.push_back(packet);
    }
}

/// What the loop does after looking at the command bits.
enum Step {
    Read(Duration),
    Linger,
    Again,
    Stop,
}

/// Serve `wait` and `get` requests and decide the next step.
fn poll(csap: &Csap, shared: &mut Shared, outbox: &mut Outbox, have_read: bool) -> Step {
    if shared.command.contains(Command::WAIT) {
        shared.state.insert(State::FOREGROUND);
        shared.command.remove(Command::WAIT);
        // Later packets are reported directly, keep the order.
        flush(shared, outbox);
    }
    if shared.command.contains(Command::GET) {
        shared.command.remove(Command::GET);
        if let Some(reply) = shared.get_reply.take() {
            for packet in shared.results.drain(..) {
                outbox.packet(&reply, packet);
            }
            outbox.answer(&reply, None, vec![shared.pkt_count.to_string()]);
        }
    }

    if shared.command.contains(Command::STOP) {
        debug!(csap = csap.id(), "receive stopped");
        return Step::Stop;
    }

    if shared.state.contains(State::COMPLETE) {
        return if shared.state.contains(State::FOREGROUND) { Step::Stop } else { Step::Linger };
    }

    let now = Instant::now();
    match shared.wait_for {
        // The deadline only ends the operation once at least one read happened.
        Some(deadline) if deadline <= now && have_read => {
            debug!(csap = csap.id(), "receive timed out");
            shared.fail(Error::Timeout);
            shared.state.insert(State::COMPLETE);
            Step::Again
        },
        Some(deadline) => Step::Read(csap.receive_timeout().min(deadline.saturating_duration_since(now))),
        None => Step::Read(csap.receive_timeout()),
    }
}

fn recv_loop(csap: &Csap, task: &RecvTask) {
    let mut have_read = false;

    loop {
        let mut outbox = Outbox::default();
        let step = poll(csap, &mut csap.lock(), &mut outbox, have_read);
        outbox.deliver();

        let read_timeout = match step {
            Step::Read(timeout) => timeout,
            Step::Again => continue,
            Step::Stop => break,
            Step::Linger => {
                let mut shared = csap.lock();
                // A request may have come in while the lock was released.
                if !shared.command.intersects(Command::STOP | Command::GET | Command::WAIT) {
                    let latency = Instant::now() + csap.stop_latency();
                    csap.wait_until(&mut shared, latency);
                }
                continue;
            },
        };

        let frame = csap.media().read(read_timeout);
        have_read = true;
        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(err) => {
                error!(csap = csap.id(), error = %err, "read failed");
                let mut shared = csap.lock();
                shared.fail(err);
                shared.state.insert(State::COMPLETE);
                continue;
            },
        };
        trace!(csap = csap.id(), len = frame.len(), "read");

        let hit = match task.match_frame(csap, &frame) {
            Ok(Some(hit)) => hit,
            Ok(None) => {
                let mut outbox = Outbox::default();
                {
                    let mut shared = csap.lock();
                    shared.no_match_pkts += 1;
                    if shared.command.contains(Command::MISMATCH) {
                        report(&mut shared, &mut outbox, Packet::unmatched(frame));
                    }
                }
                outbox.deliver();
                continue;
            },
            Err(err) => {
                warn!(csap = csap.id(), error = %err, "match failed");
                let mut shared = csap.lock();
                shared.fail(err);
                shared.state.insert(State::COMPLETE);
                continue;
            },
        };

        let (stop, reported) = task.act(csap, &hit, &frame);

        let mut outbox = Outbox::default();
        {
            let mut shared = csap.lock();
            shared.last_pkt_time = hit.packet.received;
            if shared.pkt_count == 0 {
                shared.first_pkt_time = hit.packet.received;
            }
            shared.pkt_count += 1;
            shared.total_bytes += frame.len() as u64;

            if reported {
                report(&mut shared, &mut outbox, hit.packet);
            }

            if stop || (shared.num_packets != 0 && shared.pkt_count >= shared.num_packets) {
                shared.state.insert(State::COMPLETE);
            }
        }
        outbox.deliver();
    }
}
