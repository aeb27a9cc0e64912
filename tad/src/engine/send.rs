//! The send engine.
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::{confirm_pdus, final_error, sleep_unless_stopped, spawn, Outbox};
use crate::args::{Arg, ArgIter};
use crate::bps::Direction;
use crate::ch::{PayloadFn, Responder, Symbols};
use crate::csap::{Command, Csap, State};
use crate::error::{Error, Result};
use crate::nds::{Payload, Template, Timestamp, PAYLOAD_FILLER};

/// A confirmed template, ready to run.
pub(crate) struct SendTask {
    template: Template,
    function: Option<(String, PayloadFn)>,
}

impl SendTask {
    /// Confirm the template against the layers and resolve the payload function.
    pub(crate) fn prepare(csap: &Csap, mut template: Template, symbols: &Symbols) -> Result<Self> {
        confirm_pdus(csap, &mut template.pdus, Direction::Send)?;
        for spec in &template.arg_sets {
            spec.validate()?;
        }

        let function = match &template.payload {
            Some(Payload::Function(name)) => {
                let function = symbols.payload_fn(name)
                    .ok_or_else(|| Error::NoSuchName(name.clone()))?;
                Some((name.clone(), function))
            },
            _ => None,
        };

        Ok(SendTask { template, function })
    }

    /// The payload of the next iteration.
    fn payload(&mut self, csap: &Csap) -> Result<Vec<u8>> {
        if let Some((name, function)) = &self.function {
            trace!(csap = csap.id(), function = %name, "payload function");
            function(csap.id(), -1, &mut self.template)?;
        }

        Ok(match &self.template.payload {
            Some(Payload::Bytes(bytes)) => bytes.0.clone(),
            Some(Payload::Length(len)) => vec![PAYLOAD_FILLER; *len],
            Some(Payload::Function(_)) | None => Vec::new(),
        })
    }

    /// Descend the stack, the bottom layer yields the frames to write.
    pub(crate) fn frames(&mut self, csap: &Csap, args: &[Arg]) -> Result<Vec<Vec<u8>>> {
        let mut frames = vec![self.payload(csap)?];
        for index in 0..csap.depth() {
            let layer = &csap.layer(index).layer;
            frames = layer.generate(&csap.ctx(index), &self.template.pdus[index], args, frames)?;
        }
        Ok(frames)
    }

    pub(crate) fn template(&self) -> &Template {
        &self.template
    }
}

/// Start a send operation on an idle CSAP.
///
/// A foreground operation answers through `reply` when done, a background one answers `0 0`
/// immediately and its final answer goes to the stop command.
pub(crate) fn start_send(csap: Arc<Csap>, task: SendTask, reply: Responder, foreground: bool) -> Result<()> {
    {
        let mut shared = csap.lock();
        if !shared.is_idle() {
            return Err(Error::CsapBusy(csap.id()));
        }
        let state = if foreground { State::SEND | State::FOREGROUND } else { State::SEND };
        shared.begin(Command::SEND, state, if foreground { Some(reply.clone()) } else { None });
    }

    let worker = csap.clone();
    if let Err(err) = spawn(&csap, "send", move || send_worker(worker, task)) {
        csap.lock().finish();
        return Err(err);
    }

    if !foreground {
        reply.ok(vec!["0".into()]);
    }
    Ok(())
}

fn send_worker(csap: Arc<Csap>, mut task: SendTask) {
    debug!(csap = csap.id(), "send started");
    let result = send_loop(&csap, &mut task);
    if let Err(err) = csap.media().release() {
        warn!(csap = csap.id(), error = %err, "release after send failed");
    }

    let mut outbox = Outbox::default();
    {
        let mut shared = csap.lock();
        if let Err(err) = result {
            warn!(csap = csap.id(), error = %err, "send failed");
            shared.fail(err);
        }
        debug!(csap = csap.id(), sent = shared.sent, "send finished");

        if shared.final_reply.is_none() {
            // Background without stop yet, trsend_stop answers.
            shared.state.insert(State::COMPLETE);
            return;
        }

        let values = match final_error(&shared) {
            None => vec![shared.sent.to_string()],
            Some(_) => Vec::new(),
        };
        outbox.final_answer(&shared, values);
        shared.finish();
    }
    outbox.deliver();
}

fn send_loop(csap: &Csap, task: &mut SendTask) -> Result<()> {
    csap.media().prepare_send()?;

    let specs = task.template.arg_sets.clone();
    let delay = Duration::from_millis(task.template.delays.unwrap_or(0));
    let mut next_at: Option<Instant> = None;

    for (iteration, args) in ArgIter::new(&specs).enumerate() {
        if csap.lock().command.contains(Command::STOP) {
            debug!(csap = csap.id(), "send stopped");
            break;
        }
        if let Some(target) = next_at {
            if sleep_unless_stopped(csap, target) {
                debug!(csap = csap.id(), "send stopped while pacing");
                break;
            }
        }

        let started = Instant::now();
        // The schedule follows the target times, late wake ups do not shift it.
        next_at = Some(next_at.unwrap_or(started) + delay);
        if iteration == 0 {
            csap.lock().first_pkt_time = Timestamp::now();
        }

        let frames = task.frames(csap, &args)?;
        for frame in frames {
            trace!(csap = csap.id(), len = frame.len(), "write");
            csap.media().write(&frame)?;
            let mut shared = csap.lock();
            shared.last_pkt_time = Timestamp::now();
            shared.total_bytes += frame.len() as u64;
            shared.sent += 1;
        }
    }

    Ok(())
}
