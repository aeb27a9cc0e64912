//! The command handler.
//!
//! A [`Tad`] instance owns the protocol support table, the CSAP database, the in-memory hubs and
//! the registered functions of one process. Commands arrive as [`Request`]s, each with a
//! correlation prefix, and are answered through a [`Reply`] sink with lines of the form
//! `<prefix> <rc> [values...]`. Requests are accepted one at a time; an operation started by a
//! request keeps the [`Responder`] and may answer long after the request was handled.
//!
//! [`Tad`]: struct.Tad.html
//! [`Request`]: struct.Request.html
//! [`Reply`]: trait.Reply.html
//! [`Responder`]: struct.Responder.html
use core::fmt;
use std::collections::HashMap;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::csap::{Command, Csap, CsapDb, CsapId, CsapKind, CsapLayer, CsapRecord, Shared, State};
use crate::engine::{self, RecvTask, RecvTimeout, SendRecvTask, SendTask};
use crate::error::{Error, ErrorKind, Result};
use crate::media::{Hubs, Media};
use crate::nds::{self, CsapSpec, Nds, NdsKind, Packet, Pattern, Pdu, Template};
use crate::spt::{LayerInit, LayerState, Spt};

/// A function producing the payload of a send iteration.
///
/// It gets the CSAP id, `-1` as the layer index for "all layers" and write access to the
/// template, and is expected to update the template payload.
pub type PayloadFn = Arc<dyn Fn(CsapId, i32, &mut Template) -> Result<()> + Send + Sync>;

/// A function called for every packet matching a unit with a `function` action.
///
/// It gets the CSAP id, the opaque part of the action and the raw frame.
pub type ActionFn = Arc<dyn Fn(CsapId, &str, &[u8]) -> Result<()> + Send + Sync>;

/// One answer line, optionally followed by an attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub prefix: String,
    /// `None` is success.
    pub rc: Option<ErrorKind>,
    pub values: Vec<String>,
    pub attachment: Option<String>,
}

impl Answer {
    /// The numeric return code, 0 on success.
    pub fn code(&self) -> u32 {
        self.rc.map_or(0, ErrorKind::code)
    }
}

impl fmt::Display for Answer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.prefix, self.code())?;
        for value in &self.values {
            write!(f, " {}", value)?;
        }
        Ok(())
    }
}

/// Where answers go.
pub trait Reply: Send + Sync {
    fn send(&self, answer: Answer);
}

/// A reply sink feeding a channel.
pub struct ChannelReply {
    sender: Mutex<mpsc::Sender<Answer>>,
}

impl ChannelReply {
    /// A sink and the receiving end of its channel.
    pub fn new() -> (Arc<Self>, mpsc::Receiver<Answer>) {
        let (sender, receiver) = mpsc::channel();
        (Arc::new(ChannelReply { sender: Mutex::new(sender) }), receiver)
    }
}

impl Reply for ChannelReply {
    fn send(&self, answer: Answer) {
        if self.sender.lock().send(answer).is_err() {
            debug!("answer dropped, receiver gone");
        }
    }
}

/// Answers one request, possibly several times.
#[derive(Clone)]
pub struct Responder {
    prefix: String,
    reply: Arc<dyn Reply>,
}

impl Responder {
    pub fn new(prefix: impl Into<String>, reply: Arc<dyn Reply>) -> Self {
        Responder {
            prefix: prefix.into(),
            reply,
        }
    }

    /// The correlation token of the request.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Answer with a return code and values.
    pub fn answer(&self, rc: Option<ErrorKind>, values: Vec<String>) {
        self.reply.send(Answer {
            prefix: self.prefix.clone(),
            rc,
            values,
            attachment: None,
        });
    }

    pub fn ok(&self, values: Vec<String>) {
        self.answer(None, values)
    }

    /// Answer with the code of an error and nothing else.
    pub fn fail(&self, err: &Error) {
        self.answer(Some(err.kind()), Vec::new())
    }

    /// Answer with the code of an error and its message.
    pub fn fail_with_message(&self, err: &Error) {
        self.answer(Some(err.kind()), vec![err.to_string()])
    }

    /// Report one received packet, as a `raw-packet` attachment.
    pub fn packet(&self, packet: &Packet) {
        self.reply.send(Answer {
            prefix: self.prefix.clone(),
            rc: None,
            values: vec!["packet".into()],
            attachment: Some(Nds::Packet(packet.clone()).to_text()),
        });
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Responder").field("prefix", &self.prefix).finish()
    }
}

/// The registered payload and action functions.
#[derive(Default)]
pub struct Symbols {
    payload: RwLock<HashMap<String, PayloadFn>>,
    action: RwLock<HashMap<String, ActionFn>>,
}

impl Symbols {
    pub fn register_payload_fn(&self, name: &str, function: PayloadFn) {
        self.payload.write().insert(name.to_owned(), function);
    }

    pub fn register_action_fn(&self, name: &str, function: ActionFn) {
        self.action.write().insert(name.to_owned(), function);
    }

    pub fn payload_fn(&self, name: &str) -> Option<PayloadFn> {
        self.payload.read().get(name).cloned()
    }

    pub fn action_fn(&self, name: &str) -> Option<ActionFn> {
        self.action.read().get(name).cloned()
    }
}

/// Process wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// The first CSAP id handed out.
    pub csap_id_offset: CsapId,
    /// Upper bound of a single medium read, and so of the command polling interval.
    pub receive_timeout_ms: u64,
    /// Poll interval of a finished background receiver.
    pub stop_latency_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            csap_id_offset: 1,
            receive_timeout_ms: 100,
            stop_latency_ms: 100,
        }
    }
}

impl Config {
    /// Parse a JSON configuration, missing fields keep their default.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|err| Error::InvalidArgument(format!("configuration: {}", err)))
    }
}

/// One command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub prefix: String,
    pub keyword: String,
    pub args: Vec<String>,
    pub attachment: Option<String>,
}

impl Request {
    pub fn new(prefix: &str, keyword: &str, args: &[&str]) -> Self {
        Request {
            prefix: prefix.to_owned(),
            keyword: keyword.to_owned(),
            args: args.iter().map(|&arg| arg.to_owned()).collect(),
            attachment: None,
        }
    }

    pub fn with_attachment(mut self, attachment: impl Into<String>) -> Self {
        self.attachment = Some(attachment.into());
        self
    }

    /// Split a command line `<prefix> <keyword> [args...]`.
    ///
    /// Returns `None` for a blank line.
    pub fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        let prefix = words.next()?.to_owned();
        Some(Request {
            prefix,
            keyword: words.next().unwrap_or("").to_owned(),
            args: words.map(String::from).collect(),
            attachment: None,
        })
    }
}

/// A parsed command.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Op {
    CsapCreate(String),
    CsapDestroy(CsapId),
    CsapParam(CsapId, String),
    SendStart { csap: CsapId, foreground: bool },
    SendStop(CsapId),
    RecvStart {
        csap: CsapId,
        num: usize,
        timeout: RecvTimeout,
        report: Command,
        foreground: bool,
    },
    RecvStop(CsapId),
    RecvWait(CsapId),
    RecvGet(CsapId),
    SendRecv {
        csap: CsapId,
        timeout: RecvTimeout,
        report: Command,
    },
}

/// Flags trailing the positional arguments.
#[derive(Default)]
struct Flags {
    /// The reporting bits of [`Command`].
    report: Command,
    postponed: bool,
}

fn invalid(what: impl fmt::Display) -> Error {
    Error::InvalidArgument(what.to_string())
}

fn positional<'a>(args: &'a [String], idx: usize, what: &str) -> Result<&'a str> {
    args.get(idx)
        .map(String::as_str)
        .ok_or_else(|| invalid(format_args!("missing {}", what)))
}

fn parse_id(args: &[String]) -> Result<CsapId> {
    let text = positional(args, 0, "CSAP id")?;
    text.parse().map_err(|_| invalid(format_args!("bad CSAP id '{}'", text)))
}

fn parse_timeout(text: &str) -> Result<RecvTimeout> {
    match text {
        "inf" => Ok(RecvTimeout::Infinite),
        ms => ms.parse()
            .map(RecvTimeout::Millis)
            .map_err(|_| invalid(format_args!("bad timeout '{}'", ms))),
    }
}

fn parse_flags(args: &[String], allowed: &[&str]) -> Result<Flags> {
    let mut flags = Flags::default();
    for arg in args {
        match arg.as_str() {
            flag if !allowed.contains(&flag) => return Err(invalid(format_args!("unexpected '{}'", flag))),
            "results" => flags.report.insert(Command::RESULTS),
            "mismatch" => flags.report.insert(Command::MISMATCH),
            "no-payload" => flags.report.insert(Command::NO_PAYLOAD),
            "postponed" => flags.postponed = true,
            other => return Err(invalid(format_args!("unexpected '{}'", other))),
        }
    }
    Ok(flags)
}

fn exact(args: &[String], count: usize) -> Result<()> {
    if args.len() == count {
        Ok(())
    } else {
        Err(invalid(format_args!("expected {} arguments, got {}", count, args.len())))
    }
}

impl Op {
    fn parse(keyword: &str, args: &[String]) -> Result<Op> {
        let op = match keyword {
            "csap_create" => {
                exact(args, 1)?;
                Op::CsapCreate(args[0].clone())
            },
            "csap_destroy" => {
                exact(args, 1)?;
                Op::CsapDestroy(parse_id(args)?)
            },
            "csap_param" => {
                exact(args, 2)?;
                Op::CsapParam(parse_id(args)?, args[1].clone())
            },
            "trsend_start" => {
                let flags = parse_flags(args.get(1..).unwrap_or_default(), &["postponed"])?;
                Op::SendStart { csap: parse_id(args)?, foreground: flags.postponed }
            },
            "trsend_stop" => {
                exact(args, 1)?;
                Op::SendStop(parse_id(args)?)
            },
            "trrecv_start" => {
                let num = positional(args, 1, "packet count")?;
                let num = num.parse().map_err(|_| invalid(format_args!("bad packet count '{}'", num)))?;
                let timeout = parse_timeout(positional(args, 2, "timeout")?)?;
                let flags = parse_flags(&args[3..], &["results", "mismatch", "no-payload", "postponed"])?;
                Op::RecvStart {
                    csap: parse_id(args)?,
                    num,
                    timeout,
                    report: flags.report,
                    foreground: flags.postponed,
                }
            },
            "trrecv_stop" => {
                exact(args, 1)?;
                Op::RecvStop(parse_id(args)?)
            },
            "trrecv_wait" => {
                exact(args, 1)?;
                Op::RecvWait(parse_id(args)?)
            },
            "trrecv_get" => {
                exact(args, 1)?;
                Op::RecvGet(parse_id(args)?)
            },
            "trsend_recv" => {
                let timeout = parse_timeout(positional(args, 1, "timeout")?)?;
                let flags = parse_flags(&args[2..], &["results", "mismatch", "no-payload"])?;
                Op::SendRecv {
                    csap: parse_id(args)?,
                    timeout,
                    report: flags.report,
                }
            },
            "" => return Err(invalid("missing keyword")),
            other => return Err(invalid(format_args!("unknown command '{}'", other))),
        };
        Ok(op)
    }
}

/// The traffic application domain of one process.
#[derive(Clone)]
pub struct Tad {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    spt: Spt,
    db: Arc<Mutex<CsapDb>>,
    hubs: Hubs,
    symbols: Symbols,
    /// Serializes request handling.
    rpc: Mutex<()>,
}

impl Tad {
    /// An instance with the built-in layers.
    pub fn new(config: Config) -> Self {
        Tad::with_spt(config, Spt::with_builtin())
    }

    /// An instance with a custom protocol support table.
    pub fn with_spt(config: Config, spt: Spt) -> Self {
        info!(layers = ?spt.tags().collect::<Vec<_>>(), "traffic application domain ready");
        Tad {
            inner: Arc::new(Inner {
                db: Arc::new(Mutex::new(CsapDb::new(config.csap_id_offset))),
                config,
                spt,
                hubs: Hubs::new(),
                symbols: Symbols::default(),
                rpc: Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn spt(&self) -> &Spt {
        &self.inner.spt
    }

    /// The in-memory hubs, as used by `hub:<name>` interfaces.
    pub fn hubs(&self) -> &Hubs {
        &self.inner.hubs
    }

    /// Register a payload function under a name usable in templates.
    pub fn register_payload_fn<F>(&self, name: &str, function: F)
    where
        F: Fn(CsapId, i32, &mut Template) -> Result<()> + Send + Sync + 'static,
    {
        self.inner.symbols.register_payload_fn(name, Arc::new(function));
    }

    /// Register an action function under a name usable in patterns.
    pub fn register_action_fn<F>(&self, name: &str, function: F)
    where
        F: Fn(CsapId, &str, &[u8]) -> Result<()> + Send + Sync + 'static,
    {
        self.inner.symbols.register_action_fn(name, Arc::new(function));
    }

    /// Look up a live CSAP.
    pub fn find(&self, id: CsapId) -> Option<Arc<Csap>> {
        self.inner.db.lock().find(id)
    }

    /// The ids of all live CSAPs.
    pub fn csaps(&self) -> Vec<CsapId> {
        self.inner.db.lock().ids()
    }

    /// Handle a command line, with the attachment that followed it.
    pub fn handle_line(&self, line: &str, attachment: Option<String>, reply: Arc<dyn Reply>) {
        if let Some(mut request) = Request::parse(line) {
            request.attachment = attachment;
            self.handle(request, reply);
        }
    }

    /// Handle one command.
    ///
    /// Failures detected here are answered at once. Operations that start a worker answer when
    /// the worker is done, or immediately with `0 0` when they run in the background.
    pub fn handle(&self, request: Request, reply: Arc<dyn Reply>) {
        let _serial = self.inner.rpc.lock();
        let responder = Responder::new(request.prefix.as_str(), reply);
        debug!(prefix = %request.prefix, keyword = %request.keyword, args = ?request.args, "request");

        let op = match Op::parse(&request.keyword, &request.args) {
            Ok(op) => op,
            Err(err) => {
                warn!(keyword = %request.keyword, error = %err, "bad request");
                return responder.fail(&err);
            },
        };

        let create = match op {
            Op::CsapCreate(_) => true,
            _ => false,
        };
        if let Err(err) = self.dispatch(op, request.attachment.as_deref(), &responder) {
            warn!(keyword = %request.keyword, error = %err, "request failed");
            if create {
                responder.fail_with_message(&err);
            } else {
                responder.fail(&err);
            }
        }
    }

    fn dispatch(&self, op: Op, attachment: Option<&str>, responder: &Responder) -> Result<()> {
        match op {
            Op::CsapCreate(stack) => {
                let id = self.csap_create(&stack, attachment)?;
                responder.ok(vec![id.to_string()]);
            },
            Op::CsapDestroy(id) => {
                self.csap_destroy(id)?;
                responder.ok(Vec::new());
            },
            Op::CsapParam(id, name) => {
                let value = self.csap_param(id, &name)?;
                responder.ok(vec![value]);
            },
            Op::SendStart { csap, foreground } => {
                let template = template(attachment)?;
                let csap = self.idle(csap)?;
                let task = SendTask::prepare(&csap, template, &self.inner.symbols)?;
                engine::start_send(csap, task, responder.clone(), foreground)?;
            },
            Op::SendStop(id) => self.send_stop(id, responder)?,
            Op::RecvStart { csap, num, timeout, report, foreground } => {
                let pattern = pattern(attachment)?;
                let csap = self.idle(csap)?;
                let task = RecvTask::prepare(&csap, pattern, &self.inner.symbols, self.inner.db.clone())?;
                engine::start_recv(csap, task, responder.clone(), num, timeout, report, foreground)?;
            },
            Op::RecvStop(id) => self.recv_stop(id, responder)?,
            Op::RecvWait(id) => self.recv_wait(id, responder)?,
            Op::RecvGet(id) => self.recv_get(id, responder)?,
            Op::SendRecv { csap, timeout, report } => {
                let template = template(attachment)?;
                let csap = self.idle(csap)?;
                let task = SendRecvTask::prepare(&csap, template, &self.inner.symbols, self.inner.db.clone())?;
                engine::start_send_recv(csap, task, responder.clone(), timeout, report)?;
            },
        }
        Ok(())
    }

    fn csap(&self, id: CsapId) -> Result<Arc<Csap>> {
        self.find(id).ok_or(Error::NoSuchCsap(id))
    }

    fn idle(&self, id: CsapId) -> Result<Arc<Csap>> {
        let csap = self.csap(id)?;
        if csap.lock().is_idle() {
            Ok(csap)
        } else {
            Err(Error::CsapBusy(id))
        }
    }

    fn csap_create(&self, stack: &str, attachment: Option<&str>) -> Result<CsapId> {
        let spec = match attachment {
            None => CsapSpec::default(),
            Some(text) => match nds::parse_text(NdsKind::CsapSpec, text)? {
                Nds::CsapSpec(spec) => spec,
                _ => return Err(Error::WrongNdsType { expected: NdsKind::CsapSpec.name() }),
            },
        };

        let record = self.inner.db.lock().create(stack)?;
        let id = record.id;
        match self.init_csap(record, &spec) {
            Ok(csap) => {
                info!(csap = id, stack = stack, "csap created");
                self.inner.db.lock().bind(Arc::new(csap));
                Ok(id)
            },
            Err(err) => {
                self.inner.db.lock().destroy(id);
                Err(err)
            },
        }
    }

    /// Resolve the stack and run the layer initializers bottom up.
    fn init_csap(&self, record: CsapRecord, spec: &CsapSpec) -> Result<Csap> {
        let bindings = self.inner.spt.resolve(&record.stack, record.kind == CsapKind::Data)?;
        let depth = bindings.len();
        let params: Vec<Pdu> = record.stack.iter()
            .enumerate()
            .map(|(index, tag)| spec.layer(index, tag))
            .collect();

        let mut states: Vec<Option<LayerState>> = (0..depth).map(|_| None).collect();
        let mut media: Option<(usize, Arc<dyn Media>)> = None;

        for index in (0..depth).rev() {
            let mut init = LayerInit::new(record.id, index, &record.stack, &params[index], &self.inner.hubs);
            let result = (bindings[index].1.init)(&mut init);
            let attached = init.take_media();
            match result {
                Ok(state) => {
                    states[index] = Some(state);
                    if media.is_none() {
                        media = attached.map(|attached| (index, attached));
                    }
                },
                Err(err) => {
                    warn!(csap = record.id, layer = %record.stack[index], error = %err, "layer init failed");
                    for (lower, state) in states.iter().enumerate().rev() {
                        if let Some(state) = state {
                            let _ = (bindings[lower].1.destroy)(state);
                        }
                    }
                    if let Some((_, media)) = media {
                        media.detach();
                    }
                    return Err(err);
                },
            }
        }

        let (rw_layer, media) = match media {
            Some(media) => media,
            None => {
                for (lower, state) in states.iter().enumerate().rev() {
                    if let Some(state) = state {
                        let _ = (bindings[lower].1.destroy)(state);
                    }
                }
                return Err(Error::StackNotSupported(record.stack.join(".")));
            },
        };

        let layers = bindings.into_iter()
            .zip(params)
            .zip(states)
            .map(|(((layer, neighbor), params), state)| CsapLayer {
                layer,
                neighbor,
                params,
                state: state.unwrap_or_else(|| Box::new(())),
            })
            .collect();

        let config = &self.inner.config;
        let receive_timeout = spec.receive_timeout_ms.unwrap_or(config.receive_timeout_ms);
        let stop_latency = spec.stop_latency_timeout_ms.unwrap_or(config.stop_latency_ms);
        Ok(Csap::new(
            record,
            layers,
            rw_layer,
            media,
            Duration::from_millis(receive_timeout),
            Duration::from_millis(stop_latency),
        ))
    }

    fn csap_destroy(&self, id: CsapId) -> Result<()> {
        let csap = self.idle(id)?;
        self.inner.db.lock().destroy(id);
        info!(csap = id, "csap destroyed");
        csap.release_layers()
    }

    fn csap_param(&self, id: CsapId, name: &str) -> Result<String> {
        let csap = self.csap(id)?;
        {
            let shared = csap.lock();
            let value = match name {
                "status" => Some(shared.status().as_str().to_owned()),
                "total_bytes" => Some(shared.total_bytes.to_string()),
                "first_packet_time" => Some(shared.first_pkt_time.to_string()),
                "last_packet_time" => Some(shared.last_pkt_time.to_string()),
                "no_match_pkts" => Some(shared.no_match_pkts.to_string()),
                _ => None,
            };
            if let Some(value) = value {
                return Ok(value);
            }
        }

        let rw = csap.rw_layer();
        csap.layer(rw).layer
            .get_param(&csap.ctx(rw), name)
            .ok_or(Error::NotImplemented("CSAP parameter"))
    }

    fn send_stop(&self, id: CsapId, responder: &Responder) -> Result<()> {
        let csap = self.csap(id)?;
        let mut shared = csap.lock();
        if !shared.command.contains(Command::SEND) {
            return Err(Error::CsapBadState(id));
        }

        if shared.state.contains(State::COMPLETE) && shared.final_reply.is_none() {
            // The background send is already over.
            let outcome = match shared.last_error.take() {
                None => Ok(shared.sent),
                Some(err) => Err(err),
            };
            shared.finish();
            drop(shared);
            match outcome {
                Ok(sent) => responder.ok(vec![sent.to_string()]),
                Err(err) => responder.fail(&err),
            }
            return Ok(());
        }

        stop(&csap, &mut shared, responder);
        Ok(())
    }

    fn recv_stop(&self, id: CsapId, responder: &Responder) -> Result<()> {
        let csap = self.csap(id)?;
        let mut shared = csap.lock();
        if !shared.command.contains(Command::RECV) {
            return Err(Error::CsapBadState(id));
        }
        stop(&csap, &mut shared, responder);
        Ok(())
    }

    fn recv_wait(&self, id: CsapId, responder: &Responder) -> Result<()> {
        let csap = self.csap(id)?;
        let mut shared = csap.lock();
        if !shared.command.contains(Command::RECV) || shared.state.contains(State::FOREGROUND) {
            return Err(Error::CsapBadState(id));
        }
        shared.command.insert(Command::WAIT);
        shared.final_reply = Some(responder.clone());
        csap.notify();
        Ok(())
    }

    fn recv_get(&self, id: CsapId, responder: &Responder) -> Result<()> {
        let csap = self.csap(id)?;
        let mut shared = csap.lock();
        if !shared.command.contains(Command::RECV) || shared.state.contains(State::FOREGROUND) {
            return Err(Error::CsapBadState(id));
        }
        if shared.get_reply.is_some() {
            return Err(Error::CsapBusy(id));
        }
        shared.command.insert(Command::GET);
        shared.get_reply = Some(responder.clone());
        csap.notify();
        Ok(())
    }

    /// Stop every operation and destroy all CSAPs.
    ///
    /// Workers still running observe the stop at their next poll and answer as usual.
    pub fn shutdown(&self) {
        let _serial = self.inner.rpc.lock();
        let ids = self.csaps();
        for id in ids {
            let csap = match self.inner.db.lock().destroy(id) {
                Some(csap) => csap,
                None => continue,
            };
            {
                let mut shared = csap.lock();
                if !shared.is_idle() {
                    shared.command.insert(Command::STOP);
                    csap.notify();
                }
            }
            if let Err(err) = csap.release_layers() {
                warn!(csap = id, error = %err, "release on shutdown failed");
            }
        }
        info!("traffic application domain shut down");
    }
}

/// Request the end of the current operation, the responder gets its final answer.
fn stop(csap: &Csap, shared: &mut Shared, responder: &Responder) {
    shared.command.insert(Command::STOP);
    if shared.final_reply.is_none() {
        shared.final_reply = Some(responder.clone());
    } else {
        shared.stop_reply = Some(responder.clone());
    }
    csap.notify();
}

fn template(attachment: Option<&str>) -> Result<Template> {
    match nds::parse_text(NdsKind::Template, attachment.ok_or(Error::MissingNds)?)? {
        Nds::Template(template) => Ok(template),
        _ => Err(Error::WrongNdsType { expected: NdsKind::Template.name() }),
    }
}

fn pattern(attachment: Option<&str>) -> Result<Pattern> {
    match nds::parse_text(NdsKind::Pattern, attachment.ok_or(Error::MissingNds)?)? {
        Nds::Pattern(pattern) => Ok(pattern),
        _ => Err(Error::WrongNdsType { expected: NdsKind::Pattern.name() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|&arg| arg.to_owned()).collect()
    }

    #[test]
    fn command_grammar() {
        assert_eq!(Op::parse("csap_create", &args(&["arp.eth"])), Ok(Op::CsapCreate("arp.eth".into())));
        assert_eq!(Op::parse("trsend_start", &args(&["3"])), Ok(Op::SendStart { csap: 3, foreground: false }));
        assert_eq!(Op::parse("trsend_start", &args(&["3", "postponed"])), Ok(Op::SendStart { csap: 3, foreground: true }));
        assert_eq!(Op::parse("trrecv_start", &args(&["1", "5", "inf", "results"])), Ok(Op::RecvStart {
            csap: 1,
            num: 5,
            timeout: RecvTimeout::Infinite,
            report: Command::RESULTS,
            foreground: false,
        }));
        assert_eq!(Op::parse("trrecv_start", &args(&["1", "0", "100", "no-payload", "mismatch", "results", "postponed"])),
            Ok(Op::RecvStart {
                csap: 1,
                num: 0,
                timeout: RecvTimeout::Millis(100),
                report: Command::RESULTS | Command::MISMATCH | Command::NO_PAYLOAD,
                foreground: true,
            }));
        assert_eq!(Op::parse("trsend_recv", &args(&["2", "250"])), Ok(Op::SendRecv {
            csap: 2,
            timeout: RecvTimeout::Millis(250),
            report: Command::default(),
        }));
        assert_eq!(Op::parse("trsend_recv", &args(&["2", "250", "results", "mismatch"])), Ok(Op::SendRecv {
            csap: 2,
            timeout: RecvTimeout::Millis(250),
            report: Command::RESULTS | Command::MISMATCH,
        }));
        assert_eq!(Op::parse("csap_param", &args(&["2", "status"])), Ok(Op::CsapParam(2, "status".into())));
    }

    #[test]
    fn bad_commands() {
        let kind = |keyword: &str, list: &[&str]| Op::parse(keyword, &args(list)).map_err(|err| err.kind());
        assert_eq!(kind("csap_destroy", &["x"]), Err(ErrorKind::InvalidArgument));
        assert_eq!(kind("csap_destroy", &[]), Err(ErrorKind::InvalidArgument));
        assert_eq!(kind("trrecv_start", &["1", "1"]), Err(ErrorKind::InvalidArgument));
        assert_eq!(kind("trrecv_start", &["1", "1", "10", "loud"]), Err(ErrorKind::InvalidArgument));
        assert_eq!(kind("trsend_recv", &["1", "10", "postponed"]), Err(ErrorKind::InvalidArgument));
        assert_eq!(kind("trsend_start", &["1", "mismatch"]), Err(ErrorKind::InvalidArgument));
        assert_eq!(kind("frobnicate", &[]), Err(ErrorKind::InvalidArgument));
        assert_eq!(kind("", &[]), Err(ErrorKind::InvalidArgument));
    }

    #[test]
    fn request_lines() {
        let request = Request::parse("  7 trrecv_get 3 ").unwrap();
        assert_eq!(request, Request::new("7", "trrecv_get", &["3"]));
        assert!(Request::parse("   ").is_none());
        assert_eq!(Request::parse("8").unwrap().keyword, "");
    }

    #[test]
    fn answer_lines() {
        let answer = Answer {
            prefix: "12".into(),
            rc: Some(ErrorKind::Timeout),
            values: vec!["0".into()],
            attachment: None,
        };
        assert_eq!(answer.to_string(), format!("12 {} 0", ErrorKind::Timeout.code()));

        let (reply, answers) = ChannelReply::new();
        let responder = Responder::new("5", reply);
        responder.ok(vec!["1".into(), "2".into()]);
        assert_eq!(answers.recv().unwrap().to_string(), "5 0 1 2");
    }

    #[test]
    fn config_defaults() {
        assert_eq!(Config::from_json("{}").unwrap(), Config::default());
        let config = Config::from_json(r#"{"csap_id_offset": 100}"#).unwrap();
        assert_eq!(config.csap_id_offset, 100);
        assert_eq!(config.receive_timeout_ms, 100);
        assert!(Config::from_json(r#"{"bogus": 1}"#).is_err());
    }

    #[test]
    fn symbols() {
        let symbols = Symbols::default();
        assert!(symbols.payload_fn("fill").is_none());
        symbols.register_payload_fn("fill", Arc::new(|_: CsapId, _: i32, template: &mut Template| {
            template.payload = None;
            Ok(())
        }));
        assert!(symbols.payload_fn("fill").is_some());
        assert!(symbols.action_fn("fill").is_none());
    }
}
