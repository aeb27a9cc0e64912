//! CSAP records and the CSAP database.
//!
//! A CSAP is one instantiated protocol stack. It owns the per-layer state created by the layer
//! initializers, the medium attached by its read/write layer, and the small state machine that
//! coordinates the command handler with at most one worker at a time.
//!
//! # Command and state
//!
//! The command handler communicates with a worker through two bit sets guarded by the CSAP lock.
//! `Command` holds the requests (`SEND`, `RECV`, `STOP`, `GET`, `WAIT`, `RESULTS`), `State` what
//! the worker is doing (`SEND`, `RECV`, `FOREGROUND`, `COMPLETE`). A CSAP with an empty command
//! set is idle and has no worker. Workers poll the bits at every loop turn and sleep on the CSAP
//! condition variable so that a new command wakes them early.
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::ch::Responder;
use crate::error::{Error, Result};
use crate::media::Media;
use crate::nds::{Packet, Pdu, Timestamp};
use crate::spt::{Layer, LayerCtx, LayerState, Neighbor};

/// The identifier of a CSAP, unique among live CSAPs.
pub type CsapId = u32;

/// Stack prefix marking a data-CSAP.
pub const DATA_PREFIX: &str = "data.";

bit_set! {
    /// Requests of the command handler to the worker.
    pub struct Command(u8) {
        SEND = 0x01,
        RECV = 0x02,
        STOP = 0x04,
        GET = 0x08,
        WAIT = 0x10,
        /// Matched packets are reported, not only counted.
        RESULTS = 0x20,
        /// Packets matching no unit are reported as well.
        MISMATCH = 0x40,
        /// Reported packets leave out their payload.
        NO_PAYLOAD = 0x80,
    }
}

bit_set! {
    /// What the worker of a CSAP is doing.
    pub struct State(u8) {
        SEND = 0x01,
        RECV = 0x02,
        /// The worker answers the operation itself when done.
        FOREGROUND = 0x04,
        /// The operation is over, the final answer is pending.
        COMPLETE = 0x08,
    }
}

/// Normal CSAPs attach to a real or simulated medium, data-CSAPs to a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsapKind {
    Normal,
    Data,
}

/// The status reported by the `status` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    Busy,
    Complete,
    Error,
}

impl Status {
    /// The word used in answers.
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Idle => "idle",
            Status::Busy => "busy",
            Status::Complete => "complete",
            Status::Error => "error",
        }
    }
}

/// A reserved id with a parsed stack, before the layers are initialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsapRecord {
    pub id: CsapId,
    pub kind: CsapKind,
    pub stack: Vec<String>,
}

/// One layer of a live CSAP.
pub struct CsapLayer {
    pub layer: Arc<dyn Layer>,
    pub neighbor: Neighbor,
    pub params: Pdu,
    pub state: LayerState,
}

/// Fields shared between the command handler and the worker.
pub(crate) struct Shared {
    pub(crate) command: Command,
    pub(crate) state: State,
    /// Where the final answer of the current operation goes, unset while nobody waits for it.
    pub(crate) final_reply: Option<Responder>,
    /// A stop arriving during a foreground operation, answered together with it.
    pub(crate) stop_reply: Option<Responder>,
    /// A pending `get` request.
    pub(crate) get_reply: Option<Responder>,
    pub(crate) num_packets: usize,
    pub(crate) wait_for: Option<Instant>,
    pub(crate) first_pkt_time: Timestamp,
    pub(crate) last_pkt_time: Timestamp,
    pub(crate) total_bytes: u64,
    pub(crate) pkt_count: usize,
    pub(crate) sent: usize,
    pub(crate) no_match_pkts: u64,
    pub(crate) last_error: Option<Error>,
    pub(crate) results: VecDeque<Packet>,
}

/// A live CSAP.
pub struct Csap {
    id: CsapId,
    kind: CsapKind,
    stack: Vec<String>,
    layers: Vec<CsapLayer>,
    rw_layer: usize,
    media: Arc<dyn Media>,
    receive_timeout: Duration,
    stop_latency: Duration,
    shared: Mutex<Shared>,
    signal: Condvar,
}

impl Shared {
    fn new() -> Self {
        Shared {
            command: Command::EMPTY,
            state: State::EMPTY,
            final_reply: None,
            stop_reply: None,
            get_reply: None,
            num_packets: 0,
            wait_for: None,
            first_pkt_time: Timestamp::default(),
            last_pkt_time: Timestamp::default(),
            total_bytes: 0,
            pkt_count: 0,
            sent: 0,
            no_match_pkts: 0,
            last_error: None,
            results: VecDeque::new(),
        }
    }

    /// Start an operation, resetting all per-operation fields.
    pub(crate) fn begin(&mut self, command: Command, state: State, final_reply: Option<Responder>) {
        let fresh = Shared::new();
        *self = Shared {
            command,
            state,
            final_reply,
            ..fresh
        };
    }

    /// Return to idle. Counters stay readable until the next operation.
    pub(crate) fn finish(&mut self) {
        self.command = Command::EMPTY;
        self.state = State::EMPTY;
        self.final_reply = None;
        self.stop_reply = None;
        self.get_reply = None;
        self.wait_for = None;
    }

    /// Record a failure unless an earlier one is already recorded.
    pub(crate) fn fail(&mut self, err: Error) {
        if self.last_error.is_none() {
            self.last_error = Some(err);
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.command.is_empty()
    }

    pub(crate) fn status(&self) -> Status {
        if self.command.is_empty() {
            return Status::Idle;
        }
        if !self.state.contains(State::COMPLETE) {
            return Status::Busy;
        }
        match self.last_error {
            None | Some(Error::Timeout) => Status::Complete,
            Some(_) => Status::Error,
        }
    }
}

impl Csap {
    pub(crate) fn new(
        record: CsapRecord,
        layers: Vec<CsapLayer>,
        rw_layer: usize,
        media: Arc<dyn Media>,
        receive_timeout: Duration,
        stop_latency: Duration,
    ) -> Self {
        Csap {
            id: record.id,
            kind: record.kind,
            stack: record.stack,
            layers,
            rw_layer,
            media,
            receive_timeout,
            stop_latency,
            shared: Mutex::new(Shared::new()),
            signal: Condvar::new(),
        }
    }

    pub fn id(&self) -> CsapId {
        self.id
    }

    pub fn kind(&self) -> CsapKind {
        self.kind
    }

    /// The protocol tags, top down.
    pub fn stack(&self) -> &[String] {
        &self.stack
    }

    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    pub fn layer(&self, index: usize) -> &CsapLayer {
        &self.layers[index]
    }

    /// Index of the layer owning the medium.
    pub fn rw_layer(&self) -> usize {
        self.rw_layer
    }

    pub fn media(&self) -> &dyn Media {
        self.media.as_ref()
    }

    /// Upper bound of a single medium read.
    pub fn receive_timeout(&self) -> Duration {
        self.receive_timeout
    }

    /// Poll interval of a finished background receiver.
    pub fn stop_latency(&self) -> Duration {
        self.stop_latency
    }

    /// The context handed to callbacks of one layer.
    pub fn ctx(&self, index: usize) -> LayerCtx<'_> {
        let layer = &self.layers[index];
        LayerCtx {
            csap: self.id,
            index,
            stack: &self.stack,
            params: &layer.params,
            state: &layer.state,
            media: self.media.as_ref(),
        }
    }

    /// The current command and state bits.
    pub fn flags(&self) -> (Command, State) {
        let shared = self.shared.lock();
        (shared.command, shared.state)
    }

    /// The status word of the current operation.
    pub fn status(&self) -> Status {
        self.shared.lock().status()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock()
    }

    /// Wake the worker, after changing command bits.
    pub(crate) fn notify(&self) {
        self.signal.notify_all();
    }

    /// Sleep until notified or until `deadline`.
    pub(crate) fn wait_until(&self, guard: &mut MutexGuard<'_, Shared>, deadline: Instant) {
        let _ = self.signal.wait_until(guard, deadline);
    }

    /// Run the layer destructors, bottom up, and detach the medium.
    ///
    /// All destructors run even when some fail, the first failure is returned.
    pub(crate) fn release_layers(&self) -> Result<()> {
        let mut result = Ok(());
        for (index, layer) in self.layers.iter().enumerate().rev() {
            if let Err(err) = (layer.neighbor.destroy)(&layer.state) {
                warn!(csap = self.id, layer = index, error = %err, "layer destroy failed");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        self.media.detach();
        result
    }
}

/// The ordered collection of CSAPs of a process.
pub struct CsapDb {
    offset: CsapId,
    entries: BTreeMap<CsapId, Entry>,
}

enum Entry {
    Reserved,
    Live(Arc<Csap>),
}

impl CsapDb {
    /// An empty database handing out ids from `offset` on.
    pub fn new(offset: CsapId) -> Self {
        CsapDb {
            offset: offset.max(1),
            entries: BTreeMap::new(),
        }
    }

    /// Parse a stack and reserve the lowest free id for it.
    ///
    /// The layers are not initialized here, see `bind`.
    pub fn create(&mut self, stack: &str) -> Result<CsapRecord> {
        let (kind, tags) = if stack.starts_with(DATA_PREFIX) {
            (CsapKind::Data, &stack[DATA_PREFIX.len()..])
        } else {
            (CsapKind::Normal, stack)
        };

        let stack: Vec<String> = tags.split('.').map(String::from).collect();
        if stack.iter().any(String::is_empty) {
            return Err(Error::StackNotSupported(tags.to_owned()));
        }

        let id = self.free_id()?;
        self.entries.insert(id, Entry::Reserved);
        debug!(csap = id, stack = tags, "csap reserved");
        Ok(CsapRecord { id, kind, stack })
    }

    fn free_id(&self) -> Result<CsapId> {
        let mut candidate = self.offset;
        for &id in self.entries.range(self.offset..).map(|(id, _)| id) {
            if id != candidate {
                break;
            }
            candidate = candidate.checked_add(1).ok_or(Error::OutOfMemory)?;
        }
        Ok(candidate)
    }

    /// Make a reserved id live.
    pub fn bind(&mut self, csap: Arc<Csap>) {
        self.entries.insert(csap.id(), Entry::Live(csap));
    }

    /// Look up a live CSAP.
    pub fn find(&self, id: CsapId) -> Option<Arc<Csap>> {
        match self.entries.get(&id) {
            Some(Entry::Live(csap)) => Some(csap.clone()),
            _ => None,
        }
    }

    /// Remove a record, live or reserved. The layers must already be released.
    pub fn destroy(&mut self, id: CsapId) -> Option<Arc<Csap>> {
        match self.entries.remove(&id)? {
            Entry::Live(csap) => Some(csap),
            Entry::Reserved => None,
        }
    }

    /// The ids of all live CSAPs, ascending.
    pub fn ids(&self) -> Vec<CsapId> {
        self.entries.iter()
            .filter(|(_, entry)| match entry {
                Entry::Live(_) => true,
                Entry::Reserved => false,
            })
            .map(|(&id, _)| id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_free_id() {
        let mut db = CsapDb::new(5);
        assert_eq!(db.create("eth").unwrap().id, 5);
        assert_eq!(db.create("eth").unwrap().id, 6);
        assert_eq!(db.create("eth").unwrap().id, 7);
        db.destroy(6);
        assert_eq!(db.create("eth").unwrap().id, 6);
        assert_eq!(db.create("eth").unwrap().id, 8);
    }

    #[test]
    fn stack_parsing() {
        let mut db = CsapDb::new(1);
        let record = db.create("arp.eth").unwrap();
        assert_eq!(record.kind, CsapKind::Normal);
        assert_eq!(record.stack, vec!["arp", "eth"]);

        let data = db.create("data.eth").unwrap();
        assert_eq!(data.kind, CsapKind::Data);
        assert_eq!(data.stack, vec!["eth"]);

        assert!(matches!(db.create("arp..eth"), Err(Error::StackNotSupported(_))));
        assert!(matches!(db.create(""), Err(Error::StackNotSupported(_))));
        // Reserved ids are not live.
        assert!(db.find(record.id).is_none());
        assert!(db.ids().is_empty());
    }

    #[test]
    fn bit_sets() {
        let mut command = Command::SEND | Command::RESULTS;
        assert!(command.contains(Command::SEND));
        assert!(!command.contains(Command::SEND | Command::STOP));
        command.insert(Command::STOP);
        command.remove(Command::SEND);
        assert_eq!(command, Command::STOP | Command::RESULTS);
        assert_eq!(command.count(), 2);
        assert_eq!(format!("{:?}", command), r#"{"STOP", "RESULTS"}"#);
        assert!(State::EMPTY.is_empty());
    }

    #[test]
    fn status_words() {
        let mut shared = Shared::new();
        assert_eq!(shared.status(), Status::Idle);
        shared.begin(Command::RECV, State::RECV, None);
        assert_eq!(shared.status(), Status::Busy);
        shared.state.insert(State::COMPLETE);
        shared.fail(Error::Timeout);
        assert_eq!(shared.status(), Status::Complete);
        shared.last_error = Some(Error::Io("down".into()));
        assert_eq!(shared.status(), Status::Error);
        shared.finish();
        assert!(shared.is_idle());
    }
}
