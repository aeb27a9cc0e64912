//! The NDS value library: attachments describing CSAPs, templates and patterns.
//!
//! Commands carry their bulky arguments as a textual attachment. The text is a JSON object with a
//! single key naming its type, for example
//!
//! ```text
//! {"traffic-template": {
//!     "pdus": [{"eth": {"dst-addr": {"bytes": "00:11:22:33:44:55"}, "eth-type": 2048}}],
//!     "payload": {"bytes": "68:65:6c:6c:6f"}
//! }}
//! ```
//!
//! The engine consumes this module only through [`parse_text`] and [`read_field`] plus the typed
//! values they produce.
//!
//! [`parse_text`]: fn.parse_text.html
//! [`read_field`]: fn.read_field.html
use core::{convert::TryFrom, fmt};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::args::{Arg, ArgSpec};
use crate::csap::CsapId;
use crate::du::DataUnit;
use crate::error::{Error, Result};
use crate::wire::Octets;

/// The types of attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NdsKind {
    CsapSpec,
    Template,
    Pattern,
    /// A received packet, as reported to the caller.
    Packet,
}

/// A parsed attachment.
#[derive(Debug, Clone, PartialEq)]
pub enum Nds {
    CsapSpec(CsapSpec),
    Template(Template),
    Pattern(Pattern),
    Packet(Packet),
}

impl NdsKind {
    /// The key naming this type in the text form.
    pub fn name(self) -> &'static str {
        match self {
            NdsKind::CsapSpec => "csap-spec",
            NdsKind::Template => "traffic-template",
            NdsKind::Pattern => "traffic-pattern",
            NdsKind::Packet => "raw-packet",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        [NdsKind::CsapSpec, NdsKind::Template, NdsKind::Pattern, NdsKind::Packet]
            .iter()
            .copied()
            .find(|kind| kind.name() == name)
    }
}

/// Parse an attachment, which must be of the given type.
///
/// Text that is not a valid attachment at all is `BadNds`, a valid attachment of another type is
/// `WrongNdsType`.
pub fn parse_text(kind: NdsKind, text: &str) -> Result<Nds> {
    let value: Value = serde_json::from_str(text)?;
    let mut object = match value {
        Value::Object(object) if object.len() == 1 => object,
        _ => return Err(Error::BadNds("expected an object with a single type key".into())),
    };

    let found = object.keys()
        .next()
        .and_then(|key| NdsKind::from_name(key))
        .ok_or_else(|| Error::BadNds("unknown NDS type".into()))?;
    if found != kind {
        return Err(Error::WrongNdsType { expected: kind.name() });
    }

    let inner = object.remove(kind.name()).unwrap_or(Value::Null);
    Ok(match kind {
        NdsKind::CsapSpec => Nds::CsapSpec(CsapSpec::from_value(&inner)?),
        NdsKind::Template => Nds::Template(serde_json::from_value(inner)?),
        NdsKind::Pattern => Nds::Pattern(serde_json::from_value(inner)?),
        NdsKind::Packet => Nds::Packet(serde_json::from_value(inner)?),
    })
}

/// Look up a value by a dot separated path.
///
/// Numeric path components index into arrays, all others name object members. The empty path is
/// the value itself.
pub fn read_field<'v>(value: &'v Value, path: &str) -> Result<&'v Value> {
    if path.is_empty() {
        return Ok(value);
    }

    path.split('.').try_fold(value, |current, label| {
        let next = match current {
            Value::Object(map) => map.get(label),
            Value::Array(list) => label.parse::<usize>().ok().and_then(|idx| list.get(idx)),
            _ => None,
        };
        next.ok_or_else(|| Error::BadNds(format!("no field '{}' in path '{}'", label, path)))
    })
}

/// Read an integer by path.
pub fn read_int(value: &Value, path: &str) -> Result<i64> {
    read_field(value, path)?
        .as_i64()
        .ok_or_else(|| Error::BadNds(format!("field '{}' is not an integer", path)))
}

/// Read a string by path.
pub fn read_str<'v>(value: &'v Value, path: &str) -> Result<&'v str> {
    read_field(value, path)?
        .as_str()
        .ok_or_else(|| Error::BadNds(format!("field '{}' is not a string", path)))
}

impl Nds {
    /// The type of this attachment.
    pub fn kind(&self) -> NdsKind {
        match self {
            Nds::CsapSpec(_) => NdsKind::CsapSpec,
            Nds::Template(_) => NdsKind::Template,
            Nds::Pattern(_) => NdsKind::Pattern,
            Nds::Packet(_) => NdsKind::Packet,
        }
    }

    /// Render the text form, which `parse_text` accepts.
    pub fn to_text(&self) -> String {
        let inner = match self {
            Nds::CsapSpec(spec) => serde_json::to_value(spec),
            Nds::Template(template) => serde_json::to_value(template),
            Nds::Pattern(pattern) => serde_json::to_value(pattern),
            Nds::Packet(packet) => serde_json::to_value(packet),
        };
        let mut object = Map::new();
        object.insert(self.kind().name().to_owned(), inner.unwrap_or(Value::Null));
        Value::Object(object).to_string()
    }
}

/// The description of one layer: a protocol tag and labelled data units.
///
/// Used for template and pattern headers, for the parsed headers of received packets, and for
/// the per-layer parameters of a CSAP.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Pdu {
    tag: String,
    fields: BTreeMap<String, DataUnit>,
}

impl Pdu {
    /// An empty PDU of some protocol.
    pub fn new(tag: impl Into<String>) -> Self {
        Pdu {
            tag: tag.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder style setter.
    pub fn with(mut self, label: &str, unit: DataUnit) -> Self {
        self.set(label, unit);
        self
    }

    /// The protocol tag.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Look up a field.
    pub fn get(&self, label: &str) -> Option<&DataUnit> {
        self.fields.get(label)
    }

    /// Set or replace a field.
    pub fn set(&mut self, label: &str, unit: DataUnit) {
        self.fields.insert(label.to_owned(), unit);
    }

    /// Remove a field.
    pub fn remove(&mut self, label: &str) -> Option<DataUnit> {
        self.fields.remove(label)
    }

    /// Whether some field is set.
    pub fn contains(&self, label: &str) -> bool {
        self.fields.contains_key(label)
    }

    /// All fields, ordered by label.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &DataUnit)> {
        self.fields.iter().map(|(label, unit)| (label.as_str(), unit))
    }

    /// Whether no field is set.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Resolve an integer field, `None` if unset or undefined.
    pub fn read_int(&self, label: &str, args: &[Arg]) -> Result<Option<i64>> {
        match self.get(label) {
            Some(unit) => unit.to_int(args),
            None => Ok(None),
        }
    }

    /// Resolve an octet field, `None` if unset or undefined.
    ///
    /// A string is accepted in place of octets when it is in colon separated hex notation.
    pub fn read_octets(&self, label: &str, len: Option<usize>) -> Result<Option<Vec<u8>>> {
        match self.get(label) {
            Some(DataUnit::String(text)) => match text.parse::<Octets>() {
                Ok(octets) => DataUnit::Bytes(octets.0).to_octets(&[], len),
                Err(_) => DataUnit::String(text.clone()).to_octets(&[], len),
            },
            Some(unit) => unit.to_octets(&[], len),
            None => Ok(None),
        }
    }

    /// Resolve a string field.
    pub fn read_str(&self, label: &str) -> Result<Option<&str>> {
        match self.get(label) {
            Some(DataUnit::String(text)) => Ok(Some(text.as_str())),
            Some(other) => Err(Error::BadNds(format!("field '{}' is {}, not a string", label, other))),
            None => Ok(None),
        }
    }
}

impl TryFrom<Value> for Pdu {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        let object = match value {
            Value::Object(object) if object.len() == 1 => object,
            _ => return Err(Error::BadNds("a PDU is an object with its tag as single key".into())),
        };

        let (tag, inner) = object.into_iter()
            .next()
            .ok_or_else(|| Error::BadNds("empty PDU".into()))?;
        let fields = match inner {
            Value::Object(fields) => fields,
            Value::Null => Map::new(),
            _ => return Err(Error::BadNds(format!("fields of PDU '{}' are not an object", tag))),
        };

        let mut pdu = Pdu::new(tag);
        for (label, unit) in fields {
            let unit = DataUnit::try_from(unit)?;
            pdu.fields.insert(label, unit);
        }
        Ok(pdu)
    }
}

impl From<Pdu> for Value {
    fn from(pdu: Pdu) -> Value {
        let fields = pdu.fields.into_iter()
            .map(|(label, unit)| (label, Value::from(unit)))
            .collect::<Map<_, _>>();
        let mut object = Map::new();
        object.insert(pdu.tag, Value::Object(fields));
        Value::Object(object)
    }
}

impl fmt::Display for Pdu {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", Value::from(self.clone()))
    }
}

/// The parameters of a CSAP, one PDU per layer, top down.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CsapSpec {
    pub layers: Vec<Pdu>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receive_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_latency_timeout_ms: Option<u64>,
}

impl CsapSpec {
    /// Extract from the inner value of an attachment.
    pub fn from_value(value: &Value) -> Result<Self> {
        let layers = match read_field(value, "layers")? {
            Value::Array(layers) => layers.iter()
                .cloned()
                .map(Pdu::try_from)
                .collect::<Result<Vec<_>>>()?,
            _ => return Err(Error::BadNds("layers of a CSAP spec must be a list".into())),
        };

        let optional_ms = |path: &str| -> Result<Option<u64>> {
            match read_field(value, path) {
                Ok(_) => {
                    let ms = read_int(value, path)?;
                    u64::try_from(ms)
                        .map(Some)
                        .map_err(|_| Error::BadNds(format!("negative {}", path)))
                },
                Err(_) => Ok(None),
            }
        };

        Ok(CsapSpec {
            layers,
            receive_timeout_ms: optional_ms("receive-timeout-ms")?,
            stop_latency_timeout_ms: optional_ms("stop-latency-timeout-ms")?,
        })
    }

    /// The parameters of the layer with some tag, or an empty set.
    pub fn layer(&self, index: usize, tag: &str) -> Pdu {
        match self.layers.get(index) {
            Some(pdu) if pdu.tag() == tag => pdu.clone(),
            _ => Pdu::new(tag),
        }
    }
}

/// What to send.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Template {
    /// One PDU per layer, top down.
    pub pdus: Vec<Pdu>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arg_sets: Vec<ArgSpec>,
    /// Spacing between iterations, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delays: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
}

/// The payload of a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Payload {
    /// Literal octets.
    Bytes(Octets),
    /// This many filler octets.
    Length(usize),
    /// A registered function which fills in the payload.
    Function(String),
}

/// The filler octet of `Payload::Length`.
pub const PAYLOAD_FILLER: u8 = 0x5a;

/// What to accept: a frame matches if any unit matches.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pattern(pub Vec<PatternUnit>);

/// One alternative of a pattern.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct PatternUnit {
    /// One PDU per layer, top down. Missing layers accept anything.
    #[serde(default)]
    pub pdus: Vec<Pdu>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<PayloadPattern>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,
}

/// A condition on the payload left after the top layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PayloadPattern {
    /// Compare the leading octets under a mask.
    Mask {
        m: Octets,
        v: Octets,
        /// Require the payload to be exactly as long as the mask.
        #[serde(default, rename = "exact-len")]
        exact_len: bool,
    },
    /// Require the payload to start with these octets.
    Bytes(Octets),
}

/// What to do with a matched packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    /// Send the frame back through the CSAP.
    Echo,
    /// Finish the receive operation after this packet.
    Break,
    /// Count the packet but do not report it.
    NoReport,
    /// Write the payload through another CSAP.
    ForwardPayload(CsapId),
    /// Call a registered function, `name` or `name:opaque`.
    Function(String),
}

impl PayloadPattern {
    /// Check the trailing payload of a frame.
    pub fn matches(&self, payload: &[u8]) -> Result<()> {
        let hit = match self {
            PayloadPattern::Mask { m, v, exact_len } => {
                if m.0.len() != v.0.len() {
                    return Err(Error::BadNds("payload mask and value lengths differ".into()));
                }
                let long_enough = if *exact_len {
                    payload.len() == m.0.len()
                } else {
                    payload.len() >= m.0.len()
                };
                let empty_ok = m.0.is_empty() && payload.is_empty();
                empty_ok || (long_enough && payload.iter()
                    .zip(m.0.iter().zip(&v.0))
                    .all(|(input, (mask, value))| input & mask == value & mask))
            },
            PayloadPattern::Bytes(prefix) => payload.starts_with(&prefix.0),
        };

        if hit {
            Ok(())
        } else {
            Err(Error::MatchNotFound)
        }
    }
}

impl PatternUnit {
    /// Whether any action of the unit echoes the frame.
    pub fn echoes(&self) -> bool {
        self.actions.contains(&Action::Echo)
    }
}

impl Pattern {
    /// Whether any unit echoes frames.
    pub fn echoes(&self) -> bool {
        self.0.iter().any(PatternUnit::echoes)
    }
}

/// A wall clock time, as reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Timestamp {
    pub sec: u64,
    pub usec: u32,
}

impl Timestamp {
    /// The current time.
    pub fn now() -> Self {
        SystemTime::now().into()
    }
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Self {
        let since = time.duration_since(UNIX_EPOCH).unwrap_or_default();
        Timestamp {
            sec: since.as_secs(),
            usec: since.subsec_micros(),
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.sec, self.usec)
    }
}

/// A received packet, one parsed PDU per layer plus the remaining payload.
///
/// A packet that matched no unit has neither PDUs nor a unit index, its payload is the whole
/// frame. The payload is left out when the operation reports packets without payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub received: Timestamp,
    #[serde(rename = "match-unit", default, skip_serializing_if = "Option::is_none")]
    pub match_unit: Option<usize>,
    pub pdus: Vec<Pdu>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Octets>,
}

impl Packet {
    /// A frame that matched no unit, received now.
    pub fn unmatched(frame: Vec<u8>) -> Self {
        Packet {
            received: Timestamp::now(),
            match_unit: None,
            pdus: Vec::new(),
            payload: Some(Octets(frame)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TEMPLATE: &str = r#"{"traffic-template": {
        "pdus": [{"eth": {"dst-addr": {"bytes": "00:11:22:33:44:55"}, "eth-type": 2048}}],
        "arg-sets": [{"simple-for": {"end": 3}}],
        "delays": 10,
        "payload": {"length": 4}
    }}"#;

    #[test]
    fn template_text() {
        let template = match parse_text(NdsKind::Template, TEMPLATE).unwrap() {
            Nds::Template(template) => template,
            other => panic!("parsed as {:?}", other),
        };
        assert_eq!(template.pdus.len(), 1);
        assert_eq!(template.pdus[0].tag(), "eth");
        assert_eq!(template.pdus[0].read_int("eth-type", &[]), Ok(Some(0x800)));
        assert_eq!(template.pdus[0].read_octets("dst-addr", Some(6)),
                   Ok(Some(vec![0, 0x11, 0x22, 0x33, 0x44, 0x55])));
        assert_eq!(template.arg_sets, vec![ArgSpec::simple_for(1, 1, 3)]);
        assert_eq!(template.delays, Some(10));
        assert_eq!(template.payload, Some(Payload::Length(4)));

        let text = Nds::Template(template.clone()).to_text();
        assert_eq!(parse_text(NdsKind::Template, &text), Ok(Nds::Template(template)));
    }

    #[test]
    fn wrong_and_bad() {
        assert_eq!(parse_text(NdsKind::Pattern, TEMPLATE),
                   Err(Error::WrongNdsType { expected: "traffic-pattern" }));
        assert!(matches!(parse_text(NdsKind::Template, "{"), Err(Error::BadNds(_))));
        assert!(matches!(parse_text(NdsKind::Template, r#"{"nonsense": 1}"#), Err(Error::BadNds(_))));
        assert!(matches!(parse_text(NdsKind::Template,
            r#"{"traffic-template": {"pdus": [], "bogus": 1}}"#), Err(Error::BadNds(_))));
    }

    #[test]
    fn pattern_text() {
        let text = r#"{"traffic-pattern": [
            {"pdus": [{"eth": {"dst-addr": {"mask": {"m": "ff:ff:ff:00:00:00", "v": "01:02:03:00:00:00"}}}}],
             "payload": {"mask": {"m": "ff", "v": "aa"}},
             "actions": ["echo", {"forward-payload": 7}, "no-report"]},
            {}
        ]}"#;
        let pattern = match parse_text(NdsKind::Pattern, text).unwrap() {
            Nds::Pattern(pattern) => pattern,
            other => panic!("parsed as {:?}", other),
        };
        assert_eq!(pattern.0.len(), 2);
        assert!(pattern.echoes());
        assert_eq!(pattern.0[0].actions[1], Action::ForwardPayload(7));
        assert!(pattern.0[1].pdus.is_empty());
        match &pattern.0[0].payload {
            Some(PayloadPattern::Mask { exact_len, .. }) => assert!(!exact_len),
            other => panic!("payload {:?}", other),
        }
    }

    #[test]
    fn payload_patterns() {
        let mask = PayloadPattern::Mask { m: Octets(vec![0xff]), v: Octets(vec![0xaa]), exact_len: false };
        assert!(mask.matches(&[0xaa, 0x00, 0x01]).is_ok());
        assert_eq!(mask.matches(&[0xab]), Err(Error::MatchNotFound));
        assert_eq!(mask.matches(&[]), Err(Error::MatchNotFound));

        let exact = PayloadPattern::Mask { m: Octets(vec![0xf0]), v: Octets(vec![0xa0]), exact_len: true };
        assert!(exact.matches(&[0xa5]).is_ok());
        assert_eq!(exact.matches(&[0xa5, 0x00]), Err(Error::MatchNotFound));

        let empty = PayloadPattern::Mask { m: Octets(vec![]), v: Octets(vec![]), exact_len: true };
        assert!(empty.matches(&[]).is_ok());

        let prefix = PayloadPattern::Bytes(Octets(b"he".to_vec()));
        assert!(prefix.matches(b"hello").is_ok());
        assert_eq!(prefix.matches(b"h"), Err(Error::MatchNotFound));
    }

    #[test]
    fn csap_spec() {
        let text = r#"{"csap-spec": {
            "layers": [{"eth": {"interface": "hub:a", "local-addr": {"bytes": "02:00:00:00:00:01"}}}],
            "receive-timeout-ms": 20
        }}"#;
        let spec = match parse_text(NdsKind::CsapSpec, text).unwrap() {
            Nds::CsapSpec(spec) => spec,
            other => panic!("parsed as {:?}", other),
        };
        assert_eq!(spec.receive_timeout_ms, Some(20));
        assert_eq!(spec.stop_latency_timeout_ms, None);
        assert_eq!(spec.layer(0, "eth").read_str("interface"), Ok(Some("hub:a")));
        assert!(spec.layer(0, "arp").is_empty());
        assert!(spec.layer(3, "eth").is_empty());
    }

    #[test]
    fn field_paths() {
        let value = json!({"a": [{"b": 5}, {"c": "x"}]});
        assert_eq!(read_int(&value, "a.0.b"), Ok(5));
        assert_eq!(read_str(&value, "a.1.c"), Ok("x"));
        assert_eq!(read_field(&value, ""), Ok(&value));
        assert!(read_field(&value, "a.2").is_err());
        assert!(read_int(&value, "a.1.c").is_err());
    }

    #[test]
    fn packet_text() {
        let text = r#"{"raw-packet": {"received": {"sec": 3, "usec": 4}, "pdus": [], "payload": "aa:bb"}}"#;
        let packet = match parse_text(NdsKind::Packet, text).unwrap() {
            Nds::Packet(packet) => packet,
            other => panic!("parsed as {:?}", other),
        };
        assert_eq!(packet.match_unit, None);
        assert_eq!(packet.payload, Some(Octets(vec![0xaa, 0xbb])));

        let bare = Packet { match_unit: Some(1), payload: None, ..packet };
        let text = Nds::Packet(bare.clone()).to_text();
        assert!(text.contains(r#""match-unit":1"#), "{}", text);
        assert!(!text.contains("payload"), "{}", text);
        assert_eq!(parse_text(NdsKind::Packet, &text), Ok(Nds::Packet(bare)));
    }

    #[test]
    fn timestamps() {
        let stamp = Timestamp { sec: 12, usec: 5 };
        assert_eq!(stamp.to_string(), "12.5");
        assert_eq!(Timestamp::default().to_string(), "0.0");
    }
}
