use std::sync::Arc;
use std::time::Duration;

use crate::bps::Direction;
use crate::ch::{ChannelReply, Config, Request, Tad};
use crate::csap::Csap;
use crate::du::{DataUnit, Interval};
use crate::error::Error;
use crate::layer::arp;
use crate::nds::Pdu;

const DST: [u8; 6] = [0x00, 0x11, 0x22, 0x33, 0x44, 0x55];
const LOCAL: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x0a];

fn eth_spec(hub: &str, extra: &str) -> String {
    format!(
        r#"{{"csap-spec": {{"layers": [{{"eth": {{"interface": "hub:{}", "local-addr": {{"bytes": "02:00:00:00:00:0a"}}{}}}}}]}}}}"#,
        hub, extra)
}

fn create(tad: &Tad, stack: &str, spec: &str) -> Arc<Csap> {
    let (reply, answers) = ChannelReply::new();
    tad.handle(Request::new("1", "csap_create", &[stack]).with_attachment(spec), reply);
    let answer = answers.recv().unwrap();
    assert_eq!(answer.rc, None, "{}", answer);
    tad.find(answer.values[0].parse().unwrap()).unwrap()
}

fn eth_template() -> Pdu {
    Pdu::new("eth")
        .with("dst-addr", DataUnit::bytes(DST.to_vec()))
        .with("eth-type", DataUnit::int(0x0800))
}

#[test]
fn untagged_frame() {
    let tad = Tad::new(Config::default());
    let csap = create(&tad, "eth", &eth_spec("untagged", ""));
    let (eth, ctx) = (&csap.layer(0).layer, csap.ctx(0));

    let mut pdu = eth_template();
    eth.confirm(&ctx, &mut pdu, Direction::Send).unwrap();
    assert_eq!(pdu.get("src-addr"), Some(&DataUnit::bytes(LOCAL.to_vec())));

    let frames = eth.generate(&ctx, &pdu, &[], vec![b"hello".to_vec()]).unwrap();
    assert_eq!(frames.len(), 1);
    let frame = &frames[0];
    assert_eq!(frame.len(), 60);
    assert_eq!(frame[..6], DST);
    assert_eq!(frame[6..12], LOCAL);
    assert_eq!(frame[12..14], [0x08, 0x00]);
    assert_eq!(&frame[14..19], b"hello");
    assert!(frame[19..].iter().all(|&octet| octet == 0));
}

#[test]
fn no_padding() {
    let tad = Tad::new(Config::default());
    let csap = create(&tad, "eth", &eth_spec("unpadded", r#", "padding": 0"#));
    let (eth, ctx) = (&csap.layer(0).layer, csap.ctx(0));

    let mut pdu = eth_template();
    eth.confirm(&ctx, &mut pdu, Direction::Send).unwrap();
    let frames = eth.generate(&ctx, &pdu, &[], vec![b"hello".to_vec()]).unwrap();
    assert_eq!(frames[0].len(), 19);
}

#[test]
fn source_from_medium() {
    let tad = Tad::new(Config::default());
    let spec = r#"{"csap-spec": {"layers": [{"eth": {"interface": "hub:hwaddr"}}]}}"#;
    let csap = create(&tad, "eth", spec);
    let (eth, ctx) = (&csap.layer(0).layer, csap.ctx(0));

    let hw = csap.media().hardware_addr().unwrap();
    let mut pdu = eth_template();
    eth.confirm(&ctx, &mut pdu, Direction::Send).unwrap();
    assert_eq!(pdu.get("src-addr"), Some(&DataUnit::bytes(hw.to_vec())));
    assert_eq!(eth.get_param(&ctx, "interface").as_deref(), Some("hub:hwaddr"));
}

#[test]
fn vlan_tagged_frame() {
    let tad = Tad::new(Config::default());
    let csap = create(&tad, "eth", &eth_spec("tagged", ""));
    let (eth, ctx) = (&csap.layer(0).layer, csap.ctx(0));

    let mut pdu = eth_template()
        .with("vlan-id", DataUnit::int(100))
        .with("priority", DataUnit::int(3));
    eth.confirm(&ctx, &mut pdu, Direction::Send).unwrap();
    assert_eq!(pdu.get("cfi"), Some(&DataUnit::int(0)));

    let frames = eth.generate(&ctx, &pdu, &[], vec![b"x".to_vec()]).unwrap();
    let frame = &frames[0];
    assert_eq!(frame[12..14], [0x81, 0x00]);
    // priority 3, cfi 0, vlan 100
    assert_eq!(frame[14..16], [0x60, 0x64]);
    assert_eq!(frame[16..18], [0x08, 0x00]);
    assert_eq!(frame[18], b'x');

    // The tag is parsed back.
    let mut pattern = Pdu::new("eth")
        .with("dst-addr", DataUnit::bytes(DST.to_vec()))
        .with("vlan-id", DataUnit::int(100));
    eth.confirm(&ctx, &mut pattern, Direction::Recv).unwrap();
    let matched = eth.match_frame(&ctx, &pattern, frame).unwrap();
    assert_eq!(matched.parsed.get("priority"), Some(&DataUnit::int(3)));
    assert_eq!(matched.payload[0], b'x');
}

#[test]
fn masked_destination() {
    let tad = Tad::new(Config::default());
    let spec = r#"{"csap-spec": {"layers": [{"eth": {"interface": "hub:mask"}}]}}"#;
    let csap = create(&tad, "eth", spec);
    let (eth, ctx) = (&csap.layer(0).layer, csap.ctx(0));

    let mut pattern = Pdu::new("eth").with("dst-addr", DataUnit::mask(
        vec![0xff, 0xff, 0xff, 0, 0, 0],
        vec![0x01, 0x02, 0x03, 0, 0, 0]).unwrap());
    eth.confirm(&ctx, &mut pattern, Direction::Recv).unwrap();

    let mut frame = vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0, 0, 0, 0, 0, 1, 0x08, 0x00, 0xaa];
    let matched = eth.match_frame(&ctx, &pattern, &frame).unwrap();
    assert_eq!(matched.parsed.get("dst-addr"), Some(&DataUnit::bytes(vec![1, 2, 3, 4, 5, 6])));
    assert_eq!(matched.parsed.get("eth-type"), Some(&DataUnit::int(0x0800)));
    assert_eq!(matched.payload, &[0xaa]);

    frame[2] = 0x04;
    assert_eq!(eth.match_frame(&ctx, &pattern, &frame), Err(Error::MatchNotFound));
    assert_eq!(eth.match_frame(&ctx, &pattern, &frame[..10]), Err(Error::MatchLessData));

    let tagged = Pdu::new("eth").with("vlan-id", DataUnit::int(7));
    frame[2] = 0x03;
    assert_eq!(eth.match_frame(&ctx, &tagged, &frame), Err(Error::MatchNotFound));
}

#[test]
fn interval_fields() {
    let tad = Tad::new(Config::default());
    let spec = r#"{"csap-spec": {"layers": [{"eth": {"interface": "hub:intervals"}}]}}"#;
    let csap = create(&tad, "eth", spec);
    let (eth, ctx) = (&csap.layer(0).layer, csap.ctx(0));

    let mut pattern = Pdu::new("eth")
        .with("eth-type", DataUnit::Intervals(vec![Interval { b: 0x0800, e: 0x0806 }]))
        .with("vlan-id", DataUnit::Intervals(vec![Interval { b: 90, e: 110 }]));
    eth.confirm(&ctx, &mut pattern, Direction::Recv).unwrap();

    let tagged = |tci: [u8; 2], ether_type: [u8; 2]| {
        let mut frame = DST.to_vec();
        frame.extend_from_slice(&LOCAL);
        frame.extend_from_slice(&[0x81, 0x00]);
        frame.extend_from_slice(&tci);
        frame.extend_from_slice(&ether_type);
        frame.push(0xee);
        frame
    };

    let frame = tagged([0x00, 0x64], [0x08, 0x06]);
    let matched = eth.match_frame(&ctx, &pattern, &frame).unwrap();
    assert_eq!(matched.parsed.get("vlan-id"), Some(&DataUnit::int(100)));
    assert_eq!(matched.parsed.get("eth-type"), Some(&DataUnit::int(0x0806)));
    assert_eq!(matched.payload, &[0xee]);

    // vlan 200
    assert_eq!(eth.match_frame(&ctx, &pattern, &tagged([0x00, 0xc8], [0x08, 0x00])), Err(Error::MatchNotFound));
    assert_eq!(eth.match_frame(&ctx, &pattern, &tagged([0x00, 0x64], [0x86, 0xdd])), Err(Error::MatchNotFound));
    // 0x0608 only matches when read in the wrong byte order.
    assert_eq!(eth.match_frame(&ctx, &pattern, &tagged([0x00, 0x64], [0x06, 0x08])), Err(Error::MatchNotFound));
}

#[test]
fn echo_swaps_addresses() {
    let tad = Tad::new(Config::default());
    let csap = create(&tad, "eth", &eth_spec("echo", ""));
    let (eth, ctx) = (&csap.layer(0).layer, csap.ctx(0));

    let mut frame = vec![0; 20];
    frame[..6].copy_from_slice(&DST);
    frame[6..12].copy_from_slice(&LOCAL);
    let echo = eth.echo(&ctx, &frame).unwrap();
    assert_eq!(echo[..6], LOCAL);
    assert_eq!(echo[6..12], DST);
    assert_eq!(echo[12..], frame[12..]);
}

#[test]
fn arp_request() {
    let tad = Tad::new(Config::default());
    let spec = r#"{"csap-spec": {"layers": [
        {"arp": {}},
        {"eth": {"interface": "hub:arp", "local-addr": {"bytes": "02:00:00:00:00:0a"}}}
    ]}}"#;
    let csap = create(&tad, "arp.eth", spec);
    let (arp, arp_ctx) = (&csap.layer(0).layer, csap.ctx(0));
    let (eth, eth_ctx) = (&csap.layer(1).layer, csap.ctx(1));

    let mut request = Pdu::new("arp")
        .with("opcode", DataUnit::int(arp::OP_REQUEST))
        .with("snd-hw-addr", DataUnit::bytes(LOCAL.to_vec()))
        .with("snd-proto-addr", DataUnit::bytes(vec![10, 0, 0, 1]))
        .with("tgt-proto-addr", DataUnit::bytes(vec![10, 0, 0, 2]));
    arp.confirm(&arp_ctx, &mut request, Direction::Send).unwrap();

    let mut header = Pdu::new("eth").with("dst-addr", DataUnit::bytes(vec![0xff; 6]));
    eth.confirm(&eth_ctx, &mut header, Direction::Send).unwrap();
    assert_eq!(header.get("eth-type"), Some(&DataUnit::int(0x0806)));

    let messages = arp.generate(&arp_ctx, &request, &[], vec![Vec::new()]).unwrap();
    assert_eq!(messages[0].len(), 28);
    assert_eq!(messages[0][..8], [0x00, 0x01, 0x08, 0x00, 6, 4, 0x00, 0x01]);
    assert_eq!(messages[0][18..24], [0; 6]);

    let frames = eth.generate(&eth_ctx, &header, &[], messages).unwrap();
    let frame = &frames[0];
    assert_eq!(frame.len(), 60);

    let pattern = arp.gen_pattern(&arp_ctx, &request).unwrap();
    assert_eq!(pattern.get("hw-type"), Some(&DataUnit::int(1)));
    assert!(pattern.get("opcode").is_none());
    let matched = arp.match_frame(&arp_ctx, &pattern, &frame[14..]).unwrap();
    assert_eq!(matched.parsed.get("tgt-proto-addr"), Some(&DataUnit::bytes(vec![10, 0, 0, 2])));
    assert_eq!(arp.match_frame(&arp_ctx, &pattern, &frame[14..30]), Err(Error::MatchLessData));
}

#[test]
fn unsupported_stacks() {
    let tad = Tad::new(Config::default());
    let (reply, answers) = ChannelReply::new();
    let rc = |stack: &str| {
        tad.handle(Request::new("1", "csap_create", &[stack]), reply.clone());
        answers.recv_timeout(Duration::from_secs(1)).unwrap().rc
    };
    assert_eq!(rc("eth.arp"), Some(crate::ErrorKind::StackNotSupported));
    assert_eq!(rc("ip4.eth"), Some(crate::ErrorKind::ProtoNotSupported));
    assert_eq!(rc("arp"), Some(crate::ErrorKind::StackNotSupported));
    // No interface parameter.
    assert_eq!(rc("eth"), Some(crate::ErrorKind::BadNds));
    assert!(tad.csaps().is_empty());
}
