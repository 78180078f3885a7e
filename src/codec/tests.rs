use bytes::BytesMut;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::{json, Value};
use test_case::test_case;

use super::*;
use crate::protocol::*;

fn to_bytes(value: Value) -> Vec<u8> {
    serde_json::to_vec(&value).unwrap()
}

fn encode(packet: &Packet) -> Value {
    let json = Encoder::new().encode_json(packet).unwrap();
    serde_json::from_str(&json).unwrap()
}

#[test]
fn test_decoder_splits_multiple_frames_in_one_read() {
    let mut decoder = Decoder::new();
    decoder.extend(b"{\"hb\":{}}\0{\"disconn\":{}}\0");

    assert_eq!(decoder.next_frame().unwrap().unwrap().as_ref(), b"{\"hb\":{}}");
    assert_eq!(decoder.next_frame().unwrap().unwrap().as_ref(), b"{\"disconn\":{}}");
    assert_eq!(decoder.next_frame().unwrap(), None);
    assert_eq!(decoder.buffered(), 0);
}

#[test]
fn test_decoder_waits_for_terminator() {
    let mut decoder = Decoder::new();
    decoder.extend(b"{\"sub\":{\"cn\":");
    assert_eq!(decoder.next_frame().unwrap(), None);

    decoder.extend(b"\"news\"}}");
    assert_eq!(decoder.next_frame().unwrap(), None);

    decoder.extend(b"\0{\"hb\"");
    let packet = decode(&decoder.next_frame().unwrap().unwrap()).unwrap();
    assert_eq!(
        packet,
        Packet::Subscribe(Subscribe {
            channel: "news".into(),
            persistent: false,
        })
    );
    assert_eq!(decoder.next_frame().unwrap(), None);
    assert_eq!(decoder.buffered(), 5);
}

#[test]
fn test_decoder_frame_fed_byte_by_byte() {
    let body = format!("{{\"pub\":{{\"cn\":\"bulk\",\"dt\":\"{}\"}}}}", "x".repeat(2000));
    let mut decoder = Decoder::new().with_max_frame_size(body.len());

    for byte in body.as_bytes() {
        decoder.extend(&[*byte]);
        assert_eq!(decoder.next_frame().unwrap(), None);
    }
    decoder.extend(b"\0{\"hb\":{}}\0");

    assert_eq!(decoder.next_frame().unwrap().unwrap().as_ref(), body.as_bytes());
    assert_eq!(decoder.next_frame().unwrap().unwrap().as_ref(), b"{\"hb\":{}}");
    assert_eq!(decoder.buffered(), 0);

    // One byte past the limit without a terminator is fatal
    for byte in body.as_bytes() {
        decoder.extend(&[*byte]);
    }
    assert_eq!(decoder.next_frame().unwrap(), None);
    decoder.extend(b"x");
    assert_eq!(
        decoder.next_frame(),
        Err(DecodeError::FrameTooLarge {
            size: body.len() + 1,
            max: body.len(),
        })
    );
}

#[test]
fn test_decoder_skips_empty_frames() {
    let mut decoder = Decoder::new();
    decoder.extend(b"\0\0 \n\0{\"hb\":{}}\0");

    let frame = decoder.next_frame().unwrap().unwrap();
    assert_eq!(decode(&frame).unwrap(), Packet::Heartbeat);
    assert_eq!(decoder.next_frame().unwrap(), None);
}

#[test]
fn test_decoder_rejects_oversized_frame() {
    let mut decoder = Decoder::new().with_max_frame_size(16);
    decoder.extend(&[b'a'; 17]);

    assert_eq!(
        decoder.next_frame(),
        Err(DecodeError::FrameTooLarge { size: 17, max: 16 })
    );
}

#[test]
fn test_decoder_next_packet_keeps_stream_on_bad_frame() {
    let mut decoder = Decoder::new();
    decoder.extend(b"not json\0{\"hb\":{}}\0");

    let first = decoder.next_packet().unwrap().unwrap();
    assert!(matches!(first, Err(DecodeError::InvalidJson(_))));

    let second = decoder.next_packet().unwrap().unwrap();
    assert_eq!(second, Ok(Packet::Heartbeat));
}

#[test_case(b"\xff\xfe" ; "invalid utf8")]
#[test_case(b"{\"hb\":" ; "truncated json")]
#[test_case(b"[1,2,3]" ; "array root")]
#[test_case(b"{}" ; "no root key")]
#[test_case(b"{\"hb\":{},\"hbAck\":{}}" ; "two root keys")]
#[test_case(b"{\"bogus\":{}}" ; "unknown packet type")]
#[test_case(b"{\"pub\":{\"cn\":\"a\",\"q\":2}}" ; "qos out of range")]
#[test_case(b"{\"pub\":{\"cn\":\"a\",\"q\":-1}}" ; "negative qos")]
#[test_case(b"{\"sub\":\"news\"}" ; "body not an object")]
#[test_case(b"{\"sub\":{\"cn\":[\"news\"]}}" ; "channel not a string")]
fn test_malformed_frames_are_rejected(input: &[u8]) {
    let err = decode(input).unwrap_err();
    assert!(err.is_malformed_packet(), "{}", err);
}

#[test]
fn test_decode_error_messages() {
    assert_eq!(
        decode(b"{\"hb\":{},\"hbAck\":{}}").unwrap_err(),
        DecodeError::RootKeyCount(2)
    );
    assert_eq!(
        decode(b"{\"pub\":{\"cn\":\"a\",\"q\":2}}").unwrap_err(),
        DecodeError::InvalidQoS(2)
    );
    assert_eq!(
        decode(b"{\"nope\":{}}").unwrap_err(),
        DecodeError::UnknownPacketType("nope".into())
    );
}

#[test]
fn test_decode_accepts_numeric_ids_and_flags() {
    let packet = decode(&to_bytes(json!({
        "pub": {"cn": "news", "dt": {"a": 1}, "id": 42, "q": 1, "rt": true}
    })))
    .unwrap();

    assert_eq!(
        packet,
        Packet::Publish(Publish {
            channel: "news".into(),
            data: json!({"a": 1}),
            packet_id: Some("42".into()),
            qos: QoS::AtLeastOnce,
            retain: true,
        })
    );

    let packet = decode(br#"{"conn":{"at":"token","cl":7}}"#).unwrap();
    assert_eq!(
        packet,
        Packet::Conn(Conn {
            token: "token".into(),
            client_id: "7".into(),
        })
    );

    let packet = decode(br#"{"sub":{"cn":"a","pr":1}}"#).unwrap();
    assert_eq!(
        packet,
        Packet::Subscribe(Subscribe {
            channel: "a".into(),
            persistent: true,
        })
    );
}

#[test]
fn test_decode_defaults_for_missing_fields() {
    assert_eq!(
        decode(br#"{"pub":{}}"#).unwrap(),
        Packet::Publish(Publish {
            channel: String::new(),
            data: Value::Null,
            packet_id: None,
            qos: QoS::AtMostOnce,
            retain: false,
        })
    );
    assert_eq!(
        decode(br#"{"auth":{}}"#).unwrap(),
        Packet::Auth(Auth { data: Value::Null })
    );
    assert_eq!(decode(br#"{"hb":null}"#).unwrap(), Packet::Heartbeat);
    assert_eq!(decode(br#"{"disconn":{}}"#).unwrap(), Packet::Disconnect);
}

#[test]
fn test_recognized_packets_survive_encoding() {
    let packets = vec![
        Packet::Auth(Auth {
            data: json!({"client_name": "sensor"}),
        }),
        Packet::AuthAck(AuthAck {
            status: StatusCode::Ok,
            client_id: "c1".into(),
            token: "t1".into(),
            message: String::new(),
        }),
        Packet::AuthAck(AuthAck {
            status: StatusCode::InvalidPacket,
            client_id: String::new(),
            token: String::new(),
            message: "client_name is missing".into(),
        }),
        Packet::Conn(Conn {
            token: "t1".into(),
            client_id: "c1".into(),
        }),
        Packet::ConnAck(ConnAck {
            status: StatusCode::Ok,
            timeout: 30,
        }),
        Packet::Publish(Publish {
            channel: "news".into(),
            data: json!("hello"),
            packet_id: Some("p1".into()),
            qos: QoS::AtLeastOnce,
            retain: true,
        }),
        Packet::PubAck(PubAck {
            status: StatusCode::ClientOffline,
            packet_id: "p1".into(),
            data: None,
        }),
        Packet::Push(Push {
            channel: "news".into(),
            data: json!([1, 2]),
            sender: "c2".into(),
            packet_id: Some("m1".into()),
            qos: QoS::AtLeastOnce,
            retain: false,
        }),
        Packet::PushAck(PushAck {
            packet_id: "m1".into(),
        }),
        Packet::Subscribe(Subscribe {
            channel: "news".into(),
            persistent: true,
        }),
        Packet::SubAck(SubAck {
            status: StatusCode::NotAllowed,
            channel: "news".into(),
        }),
        Packet::Unsubscribe(Unsubscribe {
            channel: "news".into(),
        }),
        Packet::UnsubAck(UnsubAck {
            status: StatusCode::Ok,
            channel: "news".into(),
        }),
        Packet::Heartbeat,
        Packet::HeartbeatAck,
        Packet::Disconnect,
    ];

    for packet in packets {
        let mut buf = BytesMut::new();
        Encoder::new().encode(&packet, &mut buf).unwrap();
        assert_eq!(buf.last(), Some(&FRAME_DELIMITER));

        let mut decoder = Decoder::new();
        decoder.extend(&buf);
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(decode(&frame).unwrap(), packet);
    }
}

#[test]
fn test_encode_wire_shapes() {
    assert_eq!(
        encode(&Packet::SubAck(SubAck {
            status: StatusCode::Ok,
            channel: " news ".into(),
        })),
        json!({"subAck": {"st": 1, "cn": "news"}})
    );
    assert_eq!(
        encode(&Packet::ConnAck(ConnAck {
            status: StatusCode::Ok,
            timeout: 30,
        })),
        json!({"connAck": {"st": 1, "ts": 30}})
    );
    assert_eq!(
        encode(&Packet::Push(Push {
            channel: "news".into(),
            data: json!("x"),
            sender: String::new(),
            packet_id: None,
            qos: QoS::AtMostOnce,
            retain: true,
        })),
        json!({"push": {"cn": "news", "dt": "x", "cl": "", "rt": 1}})
    );
    assert_eq!(
        encode(&Packet::PubAck(PubAck {
            status: StatusCode::Ok,
            packet_id: "p9".into(),
            data: Some(json!({"channels": ["a"]})),
        })),
        json!({"pubAck": {"st": 1, "id": "p9", "dt": {"channels": ["a"]}}})
    );
    assert_eq!(encode(&Packet::HeartbeatAck), json!({"hbAck": {}}));
}

#[test_case(Packet::SubAck(SubAck { status: StatusCode::Ok, channel: "  ".into() }), "channel name")]
#[test_case(Packet::PushAck(PushAck { packet_id: String::new() }), "packet id")]
#[test_case(Packet::Conn(Conn { token: String::new(), client_id: "c".into() }), "auth token")]
#[test_case(Packet::AuthAck(AuthAck { status: StatusCode::Failed, client_id: String::new(), token: String::new(), message: String::new() }), "message")]
#[test_case(Packet::AuthAck(AuthAck { status: StatusCode::Ok, client_id: String::new(), token: "t".into(), message: String::new() }), "client id")]
#[test_case(Packet::Push(Push { channel: "a".into(), data: Value::Null, sender: String::new(), packet_id: None, qos: QoS::AtLeastOnce, retain: false }), "packet id")]
fn test_encode_rejects_blank_required_fields(packet: Packet, field: &'static str) {
    assert_eq!(
        Encoder::new().encode_json(&packet),
        Err(EncodeError::EmptyField(field))
    );
}

proptest! {
    #[test]
    fn prop_chunked_stream_yields_same_frames(
        channels in prop::collection::vec("[a-z]{1,12}", 1..8),
        cuts in prop::collection::vec(1usize..16, 1..32),
    ) {
        let encoder = Encoder::new();
        let mut stream = BytesMut::new();
        let expected: Vec<Packet> = channels
            .iter()
            .map(|channel| Packet::Subscribe(Subscribe { channel: channel.clone(), persistent: false }))
            .collect();
        for packet in &expected {
            encoder.encode(packet, &mut stream).unwrap();
        }

        let mut decoder = Decoder::new();
        let mut decoded = Vec::new();
        let mut rest = &stream[..];
        let mut cut = cuts.iter().cycle();
        while !rest.is_empty() {
            let n = (*cut.next().unwrap()).min(rest.len());
            decoder.extend(&rest[..n]);
            rest = &rest[n..];
            while let Some(frame) = decoder.next_frame().unwrap() {
                decoded.push(decode(&frame).unwrap());
            }
        }

        prop_assert_eq!(decoded, expected);
        prop_assert_eq!(decoder.buffered(), 0);
    }
}
