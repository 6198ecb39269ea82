//! Tests for frame headers, envelopes and reply bodies.

use super::*;
use crate::errors::WireError;
use bytes::BytesMut;
use proptest::prelude::*;
use serde_json::json;

fn frame_for(op_code: OpCode, tag: u32, request_id: u64, payload: &[u8]) -> Vec<u8> {
    Envelope::build(op_code, tag, request_id, payload).frame().to_vec()
}

#[test]
fn test_decode_reads_all_header_fields() {
    let frame = frame_for(OpCode::Query, 7, 99, b"{}");
    let header = MsgHeader::decode(&frame).expect("decode");

    assert_eq!(header.length as usize, HEADER_LEN + 2);
    assert_eq!(header.op_code, OpCode::Query);
    assert_eq!(header.tag, 7);
    assert_eq!(header.request_id, 99);
    assert!(!header.is_main_queue());
    assert!(!header.is_system_info());
}

#[test]
fn test_decode_rejects_length_mismatch() {
    let mut frame = frame_for(OpCode::Query, 0, 1, b"abc");
    frame.push(0);

    let err = MsgHeader::decode(&frame).unwrap_err();
    assert_eq!(
        err,
        WireError::LengthMismatch {
            declared: (HEADER_LEN + 3) as u32,
            actual: HEADER_LEN + 4,
        }
    );
}

#[test]
fn test_decode_rejects_length_smaller_than_header() {
    let mut buf = BytesMut::new();
    MsgHeader {
        length: 8,
        op_code: OpCode::Query,
        tag: 0,
        request_id: 0,
    }
    .encode(&mut buf);

    let err = MsgHeader::decode(&buf).unwrap_err();
    assert_eq!(err, WireError::BadLength(8));
}

#[test]
fn test_decode_short_frame_is_truncated() {
    let err = MsgHeader::decode(&[1, 0]).unwrap_err();
    assert!(matches!(err, WireError::Truncated { needed: 4, .. }));
}

#[test]
fn test_probe_is_recognised_by_first_word() {
    let probe = encode_probe();
    let header = MsgHeader::decode(&probe).expect("decode probe");

    assert!(header.is_system_info());
    assert_eq!(header.tag, 0);
}

#[test]
fn test_sys_info_reply_layout() {
    let reply = SysInfoReply::new(2).encode();

    assert_eq!(reply.len(), SYS_INFO_REPLY_LEN);
    assert_eq!(reply[0..4], SYSTEM_INFO_LEN.to_le_bytes());
    assert_eq!(reply[4..8], EYE_CATCHER.to_le_bytes());
    assert_eq!(reply[12..16], 2i32.to_le_bytes());
    assert!(reply[16..].iter().all(|b| *b == 0));
}

#[test]
fn test_reply_opcodes_carry_reply_bit() {
    assert!(OpCode::QueryResponse.is_reply());
    assert!(OpCode::GetMoreResponse.is_reply());
    assert!(OpCode::KillContextResponse.is_reply());
    assert!(!OpCode::Query.is_reply());
    assert_eq!(OpCode::QueryResponse.code(), 2004 | REPLY_MASK);
    assert_eq!(OpCode::from_code(2005 | REPLY_MASK), OpCode::GetMoreResponse);
    assert_eq!(OpCode::from_code(31), OpCode::Other(31));
}

#[test]
fn test_disconnect_and_interrupts_never_create_sessions() {
    assert!(!OpCode::Disconnect.allows_session_create());
    assert!(!OpCode::Interrupt.allows_session_create());
    assert!(!OpCode::InterruptSelf.allows_session_create());
    assert!(OpCode::Query.allows_session_create());
    assert!(OpCode::QueryResponse.allows_session_create());
}

#[test]
fn test_envelope_copy_is_independent_of_source() {
    let mut frame = frame_for(OpCode::Other(42), 0, 5, b"payload");
    let header = MsgHeader::decode(&frame).expect("decode");
    let envelope = Envelope::copy_from(header, &frame).expect("copy");

    frame[HEADER_LEN] = b'X';

    assert_eq!(envelope.payload(), b"payload");
}

#[test]
fn test_reply_round_trips_through_envelope() {
    let reply = OpReply::ok(12, vec![json!({"_id": 3})]);
    let envelope = reply
        .clone()
        .into_envelope(OpCode::QueryResponse, 9, 4)
        .expect("encode");

    let decoded = OpReply::decode(&envelope).expect("decode");
    assert_eq!(decoded, reply);
    assert_eq!(decoded.flags.class(), ReplyClass::Ok);
}

#[test]
fn test_status_classes() {
    assert_eq!(StatusCode::DMS_EOC.class(), ReplyClass::EndOfCursor);
    assert_eq!(StatusCode::CS_DELETING.class(), ReplyClass::NotExist);
    assert_eq!(StatusCode::CS_NOTEXIST.class(), ReplyClass::NotExist);
    assert_eq!(StatusCode::NOT_PRIMARY.class(), ReplyClass::NotPrimary);
    assert_eq!(
        StatusCode::NETWORK.class(),
        ReplyClass::Failed(StatusCode::NETWORK)
    );
}

#[test]
fn test_pop_request_targets_pop_command() {
    let request = DataNodeRequest::Pop {
        collection: "cs.capped".to_string(),
        logical_id: 40,
        direction: 1,
    };
    let envelope = request.encode(3, 11).expect("encode");
    let body: serde_json::Value = envelope.decode_json().expect("body");

    assert_eq!(envelope.header.op_code, OpCode::Query);
    assert_eq!(body["collection"], POP_COMMAND);
    assert_eq!(body["condition"]["LogicalID"], 40);
    assert_eq!(body["condition"]["Collection"], "cs.capped");
}

proptest! {
    #[test]
    fn prop_header_survives_encode_decode(
        code in any::<i32>(),
        tag in any::<u32>(),
        request_id in any::<u64>(),
        payload in proptest::collection::vec(any::<u8>(), 0..64),
    ) {
        let op_code = OpCode::from_code(code);
        let frame = frame_for(op_code, tag, request_id, &payload);
        let header = MsgHeader::decode(&frame).expect("decode");

        prop_assert_eq!(header.op_code.code(), code);
        prop_assert_eq!(header.tag, tag);
        prop_assert_eq!(header.request_id, request_id);
        prop_assert_eq!(header.length as usize, frame.len());
    }
}
