//! Envelope codec: framing around bodies, in text and buffer variants.
//!
//! The text variant is one JSON object (the serde shape of
//! [`TransportData`]). The buffer variant (PBOX1) is length-prefixed and
//! type-tagged, all integers big-endian:
//!
//! ```text
//! [u32 frame_len][u8 tag][per-type fields]
//!   req:       [u16 service_id][u32 sn][proto?][u32 body_len][body]
//!   res:       [u32 sn][proto?][u32 body_len][body]
//!   err:       [u32 sn][proto?][u32 err_len][msgpack RpcError]
//!   msg:       [u16 service_id][u32 body_len][body]
//!   heartbeat: [u32 sn][u8 is_reply]
//!   custom:    [u32 body_len][body]
//! proto? = [u8 present][u16 len][msgpack ProtoInfo]
//! ```
//!
//! A buffer `res` carries no service id; the decoder recovers the service
//! name from the pending-call table by sn. Decoding yields an [`Envelope`]
//! with the body still in its encoded form — body decode is a separate
//! stage with its own error handling.

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;

use crate::error::RpcError;
use crate::pending::PendingCallTable;
use crate::proto::{ProtoInfo, TransportData};
use crate::service::ServiceMap;

const TAG_REQ: u8 = 0x01;
const TAG_RES: u8 = 0x02;
const TAG_ERR: u8 = 0x03;
const TAG_MSG: u8 = 0x04;
const TAG_HEARTBEAT: u8 = 0x05;
const TAG_CUSTOM: u8 = 0x06;

/// Errors during envelope encode/decode.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Frame truncated reading {what}: need {expected} bytes, have {actual}")]
    TooShort {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("Frame length mismatch: header says {declared}, buffer has {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("Invalid envelope tag: {0:#04x}")]
    InvalidTag(u8),
    #[error("Unknown service: {0}")]
    UnknownService(String),
    #[error("Unknown service id: {0}")]
    UnknownServiceId(u16),
    #[error("Missing body for {0} envelope")]
    MissingBody(&'static str),
    #[error("{0} segment exceeds the wire limit")]
    SegmentTooLarge(&'static str),
    #[error("Invalid JSON envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),
}

impl From<FrameError> for RpcError {
    fn from(e: FrameError) -> Self {
        RpcError::local(e.to_string())
    }
}

/// A body as it sits inside a decoded envelope: still JSON in text mode,
/// still MessagePack bytes in buffer mode.
#[derive(Debug, Clone, PartialEq)]
pub enum BodyData {
    Json(Value),
    Bin(Bytes),
}

/// A decoded envelope: routing info resolved, body not yet decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Req {
        service_name: String,
        sn: u32,
        proto_info: Option<ProtoInfo>,
        body: BodyData,
    },
    Res {
        /// Recovered from the wire (text) or the pending-call table
        /// (buffer); `None` when the sn is unknown and dispatch will drop.
        service_name: Option<String>,
        sn: u32,
        proto_info: Option<ProtoInfo>,
        body: BodyData,
    },
    Err {
        sn: u32,
        proto_info: Option<ProtoInfo>,
        err: RpcError,
    },
    Msg {
        service_name: String,
        body: BodyData,
    },
    Heartbeat {
        sn: u32,
        is_reply: bool,
    },
    Custom {
        body: BodyData,
    },
}

impl Envelope {
    pub fn proto_info(&self) -> Option<&ProtoInfo> {
        match self {
            Envelope::Req { proto_info, .. }
            | Envelope::Res { proto_info, .. }
            | Envelope::Err { proto_info, .. } => proto_info.as_ref(),
            _ => None,
        }
    }
}

/// Encode a text-mode envelope. The body inside `data` must already be
/// validated by the body codec.
pub fn encode_box_text(data: &TransportData) -> Result<String, FrameError> {
    Ok(serde_json::to_string(data)?)
}

/// Decode a text-mode envelope. Body decode happens in a later stage.
pub fn decode_box_text(raw: &str) -> Result<Envelope, FrameError> {
    let data: TransportData = serde_json::from_str(raw)?;
    Ok(match data {
        TransportData::Req {
            service_name,
            sn,
            body,
            proto_info,
        } => Envelope::Req {
            service_name,
            sn,
            proto_info,
            body: BodyData::Json(body),
        },
        TransportData::Res {
            service_name,
            sn,
            body,
            proto_info,
        } => Envelope::Res {
            service_name,
            sn,
            proto_info,
            body: BodyData::Json(body),
        },
        TransportData::Err {
            sn,
            err,
            proto_info,
        } => Envelope::Err {
            sn,
            proto_info,
            err,
        },
        TransportData::Msg { service_name, body } => Envelope::Msg {
            service_name,
            body: BodyData::Json(body),
        },
        TransportData::Heartbeat { sn, is_reply } => Envelope::Heartbeat { sn, is_reply },
        TransportData::Custom { body } => Envelope::Custom {
            body: BodyData::Json(body),
        },
    })
}

/// Encode a buffer-mode envelope. `body` is the codec-packed body for the
/// genres that carry one (req/res/msg/custom).
pub fn encode_box_buffer(
    data: &TransportData,
    body: Option<&Bytes>,
    map: &ServiceMap,
) -> Result<Bytes, FrameError> {
    let mut payload = BytesMut::with_capacity(32 + body.map_or(0, |b| b.len()));
    match data {
        TransportData::Req {
            service_name,
            sn,
            proto_info,
            ..
        } => {
            payload.put_u8(TAG_REQ);
            let service = map
                .api(service_name)
                .ok_or_else(|| FrameError::UnknownService(service_name.clone()))?;
            payload.put_u16(service.id);
            payload.put_u32(*sn);
            put_proto(&mut payload, proto_info.as_ref())?;
            put_body(&mut payload, body, "req")?;
        }
        TransportData::Res { sn, proto_info, .. } => {
            payload.put_u8(TAG_RES);
            payload.put_u32(*sn);
            put_proto(&mut payload, proto_info.as_ref())?;
            put_body(&mut payload, body, "res")?;
        }
        TransportData::Err {
            sn,
            err,
            proto_info,
        } => {
            payload.put_u8(TAG_ERR);
            payload.put_u32(*sn);
            put_proto(&mut payload, proto_info.as_ref())?;
            let packed = rmp_serde::to_vec_named(err)?;
            payload.put_u32(seg_len(&packed, "err")?);
            payload.extend_from_slice(&packed);
        }
        TransportData::Msg { service_name, .. } => {
            payload.put_u8(TAG_MSG);
            let service = map
                .msg(service_name)
                .ok_or_else(|| FrameError::UnknownService(service_name.clone()))?;
            payload.put_u16(service.id);
            put_body(&mut payload, body, "msg")?;
        }
        TransportData::Heartbeat { sn, is_reply } => {
            payload.put_u8(TAG_HEARTBEAT);
            payload.put_u32(*sn);
            payload.put_u8(u8::from(*is_reply));
        }
        TransportData::Custom { .. } => {
            payload.put_u8(TAG_CUSTOM);
            put_body(&mut payload, body, "custom")?;
        }
    }

    let mut out = BytesMut::with_capacity(4 + payload.len());
    out.put_u32(seg_len(&payload, "frame")?);
    out.extend_from_slice(&payload);
    Ok(out.freeze())
}

/// Decode a buffer-mode envelope. The pending-call table recovers the
/// service name for a `res`, which only carries an sn on the wire.
pub fn decode_box_buffer(
    raw: &[u8],
    map: &ServiceMap,
    pending: &PendingCallTable,
) -> Result<Envelope, FrameError> {
    let mut r = Reader::new(raw);
    let declared = r.u32("length prefix")? as usize;
    if declared != r.remaining() {
        return Err(FrameError::LengthMismatch {
            declared,
            actual: r.remaining(),
        });
    }

    let tag = r.u8("tag")?;
    Ok(match tag {
        TAG_REQ => {
            let id = r.u16("service id")?;
            let service = map.by_id(id).ok_or(FrameError::UnknownServiceId(id))?;
            let sn = r.u32("sn")?;
            let proto_info = get_proto(&mut r)?;
            let body = get_body(&mut r)?;
            Envelope::Req {
                service_name: service.name.clone(),
                sn,
                proto_info,
                body: BodyData::Bin(body),
            }
        }
        TAG_RES => {
            let sn = r.u32("sn")?;
            let proto_info = get_proto(&mut r)?;
            let body = get_body(&mut r)?;
            Envelope::Res {
                service_name: pending.api_name(sn).map(String::from),
                sn,
                proto_info,
                body: BodyData::Bin(body),
            }
        }
        TAG_ERR => {
            let sn = r.u32("sn")?;
            let proto_info = get_proto(&mut r)?;
            let len = r.u32("err length")? as usize;
            let err: RpcError = rmp_serde::from_slice(r.take(len, "err")?)?;
            Envelope::Err {
                sn,
                proto_info,
                err,
            }
        }
        TAG_MSG => {
            let id = r.u16("service id")?;
            let service = map.by_id(id).ok_or(FrameError::UnknownServiceId(id))?;
            let body = get_body(&mut r)?;
            Envelope::Msg {
                service_name: service.name.clone(),
                body: BodyData::Bin(body),
            }
        }
        TAG_HEARTBEAT => {
            let sn = r.u32("sn")?;
            let is_reply = r.u8("isReply flag")? != 0;
            Envelope::Heartbeat { sn, is_reply }
        }
        TAG_CUSTOM => {
            let body = get_body(&mut r)?;
            Envelope::Custom {
                body: BodyData::Bin(body),
            }
        }
        other => return Err(FrameError::InvalidTag(other)),
    })
}

fn seg_len(bytes: &[u8], what: &'static str) -> Result<u32, FrameError> {
    u32::try_from(bytes.len()).map_err(|_| FrameError::SegmentTooLarge(what))
}

fn put_body(
    payload: &mut BytesMut,
    body: Option<&Bytes>,
    what: &'static str,
) -> Result<(), FrameError> {
    let body = body.ok_or(FrameError::MissingBody(what))?;
    payload.put_u32(seg_len(body, what)?);
    payload.extend_from_slice(body);
    Ok(())
}

fn put_proto(payload: &mut BytesMut, proto: Option<&ProtoInfo>) -> Result<(), FrameError> {
    match proto {
        None => payload.put_u8(0),
        Some(pi) => {
            payload.put_u8(1);
            let packed = rmp_serde::to_vec_named(pi)?;
            let len =
                u16::try_from(packed.len()).map_err(|_| FrameError::SegmentTooLarge("protoInfo"))?;
            payload.put_u16(len);
            payload.extend_from_slice(&packed);
        }
    }
    Ok(())
}

fn get_body(r: &mut Reader<'_>) -> Result<Bytes, FrameError> {
    let len = r.u32("body length")? as usize;
    Ok(Bytes::copy_from_slice(r.take(len, "body")?))
}

fn get_proto(r: &mut Reader<'_>) -> Result<Option<ProtoInfo>, FrameError> {
    if r.u8("protoInfo flag")? == 0 {
        return Ok(None);
    }
    let len = r.u16("protoInfo length")? as usize;
    let pi: ProtoInfo = rmp_serde::from_slice(r.take(len, "protoInfo")?)?;
    Ok(Some(pi))
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], FrameError> {
        if self.remaining() < n {
            return Err(FrameError::TooShort {
                what,
                expected: n,
                actual: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, FrameError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, FrameError> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, FrameError> {
        let b = self.take(4, what)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{codes, ErrorKind};
    use crate::pending::PendingCall;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn test_map() -> ServiceMap {
        ServiceMap::builder()
            .add_api("Echo")
            .add_msg("Chat")
            .build()
            .unwrap()
    }

    fn packed(v: &Value) -> Bytes {
        Bytes::from(rmp_serde::to_vec_named(v).unwrap())
    }

    #[test]
    fn text_req_roundtrip() {
        let data = TransportData::Req {
            service_name: "Echo".into(),
            sn: 7,
            body: json!({"text": "hi"}),
            proto_info: None,
        };
        let raw = encode_box_text(&data).unwrap();
        let env = decode_box_text(&raw).unwrap();
        assert_eq!(
            env,
            Envelope::Req {
                service_name: "Echo".into(),
                sn: 7,
                proto_info: None,
                body: BodyData::Json(json!({"text": "hi"})),
            }
        );
    }

    #[test]
    fn text_err_roundtrip() {
        let data = TransportData::Err {
            sn: 0,
            err: RpcError::remote("Invalid request data"),
            proto_info: None,
        };
        let raw = encode_box_text(&data).unwrap();
        match decode_box_text(&raw).unwrap() {
            Envelope::Err { sn, err, .. } => {
                assert_eq!(sn, 0);
                assert_eq!(err.kind, ErrorKind::Remote);
            }
            other => panic!("expected err envelope, got {:?}", other),
        }
    }

    #[test]
    fn buffer_req_roundtrip_with_proto() {
        let map = test_map();
        let pending = PendingCallTable::new();
        let body = packed(&json!({"text": "hi"}));
        let data = TransportData::Req {
            service_name: "Echo".into(),
            sn: 1,
            body: Value::Null,
            proto_info: Some(map.proto_info()),
        };
        let raw = encode_box_buffer(&data, Some(&body), &map).unwrap();
        let env = decode_box_buffer(&raw, &map, &pending).unwrap();
        assert_eq!(
            env,
            Envelope::Req {
                service_name: "Echo".into(),
                sn: 1,
                proto_info: Some(map.proto_info()),
                body: BodyData::Bin(body),
            }
        );
    }

    #[test]
    fn buffer_res_recovers_service_from_pending() {
        let map = test_map();
        let mut pending = PendingCallTable::new();
        let (tx, _rx) = tokio::sync::oneshot::channel();
        pending.insert(PendingCall::new(9, "Echo", json!({}), None, tx));

        let body = packed(&json!({"text": "hi"}));
        let data = TransportData::Res {
            service_name: None,
            sn: 9,
            body: Value::Null,
            proto_info: None,
        };
        let raw = encode_box_buffer(&data, Some(&body), &map).unwrap();
        match decode_box_buffer(&raw, &map, &pending).unwrap() {
            Envelope::Res {
                service_name, sn, ..
            } => {
                assert_eq!(service_name.as_deref(), Some("Echo"));
                assert_eq!(sn, 9);
            }
            other => panic!("expected res envelope, got {:?}", other),
        }

        // unknown sn still decodes; dispatch drops it later
        let data = TransportData::Res {
            service_name: None,
            sn: 10,
            body: Value::Null,
            proto_info: None,
        };
        let raw = encode_box_buffer(&data, Some(&body), &map).unwrap();
        match decode_box_buffer(&raw, &map, &pending).unwrap() {
            Envelope::Res { service_name, .. } => assert_eq!(service_name, None),
            other => panic!("expected res envelope, got {:?}", other),
        }
    }

    #[test]
    fn buffer_err_roundtrip() {
        let map = test_map();
        let pending = PendingCallTable::new();
        let data = TransportData::Err {
            sn: 3,
            err: RpcError::network("Request Timeout").with_code(codes::TIMEOUT),
            proto_info: None,
        };
        let raw = encode_box_buffer(&data, None, &map).unwrap();
        match decode_box_buffer(&raw, &map, &pending).unwrap() {
            Envelope::Err { sn, err, .. } => {
                assert_eq!(sn, 3);
                assert!(err.is(ErrorKind::Network, codes::TIMEOUT));
            }
            other => panic!("expected err envelope, got {:?}", other),
        }
    }

    #[test]
    fn buffer_msg_and_heartbeat_roundtrip() {
        let map = test_map();
        let pending = PendingCallTable::new();

        let body = packed(&json!({"line": "yo"}));
        let msg = TransportData::Msg {
            service_name: "Chat".into(),
            body: Value::Null,
        };
        let raw = encode_box_buffer(&msg, Some(&body), &map).unwrap();
        assert_eq!(
            decode_box_buffer(&raw, &map, &pending).unwrap(),
            Envelope::Msg {
                service_name: "Chat".into(),
                body: BodyData::Bin(body),
            }
        );

        let hb = TransportData::Heartbeat {
            sn: 2,
            is_reply: true,
        };
        let raw = encode_box_buffer(&hb, None, &map).unwrap();
        assert_eq!(
            decode_box_buffer(&raw, &map, &pending).unwrap(),
            Envelope::Heartbeat {
                sn: 2,
                is_reply: true
            }
        );
    }

    #[test]
    fn unknown_service_fails_encode() {
        let map = test_map();
        let data = TransportData::Req {
            service_name: "Nope".into(),
            sn: 1,
            body: Value::Null,
            proto_info: None,
        };
        let body = packed(&json!({}));
        assert!(matches!(
            encode_box_buffer(&data, Some(&body), &map),
            Err(FrameError::UnknownService(_))
        ));
    }

    #[test]
    fn invalid_tag_and_truncation_are_rejected() {
        let map = test_map();
        let pending = PendingCallTable::new();

        let raw: &[u8] = &[0, 0, 0, 1, 0xEE];
        assert!(matches!(
            decode_box_buffer(raw, &map, &pending),
            Err(FrameError::InvalidTag(0xEE))
        ));

        let hb = TransportData::Heartbeat {
            sn: 1,
            is_reply: false,
        };
        let mut raw = encode_box_buffer(&hb, None, &map).unwrap().to_vec();
        raw.truncate(raw.len() - 1);
        assert!(matches!(
            decode_box_buffer(&raw, &map, &pending),
            Err(FrameError::LengthMismatch { .. })
        ));
    }
}
