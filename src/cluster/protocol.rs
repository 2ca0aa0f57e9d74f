//! Coordination Wire Protocol
//!
//! Every message is one length-delimited frame:
//!
//! ```text
//! ┌──────────┬────────────────────────────┬─────────────────────┐
//! │ u32 (BE) │ JSON Envelope { id, body } │ raw payload bytes   │
//! │ hdr len  │                            │ (part data, if any) │
//! └──────────┴────────────────────────────┴─────────────────────┘
//! ```
//!
//! Part payloads travel outside the JSON header so they are never
//! re-encoded. A `Commit` carries its parts back to back in tag order of
//! the `parts` list; a `Part` response carries exactly one part.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

use crate::cache::backend::{EntryInfo, PartInfo};
use crate::cache::key::{CacheKey, PartTag};
use crate::error::{Error, Result};

/// Largest frame accepted on a channel
pub const MAX_FRAME_LENGTH: usize = u32::MAX as usize;

/// Frame codec shared by both channel ends
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Request id plus message body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub id: u64,
    pub body: T,
}

/// Worker to coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Ping,
    GetInfo { key: CacheKey },
    GetPart { key: CacheKey, tag: PartTag },
    Commit { key: CacheKey, parts: Vec<PartInfo> },
}

impl Request {
    /// Operation name for logging
    pub fn operation(&self) -> &'static str {
        match self {
            Request::Ping => "ping",
            Request::GetInfo { .. } => "get_info",
            Request::GetPart { .. } => "get_part",
            Request::Commit { .. } => "commit",
        }
    }
}

/// Coordinator to worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Pong,
    Info { info: Option<EntryInfo> },
    Part { size: u64 },
    Committed,
    Error(WireError),
}

/// An [`Error`] flattened for the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part: Option<char>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<u64>,
}

impl WireError {
    fn new(err: &Error, message: String) -> Self {
        Self {
            kind: err.kind().to_string(),
            message,
            part: None,
            expected: None,
            actual: None,
        }
    }

    /// Rebuild the error on the receiving side, keeping its variant
    pub fn into_error(self) -> Error {
        let part = self.part.unwrap_or('?');
        let expected = self.expected.unwrap_or(0);
        let actual = self.actual.unwrap_or(0);
        match self.kind.as_str() {
            "invalid_key" => Error::InvalidKey(self.message),
            "invalid_part_tag" => Error::InvalidPartTag(part),
            "not_implemented" => Error::not_implemented("cluster_coordinator", "remote_call"),
            "init_error" => Error::InitError(self.message),
            "not_found" => Error::NotFound(self.message),
            "duplicate_part" => Error::DuplicatePart(part),
            "incomplete_write" => Error::IncompleteWrite {
                part,
                reason: self.message,
            },
            "size_mismatch" => Error::SizeMismatch {
                part,
                expected,
                actual,
            },
            "entry_too_large" => Error::EntryTooLarge {
                size: actual,
                capacity: expected,
            },
            "transaction_closed" => Error::TransactionClosed(uuid::Uuid::nil()),
            "coordinator_unavailable" => Error::CoordinatorUnavailable(self.message),
            "protocol" => Error::Protocol(self.message),
            "config" => Error::Config(self.message),
            _ => Error::Internal(format!("{}: {}", self.kind, self.message)),
        }
    }
}

impl From<&Error> for WireError {
    fn from(err: &Error) -> Self {
        match err {
            Error::InvalidPartTag(part) | Error::DuplicatePart(part) => WireError {
                part: Some(*part),
                ..WireError::new(err, err.to_string())
            },
            Error::IncompleteWrite { part, reason } => WireError {
                part: Some(*part),
                ..WireError::new(err, reason.clone())
            },
            Error::SizeMismatch {
                part,
                expected,
                actual,
            } => WireError {
                part: Some(*part),
                expected: Some(*expected),
                actual: Some(*actual),
                ..WireError::new(err, err.to_string())
            },
            Error::EntryTooLarge { size, capacity } => WireError {
                expected: Some(*capacity),
                actual: Some(*size),
                ..WireError::new(err, err.to_string())
            },
            Error::InvalidKey(msg)
            | Error::InitError(msg)
            | Error::NotFound(msg)
            | Error::CoordinatorUnavailable(msg)
            | Error::Protocol(msg)
            | Error::Config(msg)
            | Error::Internal(msg) => WireError::new(err, msg.clone()),
            _ => WireError::new(err, err.to_string()),
        }
    }
}

/// Encode an envelope and its payload into one frame
pub fn encode_frame<T: Serialize>(envelope: &Envelope<T>, payload: &[Bytes]) -> Result<Bytes> {
    let header = serde_json::to_vec(envelope)?;
    let header_len = u32::try_from(header.len())
        .map_err(|_| Error::Protocol(format!("header of {} bytes too large", header.len())))?;
    let payload_len: usize = payload.iter().map(Bytes::len).sum();

    let mut buf = BytesMut::with_capacity(4 + header.len() + payload_len);
    buf.put_u32(header_len);
    buf.extend_from_slice(&header);
    for chunk in payload {
        buf.extend_from_slice(chunk);
    }
    Ok(buf.freeze())
}

/// Split a frame into its envelope and payload
pub fn decode_frame<T: DeserializeOwned>(mut frame: BytesMut) -> Result<(Envelope<T>, Bytes)> {
    if frame.len() < 4 {
        return Err(Error::Protocol(format!("frame of {} bytes is too short", frame.len())));
    }
    let header_len = frame.get_u32() as usize;
    if frame.len() < header_len {
        return Err(Error::Protocol(format!(
            "header length {} exceeds frame of {} bytes",
            header_len,
            frame.len()
        )));
    }
    let header = frame.split_to(header_len);
    let envelope = serde_json::from_slice(&header)?;
    Ok((envelope, frame.freeze()))
}

/// Cut a commit payload into one slice per announced part
pub fn split_parts(parts: &[PartInfo], mut payload: Bytes) -> Result<Vec<(PartTag, Bytes)>> {
    let announced: u64 = parts.iter().map(|p| p.size).sum();
    if announced != payload.len() as u64 {
        return Err(Error::Protocol(format!(
            "commit announced {} bytes, carried {}",
            announced,
            payload.len()
        )));
    }
    Ok(parts
        .iter()
        .map(|p| (p.tag, payload.split_to(p.size as usize)))
        .collect())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn make_key() -> CacheKey {
        CacheKey::new(&[9u8; 16], &[8u8; 16]).unwrap()
    }

    #[test]
    fn test_commit_frame() {
        let parts = vec![
            PartInfo {
                tag: PartTag::INFO,
                size: 2,
            },
            PartInfo {
                tag: PartTag::BINARY,
                size: 3,
            },
        ];
        let envelope = Envelope {
            id: 42,
            body: Request::Commit {
                key: make_key(),
                parts: parts.clone(),
            },
        };
        let frame = encode_frame(
            &envelope,
            &[Bytes::from_static(b"ab"), Bytes::from_static(b"cde")],
        )
        .unwrap();

        let (decoded, payload) = decode_frame::<Request>(BytesMut::from(&frame[..])).unwrap();
        assert_eq!(decoded, envelope);

        let split = split_parts(&parts, payload).unwrap();
        assert_eq!(split[0], (PartTag::INFO, Bytes::from_static(b"ab")));
        assert_eq!(split[1], (PartTag::BINARY, Bytes::from_static(b"cde")));
    }

    #[test]
    fn test_split_parts_rejects_short_payload() {
        let parts = vec![PartInfo {
            tag: PartTag::BINARY,
            size: 10,
        }];
        assert_matches!(
            split_parts(&parts, Bytes::from_static(b"short")),
            Err(Error::Protocol(_))
        );
    }

    #[test]
    fn test_truncated_frame() {
        assert_matches!(
            decode_frame::<Request>(BytesMut::from(&b"\x00\x00"[..])),
            Err(Error::Protocol(_))
        );
        assert_matches!(
            decode_frame::<Request>(BytesMut::from(&b"\x00\x00\x00\xffabc"[..])),
            Err(Error::Protocol(_))
        );
    }

    #[test]
    fn test_request_json_shape() {
        let json = serde_json::to_value(Request::GetPart {
            key: make_key(),
            tag: PartTag::RESOURCE,
        })
        .unwrap();
        assert_eq!(json["type"], "get_part");
        assert_eq!(json["tag"], "r");
    }

    #[test]
    fn test_error_variants_survive_the_wire() {
        let cases = vec![
            Error::NotFound("k/a".into()),
            Error::InvalidPartTag('x'),
            Error::DuplicatePart('a'),
            Error::IncompleteWrite {
                part: 'i',
                reason: "stream not closed".into(),
            },
            Error::SizeMismatch {
                part: 'a',
                expected: 3,
                actual: 5,
            },
            Error::EntryTooLarge {
                size: 2000,
                capacity: 1000,
            },
            Error::Config("disabled".into()),
        ];
        for err in cases {
            let wire = WireError::from(&err);
            let json = serde_json::to_string(&Response::Error(wire)).unwrap();
            let Response::Error(wire) = serde_json::from_str(&json).unwrap() else {
                panic!("expected error response");
            };
            let rebuilt = wire.into_error();
            assert_eq!(rebuilt.kind(), err.kind());
            assert_eq!(rebuilt.to_string(), err.to_string());
        }
    }

    #[test]
    fn test_unknown_kind_is_internal() {
        let wire = WireError {
            kind: "mystery".into(),
            message: "?".into(),
            part: None,
            expected: None,
            actual: None,
        };
        assert_matches!(wire.into_error(), Error::Internal(_));
    }
}
