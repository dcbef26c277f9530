use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use serde_json::{Map, Value};

use super::{
    header::{Header, HEADER_LEN, VERSION},
    FrameError,
};

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(0);

/// One framed application unit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub version: u8,
    pub id: u64,
    pub kind: u8,
    pub body: Bytes,
}

impl Message {
    pub fn new(kind: u8, body: impl Into<Bytes>) -> Self {
        Self {
            version: 0,
            id: 0,
            kind,
            body: body.into(),
        }
    }

    pub(crate) fn from_header(header: &Header, body: Bytes) -> Self {
        Self {
            version: header.version,
            id: header.id,
            kind: header.kind,
            body,
        }
    }

    pub fn header(&self) -> Header {
        Header {
            version: self.version,
            id: self.id,
            kind: self.kind,
            body_len: self.body.len() as u32,
            header_len: HEADER_LEN,
        }
    }

    /// Encodes header and body. An id of 0 is replaced with the next
    /// process-wide id and a version of 0 with the current version.
    pub fn marshal(&mut self) -> Bytes {
        if self.id == 0 {
            self.id = NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed) + 1;
        }
        if self.version == 0 {
            self.version = VERSION;
        }

        let mut out = BytesMut::with_capacity(HEADER_LEN + self.body.len());
        self.header().encode(&mut out);
        out.extend_from_slice(&self.body);
        out.freeze()
    }

    /// Strips a `[length:4][json object]` prefix off the body.
    ///
    /// Returns `Ok(None)` and leaves the body alone when there is no prefix
    /// (body shorter than 4 bytes or a zero length).
    pub fn decode_options(&mut self) -> Result<Option<Map<String, Value>>, FrameError> {
        if self.body.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.body[0], self.body[1], self.body[2], self.body[3]]) as usize;
        if len == 0 {
            return Ok(None);
        }
        let end = 4usize
            .checked_add(len)
            .filter(|end| *end <= self.body.len())
            .ok_or_else(|| {
                FrameError::MalformedOptions(format!(
                    "options declare {len} bytes, body has {}",
                    self.body.len() - 4
                ))
            })?;

        let options: Map<String, Value> = serde_json::from_slice(&self.body[4..end])
            .map_err(|e| FrameError::MalformedOptions(e.to_string()))?;
        self.body = self.body.slice(end..);
        Ok(Some(options))
    }
}

/// Body prefix understood by [`Message::decode_options`].
pub fn encode_options(options: &Map<String, Value>, data: &[u8]) -> Result<Bytes, FrameError> {
    let json = serde_json::to_vec(options).map_err(|e| FrameError::MalformedOptions(e.to_string()))?;
    let mut out = BytesMut::with_capacity(4 + json.len() + data.len());
    out.extend_from_slice(&(json.len() as u32).to_be_bytes());
    out.extend_from_slice(&json);
    out.extend_from_slice(data);
    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_marshal_assigns_increasing_ids() {
        let mut a = Message::new(2, &b"a"[..]);
        let mut b = Message::new(2, &b"b"[..]);
        let wire_a = a.marshal();
        b.marshal();

        assert!(a.id > 0);
        assert!(b.id > a.id);
        assert_eq!(a.version, VERSION);
        assert_eq!(wire_a.len(), HEADER_LEN + 1);
        assert_eq!(wire_a[0], VERSION);
        assert_eq!(wire_a[9], 2);
    }

    #[test]
    fn test_marshal_keeps_explicit_id() {
        let mut msg = Message::new(0, &b"hello"[..]);
        msg.id = 1;
        let wire = msg.marshal();
        assert_eq!(
            &wire[..],
            &[0x01, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 5, b'h', b'e', b'l', b'l', b'o'][..]
        );
    }

    #[test]
    fn test_decode_options_strips_prefix() {
        let mut opts = Map::new();
        opts.insert("route".into(), json!("echo"));
        let mut msg = Message::new(1, encode_options(&opts, b"rest").unwrap());

        let decoded = msg.decode_options().unwrap().unwrap();
        assert_eq!(decoded.get("route"), Some(&json!("echo")));
        assert_eq!(&msg.body[..], b"rest");
    }

    #[test]
    fn test_decode_options_absent() {
        let mut short = Message::new(1, &b"ab"[..]);
        assert!(short.decode_options().unwrap().is_none());
        let mut zero = Message::new(1, &[0u8, 0, 0, 0, 9][..]);
        assert!(zero.decode_options().unwrap().is_none());
        assert_eq!(zero.body.len(), 5);
    }

    #[test]
    fn test_decode_options_overrun_is_error() {
        let mut msg = Message::new(1, &[0u8, 0, 0, 50, b'{', b'}'][..]);
        assert!(matches!(
            msg.decode_options(),
            Err(FrameError::MalformedOptions(_))
        ));
    }
}
