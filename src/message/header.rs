use bytes::{Buf, BufMut, BytesMut};

use super::FrameError;

/// `[version:1][id:8][type:1][length:4]`, integers big-endian.
pub const HEADER_LEN: usize = 14;
pub const VERSION: u8 = 0x01;
pub const MAX_BODY_LEN: u32 = 2 * 1024 * 1024;

pub(crate) const ID_INDEX: usize = 1;
pub(crate) const KIND_INDEX: usize = 9;
pub(crate) const LENGTH_INDEX: usize = 10;

/// Parsed message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub id: u64,
    pub kind: u8,
    pub body_len: u32,
    /// Bytes the header occupies on the wire.
    pub header_len: usize,
}

impl Header {
    pub fn new(id: u64, kind: u8, body_len: u32) -> Self {
        Self {
            version: VERSION,
            id,
            kind,
            body_len,
            header_len: HEADER_LEN,
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_LEN);
        dst.put_u8(self.version);
        dst.put_u64(self.id);
        dst.put_u8(self.kind);
        dst.put_u32(self.body_len);
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = self.version;
        out[ID_INDEX..KIND_INDEX].copy_from_slice(&self.id.to_be_bytes());
        out[KIND_INDEX] = self.kind;
        out[LENGTH_INDEX..HEADER_LEN].copy_from_slice(&self.body_len.to_be_bytes());
        out
    }
}

/// Recognizes a header at the start of the backlog.
///
/// Must return [`FrameError::Incomplete`] when more bytes are needed; every
/// other error is fatal for the buffer.
pub trait HeaderParser: Send + Sync {
    fn parse(&self, buf: &[u8]) -> Result<Header, FrameError>;
}

/// Parser for the fixed 14-byte header.
#[derive(Debug, Clone, Copy)]
pub struct StandardParser {
    version: u8,
    max_body_len: u32,
}

impl Default for StandardParser {
    fn default() -> Self {
        Self {
            version: VERSION,
            max_body_len: MAX_BODY_LEN,
        }
    }
}

impl StandardParser {
    pub fn new(version: u8, max_body_len: u32) -> Self {
        Self {
            version,
            max_body_len,
        }
    }
}

impl HeaderParser for StandardParser {
    fn parse(&self, buf: &[u8]) -> Result<Header, FrameError> {
        // the version byte is judged as soon as it arrives
        match buf.first() {
            None => {
                return Err(FrameError::Incomplete {
                    needed: HEADER_LEN,
                })
            }
            Some(&v) if v != self.version => return Err(FrameError::InvalidVersion(v)),
            Some(_) => {}
        }
        if buf.len() < HEADER_LEN {
            return Err(FrameError::Incomplete {
                needed: HEADER_LEN - buf.len(),
            });
        }

        let mut cursor = &buf[..HEADER_LEN];
        let version = cursor.get_u8();
        let id = cursor.get_u64();
        let kind = cursor.get_u8();
        let body_len = cursor.get_u32();

        if body_len > self.max_body_len {
            return Err(FrameError::TooLarge {
                declared: body_len,
                max: self.max_body_len,
            });
        }

        Ok(Header {
            version,
            id,
            kind,
            body_len,
            header_len: HEADER_LEN,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_layout() {
        let header = Header::new(1, 0, 5);
        assert_eq!(
            header.to_bytes(),
            [0x01, 0, 0, 0, 0, 0, 0, 0, 1, 0x00, 0, 0, 0, 5]
        );
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(&buf[..], &header.to_bytes()[..]);
    }

    #[test]
    fn test_short_header_is_incomplete() {
        let parser = StandardParser::default();
        assert!(matches!(
            parser.parse(&[0x01, 0, 0]),
            Err(FrameError::Incomplete { needed: 11 })
        ));
        assert!(matches!(
            parser.parse(&[]),
            Err(FrameError::Incomplete { .. })
        ));
    }

    #[test]
    fn test_bad_version_detected_on_first_byte() {
        let parser = StandardParser::default();
        assert!(matches!(
            parser.parse(&[0x07]),
            Err(FrameError::InvalidVersion(0x07))
        ));
    }

    #[test]
    fn test_oversized_body_rejected() {
        let parser = StandardParser::default();
        let header = Header::new(3, 1, MAX_BODY_LEN + 1);
        assert!(matches!(
            parser.parse(&header.to_bytes()),
            Err(FrameError::TooLarge { declared, max }) if declared == MAX_BODY_LEN + 1 && max == MAX_BODY_LEN
        ));
        let header = Header::new(3, 1, MAX_BODY_LEN);
        assert!(parser.parse(&header.to_bytes()).is_ok());
    }
}
