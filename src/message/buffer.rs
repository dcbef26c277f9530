use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard},
};

use bytes::{Buf, BytesMut};

use super::{
    framed::Message,
    header::{Header, HeaderParser, StandardParser},
    FrameError,
};

pub type MessageFn = Box<dyn Fn(Message) + Send + Sync>;
pub type ErrorFn = Box<dyn Fn(&FrameError) + Send + Sync>;

#[derive(Default)]
struct State {
    backlog: BytesMut,
    /// Header already consumed from the backlog, body still short.
    pending: Option<Header>,
    last_id: u64,
    errored: bool,
    processing: bool,
}

enum Step {
    Wait,
    Emit(Message),
    Fail(FrameError),
}

/// Reassembles framed messages from a byte stream.
///
/// Bytes may arrive split at any boundary; a message is delivered once its
/// whole body is present. The first fatal condition (bad version, oversized
/// length, replayed id) makes the buffer errored: the error callback fires
/// once and every later `write` is ignored.
///
/// Callbacks run without the internal lock held, so a message callback may
/// write into the same buffer; those bytes are processed after it returns.
pub struct FrameBuffer {
    state: Mutex<State>,
    parser: Arc<dyn HeaderParser>,
    validate_id: bool,
    resettable: bool,
    on_message: Option<MessageFn>,
    on_error: Option<ErrorFn>,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            parser: Arc::new(StandardParser::default()),
            validate_id: false,
            resettable: false,
            on_message: None,
            on_error: None,
        }
    }

    /// Rejects any message whose id is not above every id seen before.
    pub fn validate_id(mut self, enabled: bool) -> Self {
        self.validate_id = enabled;
        self
    }

    pub fn with_parser(mut self, parser: Arc<dyn HeaderParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn on_message<F>(mut self, f: F) -> Self
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.on_message = Some(Box::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&FrameError) + Send + Sync + 'static,
    {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Lets [`reset`](Self::reset) clear the buffer. Off by default.
    pub fn resettable(mut self, enabled: bool) -> Self {
        self.resettable = enabled;
        self
    }

    pub fn write(&self, data: &[u8]) {
        let mut state = self.lock();
        if state.errored || data.is_empty() {
            return;
        }
        state.backlog.extend_from_slice(data);
        if state.processing {
            // re-entrant or concurrent write: the running loop picks it up
            return;
        }
        state.processing = true;

        loop {
            let step = catch_unwind(AssertUnwindSafe(|| self.next_step(&mut state)))
                .unwrap_or_else(|_| Step::Fail(FrameError::Parser("parser panicked".into())));
            match step {
                Step::Wait => {
                    state.processing = false;
                    break;
                }
                Step::Emit(message) => {
                    drop(state);
                    if let Some(on_message) = &self.on_message {
                        // keep the processing flag consistent if the callback unwinds
                        if catch_unwind(AssertUnwindSafe(|| on_message(message))).is_err() {
                            tracing::error!("frame message callback panicked");
                        }
                    }
                    state = self.lock();
                    if state.errored {
                        state.processing = false;
                        break;
                    }
                }
                Step::Fail(err) => {
                    state.errored = true;
                    state.processing = false;
                    state.pending = None;
                    state.backlog.clear();
                    drop(state);
                    tracing::error!(error = %err, "frame buffer errored");
                    if let Some(on_error) = &self.on_error {
                        on_error(&err);
                    }
                    return;
                }
            }
        }
    }

    fn next_step(&self, state: &mut State) -> Step {
        let header = match state.pending {
            Some(header) => header,
            None => {
                let header = match self.parser.parse(&state.backlog) {
                    Ok(header) => header,
                    Err(FrameError::Incomplete { .. }) => return Step::Wait,
                    Err(err) => return Step::Fail(err),
                };
                if header.header_len == 0 {
                    return Step::Fail(FrameError::Parser("zero-length header".into()));
                }
                if header.header_len > state.backlog.len() {
                    return Step::Wait;
                }
                if self.validate_id && header.id <= state.last_id {
                    return Step::Fail(FrameError::ReplayedId {
                        id: header.id,
                        last: state.last_id,
                    });
                }
                state.last_id = header.id;
                state.backlog.advance(header.header_len);
                state.pending = Some(header);
                header
            }
        };

        let needed = header.body_len as usize;
        if state.backlog.len() < needed {
            return Step::Wait;
        }
        let body = state.backlog.split_to(needed).freeze();
        state.pending = None;
        Step::Emit(Message::from_header(&header, body))
    }

    /// Clears backlog, replay state and the error flag, only when the buffer
    /// was built [`resettable`](Self::resettable). Otherwise a no-op: a
    /// broken stream gets a fresh buffer instead.
    pub fn reset(&self) {
        if !self.resettable {
            tracing::trace!("frame buffer reset ignored");
            return;
        }
        let mut state = self.lock();
        state.backlog.clear();
        state.pending = None;
        state.last_id = 0;
        state.errored = false;
    }

    pub fn is_errored(&self) -> bool {
        self.lock().errored
    }

    /// Bytes received but not yet delivered, header bytes of a partially
    /// received message excluded.
    pub fn backlog_len(&self) -> usize {
        self.lock().backlog.len()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::message::header::{Header, MAX_BODY_LEN};

    fn frame(id: u64, kind: u8, body: &[u8]) -> Vec<u8> {
        let mut out = Header::new(id, kind, body.len() as u32).to_bytes().to_vec();
        out.extend_from_slice(body);
        out
    }

    fn collecting() -> (FrameBuffer, Arc<Mutex<Vec<Message>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let buffer = FrameBuffer::new().on_message(move |m| sink.lock().unwrap().push(m));
        (buffer, seen)
    }

    #[test]
    fn test_split_header_and_body() {
        let (buffer, seen) = collecting();
        let wire = frame(1, 0, b"hello");
        buffer.write(&wire[..4]);
        buffer.write(&wire[4..10]);
        assert!(seen.lock().unwrap().is_empty());
        buffer.write(&wire[10..]);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].id, 1);
        assert_eq!(seen[0].kind, 0);
        assert_eq!(&seen[0].body[..], b"hello");
    }

    #[test]
    fn test_many_messages_in_one_write() {
        let (buffer, seen) = collecting();
        let mut wire = frame(1, 1, b"a");
        wire.extend(frame(2, 2, b""));
        wire.extend(frame(3, 3, b"ccc"));
        wire.extend(&frame(4, 4, b"dd")[..5]);
        buffer.write(&wire);

        let ids: Vec<u64> = seen.lock().unwrap().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(buffer.backlog_len(), 5);
    }

    #[test]
    fn test_zero_length_body_emitted_immediately() {
        let (buffer, seen) = collecting();
        buffer.write(&frame(9, 4, b""));
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(seen.lock().unwrap()[0].body.is_empty());
    }

    #[test]
    fn test_bad_version_is_sticky() {
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = errors.clone();
        let (buffer, seen) = collecting();
        let buffer = buffer.on_error(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        buffer.write(&[0x09]);
        buffer.write(&frame(1, 0, b"ok"));
        assert!(buffer.is_errored());
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_oversized_length_is_fatal() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let buffer = FrameBuffer::new().on_error(move |e| sink.lock().unwrap().push(e.to_string()));
        buffer.write(&Header::new(1, 0, MAX_BODY_LEN + 1).to_bytes());
        assert!(buffer.is_errored());
        assert_eq!(errors.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_replay_guard() {
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = errors.clone();
        let (buffer, seen) = collecting();
        let buffer = buffer.validate_id(true).on_error(move |e| {
            assert!(matches!(e, FrameError::ReplayedId { id: 5, last: 5 }));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut wire = frame(5, 0, b"x");
        wire.extend(frame(5, 0, b"y"));
        wire.extend(frame(6, 0, b"z"));
        buffer.write(&wire);

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reentrant_write_from_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let buffer = Arc::new_cyclic(|weak: &std::sync::Weak<FrameBuffer>| {
            let weak = weak.clone();
            let sink = seen.clone();
            FrameBuffer::new().on_message(move |m| {
                sink.lock().unwrap().push(m.id);
                if m.id == 1 {
                    if let Some(me) = weak.upgrade() {
                        me.write(&frame(2, 0, b"follow-up"));
                    }
                }
            })
        });

        buffer.write(&frame(1, 0, b"first"));
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(buffer.backlog_len(), 0);
    }

    /// Claims a 16-byte header as soon as the first byte is in.
    struct Eager;

    impl HeaderParser for Eager {
        fn parse(&self, buf: &[u8]) -> Result<Header, FrameError> {
            if buf.is_empty() {
                return Err(FrameError::Incomplete { needed: 16 });
            }
            Ok(Header {
                version: 1,
                id: 1,
                kind: 0,
                body_len: 2,
                header_len: 16,
            })
        }
    }

    struct Exploding;

    impl HeaderParser for Exploding {
        fn parse(&self, _buf: &[u8]) -> Result<Header, FrameError> {
            panic!("parser bug")
        }
    }

    #[test]
    fn test_custom_header_longer_than_backlog_waits() {
        let (buffer, seen) = collecting();
        let buffer = buffer.with_parser(Arc::new(Eager));

        buffer.write(&[0u8; 4]);
        assert!(!buffer.is_errored());
        assert_eq!(buffer.backlog_len(), 4);

        let mut rest = vec![0u8; 12];
        rest.extend_from_slice(b"ok");
        buffer.write(&rest);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(&seen[0].body[..], b"ok");
    }

    #[test]
    fn test_panicking_parser_errors_the_buffer() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let buffer = FrameBuffer::new()
            .with_parser(Arc::new(Exploding))
            .on_error(move |e| sink.lock().unwrap().push(e.clone()));

        buffer.write(b"anything");
        buffer.write(b"more");
        assert!(buffer.is_errored());
        assert_eq!(
            *errors.lock().unwrap(),
            vec![FrameError::Parser("parser panicked".into())]
        );
        assert_eq!(buffer.backlog_len(), 0);
    }

    #[test]
    fn test_reset_is_opt_in() {
        let buffer = FrameBuffer::new();
        buffer.write(&[0x02]);
        buffer.reset();
        assert!(buffer.is_errored());

        let (resettable, seen) = collecting();
        let resettable = resettable.resettable(true);
        resettable.write(&[0x02]);
        resettable.reset();
        assert!(!resettable.is_errored());
        resettable.write(&frame(1, 0, b"again"));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
