use std::fmt;

use crate::poll::Descriptor;

/// Readiness of one registered socket, as handed to its callback.
///
/// Both multiplexers produce this: the mio reactor from an OS event, the
/// blocking fallback from the outcome of a `peek`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    descriptor: Descriptor,
    readable: bool,
    hang_up: bool,
    error: bool,
    timed_out: bool,
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Readiness")
            .field("descriptor", &self.descriptor)
            .field("readable", &self.readable)
            .field("hang_up", &self.hang_up)
            .field("error", &self.error)
            .field("timed_out", &self.timed_out)
            .finish()
    }
}

impl Readiness {
    pub fn readable(descriptor: Descriptor) -> Self {
        Self {
            descriptor,
            readable: true,
            hang_up: false,
            error: false,
            timed_out: false,
        }
    }

    pub fn hang_up(descriptor: Descriptor) -> Self {
        Self {
            descriptor,
            readable: true,
            hang_up: true,
            error: false,
            timed_out: false,
        }
    }

    pub fn timed_out(descriptor: Descriptor) -> Self {
        Self {
            descriptor,
            readable: false,
            hang_up: false,
            error: false,
            timed_out: true,
        }
    }

    pub fn descriptor(&self) -> Descriptor {
        self.descriptor
    }

    pub fn is_readable(&self) -> bool {
        self.readable
    }

    /// Peer closed its write half (or both halves).
    pub fn is_hang_up(&self) -> bool {
        self.hang_up
    }

    pub fn is_error(&self) -> bool {
        self.error
    }

    /// The read deadline passed without any data.
    pub fn is_timed_out(&self) -> bool {
        self.timed_out
    }
}

impl From<&mio::event::Event> for Readiness {
    fn from(event: &mio::event::Event) -> Self {
        Self {
            descriptor: Descriptor::from(event.token()),
            readable: event.is_readable() || event.is_read_closed(),
            hang_up: event.is_read_closed(),
            error: event.is_error(),
            timed_out: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors() {
        let d = Descriptor::new(7);
        let r = Readiness::readable(d);
        assert!(r.is_readable() && !r.is_hang_up() && !r.is_timed_out());
        assert_eq!(r.descriptor(), d);

        let h = Readiness::hang_up(d);
        assert!(h.is_readable() && h.is_hang_up());

        let t = Readiness::timed_out(d);
        assert!(!t.is_readable() && t.is_timed_out() && !t.is_error());
    }
}
