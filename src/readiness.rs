//! Platform I/O readiness facility: `create`/`destroy`/`add`/`remove`/`wait`
//! over a set of raw file descriptors, backed concretely by `mio::Poll`.
//!
//! Uses raw-fd `SourceFd` registration rather than `mio::net::Tcp*`/`Unix*`
//! registration, since the links here wrap `std::os::unix::net` sockets.

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::error::{GrachtError, Result};

/// Readiness bits reported for a handle: `IN` (readable) and `DISCONNECT`
/// (peer closed / hangup).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMask {
    bits: u8,
}

impl EventMask {
    pub const NONE: EventMask = EventMask { bits: 0 };
    pub const IN: EventMask = EventMask { bits: 0b01 };
    pub const DISCONNECT: EventMask = EventMask { bits: 0b10 };

    fn union(self, other: EventMask) -> EventMask {
        EventMask { bits: self.bits | other.bits }
    }

    pub fn contains(self, other: EventMask) -> bool {
        self.bits & other.bits == other.bits
    }

    pub fn is_empty(self) -> bool {
        self.bits == 0
    }
}

/// One readiness notification for a single handle.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessEvent {
    pub handle: RawFd,
    pub mask: EventMask,
}

/// Concrete readiness facility, one per server instance.
pub struct Readiness {
    poll: Poll,
    events: Events,
    next_token: usize,
    tokens: std::collections::HashMap<Token, RawFd>,
    handle_tokens: std::collections::HashMap<RawFd, Token>,
}

impl Readiness {
    /// Creates a fresh readiness facility capable of holding up to
    /// `max_events` notifications per `wait` call.
    pub fn create(max_events: usize) -> Result<Self> {
        let poll = Poll::new()?;
        Ok(Readiness {
            poll,
            events: Events::with_capacity(max_events),
            next_token: 0,
            tokens: std::collections::HashMap::new(),
            handle_tokens: std::collections::HashMap::new(),
        })
    }

    /// Registers `handle` for readability notifications.
    pub fn add(&mut self, handle: RawFd) -> Result<()> {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.poll
            .registry()
            .register(&mut SourceFd(&handle), token, Interest::READABLE)
            .map_err(GrachtError::from)?;
        self.tokens.insert(token, handle);
        self.handle_tokens.insert(handle, token);
        Ok(())
    }

    /// Deregisters `handle`. No-op if it was never added.
    pub fn remove(&mut self, handle: RawFd) -> Result<()> {
        if let Some(token) = self.handle_tokens.remove(&handle) {
            self.tokens.remove(&token);
            let _ = self.poll.registry().deregister(&mut SourceFd(&handle));
        }
        Ok(())
    }

    /// Blocks (with an optional timeout) until at least one handle is
    /// ready, then returns the set of `{handle, mask}` events observed,
    /// capped at the `max_events` given to `create`.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<ReadinessEvent>> {
        self.poll.poll(&mut self.events, timeout)?;
        let mut out = Vec::with_capacity(self.events.iter().count());
        for event in self.events.iter() {
            let Some(&handle) = self.tokens.get(&event.token()) else {
                continue;
            };
            let mut mask = EventMask::NONE;
            if event.is_readable() {
                mask = mask.union(EventMask::IN);
            }
            if event.is_read_closed() || event.is_error() {
                mask = mask.union(EventMask::DISCONNECT);
            }
            // A bare wakeup with no explicit bits set is treated as readable.
            if mask.is_empty() {
                mask = EventMask::IN;
            }
            out.push(ReadinessEvent { handle, mask });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn wait_reports_readable_on_data_available() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let mut readiness = Readiness::create(32).unwrap();
        readiness.add(a.as_raw_fd()).unwrap();

        b.write_all(b"x").unwrap();

        let events = readiness.wait(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].handle, a.as_raw_fd());
        assert!(events[0].mask.contains(EventMask::IN));
    }

    #[test]
    fn wait_reports_disconnect_on_peer_close() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut readiness = Readiness::create(32).unwrap();
        readiness.add(a.as_raw_fd()).unwrap();

        drop(b);

        let events = readiness.wait(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].mask.contains(EventMask::DISCONNECT));
    }

    #[test]
    fn removed_handle_yields_no_further_events() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let mut readiness = Readiness::create(32).unwrap();
        readiness.add(a.as_raw_fd()).unwrap();
        readiness.remove(a.as_raw_fd()).unwrap();

        b.write_all(b"x").unwrap();

        let events = readiness.wait(Some(Duration::from_millis(100))).unwrap();
        assert!(events.is_empty());
    }
}
