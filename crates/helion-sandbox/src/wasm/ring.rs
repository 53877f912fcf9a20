//! The synchronous host-call ring.
//!
//! One ring per app: a 64 KiB buffer with a three-word header
//! `[state, call_type, data_len]` and the payload region behind it. The
//! worker (guest thread) writes a request, flips `state` to PENDING, wakes
//! the kernel dispatcher, and blocks until `state` leaves PENDING. The
//! dispatcher reads, serves, writes the response, flips to READY, and wakes
//! the worker. Exactly one call is in flight per app at any time.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;

/// Total ring size.
pub const RING_BYTES: usize = 64 * 1024;
/// Header: state, call_type, data_len — three u32 words.
pub const HEADER_BYTES: usize = 12;
/// Largest payload the ring accepts.
pub const PAYLOAD_MAX: usize = RING_BYTES - HEADER_BYTES;

/// Ring states.
pub const STATE_IDLE: u32 = 0;
/// A request is waiting for the dispatcher.
pub const STATE_PENDING: u32 = 1;
/// A response is waiting for the worker.
pub const STATE_READY: u32 = 2;

/// Host call types carried in the ring header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum HostCallKind {
    /// Read a storage key.
    StorageGet = 1,
    /// Write a storage key.
    StorageSet = 2,
    /// Remove a storage key.
    StorageRemove = 3,
    /// List storage keys.
    StorageKeys = 4,
    /// Surface a notification to the shell.
    Notify = 5,
    /// Ask for an additional capability (always answered, never granted
    /// silently).
    CapRequest = 6,
    /// HTTP through the kernel.
    Fetch = 7,
}

impl HostCallKind {
    /// Decode a header word.
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            1 => HostCallKind::StorageGet,
            2 => HostCallKind::StorageSet,
            3 => HostCallKind::StorageRemove,
            4 => HostCallKind::StorageKeys,
            5 => HostCallKind::Notify,
            6 => HostCallKind::CapRequest,
            7 => HostCallKind::Fetch,
            _ => return None,
        })
    }
}

/// Ring call failures (worker side).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RingError {
    /// Payload exceeded [`PAYLOAD_MAX`].
    PayloadTooLarge(usize),
    /// The dispatcher is gone (app shutting down).
    Disconnected,
}

impl std::fmt::Display for RingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RingError::PayloadTooLarge(n) => {
                write!(f, "payload of {n} bytes exceeds ring capacity {PAYLOAD_MAX}")
            }
            RingError::Disconnected => write!(f, "host call dispatcher disconnected"),
        }
    }
}

/// The shared ring.
pub struct HostRing {
    state: AtomicU32,
    call_type: AtomicU32,
    data_len: AtomicU32,
    payload: Mutex<Box<[u8; PAYLOAD_MAX]>>,
    park: Mutex<()>,
    signal: Condvar,
    wake: Mutex<Option<Sender<()>>>,
}

impl HostRing {
    /// Create a ring plus the dispatcher's wake receiver.
    pub fn new() -> (Arc<Self>, Receiver<()>) {
        let (tx, rx) = std::sync::mpsc::channel();
        let ring = Arc::new(Self {
            state: AtomicU32::new(STATE_IDLE),
            call_type: AtomicU32::new(0),
            data_len: AtomicU32::new(0),
            payload: Mutex::new(Box::new([0u8; PAYLOAD_MAX])),
            park: Mutex::new(()),
            signal: Condvar::new(),
            wake: Mutex::new(Some(tx)),
        });
        (ring, rx)
    }

    /// Worker side: one synchronous call. Blocks until the dispatcher
    /// answers or disconnects.
    pub fn call(&self, kind: HostCallKind, payload: &[u8]) -> Result<Vec<u8>, RingError> {
        if payload.len() > PAYLOAD_MAX {
            return Err(RingError::PayloadTooLarge(payload.len()));
        }

        {
            let mut buf = self.payload.lock();
            buf[..payload.len()].copy_from_slice(payload);
        }
        self.data_len.store(payload.len() as u32, Ordering::Release);
        self.call_type.store(kind as u32, Ordering::Release);
        self.state.store(STATE_PENDING, Ordering::Release);

        // Wake the dispatcher, then wait until the state leaves PENDING.
        {
            let wake = self.wake.lock();
            match wake.as_ref() {
                Some(tx) if tx.send(()).is_ok() => {}
                _ => {
                    self.state.store(STATE_IDLE, Ordering::Release);
                    return Err(RingError::Disconnected);
                }
            }
        }

        let mut guard = self.park.lock();
        while self.state.load(Ordering::Acquire) == STATE_PENDING {
            self.signal.wait(&mut guard);
        }
        drop(guard);

        if self.state.load(Ordering::Acquire) != STATE_READY {
            return Err(RingError::Disconnected);
        }
        let len = self.data_len.load(Ordering::Acquire) as usize;
        let out = {
            let buf = self.payload.lock();
            buf[..len.min(PAYLOAD_MAX)].to_vec()
        };
        self.state.store(STATE_IDLE, Ordering::Release);
        Ok(out)
    }

    /// Dispatcher side: read the pending request, when there is one.
    pub fn take_request(&self) -> Option<(HostCallKind, Vec<u8>)> {
        if self.state.load(Ordering::Acquire) != STATE_PENDING {
            return None;
        }
        let kind = HostCallKind::from_u32(self.call_type.load(Ordering::Acquire))?;
        let len = self.data_len.load(Ordering::Acquire) as usize;
        let payload = {
            let buf = self.payload.lock();
            buf[..len.min(PAYLOAD_MAX)].to_vec()
        };
        Some((kind, payload))
    }

    /// Dispatcher side: write the response and wake the worker.
    pub fn respond(&self, response: &[u8]) {
        let len = response.len().min(PAYLOAD_MAX);
        {
            let mut buf = self.payload.lock();
            buf[..len].copy_from_slice(&response[..len]);
        }
        self.data_len.store(len as u32, Ordering::Release);
        self.state.store(STATE_READY, Ordering::Release);
        let _guard = self.park.lock();
        self.signal.notify_all();
    }

    /// Tear down: drop the wake channel and release any parked worker.
    pub fn disconnect(&self) {
        *self.wake.lock() = None;
        self.state.store(STATE_IDLE, Ordering::Release);
        let _guard = self.park.lock();
        self.signal.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn call_and_respond_round_trip() {
        let (ring, wake) = HostRing::new();
        let server_ring = Arc::clone(&ring);
        let server = thread::spawn(move || {
            wake.recv().unwrap();
            let (kind, payload) = server_ring.take_request().unwrap();
            assert_eq!(kind, HostCallKind::StorageGet);
            assert_eq!(payload, b"{\"key\":\"k\"}");
            server_ring.respond(b"{\"ok\":true}");
        });

        let out = ring.call(HostCallKind::StorageGet, b"{\"key\":\"k\"}").unwrap();
        assert_eq!(out, b"{\"ok\":true}");
        server.join().unwrap();
    }

    #[test]
    fn oversized_payload_refused() {
        let (ring, _wake) = HostRing::new();
        let big = vec![0u8; PAYLOAD_MAX + 1];
        assert_eq!(
            ring.call(HostCallKind::Notify, &big),
            Err(RingError::PayloadTooLarge(PAYLOAD_MAX + 1))
        );
    }

    #[test]
    fn max_payload_accepted() {
        let (ring, wake) = HostRing::new();
        let server_ring = Arc::clone(&ring);
        let server = thread::spawn(move || {
            wake.recv().unwrap();
            let (_, payload) = server_ring.take_request().unwrap();
            assert_eq!(payload.len(), PAYLOAD_MAX);
            server_ring.respond(b"ok");
        });
        let big = vec![7u8; PAYLOAD_MAX];
        assert_eq!(ring.call(HostCallKind::Notify, &big).unwrap(), b"ok");
        server.join().unwrap();
    }

    #[test]
    fn disconnect_unblocks_caller() {
        let (ring, wake) = HostRing::new();
        drop(wake);
        ring.disconnect();
        assert_eq!(
            ring.call(HostCallKind::Notify, b"x"),
            Err(RingError::Disconnected)
        );
    }

    #[test]
    fn sequential_calls_reuse_the_ring() {
        let (ring, wake) = HostRing::new();
        let server_ring = Arc::clone(&ring);
        let server = thread::spawn(move || {
            for i in 0..10u8 {
                wake.recv().unwrap();
                let (_, payload) = server_ring.take_request().unwrap();
                assert_eq!(payload, vec![i]);
                server_ring.respond(&[i, i]);
            }
        });
        for i in 0..10u8 {
            assert_eq!(ring.call(HostCallKind::Notify, &[i]).unwrap(), vec![i, i]);
        }
        server.join().unwrap();
    }
}
