//! Shared I/O Rings
//!
//! An `IoChannel` connects a module's execution context with its relay:
//! - stdout ring: module writes, relay reads
//! - stdin ring: relay writes, module reads
//! - signal word: out-of-band signals (quit, ...) raised towards the module
//!
//! Each ring is a fixed-capacity single-producer/single-consumer byte queue.
//! Positions are monotonically increasing `u64` counters; the producer owns
//! `write_pos`, the consumer owns `read_pos`, and each publishes with
//! Release and observes the other with Acquire. The halves are not `Clone`
//! and their mutating methods take `&mut self`, so one producer and one
//! consumer per ring is enforced by the type system.
//!
//! A full ring rejects writes (`try_write` returns 0) until the consumer
//! frees space; nothing is ever overwritten or reordered.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;

pub const DEFAULT_CAPACITY: usize = 64 * 1024;

/// Busy-poll attempts before a blocked writer parks on the notifier.
const SPIN_LIMIT: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("ring closed by peer")]
pub struct RingClosed;

struct Ring {
    buf: Box<[UnsafeCell<u8>]>,
    write_pos: AtomicU64,
    read_pos: AtomicU64,
    closed: AtomicBool,
    data_ready: Notify,
    space_ready: Notify,
}

// Bytes in [read_pos, write_pos) belong to the consumer, the rest to the
// producer; positions are only advanced after the copy completes.
unsafe impl Sync for Ring {}

impl Ring {
    fn new(capacity: usize) -> Arc<Self> {
        assert!(capacity > 0, "ring capacity must be non-zero");
        let buf = (0..capacity)
            .map(|_| UnsafeCell::new(0u8))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Arc::new(Self {
            buf,
            write_pos: AtomicU64::new(0),
            read_pos: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            data_ready: Notify::new(),
            space_ready: Notify::new(),
        })
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn base(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.buf.as_ptr())
    }

    fn used(&self) -> usize {
        // read_pos first: it never passes a write_pos loaded after it
        let r = self.read_pos.load(Ordering::Acquire);
        let w = self.write_pos.load(Ordering::Acquire);
        (w - r) as usize
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.data_ready.notify_one();
        self.space_ready.notify_one();
    }

    /// Producer side. Copies as much of `input` as fits and returns the count.
    fn push(&self, input: &[u8]) -> usize {
        let cap = self.capacity();
        let r = self.read_pos.load(Ordering::Acquire);
        let w = self.write_pos.load(Ordering::Relaxed);
        let free = cap - (w - r) as usize;
        let n = free.min(input.len());
        if n == 0 {
            return 0;
        }

        let start = (w % cap as u64) as usize;
        let first = n.min(cap - start);
        unsafe {
            ptr::copy_nonoverlapping(input.as_ptr(), self.base().add(start), first);
            if first < n {
                ptr::copy_nonoverlapping(input.as_ptr().add(first), self.base(), n - first);
            }
        }

        self.write_pos.store(w + n as u64, Ordering::Release);
        self.data_ready.notify_one();
        n
    }

    /// Consumer side. Copies up to `out.len()` bytes and returns the count.
    fn pop(&self, out: &mut [u8]) -> usize {
        let cap = self.capacity();
        let w = self.write_pos.load(Ordering::Acquire);
        let r = self.read_pos.load(Ordering::Relaxed);
        let n = ((w - r) as usize).min(out.len());
        if n == 0 {
            return 0;
        }

        let start = (r % cap as u64) as usize;
        let first = n.min(cap - start);
        unsafe {
            ptr::copy_nonoverlapping(self.base().add(start), out.as_mut_ptr(), first);
            if first < n {
                ptr::copy_nonoverlapping(self.base(), out.as_mut_ptr().add(first), n - first);
            }
        }

        self.read_pos.store(r + n as u64, Ordering::Release);
        self.space_ready.notify_one();
        n
    }
}

/// Producing half of a ring.
pub struct RingWriter {
    ring: Arc<Ring>,
}

impl RingWriter {
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Free space currently available to the producer.
    pub fn available(&self) -> usize {
        self.ring.capacity() - self.ring.used()
    }

    /// Write as much as fits without waiting. Returns 0 when the ring is full.
    pub fn try_write(&mut self, data: &[u8]) -> Result<usize, RingClosed> {
        if self.ring.is_closed() {
            return Err(RingClosed);
        }
        Ok(self.ring.push(data))
    }

    /// Write all of `data`, waiting for the consumer whenever the ring is full.
    pub async fn write_all(&mut self, mut data: &[u8]) -> Result<(), RingClosed> {
        let mut spins = 0;
        while !data.is_empty() {
            if self.ring.is_closed() {
                return Err(RingClosed);
            }
            let n = self.ring.push(data);
            if n > 0 {
                data = &data[n..];
                spins = 0;
            } else if spins < SPIN_LIMIT {
                spins += 1;
                std::hint::spin_loop();
            } else {
                self.ring.space_ready.notified().await;
            }
        }
        Ok(())
    }
}

impl Drop for RingWriter {
    fn drop(&mut self) {
        self.ring.close();
    }
}

/// Consuming half of a ring.
pub struct RingReader {
    ring: Arc<Ring>,
}

impl RingReader {
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Bytes waiting to be read.
    pub fn available(&self) -> usize {
        self.ring.used()
    }

    /// Read whatever is buffered without waiting. Returns 0 when empty.
    pub fn try_read(&mut self, out: &mut [u8]) -> usize {
        self.ring.pop(out)
    }

    /// Wait for data. Returns `Ok(0)` once the writer is gone and the ring
    /// is drained.
    pub async fn read(&mut self, out: &mut [u8]) -> Result<usize, RingClosed> {
        if out.is_empty() {
            return Ok(0);
        }
        loop {
            let n = self.ring.pop(out);
            if n > 0 {
                return Ok(n);
            }
            if self.ring.is_closed() {
                // the writer may have pushed right before closing
                return Ok(self.ring.pop(out));
            }
            self.ring.data_ready.notified().await;
        }
    }
}

impl Drop for RingReader {
    fn drop(&mut self) {
        self.ring.close();
    }
}

fn ring(capacity: usize) -> (RingWriter, RingReader) {
    let ring = Ring::new(capacity);
    (
        RingWriter { ring: ring.clone() },
        RingReader { ring },
    )
}

/// Out-of-band signal delivered to a running module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Signal {
    /// Stop and, if the runtime supports it, hand back an execution snapshot.
    Quit = 1,
    Interrupt = 1 << 1,
    Kill = 1 << 2,
}

impl Signal {
    fn bit(self) -> u32 {
        self as u32
    }

    fn from_bit(bit: u32) -> Option<Self> {
        match bit {
            1 => Some(Signal::Quit),
            2 => Some(Signal::Interrupt),
            4 => Some(Signal::Kill),
            _ => None,
        }
    }
}

struct SignalWord {
    pending: AtomicU32,
    notify: Notify,
}

/// Raises signals towards a module. Cloneable; both node and relay hold one.
#[derive(Clone)]
pub struct SignalSender {
    word: Arc<SignalWord>,
}

impl SignalSender {
    pub fn raise(&self, signal: Signal) {
        self.word.pending.fetch_or(signal.bit(), Ordering::AcqRel);
        self.word.notify.notify_one();
    }
}

/// Module-side view of the signal word.
pub struct SignalReceiver {
    word: Arc<SignalWord>,
}

impl SignalReceiver {
    /// Take one pending signal, lowest bit first.
    pub fn try_recv(&mut self) -> Option<Signal> {
        let mut current = self.word.pending.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return None;
            }
            let bit = current & current.wrapping_neg();
            match self.word.pending.compare_exchange_weak(
                current,
                current & !bit,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Signal::from_bit(bit),
                Err(actual) => current = actual,
            }
        }
    }

    pub async fn recv(&mut self) -> Signal {
        loop {
            if let Some(signal) = self.try_recv() {
                return signal;
            }
            self.word.notify.notified().await;
        }
    }
}

/// Module end of an `IoChannel`.
pub struct ModuleSide {
    pub stdout: RingWriter,
    pub stdin: RingReader,
    pub signals: SignalReceiver,
}

/// Relay end of an `IoChannel`.
pub struct RelaySide {
    pub stdout: RingReader,
    pub stdin: RingWriter,
}

/// A freshly allocated channel, ready to be split between its owners.
pub struct IoChannel {
    pub module: ModuleSide,
    pub relay: RelaySide,
    pub signals: SignalSender,
}

impl IoChannel {
    pub fn new(capacity: usize) -> Self {
        let (stdout_writer, stdout_reader) = ring(capacity);
        let (stdin_writer, stdin_reader) = ring(capacity);
        let word = Arc::new(SignalWord {
            pending: AtomicU32::new(0),
            notify: Notify::new(),
        });

        Self {
            module: ModuleSide {
                stdout: stdout_writer,
                stdin: stdin_reader,
                signals: SignalReceiver { word: word.clone() },
            },
            relay: RelaySide {
                stdout: stdout_reader,
                stdin: stdin_writer,
            },
            signals: SignalSender { word },
        }
    }
}

impl Default for IoChannel {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_wraparound_preserves_order() {
        let (mut tx, mut rx) = ring(8);
        let mut out = [0u8; 8];

        assert_eq!(tx.try_write(b"abcdef").unwrap(), 6);
        assert_eq!(rx.try_read(&mut out[..4]), 4);
        assert_eq!(&out[..4], b"abcd");

        // wraps past the end of the buffer
        assert_eq!(tx.try_write(b"ghijkl").unwrap(), 6);
        assert_eq!(rx.available(), 8);
        assert_eq!(rx.try_read(&mut out), 8);
        assert_eq!(&out, b"efghijkl");
    }

    #[test]
    fn test_full_ring_rejects_write() {
        let (mut tx, mut rx) = ring(4);
        assert_eq!(tx.try_write(b"123456").unwrap(), 4);
        assert_eq!(tx.try_write(b"7").unwrap(), 0);
        assert_eq!(tx.available(), 0);

        let mut out = [0u8; 4];
        assert_eq!(rx.try_read(&mut out), 4);
        assert_eq!(&out, b"1234");
        assert_eq!(rx.try_read(&mut out), 0);
    }

    #[tokio::test]
    async fn test_write_all_waits_for_space() {
        let (mut tx, mut rx) = ring(8);
        assert_eq!(tx.try_write(b"01234567").unwrap(), 8);

        let writer = tokio::spawn(async move {
            tx.write_all(b"89").await.unwrap();
            tx
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());

        let mut out = [0u8; 8];
        assert_eq!(rx.read(&mut out).await.unwrap(), 8);
        assert_eq!(&out, b"01234567");

        let _tx = writer.await.unwrap();
        assert_eq!(rx.read(&mut out).await.unwrap(), 2);
        assert_eq!(&out[..2], b"89");
    }

    #[tokio::test]
    async fn test_reader_drains_then_sees_eof() {
        let (mut tx, mut rx) = ring(16);
        tx.write_all(b"bye").await.unwrap();
        drop(tx);

        let mut out = [0u8; 16];
        assert_eq!(rx.read(&mut out).await.unwrap(), 3);
        assert_eq!(rx.read(&mut out).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_writer_fails_after_reader_drop() {
        let (mut tx, rx) = ring(4);
        drop(rx);
        assert_eq!(tx.try_write(b"x"), Err(RingClosed));
        assert_eq!(tx.write_all(b"x").await, Err(RingClosed));
    }

    #[tokio::test]
    async fn test_large_transfer_across_tasks() {
        let (mut tx, mut rx) = ring(64);
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let producer = tokio::spawn(async move {
            for chunk in payload.chunks(37) {
                tx.write_all(chunk).await.unwrap();
            }
        });

        let mut received = Vec::new();
        let mut buf = [0u8; 50];
        loop {
            let n = rx.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }
        producer.await.unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_signals_delivered_once() {
        let channel = IoChannel::new(16);
        let mut receiver = channel.module.signals;
        assert_eq!(receiver.try_recv(), None);

        channel.signals.raise(Signal::Quit);
        channel.signals.raise(Signal::Quit);
        assert_eq!(receiver.recv().await, Signal::Quit);
        assert_eq!(receiver.try_recv(), None);

        channel.signals.raise(Signal::Kill);
        channel.signals.raise(Signal::Interrupt);
        assert_eq!(receiver.try_recv(), Some(Signal::Interrupt));
        assert_eq!(receiver.try_recv(), Some(Signal::Kill));
    }
}
