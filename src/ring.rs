//! Ring buffer: the bounded, backpressuring channel that links adjacent
//! pipeline stages (spec §2 "Ring buffer").
//!
//! Built on `crossbeam_channel::bounded`, which already implements the
//! blocking-producer / blocking-consumer semantics the spec calls for; this
//! module adds the pipeline's naming, capacity defaults, and multi-producer
//! termination-refcounting on top.

use crossbeam_channel::{Receiver, RecvError, SendError, Sender, TryRecvError};

/// Default ring capacity, matching the reference implementation's default
/// (spec §2).
pub const DEFAULT_CAPACITY: usize = 8192;

/// Rings smaller than this thrash on every single message; reject them at
/// construction instead of producing a pipeline that livelocks under load.
pub const MIN_CAPACITY: usize = 128;

/// Creates a ring buffer of `capacity` slots, shared by `producers` upstream
/// stages (spec §2: "a ring may have one or more producers; it has exactly
/// one consumer"). Returns the producer and consumer handles.
pub fn new<T: Send>(capacity: usize, producers: usize) -> (Producer<T>, Consumer<T>) {
    assert!(producers >= 1, "a ring must have at least one producer");
    let capacity = capacity.max(MIN_CAPACITY);
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    (Producer { tx }, Consumer { rx })
}

/// The sending half of a ring. `Clone` to hand a copy to each of several
/// concurrent upstream stages (spec §2 multi-producer mode). `recv` on the
/// paired [`Consumer`] only ends once every clone has been dropped —
/// `crossbeam_channel` already tracks open senders for this, so no extra
/// refcounting is needed here.
#[derive(Clone)]
pub struct Producer<T> {
    tx: Sender<T>,
}

impl<T: Send> Producer<T> {
    /// Blocks until there is room, or the consumer has gone away.
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        self.tx.send(value)
    }

    /// Non-blocking variant used by stages that must also watch a
    /// feedback pipe or a shutdown signal while producing.
    pub fn try_send(&self, value: T) -> Result<(), crossbeam_channel::TrySendError<T>> {
        self.tx.try_send(value)
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.tx.capacity()
    }
}

/// The receiving half of a ring. Exactly one per ring (spec §2); not
/// `Clone`.
pub struct Consumer<T> {
    rx: Receiver<T>,
}

impl<T: Send> Consumer<T> {
    /// Blocks until a message is available, or every producer has been
    /// dropped (graceful end-of-stream).
    pub fn recv(&self) -> Result<T, RecvError> {
        self.rx.recv()
    }

    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        self.rx.try_recv()
    }

    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Result<T, crossbeam_channel::RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// A plain `Receiver` clone for use in `crossbeam_channel::select!` when
    /// a stage also listens on a feedback pipe. Does not violate the
    /// single-consumer rule in practice since a ring's owning stage is the
    /// only thing holding this handle.
    pub fn receiver(&self) -> &Receiver<T> {
        &self.rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_clamped_to_minimum() {
        let (p, _c) = new::<u32>(4, 1);
        assert_eq!(p.capacity(), Some(MIN_CAPACITY));
    }

    #[test]
    fn send_then_recv_round_trips() {
        let (p, c) = new::<u32>(DEFAULT_CAPACITY, 1);
        p.send(42).unwrap();
        assert_eq!(c.recv().unwrap(), 42);
    }

    #[test]
    fn consumer_recv_ends_when_all_producers_drop() {
        let (p, c) = new::<u32>(DEFAULT_CAPACITY, 1);
        drop(p);
        assert!(c.recv().is_err());
    }

    #[test]
    fn multi_producer_clones_share_one_ring() {
        let (p1, c) = new::<u32>(DEFAULT_CAPACITY, 2);
        let p2 = p1.clone();
        p1.send(1).unwrap();
        p2.send(2).unwrap();
        let mut got = vec![c.recv().unwrap(), c.recv().unwrap()];
        got.sort();
        assert_eq!(got, vec![1, 2]);
    }
}
