//! Feedback pipe: the unbounded, never-blocking-on-write control channel that
//! runs upstream against the flow of data (spec §2 "Feedback pipe").
//!
//! Used for Garbage reclamation notices and termination acknowledgements,
//! which must never be able to deadlock against a full ring buffer going the
//! other way — hence unbounded rather than the bounded rings data flows
//! through.

use crossbeam_channel::{Receiver, RecvError, Sender, TryRecvError};

/// Creates a feedback pipe. Like a ring, one consumer; unlike a ring, any
/// number of producers may write without ever blocking.
pub fn new<T: Send>() -> (FeedbackTx<T>, FeedbackRx<T>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (FeedbackTx { tx }, FeedbackRx { rx })
}

#[derive(Clone)]
pub struct FeedbackTx<T> {
    tx: Sender<T>,
}

impl<T: Send> FeedbackTx<T> {
    /// Never blocks: an unbounded channel only fails to send if the
    /// receiver has already been dropped, which means the downstream stage
    /// has shut down and this notice can be discarded.
    pub fn send(&self, value: T) -> bool {
        self.tx.send(value).is_ok()
    }
}

pub struct FeedbackRx<T> {
    rx: Receiver<T>,
}

impl<T: Send> FeedbackRx<T> {
    pub fn recv(&self) -> Result<T, RecvError> {
        self.rx.recv()
    }

    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        self.rx.try_recv()
    }

    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Result<T, crossbeam_channel::RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    /// Drains every message currently queued without blocking, for a stage
    /// that wants to catch up on feedback in a burst between data messages.
    pub fn drain(&self) -> Vec<T> {
        let mut out = Vec::new();
        while let Ok(v) = self.rx.try_recv() {
            out.push(v);
        }
        out
    }

    pub fn receiver(&self) -> &Receiver<T> {
        &self.rx
    }
}
