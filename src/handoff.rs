//! Queue of staged dump paths handed from the download side to the analysis
//! workers, paired with the coordinator's completion flag.

use crate::signals::CompletionFlag;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::path::PathBuf;
use std::time::Duration;

/// Result of one dequeue attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Handoff {
    /// A staged dump, now owned by the caller.
    Staged(PathBuf),
    /// Nothing arrived within the poll interval but more input may follow.
    Idle,
    /// The queue is empty and no more input will arrive.
    Finished,
}

/// Unbounded FIFO shared by every worker of both pools. Cloning is cheap and
/// every clone refers to the same queue.
#[derive(Debug, Clone)]
pub struct HandoffQueue {
    sender: Sender<PathBuf>,
    receiver: Receiver<PathBuf>,
    done: CompletionFlag,
}

impl HandoffQueue {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            sender,
            receiver,
            done: CompletionFlag::new(),
        }
    }

    pub fn push(&self, path: PathBuf) {
        // Both ends live in `self`, so the channel cannot be disconnected here.
        let _ = self.sender.send(path);
    }

    /// Signals that no more paths will be pushed.
    pub fn close(&self) {
        self.done.mark_complete();
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_complete()
    }

    pub(crate) fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Takes the next staged path. An empty queue that has not been closed
    /// blocks for at most `poll_interval` before reporting [`Handoff::Idle`],
    /// so callers can re-check the fault flag between waits.
    pub fn next(&self, poll_interval: Duration) -> Handoff {
        match self.receiver.try_recv() {
            Ok(path) => return Handoff::Staged(path),
            Err(TryRecvError::Disconnected) => return Handoff::Finished,
            Err(TryRecvError::Empty) => {}
        }

        if self.done.is_complete() {
            // Pushes happen before the flag is raised, so one more look is
            // enough to catch anything that raced with the first check.
            return match self.receiver.try_recv() {
                Ok(path) => Handoff::Staged(path),
                Err(_) => Handoff::Finished,
            };
        }

        match self.receiver.recv_timeout(poll_interval) {
            Ok(path) => Handoff::Staged(path),
            Err(RecvTimeoutError::Timeout) => Handoff::Idle,
            Err(RecvTimeoutError::Disconnected) => Handoff::Finished,
        }
    }
}

impl Default for HandoffQueue {
    fn default() -> Self {
        Self::new()
    }
}
