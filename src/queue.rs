//! FIFO of outstanding commands.
//!
//! The daemon correlates responses to commands purely by order: the oldest
//! queued command owns the next non-unilateral response. Each slot holds a
//! oneshot sender that is consumed exactly once, either by the dispatcher
//! or by the failure fan-out.

use std::collections::VecDeque;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::Result;
use crate::pdu::Value;

/// Completion slot for one command's result.
pub type ResultSender = oneshot::Sender<Result<Value>>;

/// One enqueued command: its encoded payload and its result slot.
///
/// The sender is `None` once the result has been delivered; the entry stays
/// at the head of the queue until the dispatcher pops it, so that exactly
/// one party is responsible for sending the next command.
pub struct QueuedCommand {
    payload: Bytes,
    tx: Option<ResultSender>,
}

/// Order-preserving queue of commands awaiting responses.
#[derive(Default)]
pub struct CommandQueue {
    commands: VecDeque<QueuedCommand>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command. Returns `true` if the queue was empty beforehand,
    /// meaning the caller must trigger a send of this command.
    pub fn push(&mut self, payload: Bytes, tx: ResultSender) -> bool {
        let was_empty = self.commands.is_empty();
        self.commands.push_back(QueuedCommand {
            payload,
            tx: Some(tx),
        });
        was_empty
    }

    /// Payload of the command currently at the head, if any.
    pub fn head_payload(&self) -> Option<Bytes> {
        self.commands.front().map(|cmd| cmd.payload.clone())
    }

    /// Take the head command's result slot, leaving the command queued.
    ///
    /// Returns `None` when the queue is empty (a response with no matching
    /// command) or when the slot was already taken.
    pub fn take_head_tx(&mut self) -> Option<ResultSender> {
        self.commands.front_mut()?.tx.take()
    }

    /// Drop the head command after its response has been dispatched.
    pub fn pop_head(&mut self) {
        self.commands.pop_front();
    }

    /// Remove every queued command, yielding the result slots that have not
    /// been fulfilled yet.
    pub fn drain(&mut self) -> Vec<ResultSender> {
        self.commands.drain(..).filter_map(|cmd| cmd.tx).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }
}
