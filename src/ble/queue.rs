//! GATT operation queue
//!
//! A link tolerates one outstanding GATT request. The queue holds that
//! request in an in-flight slot until the transport acknowledges it, and
//! optionally a bounded FIFO backlog behind it. When both are full new work
//! is refused with [`BleError::Busy`] instead of displacing anything.

use std::collections::VecDeque;

use tokio::sync::oneshot;
use uuid::Uuid;

use super::transport::WriteKind;
use super::BleError;

/// What a pending operation does on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    DescriptorWrite { descriptor: Uuid },
    CharacteristicWrite { kind: WriteKind },
    CharacteristicRead,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOperation {
    pub kind: OperationKind,
    pub characteristic: Uuid,
    pub payload: Vec<u8>,
}

impl PendingOperation {
    pub fn descriptor_write(characteristic: Uuid, descriptor: Uuid, payload: Vec<u8>) -> Self {
        Self {
            kind: OperationKind::DescriptorWrite { descriptor },
            characteristic,
            payload,
        }
    }

    pub fn characteristic_write(characteristic: Uuid, payload: Vec<u8>, kind: WriteKind) -> Self {
        Self {
            kind: OperationKind::CharacteristicWrite { kind },
            characteristic,
            payload,
        }
    }

    pub fn characteristic_read(characteristic: Uuid) -> Self {
        Self {
            kind: OperationKind::CharacteristicRead,
            characteristic,
            payload: Vec::new(),
        }
    }
}

/// Successful completion of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpOutcome {
    Written,
    Read(Vec<u8>),
}

pub type OpReply = oneshot::Sender<Result<OpOutcome, BleError>>;

/// An operation together with whoever is waiting on it. Internal operations
/// (the CCCD write during setup) carry no reply channel.
#[derive(Debug)]
pub struct QueuedOperation {
    pub op: PendingOperation,
    pub reply: Option<OpReply>,
}

impl QueuedOperation {
    pub fn new(op: PendingOperation, reply: Option<OpReply>) -> Self {
        Self { op, reply }
    }

    /// Deliver the result to the waiter, if one is still listening.
    pub fn resolve(self, result: Result<OpOutcome, BleError>) {
        if let Some(reply) = self.reply {
            let _ = reply.send(result);
        }
    }
}

#[derive(Debug)]
pub struct GattQueue {
    in_flight: Option<QueuedOperation>,
    backlog: VecDeque<QueuedOperation>,
    depth: usize,
}

impl GattQueue {
    /// `depth` is the number of operations allowed to wait behind the one
    /// in flight. Zero makes the queue a single slot.
    pub fn new(depth: usize) -> Self {
        Self {
            in_flight: None,
            backlog: VecDeque::with_capacity(depth),
            depth,
        }
    }

    /// Accept an operation. Returns `true` when it went straight into the
    /// in-flight slot and must be dispatched now.
    ///
    /// On `Busy` the operation is handed back untouched so the caller can
    /// resolve its waiter.
    pub fn enqueue(&mut self, entry: QueuedOperation) -> Result<bool, (BleError, QueuedOperation)> {
        if self.in_flight.is_none() {
            self.in_flight = Some(entry);
            return Ok(true);
        }
        if self.backlog.len() >= self.depth {
            return Err((BleError::Busy, entry));
        }
        self.backlog.push_back(entry);
        Ok(false)
    }

    pub fn in_flight(&self) -> Option<&PendingOperation> {
        self.in_flight.as_ref().map(|e| &e.op)
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none()
    }

    pub fn len(&self) -> usize {
        self.backlog.len() + usize::from(self.in_flight.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take the in-flight operation on acknowledgement.
    pub fn complete(&mut self) -> Option<QueuedOperation> {
        self.in_flight.take()
    }

    /// Move the oldest waiting operation into the free in-flight slot and
    /// return it for dispatch.
    pub fn promote(&mut self) -> Option<&PendingOperation> {
        if self.in_flight.is_some() {
            return None;
        }
        self.in_flight = self.backlog.pop_front();
        self.in_flight()
    }

    /// Remove everything, in-flight first, for cancellation.
    pub fn drain(&mut self) -> Vec<QueuedOperation> {
        let mut all: Vec<QueuedOperation> = self.in_flight.take().into_iter().collect();
        all.extend(self.backlog.drain(..));
        all
    }
}
