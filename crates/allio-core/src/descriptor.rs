//! Per-(multiplexer, object, operation) dispatch.
//!
//! Each backend fills a `RelationTable` with one `Descriptor` per supported
//! `(ObjectKind, OperationKind)` pair. A descriptor is three plain function
//! pointers:
//!
//! - `submit`: start the operation. Either finishes inline and returns
//!   `Submission::Ready`, or hands the request to the kernel and returns
//!   `Submission::Pending`. An `Err` is a synchronous failure: nothing was
//!   issued and no listener callback will follow.
//! - `notify`: decode a kernel completion for this operation. May re-issue
//!   the request (e.g. an auto-reset event lost a race) and return
//!   `Notified::Resubmitted`.
//! - `cancel`: best-effort, idempotent request to stop in-flight work. The
//!   outcome still arrives through `notify` (or the backend's own
//!   completion path), exactly once.
//!
//! Lookup is two array indexes, so handle code never needs to know which
//! backend it is bound to.

use std::fmt;

use crate::error::{Error, Result};
use crate::operation::{Completion, ObjectKind, OperationKind, OperationRef};

/// A backend that can be described by a relation table.
pub trait Backend {
    /// What the kernel reports for one completion (io_uring: the CQE
    /// result, epoll: readiness bits, IOCP: the packet).
    type Status: Copy + fmt::Debug;
}

/// Outcome of `submit`.
#[derive(Debug)]
pub enum Submission {
    /// Issued; the result arrives through `notify`.
    Pending,
    /// Finished inline without a kernel round trip.
    Ready(Result<Completion>),
}

/// Outcome of `notify`.
#[derive(Debug)]
pub enum Notified {
    Ready(Result<Completion>),
    /// Re-issued; another completion will follow.
    Resubmitted,
}

pub type SubmitFn<M> = fn(&mut M, &OperationRef) -> Result<Submission>;
pub type NotifyFn<M> = fn(&mut M, &OperationRef, <M as Backend>::Status) -> Notified;
pub type CancelFn<M> = fn(&mut M, &OperationRef);

pub struct Descriptor<M: Backend> {
    pub object: ObjectKind,
    pub operation: OperationKind,
    pub submit: SubmitFn<M>,
    pub notify: NotifyFn<M>,
    pub cancel: CancelFn<M>,
    /// `submit` always completes inline on the calling thread.
    pub synchronous: bool,
}

impl<M: Backend> Descriptor<M> {
    pub fn new(
        object: ObjectKind,
        operation: OperationKind,
        submit: SubmitFn<M>,
        notify: NotifyFn<M>,
        cancel: CancelFn<M>,
    ) -> Self {
        Self {
            object,
            operation,
            submit,
            notify,
            cancel,
            synchronous: false,
        }
    }

    /// Descriptor whose `submit` runs the operation to completion inline.
    /// `notify` is never reached and `cancel` has nothing to stop.
    pub fn synchronous(object: ObjectKind, operation: OperationKind, submit: SubmitFn<M>) -> Self {
        Self {
            object,
            operation,
            submit,
            notify: unexpected_notify::<M>,
            cancel: |_, _| {},
            synchronous: true,
        }
    }
}

fn unexpected_notify<M: Backend>(_: &mut M, op: &OperationRef, status: M::Status) -> Notified {
    crate::kwarn!("completion {:?} for synchronous {:?}", status, op);
    Notified::Ready(Err(Error::UnknownFailure))
}

impl<M: Backend> Clone for Descriptor<M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M: Backend> Copy for Descriptor<M> {}

impl<M: Backend> fmt::Debug for Descriptor<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("object", &self.object)
            .field("operation", &self.operation)
            .field("synchronous", &self.synchronous)
            .finish()
    }
}

/// `(ObjectKind, OperationKind) -> Descriptor` table.
pub struct RelationTable<M: Backend> {
    entries: [[Option<Descriptor<M>>; OperationKind::COUNT]; ObjectKind::COUNT],
}

impl<M: Backend> RelationTable<M> {
    pub fn new() -> Self {
        Self {
            entries: [[None; OperationKind::COUNT]; ObjectKind::COUNT],
        }
    }

    /// Add or replace the descriptor for its pair.
    pub fn register(&mut self, descriptor: Descriptor<M>) {
        self.entries[descriptor.object.index()][descriptor.operation.index()] = Some(descriptor);
    }

    #[must_use]
    pub fn with(mut self, descriptor: Descriptor<M>) -> Self {
        self.register(descriptor);
        self
    }

    pub fn lookup(&self, object: ObjectKind, operation: OperationKind) -> Result<Descriptor<M>> {
        self.entries[object.index()][operation.index()]
            .ok_or(Error::UnsupportedMultiplexerHandleRelation)
    }

    pub fn supports(&self, object: ObjectKind, operation: OperationKind) -> bool {
        self.entries[object.index()][operation.index()].is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Descriptor<M>> {
        self.entries.iter().flatten().flatten()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<M: Backend> Default for RelationTable<M> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fake {
        submitted: usize,
    }

    impl Backend for Fake {
        type Status = i32;
    }

    fn submit(m: &mut Fake, _: &OperationRef) -> Result<Submission> {
        m.submitted += 1;
        Ok(Submission::Pending)
    }

    fn notify(_: &mut Fake, _: &OperationRef, res: i32) -> Notified {
        Notified::Ready(Ok(Completion::Transferred(res as usize)))
    }

    fn cancel(_: &mut Fake, _: &OperationRef) {}

    #[test]
    fn test_lookup_missing_relation() {
        let table = RelationTable::<Fake>::new();
        assert!(table.is_empty());
        assert_eq!(
            table.lookup(ObjectKind::File, OperationKind::ReadAt).err(),
            Some(Error::UnsupportedMultiplexerHandleRelation)
        );
    }

    #[test]
    fn test_register_and_lookup() {
        let table = RelationTable::<Fake>::new()
            .with(Descriptor::new(ObjectKind::File, OperationKind::ReadAt, submit, notify, cancel))
            .with(Descriptor::synchronous(ObjectKind::File, OperationKind::WriteAt, submit));
        assert_eq!(table.len(), 2);
        assert!(table.supports(ObjectKind::File, OperationKind::ReadAt));
        assert!(!table.supports(ObjectKind::Pipe, OperationKind::ReadAt));
        let d = table.lookup(ObjectKind::File, OperationKind::WriteAt).unwrap();
        assert!(d.synchronous);
        assert_eq!(d.operation, OperationKind::WriteAt);
    }
}
