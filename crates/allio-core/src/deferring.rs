//! Lifecycle bookkeeping shared by every backend.
//!
//! A backend owns one `DeferringEngine` and routes every status change
//! through it. The engine enforces owner and state checks on `start` and
//! `cancel`, posts status changes to the defer list and replays them in
//! `flush`, so listener callbacks look the same whether a result came back
//! inline from `submit` or later from the kernel.

use std::sync::Arc;

use crate::defer::{DeferList, Deferred};
use crate::descriptor::{Backend, Notified, RelationTable, Submission};
use crate::error::{Error, Result};
use crate::multiplexer::{MultiplexerId, PollStatistics, Started};
use crate::operation::{Completion, Listener, Operation, OperationRef, OperationStatus, Request};

/// What a backend must do for a `cancel` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelAction {
    /// First request for an in-flight operation: run the descriptor's cancel.
    Issue,
    /// Cancel already issued; nothing more to do.
    AlreadyRequested,
    /// A result is already known and will be kept.
    AlreadyDone,
}

pub struct DeferringEngine {
    id: MultiplexerId,
    deferred: DeferList<Operation>,
    /// Started and not yet concluded.
    outstanding: usize,
}

impl DeferringEngine {
    pub fn new() -> Self {
        Self {
            id: MultiplexerId::next(),
            deferred: DeferList::new(),
            outstanding: 0,
        }
    }

    #[inline]
    pub fn id(&self) -> MultiplexerId {
        self.id
    }

    /// Operations started and not yet concluded.
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    #[inline]
    pub fn has_deferred(&self) -> bool {
        !self.deferred.is_empty()
    }

    pub fn construct(&self, request: Request, listener: Option<Arc<dyn Listener>>) -> OperationRef {
        let op = Operation::new(request, listener);
        op.set_owner(self.id.as_usize());
        op
    }

    pub fn check_owner(&self, op: &Operation) -> Result<()> {
        if op.owner() != self.id.as_usize() {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    /// Validate an operation about to be submitted: ours, never started,
    /// and with a usable handle.
    pub fn begin(&self, op: &Operation) -> Result<()> {
        self.check_owner(op)?;
        if op.status() != OperationStatus::Constructed {
            return Err(Error::InvalidArgument);
        }
        if let Err(e) = op.handle().check_not_null() {
            op.retire(e);
            return Err(e);
        }
        Ok(())
    }

    /// Record what `submit` returned.
    ///
    /// A synchronous error retires the operation without callbacks and is
    /// handed back to the caller.
    pub fn submitted(&mut self, op: &OperationRef, submission: Result<Submission>) -> Result<Started> {
        match submission {
            Err(e) => {
                op.retire(e);
                Err(e)
            }
            Ok(Submission::Pending) => {
                self.outstanding += 1;
                self.deferred.post(op, OperationStatus::Submitted);
                Ok(Started::Pending)
            }
            Ok(Submission::Ready(result)) => {
                self.outstanding += 1;
                op.set_result(result);
                self.deferred.post(op, OperationStatus::Completed);
                Ok(Started::Ready)
            }
        }
    }

    /// Store a result delivered by the kernel. A result already present
    /// (e.g. from a cancel racing the completion) wins.
    pub fn complete(&self, op: &OperationRef, result: Result<Completion>) {
        op.set_result(result);
        self.deferred.post(op, OperationStatus::Completed);
    }

    pub fn cancel_action(&self, op: &Operation) -> Result<CancelAction> {
        self.check_owner(op)?;
        match op.status() {
            OperationStatus::Constructed => Err(Error::AsyncOperationNotInProgress),
            OperationStatus::Completed | OperationStatus::Concluded => Ok(CancelAction::AlreadyDone),
            OperationStatus::Submitted if op.has_result() => Ok(CancelAction::AlreadyDone),
            OperationStatus::Submitted => {
                if op.request_cancel() {
                    Ok(CancelAction::Issue)
                } else {
                    Ok(CancelAction::AlreadyRequested)
                }
            }
        }
    }

    /// Replay pending status changes to listeners. `Completed` is always
    /// followed by `Concluded` in the same flush.
    pub fn flush(&mut self) -> PollStatistics {
        let mut stats = PollStatistics::default();
        self.deferred.flush(|op, status| {
            match status {
                OperationStatus::Constructed => {}
                OperationStatus::Submitted => {
                    stats.submitted += 1;
                    if let Some(l) = op.listener() {
                        l.submitted(op);
                    }
                }
                OperationStatus::Completed => {
                    stats.completed += 1;
                    if let Some(l) = op.listener() {
                        l.completed(op);
                    }
                    op.defer_link().advance(OperationStatus::Concluded);
                }
                OperationStatus::Concluded => {
                    stats.concluded += 1;
                    if let Some(l) = op.listener() {
                        l.concluded(op);
                    }
                }
            }
        });
        self.outstanding = self.outstanding.saturating_sub(stats.concluded);
        stats
    }
}

impl Default for DeferringEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// A backend assembled from a `DeferringEngine` and a `RelationTable`.
///
/// The free functions below implement the table-driven parts of
/// `Multiplexer` once for every such backend.
pub trait Driven: Backend + Sized {
    fn engine(&self) -> &DeferringEngine;

    fn engine_mut(&mut self) -> &mut DeferringEngine;

    fn relations(&self) -> &RelationTable<Self>;
}

pub fn construct_operation<M: Driven>(
    mux: &mut M,
    request: Request,
    listener: Option<Arc<dyn Listener>>,
) -> Result<OperationRef> {
    mux.relations().lookup(request.object, request.kind())?;
    Ok(mux.engine().construct(request, listener))
}

pub fn start_operation<M: Driven>(mux: &mut M, op: &OperationRef) -> Result<Started> {
    mux.engine().begin(op)?;
    let descriptor = mux.relations().lookup(op.object(), op.kind())?;
    let submission = (descriptor.submit)(mux, op);
    mux.engine_mut().submitted(op, submission)
}

pub fn cancel_operation<M: Driven>(mux: &mut M, op: &OperationRef) -> Result<()> {
    if mux.engine().cancel_action(op)? == CancelAction::Issue {
        let descriptor = mux.relations().lookup(op.object(), op.kind())?;
        (descriptor.cancel)(mux, op);
    }
    Ok(())
}

/// Hand a kernel completion to the operation's descriptor. Returns true if
/// it produced the final result.
pub fn notify_operation<M: Driven>(mux: &mut M, op: &OperationRef, status: M::Status) -> bool {
    let descriptor = match mux.relations().lookup(op.object(), op.kind()) {
        Ok(d) => d,
        Err(e) => {
            mux.engine().complete(op, Err(e));
            return true;
        }
    };
    match (descriptor.notify)(mux, op, status) {
        Notified::Ready(result) => {
            mux.engine().complete(op, result);
            true
        }
        Notified::Resubmitted => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deadline::Deadline;
    use crate::descriptor::Descriptor;
    use crate::handle::{HandleFlags, NativeHandle};
    use crate::multiplexer::{Connector, Multiplexer};
    use crate::operation::{Arguments, ObjectKind, OperationKind};
    use std::sync::Mutex;

    /// In-memory backend: either completes in `submit` or queues the
    /// operation until `deliver`.
    struct Manual {
        engine: DeferringEngine,
        table: RelationTable<Manual>,
        inline: bool,
        queued: Vec<OperationRef>,
    }

    impl Backend for Manual {
        type Status = usize;
    }

    fn submit(m: &mut Manual, op: &OperationRef) -> Result<Submission> {
        if m.inline {
            return Ok(Submission::Ready(Ok(Completion::Transferred(5))));
        }
        m.queued.push(op.clone());
        Ok(Submission::Pending)
    }

    fn notify(_: &mut Manual, op: &OperationRef, n: usize) -> Notified {
        if op.is_cancel_requested() {
            return Notified::Ready(Err(Error::AsyncOperationCancelled));
        }
        Notified::Ready(Ok(Completion::Transferred(n)))
    }

    fn cancel(_: &mut Manual, _: &OperationRef) {}

    impl Manual {
        fn new(inline: bool) -> Self {
            Self {
                engine: DeferringEngine::new(),
                table: RelationTable::new().with(Descriptor::new(
                    ObjectKind::File,
                    OperationKind::ReadAt,
                    submit,
                    notify,
                    cancel,
                )),
                inline,
                queued: Vec::new(),
            }
        }

        /// Kernel completions arrive without a flush.
        fn deliver(&mut self) {
            for op in std::mem::take(&mut self.queued) {
                notify_operation(self, &op, 5);
            }
        }
    }

    impl Driven for Manual {
        fn engine(&self) -> &DeferringEngine {
            &self.engine
        }

        fn engine_mut(&mut self) -> &mut DeferringEngine {
            &mut self.engine
        }

        fn relations(&self) -> &RelationTable<Self> {
            &self.table
        }
    }

    impl Multiplexer for Manual {
        fn name(&self) -> &'static str {
            "manual"
        }

        fn id(&self) -> MultiplexerId {
            self.engine.id()
        }

        fn supports(&self, object: ObjectKind, operation: OperationKind) -> bool {
            self.table.supports(object, operation)
        }

        fn attach(&mut self, _: &NativeHandle, c: &mut Connector) -> Result<()> {
            c.bind(self.engine.id(), None)
        }

        fn detach(&mut self, _: &NativeHandle, c: &mut Connector) -> Result<()> {
            c.unbind(self.engine.id()).map(|_| ())
        }

        fn construct(&mut self, request: Request, listener: Option<Arc<dyn Listener>>) -> Result<OperationRef> {
            construct_operation(self, request, listener)
        }

        fn start(&mut self, op: &OperationRef) -> Result<Started> {
            start_operation(self, op)
        }

        fn cancel(&mut self, op: &OperationRef) -> Result<()> {
            cancel_operation(self, op)
        }

        fn poll(&mut self, _: Deadline) -> Result<PollStatistics> {
            self.deliver();
            Ok(self.engine.flush())
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<&'static str>>,
    }

    impl Listener for Recorder {
        fn submitted(&self, _: &Operation) {
            self.events.lock().unwrap().push("submitted");
        }
        fn completed(&self, _: &Operation) {
            self.events.lock().unwrap().push("completed");
        }
        fn concluded(&self, _: &Operation) {
            self.events.lock().unwrap().push("concluded");
        }
    }

    fn request(handle: NativeHandle) -> Request {
        Request::new(ObjectKind::File, handle, Arguments::ReadAt { offset: 0, buffer: vec![0; 8] })
    }

    fn valid() -> NativeHandle {
        NativeHandle::new(3, HandleFlags::NONE)
    }

    fn run(inline: bool) -> (Vec<&'static str>, PollStatistics) {
        let mut mux = Manual::new(inline);
        let recorder = Arc::new(Recorder::default());
        let (op, _) = mux.construct_and_start(request(valid()), Some(recorder.clone())).unwrap();
        let stats = mux.poll(Deadline::never()).unwrap();
        assert!(op.is_concluded());
        assert_eq!(op.outcome(), Ok(Completion::Transferred(5)));
        let events = recorder.events.lock().unwrap().clone();
        (events, stats)
    }

    #[test]
    fn test_sync_and_async_callbacks_match() {
        let (sync_events, sync_stats) = run(true);
        let (async_events, async_stats) = run(false);
        assert_eq!(sync_events, vec!["submitted", "completed", "concluded"]);
        assert_eq!(sync_events, async_events);
        assert_eq!(sync_stats, async_stats);
        assert_eq!(sync_stats, PollStatistics { submitted: 1, completed: 1, concluded: 1 });
    }

    #[test]
    fn test_started_reports_inline_completion() {
        let mut inline = Manual::new(true);
        let (_, started) = inline.construct_and_start(request(valid()), None).unwrap();
        assert_eq!(started, Started::Ready);
        let mut queued = Manual::new(false);
        let (_, started) = queued.construct_and_start(request(valid()), None).unwrap();
        assert_eq!(started, Started::Pending);
        assert_eq!(queued.engine.outstanding(), 1);
    }

    #[test]
    fn test_null_handle_fails_without_callbacks() {
        let mut mux = Manual::new(false);
        let recorder = Arc::new(Recorder::default());
        let op = mux.construct(request(NativeHandle::null()), Some(recorder.clone())).unwrap();
        assert_eq!(mux.start(&op), Err(Error::HandleIsNull));
        assert!(op.is_concluded());
        assert!(mux.poll(Deadline::instant()).unwrap().is_empty());
        assert!(recorder.events.lock().unwrap().is_empty());
        assert_eq!(mux.engine.outstanding(), 0);
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let mut mux = Manual::new(false);
        let op = mux.construct(request(valid()), None).unwrap();
        mux.start(&op).unwrap();
        assert_eq!(mux.start(&op), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_foreign_operation_is_rejected() {
        let mut a = Manual::new(false);
        let mut b = Manual::new(false);
        let op = a.construct(request(valid()), None).unwrap();
        assert_eq!(b.start(&op), Err(Error::InvalidArgument));
        a.start(&op).unwrap();
        assert_eq!(b.cancel(&op), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_cancel_before_start() {
        let mut mux = Manual::new(false);
        let op = mux.construct(request(valid()), None).unwrap();
        assert_eq!(mux.cancel(&op), Err(Error::AsyncOperationNotInProgress));
    }

    #[test]
    fn test_cancel_in_flight() {
        let mut mux = Manual::new(false);
        let (op, _) = mux.construct_and_start(request(valid()), None).unwrap();
        mux.cancel(&op).unwrap();
        mux.cancel(&op).unwrap();
        mux.poll(Deadline::never()).unwrap();
        assert!(op.is_concluded());
        assert_eq!(op.outcome(), Err(Error::AsyncOperationCancelled));
    }

    #[test]
    fn test_cancel_after_completion_keeps_result() {
        let mut mux = Manual::new(false);
        let (op, _) = mux.construct_and_start(request(valid()), None).unwrap();
        mux.deliver();
        mux.cancel(&op).unwrap();
        assert!(!op.is_cancel_requested());
        mux.poll(Deadline::never()).unwrap();
        assert_eq!(op.outcome(), Ok(Completion::Transferred(5)));
        mux.cancel(&op).unwrap();
    }

    #[test]
    fn test_block_runs_to_conclusion() {
        let mut mux = Manual::new(false);
        assert_eq!(mux.block(request(valid())), Ok(Completion::Transferred(5)));
        assert_eq!(mux.engine.outstanding(), 0);
    }

    #[test]
    fn test_unsupported_relation() {
        let mut mux = Manual::new(false);
        let req = Request::new(ObjectKind::Pipe, valid(), Arguments::Read { buffer: vec![0; 1] });
        assert_eq!(mux.construct(req, None).err(), Some(Error::UnsupportedMultiplexerHandleRelation));
    }
}
