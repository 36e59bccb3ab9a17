//! `BlockingMultiplexer`: runs every operation to completion inside
//! `start`.
//!
//! Nothing is ever in flight, so `cancel` has nothing to stop and `poll`
//! only replays the deferred callbacks. Used where no kernel completion
//! mechanism exists and by the facade's synchronous calls.

use std::sync::Arc;

use allio_core::{
    cancel_operation, construct_operation, kdebug, start_operation, Backend, Connector, Deadline,
    Descriptor, DeferringEngine, Driven, Listener, Multiplexer, MultiplexerId, NativeHandle,
    ObjectKind, OperationKind, OperationRef, PollStatistics, RelationTable, Request, Result,
    Started, Submission,
};

use crate::sys;

pub struct BlockingMultiplexer {
    engine: DeferringEngine,
    relations: RelationTable<BlockingMultiplexer>,
}

impl Backend for BlockingMultiplexer {
    type Status = ();
}

fn submit(_: &mut BlockingMultiplexer, op: &OperationRef) -> Result<Submission> {
    sys::validate(op)?;
    Ok(Submission::Ready(sys::execute(op)))
}

impl BlockingMultiplexer {
    pub fn new() -> Self {
        let mut relations = RelationTable::new();
        for &(object, operation) in sys::RELATIONS {
            relations.register(Descriptor::synchronous(object, operation, submit));
        }
        let engine = DeferringEngine::new();
        kdebug!("blocking: {} relations, id {}", relations.len(), engine.id());
        Self { engine, relations }
    }
}

impl Default for BlockingMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl Driven for BlockingMultiplexer {
    fn engine(&self) -> &DeferringEngine {
        &self.engine
    }

    fn engine_mut(&mut self) -> &mut DeferringEngine {
        &mut self.engine
    }

    fn relations(&self) -> &RelationTable<Self> {
        &self.relations
    }
}

impl Multiplexer for BlockingMultiplexer {
    fn name(&self) -> &'static str {
        "blocking"
    }

    fn id(&self) -> MultiplexerId {
        self.engine.id()
    }

    fn supports(&self, object: ObjectKind, operation: OperationKind) -> bool {
        self.relations.supports(object, operation)
    }

    fn attach(&mut self, handle: &NativeHandle, connector: &mut Connector) -> Result<()> {
        handle.check_multiplexable()?;
        connector.bind(self.engine.id(), None)
    }

    fn detach(&mut self, _handle: &NativeHandle, connector: &mut Connector) -> Result<()> {
        connector.unbind(self.engine.id()).map(|_| ())
    }

    fn construct(
        &mut self,
        request: Request,
        listener: Option<Arc<dyn Listener>>,
    ) -> Result<OperationRef> {
        construct_operation(self, request, listener)
    }

    fn start(&mut self, operation: &OperationRef) -> Result<Started> {
        start_operation(self, operation)
    }

    fn cancel(&mut self, operation: &OperationRef) -> Result<()> {
        cancel_operation(self, operation)
    }

    fn poll(&mut self, _deadline: Deadline) -> Result<PollStatistics> {
        Ok(self.engine.flush())
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use allio_core::{Arguments, Completion, Error, HandleFlags};
    use std::time::Duration;

    #[test]
    fn test_supports_every_relation() {
        let mux = BlockingMultiplexer::new();
        for &(object, operation) in sys::RELATIONS {
            assert!(mux.supports(object, operation));
        }
        assert!(!mux.supports(ObjectKind::File, OperationKind::Accept));
    }

    #[test]
    fn test_pipe_roundtrip() {
        let mut mux = BlockingMultiplexer::new();
        let (r, w) = sys::pipe().unwrap();
        let write = Request::new(
            ObjectKind::Pipe,
            NativeHandle::new(w, HandleFlags::NONE),
            Arguments::Write { buffer: b"allio".to_vec() },
        );
        assert_eq!(mux.block(write), Ok(Completion::Transferred(5)));
        let read = Request::new(
            ObjectKind::Pipe,
            NativeHandle::new(r, HandleFlags::NONE),
            Arguments::Read { buffer: vec![0; 16] },
        );
        let op = mux.block_operation(read).unwrap();
        assert_eq!(op.take_buffer().as_deref(), Some(&b"allio"[..]));
        sys::close(r);
        sys::close(w);
    }

    #[test]
    fn test_instant_deadline_times_out() {
        let mut mux = BlockingMultiplexer::new();
        let (r, w) = sys::pipe().unwrap();
        let read = Request::new(
            ObjectKind::Pipe,
            NativeHandle::new(r, HandleFlags::NONE),
            Arguments::Read { buffer: vec![0; 1] },
        )
        .deadline(Deadline::instant());
        assert_eq!(mux.block(read), Err(Error::AsyncOperationTimedOut));
        let read = Request::new(
            ObjectKind::Pipe,
            NativeHandle::new(r, HandleFlags::NONE),
            Arguments::Read { buffer: vec![0; 1] },
        )
        .deadline(Deadline::relative(Duration::from_millis(10)));
        assert_eq!(mux.block(read), Err(Error::AsyncOperationTimedOut));
        sys::close(r);
        sys::close(w);
    }

    #[test]
    fn test_start_is_ready_and_cancel_keeps_result() {
        let mut mux = BlockingMultiplexer::new();
        let ev = sys::event_create().unwrap();
        sys::event_signal(ev).unwrap();
        let wait = Request::new(ObjectKind::Event, NativeHandle::new(ev, HandleFlags::NONE), Arguments::Wait);
        let (op, started) = mux.construct_and_start(wait, None).unwrap();
        assert_eq!(started, Started::Ready);
        mux.cancel(&op).unwrap();
        let stats = mux.poll(Deadline::instant()).unwrap();
        assert_eq!(stats, PollStatistics { submitted: 1, completed: 1, concluded: 1 });
        assert_eq!(op.outcome(), Ok(Completion::Signaled));
        sys::close(ev);
    }

    #[test]
    fn test_attach_requires_multiplexable() {
        let mut mux = BlockingMultiplexer::new();
        let mut connector = Connector::new();
        let plain = NativeHandle::new(5, HandleFlags::NONE);
        assert_eq!(mux.attach(&plain, &mut connector), Err(Error::HandleIsNotMultiplexable));
        let ok = NativeHandle::new(5, HandleFlags::MULTIPLEXABLE);
        mux.attach(&ok, &mut connector).unwrap();
        assert_eq!(mux.attach(&ok, &mut connector), Err(Error::InvalidArgument));
        mux.detach(&ok, &mut connector).unwrap();
        assert!(!connector.is_attached());
    }
}
