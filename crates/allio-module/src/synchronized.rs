//! `SynchronizedMultiplexer`: one mutex in front of any multiplexer so
//! several threads can share it through `&self`.
//!
//! Every entry point takes the lock for its whole duration, including the
//! kernel wait inside `poll`. A thread that finds the lock taken counts
//! itself as contending and interrupts that wait through the backend's
//! `Interrupt`; pollers yield to contending threads and do not sleep in
//! the kernel while one is queued. The blocking backend runs operations
//! inline under the lock, so it is not suitable for operations that
//! depend on each other across threads. Prefer one multiplexer per thread
//! for parallel I/O.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread;

use allio_core::{
    Completion, Connector, Deadline, Interrupt, Listener, Multiplexer, MultiplexerId,
    NativeHandle, ObjectKind, OperationKind, OperationRef, PollStatistics, Request, Result,
    Started,
};

pub struct SynchronizedMultiplexer<M: Multiplexer> {
    id: MultiplexerId,
    name: &'static str,
    interrupter: Option<Arc<dyn Interrupt>>,
    /// Threads waiting for the lock to submit, cancel or attach.
    contending: AtomicUsize,
    inner: Mutex<M>,
}

impl<M: Multiplexer> SynchronizedMultiplexer<M> {
    pub fn new(inner: M) -> Self {
        Self {
            id: inner.id(),
            name: inner.name(),
            interrupter: inner.interrupter(),
            contending: AtomicUsize::new(0),
            inner: Mutex::new(inner),
        }
    }

    /// Take the lock, interrupting a poll that holds it in the kernel.
    /// Poisoning is ignored: a listener panic leaves the inner state intact.
    fn lock(&self) -> MutexGuard<'_, M> {
        match self.inner.try_lock() {
            Ok(guard) => return guard,
            Err(TryLockError::Poisoned(poisoned)) => return poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {}
        }
        self.contending.fetch_add(1, Ordering::SeqCst);
        self.interrupt();
        let guard = self.acquire();
        self.contending.fetch_sub(1, Ordering::SeqCst);
        guard
    }

    /// Plain acquisition. Pollers use it so they do not interrupt each
    /// other.
    fn acquire(&self) -> MutexGuard<'_, M> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn contended(&self) -> bool {
        self.contending.load(Ordering::SeqCst) > 0
    }

    /// Wake whichever thread is polling, if any.
    pub fn interrupt(&self) {
        if let Some(interrupter) = &self.interrupter {
            interrupter.interrupt();
        }
    }

    pub fn interrupter(&self) -> Option<&Arc<dyn Interrupt>> {
        self.interrupter.as_ref()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn id(&self) -> MultiplexerId {
        self.id
    }

    pub fn supports(&self, object: ObjectKind, operation: OperationKind) -> bool {
        self.lock().supports(object, operation)
    }

    pub fn attach(&self, handle: &NativeHandle, connector: &mut Connector) -> Result<()> {
        self.lock().attach(handle, connector)
    }

    pub fn detach(&self, handle: &NativeHandle, connector: &mut Connector) -> Result<()> {
        self.lock().detach(handle, connector)
    }

    pub fn construct(
        &self,
        request: Request,
        listener: Option<Arc<dyn Listener>>,
    ) -> Result<OperationRef> {
        self.lock().construct(request, listener)
    }

    pub fn start(&self, operation: &OperationRef) -> Result<Started> {
        self.lock().start(operation)
    }

    pub fn construct_and_start(
        &self,
        request: Request,
        listener: Option<Arc<dyn Listener>>,
    ) -> Result<(OperationRef, Started)> {
        self.lock().construct_and_start(request, listener)
    }

    pub fn cancel(&self, operation: &OperationRef) -> Result<()> {
        self.lock().cancel(operation)
    }

    /// Poll once. Yields to contending threads first, and only polls
    /// without waiting while one is still queued.
    pub fn poll(&self, deadline: Deadline) -> Result<PollStatistics> {
        while self.contended() {
            thread::yield_now();
        }
        let mut inner = self.acquire();
        // Checked under the lock: a contender that arrives later interrupts
        // after this load, and only a lock holder can drain that interrupt.
        if self.contended() {
            return inner.poll(Deadline::instant());
        }
        inner.poll(deadline)
    }

    /// Start `request` and poll once, under a single acquisition.
    pub fn submit_and_poll(
        &self,
        request: Request,
        listener: Option<Arc<dyn Listener>>,
        deadline: Deadline,
    ) -> Result<(OperationRef, PollStatistics)> {
        let mut inner = self.lock();
        let (operation, _) = inner.construct_and_start(request, listener)?;
        let deadline = if self.contended() { Deadline::instant() } else { deadline };
        let statistics = inner.poll(deadline)?;
        Ok((operation, statistics))
    }

    /// Run `request` to conclusion. The lock is released between polls.
    /// If another thread's poll concludes the operation, it interrupts
    /// whatever wait this thread has entered meanwhile.
    pub fn block_operation(&self, request: Request) -> Result<OperationRef> {
        let listener = self
            .interrupter
            .clone()
            .map(|interrupter| Arc::new(InterruptOnConclusion(interrupter)) as Arc<dyn Listener>);
        let (operation, _) = self.construct_and_start(request, listener)?;
        while !operation.is_concluded() {
            self.poll(Deadline::never())?;
        }
        Ok(operation)
    }

    pub fn block(&self, request: Request) -> Result<Completion> {
        self.block_operation(request)?.outcome()
    }

    /// Exclusive access for a sequence of calls.
    pub fn with<R>(&self, f: impl FnOnce(&mut M) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn into_inner(self) -> M {
        self.inner.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct InterruptOnConclusion(Arc<dyn Interrupt>);

impl Listener for InterruptOnConclusion {
    fn concluded(&self, _operation: &allio_core::Operation) {
        self.0.interrupt();
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use crate::blocking::BlockingMultiplexer;
    use crate::sys;
    use allio_core::{Arguments, HandleFlags, Operation};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[derive(Default)]
    struct Count(AtomicUsize);

    impl Listener for Count {
        fn concluded(&self, _: &Operation) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_shared_across_threads() {
        let mux = Arc::new(SynchronizedMultiplexer::new(BlockingMultiplexer::new()));
        assert_eq!(mux.name(), "blocking");
        let count = Arc::new(Count::default());
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let mux = mux.clone();
                let count = count.clone();
                thread::spawn(move || {
                    let ev = sys::event_create().unwrap();
                    sys::event_signal(ev).unwrap();
                    for _ in 0..10 {
                        let wait = Request::new(ObjectKind::Event, NativeHandle::new(ev, HandleFlags::NONE), Arguments::Wait);
                        mux.submit_and_poll(wait, Some(count.clone()), Deadline::instant()).unwrap();
                    }
                    sys::close(ev);
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        mux.poll(Deadline::instant()).unwrap();
        assert_eq!(count.0.load(Ordering::SeqCst), 40);
    }

    #[test]
    fn test_waiting_poll_lets_another_thread_submit() {
        use crate::{EpollMultiplexer, MultiplexerConfig};
        use std::time::Duration;

        let mux = Arc::new(SynchronizedMultiplexer::new(
            EpollMultiplexer::new(&MultiplexerConfig::default()).unwrap(),
        ));
        assert!(mux.interrupter().is_some());
        let (r, w) = sys::pipe().unwrap();

        let reader = {
            let mux = mux.clone();
            thread::spawn(move || {
                let read = Request::new(ObjectKind::Pipe, NativeHandle::new(r, HandleFlags::MULTIPLEXABLE), Arguments::Read { buffer: vec![0; 8] });
                mux.block_operation(read).map(|op| op.take_buffer())
            })
        };
        thread::sleep(Duration::from_millis(50));
        let write = Request::new(ObjectKind::Pipe, NativeHandle::new(w, HandleFlags::MULTIPLEXABLE), Arguments::Write { buffer: b"allio".to_vec() });
        assert_eq!(mux.block(write), Ok(Completion::Transferred(5)));
        assert_eq!(reader.join().unwrap().unwrap().as_deref(), Some(&b"allio"[..]));
        sys::close(r);
        sys::close(w);
    }

    #[test]
    fn test_block_and_with() {
        let mux = SynchronizedMultiplexer::new(BlockingMultiplexer::new());
        let (r, w) = sys::pipe().unwrap();
        let write = Request::new(ObjectKind::Pipe, NativeHandle::new(w, HandleFlags::NONE), Arguments::Write { buffer: vec![1, 2] });
        assert_eq!(mux.block(write), Ok(Completion::Transferred(2)));
        let outstanding = mux.with(|inner| {
            use allio_core::Driven;
            inner.engine().outstanding()
        });
        assert_eq!(outstanding, 0);
        let inner = mux.into_inner();
        assert!(inner.supports(ObjectKind::Pipe, OperationKind::Read));
        sys::close(r);
        sys::close(w);
    }
}
