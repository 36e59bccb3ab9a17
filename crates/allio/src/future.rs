//! Bridging operations to `Future`.
//!
//! An `OperationFuture` holds a request until its first poll, which
//! constructs and starts the operation with a `WakerListener` attached.
//! The listener wakes the task when the operation concludes, which only
//! happens inside a multiplexer `poll`, so something must pump the
//! multiplexer: `block_on` does that on the calling thread. Several
//! threads may `block_on` the same context; whichever polls concludes the
//! others' operations, and a wake from another thread interrupts the
//! waiting poll.
//!
//! Dropping a future whose operation has not concluded cancels it.

use std::future::Future;
use std::pin::{pin, Pin};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll, Wake, Waker};
use std::thread::{self, ThreadId};

use allio_core::{
    kdebug, Deadline, Error, Interrupt, Listener, Operation, OperationRef, Request, Result,
};

use crate::context::Context;

/// Listener that wakes the task awaiting the operation.
#[derive(Default)]
pub struct WakerListener {
    waker: Mutex<Option<Waker>>,
}

impl WakerListener {
    fn register(&self, waker: &Waker) {
        let mut slot = self.waker.lock().unwrap_or_else(|p| p.into_inner());
        match slot.as_ref() {
            Some(current) if current.will_wake(waker) => {}
            _ => *slot = Some(waker.clone()),
        }
    }
}

impl Listener for WakerListener {
    fn concluded(&self, _operation: &Operation) {
        let waker = self.waker.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

pub struct OperationFuture {
    context: Context,
    request: Option<Request>,
    operation: Option<OperationRef>,
    listener: Arc<WakerListener>,
}

impl OperationFuture {
    pub fn new(context: Context, request: Request) -> Self {
        Self {
            context,
            request: Some(request),
            operation: None,
            listener: Arc::new(WakerListener::default()),
        }
    }

    /// The started operation, once the future has been polled.
    pub fn operation(&self) -> Option<&OperationRef> {
        self.operation.as_ref()
    }
}

impl Future for OperationFuture {
    /// The concluded operation; its result and buffer can be taken from it.
    type Output = Result<OperationRef>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.listener.register(cx.waker());

        if this.operation.is_none() {
            let Some(request) = this.request.take() else {
                return Poll::Ready(Err(Error::AsyncOperationNotInProgress));
            };
            let listener: Arc<dyn Listener> = this.listener.clone();
            match this.context.multiplexer().construct_and_start(request, Some(listener)) {
                Ok((operation, _)) => this.operation = Some(operation),
                Err(e) => return Poll::Ready(Err(e)),
            }
        }

        match this.operation.take() {
            Some(operation) if operation.is_concluded() => Poll::Ready(Ok(operation)),
            pending => {
                this.operation = pending;
                Poll::Pending
            }
        }
    }
}

impl Drop for OperationFuture {
    fn drop(&mut self) {
        if let Some(operation) = &self.operation {
            if !operation.is_concluded() {
                if let Err(e) = self.context.multiplexer().cancel(operation) {
                    kdebug!("allio: cancel on drop failed: {}", e);
                }
            }
        }
    }
}

/// Waker of a `block_on` loop. Woken from any other thread, it also
/// interrupts the poll that thread may be sleeping in.
struct WokenFlag {
    woken: AtomicBool,
    thread: ThreadId,
    interrupter: Option<Arc<dyn Interrupt>>,
}

impl WokenFlag {
    fn new(woken: bool, interrupter: Option<Arc<dyn Interrupt>>) -> Self {
        Self {
            woken: AtomicBool::new(woken),
            thread: thread::current().id(),
            interrupter,
        }
    }

    fn take(&self) -> bool {
        self.woken.swap(false, Ordering::AcqRel)
    }

    fn is_set(&self) -> bool {
        self.woken.load(Ordering::Acquire)
    }
}

impl Wake for WokenFlag {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.woken.store(true, Ordering::Release);
        if thread::current().id() != self.thread {
            if let Some(interrupter) = &self.interrupter {
                interrupter.interrupt();
            }
        }
    }
}

/// Poll `future` whenever it is woken, pumping `context` in between.
pub fn block_on<F: Future>(context: &Context, future: F) -> Result<F::Output> {
    let mut future = pin!(future);
    let interrupter = context.multiplexer().interrupter().cloned();
    let woken = Arc::new(WokenFlag::new(true, interrupter));
    let waker = Waker::from(woken.clone());
    let mut cx = TaskContext::from_waker(&waker);

    loop {
        if woken.take() {
            if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                return Ok(output);
            }
        }
        if woken.is_set() {
            continue;
        }
        let stats = context.poll(Deadline::never())?;
        if stats.is_empty() && !woken.is_set() {
            // Pending on something other than this multiplexer.
            thread::yield_now();
        }
    }
}
