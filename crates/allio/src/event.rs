//! Events: a signaled flag that waiters observe.
//!
//! An auto-reset event is cleared by the wait that observes it, so one
//! signal releases exactly one waiter. A manual-reset event stays signaled
//! until `reset`, releasing every waiter.

use allio_core::{Arguments, Deadline, HandleFlags, ObjectKind, OperationRef, Result};
use allio_module::sys;

use crate::block_operation;
use crate::context::Context;
use crate::handle::OwnedHandle;

#[derive(Debug)]
pub struct Event {
    handle: OwnedHandle,
}

impl Event {
    pub fn new(auto_reset: bool) -> Result<Self> {
        let flags = if auto_reset {
            HandleFlags::EVENT_AUTO_RESET
        } else {
            HandleFlags::NONE
        };
        Ok(Self {
            handle: OwnedHandle::new(create(auto_reset)?, flags),
        })
    }

    pub fn is_auto_reset(&self) -> bool {
        self.handle.flags().contains(HandleFlags::EVENT_AUTO_RESET)
    }

    pub fn handle(&self) -> &OwnedHandle {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut OwnedHandle {
        &mut self.handle
    }

    pub fn signal(&self) -> Result<()> {
        sys::event_signal(self.handle.raw())
    }

    /// Clear the signal; returns whether it was set.
    pub fn reset(&self) -> Result<bool> {
        sys::event_reset(self.handle.raw())
    }

    pub fn wait(&self, deadline: Deadline) -> Result<()> {
        signaled(block_operation(self.request(deadline, None))?)
    }

    pub async fn wait_async(&self, context: &Context, deadline: Deadline) -> Result<()> {
        signaled(context.submit(self.request(deadline, Some(context))).await?)
    }

    fn request(&self, deadline: Deadline, context: Option<&Context>) -> allio_core::Request {
        self.handle.request(ObjectKind::Event, Arguments::Wait, deadline, context)
    }
}

fn signaled(operation: OperationRef) -> Result<()> {
    operation.outcome().map(|_| ())
}

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        fn create(auto_reset: bool) -> Result<allio_core::RawHandle> {
            sys::event_create(!auto_reset)
        }
    } else {
        // eventfd carries no reset mode; waits consult the handle flag.
        fn create(_auto_reset: bool) -> Result<allio_core::RawHandle> {
            sys::event_create()
        }
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context as TaskContext, Poll, Wake, Waker};
    use std::time::Duration;

    use allio_core::Error;

    use crate::MultiplexerConfig;

    struct NoopWake;

    impl Wake for NoopWake {
        fn wake(self: Arc<Self>) {}
    }

    type Waiter<'a> = Pin<Box<dyn Future<Output = Result<()>> + 'a>>;

    /// Start `n` waits, signal once, pump for a while and count how many
    /// concluded successfully.
    fn released(auto_reset: bool, n: usize) -> usize {
        let context = Context::new(&MultiplexerConfig::default()).unwrap();
        let event = Event::new(auto_reset).unwrap();
        let waker = Waker::from(Arc::new(NoopWake));
        let mut cx = TaskContext::from_waker(&waker);

        let mut waiters: Vec<Waiter<'_>> = (0..n)
            .map(|_| Box::pin(event.wait_async(&context, Deadline::never())) as Waiter<'_>)
            .collect();
        for waiter in waiters.iter_mut() {
            assert!(waiter.as_mut().poll(&mut cx).is_pending());
        }

        event.signal().unwrap();
        for _ in 0..10 {
            context.poll(Deadline::relative(Duration::from_millis(20))).unwrap();
        }

        let mut ok = 0;
        for waiter in waiters.iter_mut() {
            if let Poll::Ready(result) = waiter.as_mut().poll(&mut cx) {
                assert_eq!(result, Ok(()));
                ok += 1;
            }
        }
        ok
    }

    #[test]
    fn test_auto_reset_releases_one_waiter() {
        assert_eq!(released(true, 3), 1);
    }

    #[test]
    fn test_manual_reset_releases_all_waiters() {
        assert_eq!(released(false, 3), 3);
    }

    #[test]
    fn test_blocking_wait_and_reset() {
        let event = Event::new(false).unwrap();
        assert!(!event.is_auto_reset());
        assert_eq!(event.wait(Deadline::instant()), Err(Error::AsyncOperationTimedOut));
        event.signal().unwrap();
        assert_eq!(event.wait(Deadline::never()), Ok(()));
        // Manual reset: still signaled.
        assert_eq!(event.wait(Deadline::instant()), Ok(()));
        assert_eq!(event.reset(), Ok(true));
        assert_eq!(event.reset(), Ok(false));
    }

    #[test]
    fn test_relative_wait_times_out() {
        let event = Event::new(true).unwrap();
        let wait = event.wait(Deadline::relative(Duration::from_millis(10)));
        assert_eq!(wait, Err(Error::AsyncOperationTimedOut));
    }
}
