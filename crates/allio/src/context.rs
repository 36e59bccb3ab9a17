//! `Context`: a shared, thread-safe handle to one multiplexer.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use allio_core::{Deadline, Multiplexer, MultiplexerId, PollStatistics, Request, Result};
use allio_module::{create_multiplexer, BlockingMultiplexer, MultiplexerConfig, SynchronizedMultiplexer};

use crate::future::{block_on, OperationFuture};

pub type SharedMultiplexer = SynchronizedMultiplexer<Box<dyn Multiplexer>>;

/// Cheap to clone; clones share the multiplexer.
#[derive(Clone)]
pub struct Context {
    inner: Arc<SharedMultiplexer>,
}

impl Context {
    pub fn new(config: &MultiplexerConfig) -> Result<Self> {
        Ok(Self::with_multiplexer(create_multiplexer(config)?))
    }

    /// Backend chosen by `ALLIO_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(&MultiplexerConfig::from_env())
    }

    pub fn blocking() -> Self {
        Self::with_multiplexer(Box::new(BlockingMultiplexer::new()))
    }

    pub fn with_multiplexer(multiplexer: Box<dyn Multiplexer>) -> Self {
        Self {
            inner: Arc::new(SynchronizedMultiplexer::new(multiplexer)),
        }
    }

    #[inline]
    pub fn multiplexer(&self) -> &SharedMultiplexer {
        &self.inner
    }

    pub fn id(&self) -> MultiplexerId {
        self.inner.id()
    }

    pub fn name(&self) -> &'static str {
        self.inner.name()
    }

    /// Future that starts `request` on first poll and resolves to the
    /// concluded operation.
    pub fn submit(&self, request: Request) -> OperationFuture {
        OperationFuture::new(self.clone(), request)
    }

    pub fn poll(&self, deadline: Deadline) -> Result<PollStatistics> {
        self.inner.poll(deadline)
    }

    /// Drive `future` to completion on the calling thread.
    pub fn block_on<F: Future>(&self, future: F) -> Result<F::Output> {
        block_on(self, future)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Context({} {})", self.name(), self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_the_multiplexer() {
        let a = Context::blocking();
        let b = a.clone();
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), Context::blocking().id());
        assert_eq!(format!("{:?}", a).split(' ').next(), Some("Context(blocking"));
    }

    #[test]
    fn test_idle_poll_returns_immediately() {
        let context = Context::from_env().unwrap();
        let stats = context.poll(Deadline::never()).unwrap();
        assert!(stats.is_empty());
    }
}
