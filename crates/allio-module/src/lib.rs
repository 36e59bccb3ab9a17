//! # allio-module - Default multiplexer implementations
//!
//! One `Multiplexer` per platform mechanism, all built on the deferring
//! engine from `allio-core`, plus the per-platform syscall layer they share
//! with the `allio` facade.
//!
//! ## Default stack
//!
//! | Platform | Default            | Fallback / alternative             |
//! |----------|--------------------|------------------------------------|
//! | Linux    | UringMultiplexer   | EpollMultiplexer (ring setup fails) |
//! | Windows  | IocpMultiplexer    | BlockingMultiplexer                |
//! | other    | BlockingMultiplexer | -                                 |
//!
//! `SynchronizedMultiplexer` wraps any of them for sharing across threads.

pub mod config;
pub mod sys;
pub mod blocking;
pub mod synchronized;

#[cfg(target_os = "linux")]
pub mod epoll;
#[cfg(target_os = "linux")]
pub mod uring;
#[cfg(windows)]
pub mod iocp;

use allio_core::{kinfo, kwarn, Error, Multiplexer, Result};

pub use blocking::BlockingMultiplexer;
pub use config::{MultiplexerConfig, MultiplexerKind};
pub use synchronized::SynchronizedMultiplexer;

#[cfg(target_os = "linux")]
pub use epoll::EpollMultiplexer;
#[cfg(windows)]
pub use iocp::IocpMultiplexer;
#[cfg(target_os = "linux")]
pub use uring::UringMultiplexer;

/// Build the backend `config.kind` names.
///
/// `Auto` picks the best mechanism of the platform. Naming a backend that
/// does not exist here fails with `UnsupportedOperation`.
pub fn create_multiplexer(config: &MultiplexerConfig) -> Result<Box<dyn Multiplexer>> {
    if let Err(reason) = config.validate() {
        kwarn!("allio: invalid multiplexer config: {}", reason);
        return Err(Error::InvalidArgument);
    }
    let mux: Box<dyn Multiplexer> = match config.kind {
        MultiplexerKind::Auto => create_default(config)?,
        MultiplexerKind::Blocking => Box::new(BlockingMultiplexer::new()),
        #[cfg(target_os = "linux")]
        MultiplexerKind::IoUring => Box::new(UringMultiplexer::new(config)?),
        #[cfg(target_os = "linux")]
        MultiplexerKind::Epoll => Box::new(EpollMultiplexer::new(config)?),
        #[cfg(windows)]
        MultiplexerKind::Iocp => Box::new(IocpMultiplexer::new(config)?),
        #[allow(unreachable_patterns)]
        other => {
            kwarn!("allio: {} is not available on this platform", other);
            return Err(Error::UnsupportedOperation);
        }
    };
    kinfo!("allio: using {} multiplexer", mux.name());
    Ok(mux)
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn create_default(config: &MultiplexerConfig) -> Result<Box<dyn Multiplexer>> {
            match UringMultiplexer::new(config) {
                Ok(mux) => Ok(Box::new(mux)),
                Err(e) => {
                    kinfo!("allio: io_uring unavailable ({}), falling back to epoll", e);
                    Ok(Box::new(EpollMultiplexer::new(config)?))
                }
            }
        }
    } else if #[cfg(windows)] {
        fn create_default(config: &MultiplexerConfig) -> Result<Box<dyn Multiplexer>> {
            Ok(Box::new(IocpMultiplexer::new(config)?))
        }
    } else {
        fn create_default(_config: &MultiplexerConfig) -> Result<Box<dyn Multiplexer>> {
            Ok(Box::new(BlockingMultiplexer::new()))
        }
    }
}
