//! # allio-core - Vocabulary of the allio multiplexer
//!
//! Everything here is platform-agnostic: deadlines, the error enum, handle
//! flags, page protection, operation storage and its lifecycle, the defer
//! list that replays status changes to listeners, the descriptor table each
//! backend fills in, and the `Multiplexer` trait itself.
//!
//! Concrete backends (blocking, io_uring, epoll, IOCP) live in
//! `allio-module`; owned handle types and `Future` bridging live in `allio`.
//!
//! ## Lifecycle
//!
//! ```text
//! construct ──▶ start ──▶ [kernel] ──▶ poll ──▶ concluded
//!                 │                      ▲
//!                 └── inline result ─────┘   (same callbacks either way)
//! ```

pub mod kprint;
pub mod env;
pub mod error;
pub mod deadline;
pub mod handle;
pub mod spinlock;
pub mod defer;
pub mod operation;
pub mod descriptor;
pub mod multiplexer;
pub mod deferring;
pub mod abi;
pub mod memory;

pub use deadline::{Deadline, StepDeadline, TimePoint};
pub use deferring::{
    cancel_operation, construct_operation, notify_operation, start_operation, CancelAction,
    DeferringEngine, Driven,
};
pub use descriptor::{Backend, Descriptor, Notified, RelationTable, Submission};
pub use error::{Error, Result};
pub use handle::{HandleFlags, NativeHandle, RawHandle, NULL_RAW_HANDLE};
pub use memory::Protection;
pub use multiplexer::{Connector, Interrupt, Multiplexer, MultiplexerId, PollStatistics, Started};
pub use operation::{
    Arguments, Completion, Listener, ObjectKind, Operation, OperationKind, OperationRef,
    OperationStatus, Request,
};
