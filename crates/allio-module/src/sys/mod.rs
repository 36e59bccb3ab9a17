//! Platform syscall layer shared by the backends and the facade.

/// Socket type, independent of the platform's constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Datagram,
    Stream,
}

/// What a mapping views; decides how it is protected and released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    Section,
    Anonymous,
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod linux;
        pub use linux::*;
    } else if #[cfg(windows)] {
        mod windows;
        pub use self::windows::*;
    } else {
        use allio_core::{Completion, Error, ObjectKind, Operation, OperationKind, Result};

        pub const RELATIONS: &[(ObjectKind, OperationKind)] = &[];

        pub fn validate(_op: &Operation) -> Result<()> {
            Ok(())
        }

        pub fn execute(_op: &Operation) -> Result<Completion> {
            Err(Error::UnsupportedOperation)
        }
    }
}
