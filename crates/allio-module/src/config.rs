//! Multiplexer configuration.
//!
//! Library defaults with environment overrides, then builder-style tweaks:
//!
//! ```rust,ignore
//! use allio_module::config::{MultiplexerConfig, MultiplexerKind};
//!
//! let config = MultiplexerConfig::from_env().kind(MultiplexerKind::Epoll);
//! let mux = allio_module::create_multiplexer(&config)?;
//! ```

use std::fmt;
use std::str::FromStr;

use allio_core::env::{env_get, env_get_opt};

pub const DEFAULT_SQ_ENTRIES: u32 = 256;
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Which backend to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MultiplexerKind {
    /// io_uring, falling back to epoll, on Linux; IOCP on Windows;
    /// blocking elsewhere.
    #[default]
    Auto,
    IoUring,
    Epoll,
    Iocp,
    Blocking,
}

impl MultiplexerKind {
    pub fn name(&self) -> &'static str {
        match self {
            MultiplexerKind::Auto => "auto",
            MultiplexerKind::IoUring => "io_uring",
            MultiplexerKind::Epoll => "epoll",
            MultiplexerKind::Iocp => "iocp",
            MultiplexerKind::Blocking => "blocking",
        }
    }
}

impl fmt::Display for MultiplexerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MultiplexerKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(MultiplexerKind::Auto),
            "io_uring" | "iouring" | "uring" => Ok(MultiplexerKind::IoUring),
            "epoll" => Ok(MultiplexerKind::Epoll),
            "iocp" => Ok(MultiplexerKind::Iocp),
            "blocking" | "sync" => Ok(MultiplexerKind::Blocking),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    pub kind: MultiplexerKind,
    /// io_uring submission queue size. Must be a power of 2.
    pub sq_entries: u32,
    /// io_uring completion queue size. Defaults to 2 * sq_entries.
    pub cq_entries: Option<u32>,
    /// Events (epoll) or packets (IOCP) reaped per wait.
    pub event_capacity: usize,
    /// io_uring registered-file table size; 0 disables fixed files.
    pub fixed_files: u32,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            kind: MultiplexerKind::Auto,
            sq_entries: DEFAULT_SQ_ENTRIES,
            cq_entries: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            fixed_files: 0,
        }
    }
}

impl MultiplexerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `ALLIO_MULTIPLEXER` - auto, io_uring, epoll, iocp, blocking
    /// - `ALLIO_SQ_ENTRIES` - io_uring SQ size
    /// - `ALLIO_CQ_ENTRIES` - io_uring CQ size
    /// - `ALLIO_EVENT_CAPACITY` - events per epoll/IOCP wait
    /// - `ALLIO_FIXED_FILES` - io_uring fixed-file slots
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            kind: env_get("ALLIO_MULTIPLEXER", defaults.kind),
            sq_entries: env_get("ALLIO_SQ_ENTRIES", defaults.sq_entries),
            cq_entries: env_get_opt("ALLIO_CQ_ENTRIES").or(defaults.cq_entries),
            event_capacity: env_get("ALLIO_EVENT_CAPACITY", defaults.event_capacity),
            fixed_files: env_get("ALLIO_FIXED_FILES", defaults.fixed_files),
        }
    }

    pub fn kind(mut self, kind: MultiplexerKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn sq_entries(mut self, n: u32) -> Self {
        self.sq_entries = n;
        self
    }

    pub fn cq_entries(mut self, n: u32) -> Self {
        self.cq_entries = Some(n);
        self
    }

    pub fn event_capacity(mut self, n: usize) -> Self {
        self.event_capacity = n;
        self
    }

    pub fn fixed_files(mut self, n: u32) -> Self {
        self.fixed_files = n;
        self
    }

    /// CQ size actually requested from the kernel.
    pub fn effective_cq_entries(&self) -> u32 {
        self.cq_entries
            .unwrap_or_else(|| self.sq_entries.saturating_mul(2))
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.sq_entries == 0 || !self.sq_entries.is_power_of_two() {
            return Err("sq_entries must be a non-zero power of 2");
        }
        if self.effective_cq_entries() < self.sq_entries {
            return Err("cq_entries must be at least sq_entries");
        }
        if self.event_capacity == 0 {
            return Err("event_capacity must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let c = MultiplexerConfig::default();
        assert_eq!(c.kind, MultiplexerKind::Auto);
        assert_eq!(c.effective_cq_entries(), 512);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_builder_and_validate() {
        assert!(MultiplexerConfig::new().sq_entries(100).validate().is_err());
        assert!(MultiplexerConfig::new().sq_entries(64).cq_entries(32).validate().is_err());
        assert!(MultiplexerConfig::new().event_capacity(0).validate().is_err());
        let c = MultiplexerConfig::new().sq_entries(64).fixed_files(16).kind(MultiplexerKind::IoUring);
        assert!(c.validate().is_ok());
        assert_eq!(c.fixed_files, 16);
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("io_uring".parse(), Ok(MultiplexerKind::IoUring));
        assert_eq!("EPOLL".parse(), Ok(MultiplexerKind::Epoll));
        assert_eq!("blocking".parse(), Ok(MultiplexerKind::Blocking));
        assert_eq!("kqueue".parse::<MultiplexerKind>(), Err(()));
        assert_eq!(MultiplexerKind::Iocp.to_string(), "iocp");
    }

    #[test]
    fn test_from_env_overrides() {
        std::env::set_var("ALLIO_EVENT_CAPACITY", "17");
        std::env::set_var("ALLIO_MULTIPLEXER", "blocking");
        let c = MultiplexerConfig::from_env();
        std::env::remove_var("ALLIO_EVENT_CAPACITY");
        std::env::remove_var("ALLIO_MULTIPLEXER");
        assert_eq!(c.event_capacity, 17);
        assert_eq!(c.kind, MultiplexerKind::Blocking);
    }
}
