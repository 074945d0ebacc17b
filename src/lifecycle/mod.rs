//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     trigger → accept loop stops → connections drain
//!             → admin server and config reload loop stop
//! ```

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
