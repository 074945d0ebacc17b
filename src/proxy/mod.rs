//! Forward-proxy engine.
//!
//! # Data Flow
//! ```text
//! Listener::accept
//!     → server.rs (one task per connection, store handle per connection)
//!     → handler.rs (cache hooks around the client and upstream legs)
//! ```

pub mod handler;
pub mod server;

pub use handler::{serve_connection, HandlerError};
pub use server::ProxyServer;
