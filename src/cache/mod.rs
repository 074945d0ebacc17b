//! Response caching interception.
//!
//! # Data Flow
//! ```text
//! engine hook                        interceptor                    store
//! ───────────────────────────────────────────────────────────────────────────
//! before_upstream_connection ──▶ snapshot flags, is_cached? ──▶ is_cached
//! handle_client_request      ──▶ replay / record / reject   ──▶ cache_request
//! handle_upstream_chunk      ──▶ relay                      ──▶ cache_response_chunk
//! on_upstream_connection_close ─▶ finalize                  ──▶ close
//! ```
//!
//! # Session States
//! ```text
//! Snapshotted → PassThrough | CacheLookup
//! CacheLookup → ServedFromCache | Rejected | Recording | PassThrough (store fault)
//! Recording   → Closed
//! ```
//!
//! # Design Decisions
//! - The first hook consumes the interceptor and yields the session, so later
//!   hooks cannot run before the flags are captured
//! - Store faults during the request phase fall open to plain proxying
//! - Responses the interceptor synthesizes are queued for the engine to write

pub mod controller;
pub mod flags;

pub use controller::{CacheInterceptor, CacheSession, SessionState};
pub use flags::{CacheFlag, CacheFlags, ConnectionPolicy, SharedFlag};

/// Body of the 502 sent when `local_only` is set and nothing is cached.
pub const NOT_CACHED_BODY: &str = "Resource has not been cached yet. Please allow upstream.";
