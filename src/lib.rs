//! Response-caching forward proxy.
//!
//! # Architecture Overview
//!
//! ```text
//!                       ┌──────────────────────────────────────────────────┐
//!                       │                  CACHING PROXY                    │
//!                       │                                                   │
//!   Client Request      │  ┌─────────┐   ┌─────────┐   ┌───────────────┐   │
//!   ────────────────────┼─▶│   net   │──▶│  proxy  │──▶│     cache     │   │
//!                       │  │listener │   │ handler │   │  interceptor  │   │
//!                       │  └─────────┘   └────┬────┘   └───────┬───────┘   │
//!                       │                     │                │           │
//!                       │                     ▼                ▼           │
//!   Upstream Server     │               ┌─────────┐      ┌───────────┐     │
//!   ◀───────────────────┼───────────────│  http   │      │   store   │     │
//!                       │               │  codec  │      │disk/memory│     │
//!                       │               └─────────┘      └───────────┘     │
//!                       │                                                   │
//!                       │  config · observability · lifecycle · admin       │
//!                       └──────────────────────────────────────────────────┘
//! ```

pub mod admin;
pub mod cache;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod proxy;
pub mod store;

pub use cache::{CacheFlags, CacheInterceptor, CacheSession};
pub use config::schema::ProxyConfig;
pub use lifecycle::Shutdown;
pub use proxy::ProxyServer;
pub use store::{CacheStore, StoreProvider};
