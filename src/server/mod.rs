//! Server Module
//!
//! The listening side of echod: one persistent accept loop that spawns a
//! handler task per connection.
//!
//! ```text
//!   Transport::listen(addr, backlog)
//!            │
//!            ▼
//!   ┌─────────────────┐   accept()   ┌───────────────────────┐
//!   │    Listener     │─────────────>│ TaskRuntime::spawn    │
//!   │  (loops forever)│<─────────────│  handle_connection()  │
//!   └─────────────────┘   next peer  └───────────────────────┘
//! ```
//!
//! The loop never stops itself after dispatching a connection; use
//! `accept_limit` for a bounded or single-shot listener.

pub mod listener;

pub use listener::{is_transient_accept_error, Listener, ListenerConfig, ListenerError};
