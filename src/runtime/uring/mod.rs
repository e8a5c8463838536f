//! io_uring completion driver for Linux.
//!
//! Each worker thread owns a ring and accepts on its own handle to the
//! shared listener. Every completion is routed by token to the owning
//! session's continuation, which names the one op to submit next.

mod connection;
mod event_loop;
mod token;

pub use event_loop::run;
