//! mio-based readiness driver.
//!
//! One acceptor thread plus one thread per connection. Each connection
//! thread owns a private mio `Poll` (epoll on Linux, kqueue on macOS) and
//! blocks only while waiting for readiness.

mod channel;
mod event_loop;

pub use event_loop::run;
