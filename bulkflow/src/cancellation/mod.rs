//! Cooperative cancellation for in-flight bulk jobs.
//!
//! The retry sleep and the poll sleep are the only intentional waits in a
//! job run; both race against a caller-supplied [`CancellationToken`].

mod token;

pub use token::CancellationToken;
