//! Realtime fan-out: the event dispatcher, the per-caller session with its
//! single-slot active-thread registration, and the WebSocket relay.

pub mod connection;
pub mod dispatcher;
pub mod session;

pub use dispatcher::Dispatcher;
pub use session::{ActiveThreadHandle, Session};
