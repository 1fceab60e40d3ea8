//! HTTP surface over the thread engine. Transport authentication is not
//! this subsystem's job: callers arrive with an already-verified account
//! id (see `middleware`).

pub mod messages;
pub mod middleware;

use std::sync::Arc;

use creel_engine::ThreadEngine;
use creel_realtime::Dispatcher;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub engine: Arc<ThreadEngine>,
    pub dispatcher: Dispatcher,
}
