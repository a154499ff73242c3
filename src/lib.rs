//! Station broadcast orchestrator: one media server instance per station,
//! an Auto DJ feeding it, live DJs preempting the Auto DJ, and a reconciler
//! that keeps persisted on-air status in line with the origin.

pub mod api;
pub mod autodj;
pub mod config;
pub mod error;
pub mod gatekeeper;
pub mod media_server;
pub mod model;
pub mod notify;
pub mod orchestrator;
pub mod origin;
pub mod ports;
pub mod process;
pub mod reconciler;
pub mod registry;
pub mod scheduler;
pub mod store;

#[cfg(test)]
mod testing;
