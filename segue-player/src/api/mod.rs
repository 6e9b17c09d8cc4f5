//! HTTP control surface
//!
//! Read-only snapshots, transport commands, configuration, and the SSE
//! event stream for whatever control surface sits on top of the pipeline.

pub mod handlers;
pub mod server;
pub mod sse;

pub use server::{create_router, AppContext};
