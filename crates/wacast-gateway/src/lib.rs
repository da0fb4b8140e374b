//! # Wacast Gateway
//!
//! Thin HTTP layer over the Durable Store: job CRUD, WhatsApp
//! connection status, and the recent activity log. The gateway only
//! produces into and reads from the shared document; all scheduling
//! happens in the worker process.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, serve};
