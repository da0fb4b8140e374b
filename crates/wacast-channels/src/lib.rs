//! # Wacast Channels
//!
//! Messaging adapters. The only channel today is the WhatsApp sidecar
//! bridge: the protocol client itself runs as a separate process and
//! this crate talks to it over plain HTTP, implementing the `Messenger`
//! seam the worker consumes.

pub mod bridge;

pub use bridge::{BridgeFactory, WhatsAppBridge};
