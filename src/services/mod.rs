//! Domain services used by websocket and HTTP routes.
//!
//! ARCHITECTURE
//! ============
//! Service modules own relay, fan-out, and persistence concerns so route
//! handlers can stay focused on protocol translation.

pub mod broadcast;
pub mod persistence;
pub mod registry;
pub mod relay;
