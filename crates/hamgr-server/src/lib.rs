//! Example service wired to the HA manager

pub mod api;
pub mod config;
pub mod logging;
pub mod shutdown;
