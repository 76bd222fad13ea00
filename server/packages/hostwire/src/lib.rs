//! Host capability dispatcher and streaming model relay.

pub mod cli;
pub mod config;
pub mod os;
pub mod policy;
pub mod relay;
pub mod router;
pub mod session;
pub mod store;
pub mod tools;
