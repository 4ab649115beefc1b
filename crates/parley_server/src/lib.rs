#![forbid(unsafe_code)]

pub mod app;
pub mod config;
pub mod quic;
pub mod server;
pub mod store;
