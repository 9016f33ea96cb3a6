//! SOCKS5 probe engine and shared daemon state, plus the HTTP control plane
//! that exposes them. The `socksprobe` binary is a thin CLI over this crate.

pub mod api;
pub mod config;
pub mod probe;
pub mod protocol;
pub mod state;
