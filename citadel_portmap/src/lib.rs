//! Tools for opening an externally reachable UDP port on the local UPnP Internet Gateway Device.
//! This lets peers behind residential NATs accept inbound traffic without hole punching
#![forbid(unsafe_code)]

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod mapping;
pub(crate) mod standard;

pub use standard::*;
pub use standard::upnp_handler::{ProbeResult, UPnPHandler};
