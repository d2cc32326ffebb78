//! # corral-core
//!
//! The DHCPv4 server core: socket setup, the message handler that turns
//! DISCOVER/REQUEST into OFFER/ACK via the lease allocator, and the
//! background reclamation task.
#![warn(
    missing_debug_implementations,
    missing_docs,
    missing_copy_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]
pub use anyhow;
pub use dhcproto;
pub use pnet;
pub use tokio;
pub use hickory_proto;
pub use tracing;

pub use crate::{handler::DhcpHandler, server::Server};

pub mod config;
pub mod env;
pub mod handler;
pub mod reclaim;
pub mod server;
