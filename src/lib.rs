#![doc = include_str!("../README.md")]
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    clippy::clone_on_ref_ptr,
    clippy::dbg_macro,
    clippy::explicit_iter_loop,
    clippy::future_not_send,
    clippy::todo,
    clippy::use_self,
    missing_debug_implementations,
    unused_crate_dependencies
)]

// only used by integration tests
#[cfg(test)]
use tracing_log as _;
#[cfg(test)]
use tracing_subscriber as _;

pub mod backoff;
pub mod broker;
pub mod client;
pub mod coordination;
pub mod topic;

pub use backoff::BackoffConfig;
pub use client::config::{Config, DefaultOffset, RebalanceConfig};
pub use client::consumer_group::{GroupConsumer, State};
pub use client::error::{Error, Result};
pub use client::partition::Message;
pub use client::ConsumerBuilder;
