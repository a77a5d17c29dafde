//! A TCP engine for small network stacks, in the tradition of lwIP.
//!
//! The engine sits between an application and an IP layer. Applications
//! write bytes and get callbacks; the engine cuts the bytes into segments,
//! keeps them queued until the peer acknowledges them, and hands finished
//! segments to IP through the [`IpLayer`](ip::IpLayer) trait.
//!
//! # Organization
//! - [`TcpStack`](tcp::TcpStack) owns every connection and is the entry point
//!   for the application, for arriving segments and for timer ticks
//! - [`buffer`] provides the reference-counted, pool-backed buffers segments
//!   are built from
//! - [`ip`] is the contract with the layer below, plus an in-memory
//!   implementation of it
//! - [`driver`] runs a stack on a tokio task and ticks its timers
//!
//! A stack is strictly single-threaded: every operation takes `&mut self`.
//! Concurrency comes from putting it behind the [`driver`].

pub mod buffer;
pub mod config;
pub mod driver;
pub mod ip;
pub mod logging;
pub mod tcp;
pub mod utility;

pub use config::TcpConfig;
pub use tcp::{TcpError, TcpStack};
