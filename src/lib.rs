//! Core library for the proxy engine: upstream resolution (static list,
//! PAC, no-proxy bypass), upstream authentication (Basic/Digest/NTLM),
//! the connection handler and server pool, and the layered configuration
//! that drives them. `src/bin/px/main.rs` is the thin process entry point;
//! everything that can be unit-tested lives here.

pub mod auth;
pub mod cli;
pub mod client;
pub mod config;
pub mod credential;
pub mod debug;
pub mod error;
pub mod handler;
pub mod ini;
pub mod io;
pub mod noproxy;
pub mod pac;
pub mod proxylist;
pub mod resolver;
pub mod server;
pub mod supervisor;

pub use error::{PxError, Result};
