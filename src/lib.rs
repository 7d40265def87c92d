//! Core library: resolves a Cumulocity remote-access tunnel, binds a local
//! TCP listener, and bridges accepted connections to the tunnel.
//!
//! The public surface a CLI or plugin collaborator needs is small:
//! build a [`config::Config`], split it with [`config::Config::into_parts`],
//! construct a [`supervisor::Supervisor`], and run it:
//!
//! ```no_run
//! use c8ylp::config::{reconcile_env_prefixes, Config};
//! use c8ylp::resolver::Resolver;
//! use c8ylp::supervisor::Supervisor;
//! use clap::Parser;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! reconcile_env_prefixes();
//! let config = Config::parse();
//! let (input, endpoint, mode, params) = config.into_parts()?;
//! let resolver = Resolver::new()?;
//! let supervisor = Supervisor::new(resolver, input, endpoint, mode, 1, params);
//! let status = supervisor.run(|addr| println!("listening on {addr}")).await;
//! # let _ = status;
//! # Ok(())
//! # }
//! ```

pub mod acceptor;
pub mod bridge;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod resolver;
pub mod supervisor;
pub mod tls;
pub mod ws_client;
