//! # rmssh - Multi-host SSH with proxy chains and a parallel pipeline shell
//!
//! `rmssh` connects to many servers at once, each possibly behind bastions,
//! HTTP/SOCKS proxies or a local relay command, and runs shell pipelines on
//! all of them in parallel. Output of every host is tagged, streamed live and
//! kept per command for later replay.
//!
//! ## Features
//!
//! - **Proxy Chains**: Routes through SSH bastions, HTTP(S) CONNECT, SOCKS4/5 and relay commands
//! - **Cached Authentication**: Credentials are decoded once per server and reused by every hop
//! - **Parallel Pipelines**: `cat log | grep err | !sort` runs the remote part on every host and sorts locally
//! - **History**: Every line is logged durably; `%out N` replays captured output
//! - **Algorithm Profiles**: Secure, balanced and legacy-compatible algorithm sets
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rmssh::shell::{Mode, Shell};
//! use rmssh::{ConnectOptions, ConnectionFactory, Inventory, ServerConfig, ShellConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut inventory = Inventory::default();
//!     inventory.common.user = Some("deploy".to_string());
//!     inventory.common.key = Some("~/.ssh/id_ed25519".to_string());
//!     inventory.servers.insert("bastion".to_string(), ServerConfig {
//!         addr: Some("203.0.113.10".to_string()),
//!         ..Default::default()
//!     });
//!     inventory.servers.insert("web1".to_string(), ServerConfig {
//!         addr: Some("10.0.0.11".to_string()),
//!         proxy: Some("bastion".to_string()),
//!         ..Default::default()
//!     });
//!     inventory.merge_common();
//!
//!     let factory = Arc::new(ConnectionFactory::new(inventory, ConnectOptions::default()));
//!     let report = factory.connect_all(&["web1".to_string()]).await?;
//!     for (name, err) in &report.failures {
//!         eprintln!("{name}: {err}");
//!     }
//!
//!     let mut shell = Shell::from_connections(report.connected, ShellConfig::default());
//!     shell.run(Mode::Command("uptime".to_string())).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Main Components
//!
//! - [`session::ConnectionFactory`] - Resolves routes, dials hops and authenticates
//! - [`shell::Shell`] - Interactive and one-shot entry point
//! - [`shell::ParallelExecutor`] - Runs parsed pipelines over connected hosts
//! - [`auth::AuthMethodCache`] - Per-server authentication methods
//! - [`route::ProxyRouteResolver`] - Proxy chain resolution and cycle detection
//! - [`error::ConnectError`] - Error types for connection setup
//! - [`config`] - Algorithm profiles and tunables

pub mod auth;
pub mod config;
pub mod error;
pub mod host;
pub mod route;
pub mod session;
pub mod shell;

pub use config::{ConnectOptions, ShellConfig};
pub use error::{ConnectError, ParseError};
pub use host::{Inventory, ProxyConfig, ProxyType, ServerConfig};
pub use session::{ConnectReport, Connection, ConnectionFactory};
