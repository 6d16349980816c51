//! SSH connection establishment.
//!
//! This module turns a resolved proxy route into a live, authenticated
//! connection. Each hop of the route wraps the transport of the hop before
//! it: a TCP socket, an HTTP/SOCKS tunnel, a relay process's stdio, or a
//! `direct-tcpip` channel of an already established bastion connection.
//!
//! # Main Components
//!
//! - [`ConnectionFactory`] - Resolves, dials and authenticates targets
//! - [`Connection`] - A live per-host connection
//! - [`ConnectionSecurityOptions`] - Algorithm profile and host key policy

use async_trait::async_trait;
use log::{debug, info, trace, warn};
use russh::client::Handle;
use russh::keys::{PrivateKeyWithHashAlg, PublicKey};
use russh::{ChannelMsg, Preferred};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;

use crate::auth::{AuthMethod, AuthMethodCache, ResolutionReport};
use crate::config::{self, ConnectOptions};
use crate::error::ConnectError;
use crate::host::{Inventory, ProxyConfig, ProxyType, parse_adhoc};
use crate::route::{HopKind, ProxyRoute, ProxyRouteResolver};
use crate::shell::{RemoteHost, RemoteIo};

pub use client::{ClientHandler, Connection};
pub use dialer::{BoxedTransport, RelayProcess, Transport};
pub use factory::{ConnectReport, ConnectionFactory};
pub use security::{ConnectionSecurityOptions, HostKeyPolicy, SecurityLevel};

mod client;
mod dialer;
mod factory;
mod security;
