//! Error types for connection setup and pipeline parsing.
//!
//! Connection-side failures (configuration, credentials, dialing) share
//! [`ConnectError`]; a malformed command line is a [`ParseError`] and rejects
//! the whole line before anything runs.

use thiserror::Error;

/// Errors that can occur while resolving, authenticating or dialing a host.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// A server name referenced as target or proxy is not configured.
    #[error("server {0} is not defined in the configuration")]
    UnknownServer(String),

    /// A proxy name referenced by a server is not configured.
    #[error("proxy {0} is not defined in the configuration")]
    UnknownProxy(String),

    /// Walking the proxy references of `target` came back to `name`.
    #[error("proxy chain of {target} revisits {name}")]
    ProxyLoop { target: String, name: String },

    /// An ad hoc host string could not be turned into a server entry.
    #[error("invalid host specification {0:?}")]
    InvalidHost(String),

    /// A configured credential could not be read or decoded.
    #[error("credential {kind} for {server}: {reason}")]
    Credential {
        server: String,
        kind: &'static str,
        reason: String,
    },

    /// Credential resolution left the server without any usable method.
    #[error("no usable authentication method for {0}")]
    NoAuthMethods(String),

    /// Dialing or handshaking one hop did not finish in time.
    #[error("connection to {0} timed out")]
    ConnectTimeout(String),

    /// The server rejected every authentication method offered.
    #[error("authentication rejected by {0}")]
    AuthRejected(String),

    /// The server host key did not pass the configured check.
    #[error("host key of {0} rejected")]
    HostKeyRejected(String),

    /// An HTTP or SOCKS proxy refused to open the tunnel.
    #[error("proxy {proxy} refused tunnel: {reason}")]
    ProxyHandshake { proxy: String, reason: String },

    /// Every requested target failed to connect.
    #[error("all {0} target(s) failed to connect")]
    AllTargetsFailed(usize),

    /// An error occurred in the russh library.
    #[error("russh error: {0}")]
    RusshError(#[from] russh::Error),

    /// A key could not be parsed or loaded.
    #[error("key error: {0}")]
    KeyError(#[from] russh::keys::Error),

    /// A SOCKS proxy handshake failed.
    #[error("socks error: {0}")]
    SocksError(#[from] tokio_socks::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    InternalServerError(String),
}

/// Errors that reject a whole command line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unterminated {0} quote")]
    UnterminatedQuote(char),

    #[error("unterminated command substitution")]
    UnterminatedSubstitution,

    #[error("trailing backslash")]
    TrailingEscape,

    /// A pipe operator with nothing on one side.
    #[error("empty command around '|' at offset {0}")]
    EmptySegment(usize),

    /// A local escape prefix with no command after it.
    #[error("empty local command")]
    EmptyLocalCommand,

    #[error("invalid argument for {command}: {argument}")]
    InvalidBuiltinArgument { command: String, argument: String },
}
