//! Credential resolution and caching.
//!
//! Before connecting, every server that needs credentials (targets and the
//! bastions on their routes) is resolved once. Each credential is keyed by
//! its kind and a SHA-256 fingerprint of its material, so a key file shared
//! by fifty servers is read and parsed exactly once.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use log::{debug, warn};
use moka::future::Cache;
use russh::keys::ssh_key::Certificate;
use russh::keys::{PrivateKey, PublicKey};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::task::JoinSet;
use zeroize::Zeroizing;

use crate::error::ConnectError;
use crate::host::{Inventory, ServerConfig};

/// A secret as stored in configuration, optionally obfuscated.
///
/// The stored form is kept verbatim so it can be written back without ever
/// putting the plain value at rest.
#[derive(Clone)]
pub struct Secret {
    stored: String,
    plain: Zeroizing<String>,
}

impl Secret {
    /// Marks a base64-obfuscated value.
    pub const OBFUSCATED_PREFIX: &'static str = "b64:";

    /// Decodes `stored`, revealing obfuscated values.
    pub fn parse(stored: &str) -> Result<Self, String> {
        let plain = match stored.strip_prefix(Self::OBFUSCATED_PREFIX) {
            Some(encoded) => {
                let bytes = BASE64
                    .decode(encoded.trim())
                    .map_err(|e| format!("invalid obfuscated value: {e}"))?;
                String::from_utf8(bytes).map_err(|e| format!("invalid obfuscated value: {e}"))?
            }
            None => stored.to_string(),
        };
        Ok(Self {
            stored: stored.to_string(),
            plain: Zeroizing::new(plain),
        })
    }

    /// Obfuscated at-rest form of a plain value.
    pub fn obfuscate(plain: &str) -> String {
        format!("{}{}", Self::OBFUSCATED_PREFIX, BASE64.encode(plain.as_bytes()))
    }

    pub fn reveal(&self) -> &str {
        &self.plain
    }

    /// The value exactly as it was configured.
    pub fn original(&self) -> &str {
        &self.stored
    }

    pub fn is_obfuscated(&self) -> bool {
        self.stored.starts_with(Self::OBFUSCATED_PREFIX)
    }

    /// Form to persist: the original when already obfuscated, else freshly
    /// obfuscated.
    pub fn to_stored(&self) -> String {
        if self.is_obfuscated() {
            self.stored.clone()
        } else {
            Self::obfuscate(&self.plain)
        }
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Credential kinds in resolution priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AuthKind {
    Password,
    KeyFile,
    KeyCommand,
    Certificate,
    Pkcs11,
    Agent,
}

impl AuthKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthKind::Password => "password",
            AuthKind::KeyFile => "key",
            AuthKind::KeyCommand => "key_command",
            AuthKind::Certificate => "cert",
            AuthKind::Pkcs11 => "pkcs11",
            AuthKind::Agent => "agent",
        }
    }
}

/// Credential material as described by configuration.
#[derive(Debug, Clone)]
pub enum AuthCredential {
    Password(Secret),
    KeyFile {
        path: PathBuf,
        passphrase: Option<Secret>,
    },
    KeyCommand {
        command: String,
        passphrase: Option<Secret>,
    },
    Certificate {
        cert: PathBuf,
        key: PathBuf,
        passphrase: Option<Secret>,
    },
    Pkcs11 {
        provider: String,
        pin: Secret,
    },
    Agent,
}

/// Cache identity of a credential: its kind plus a digest of its material.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AuthKey {
    pub kind: AuthKind,
    fingerprint: [u8; 32],
}

impl AuthCredential {
    pub fn kind(&self) -> AuthKind {
        match self {
            AuthCredential::Password(_) => AuthKind::Password,
            AuthCredential::KeyFile { .. } => AuthKind::KeyFile,
            AuthCredential::KeyCommand { .. } => AuthKind::KeyCommand,
            AuthCredential::Certificate { .. } => AuthKind::Certificate,
            AuthCredential::Pkcs11 { .. } => AuthKind::Pkcs11,
            AuthCredential::Agent => AuthKind::Agent,
        }
    }

    pub fn cache_key(&self) -> AuthKey {
        let mut hasher = Sha256::new();
        let mut feed = |part: &[u8]| {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part);
        };
        match self {
            AuthCredential::Password(secret) => feed(secret.reveal().as_bytes()),
            AuthCredential::KeyFile { path, passphrase } => {
                feed(path.to_string_lossy().as_bytes());
                feed(passphrase.as_ref().map_or("", Secret::reveal).as_bytes());
            }
            AuthCredential::KeyCommand {
                command,
                passphrase,
            } => {
                feed(command.as_bytes());
                feed(passphrase.as_ref().map_or("", Secret::reveal).as_bytes());
            }
            AuthCredential::Certificate {
                cert,
                key,
                passphrase,
            } => {
                feed(cert.to_string_lossy().as_bytes());
                feed(key.to_string_lossy().as_bytes());
                feed(passphrase.as_ref().map_or("", Secret::reveal).as_bytes());
            }
            AuthCredential::Pkcs11 { provider, pin } => {
                feed(provider.as_bytes());
                feed(pin.reveal().as_bytes());
            }
            AuthCredential::Agent => {
                feed(std::env::var("SSH_AUTH_SOCK").unwrap_or_default().as_bytes());
            }
        }
        AuthKey {
            kind: self.kind(),
            fingerprint: hasher.finalize().into(),
        }
    }

    /// Extracts the credentials of one server in priority order.
    ///
    /// Values that cannot even be decoded are returned as errors; the rest
    /// of the server's credentials are still usable.
    pub fn from_server(
        name: &str,
        server: &ServerConfig,
    ) -> (Vec<AuthCredential>, Vec<ConnectError>) {
        let mut credentials = Vec::new();
        let mut errors = Vec::new();
        let secret = |kind: AuthKind, value: &Option<String>, errors: &mut Vec<ConnectError>| {
            let value = value.as_ref()?;
            match Secret::parse(value) {
                Ok(secret) => Some(secret),
                Err(reason) => {
                    errors.push(ConnectError::Credential {
                        server: name.to_string(),
                        kind: kind.as_str(),
                        reason,
                    });
                    None
                }
            }
        };

        if let Some(password) = secret(AuthKind::Password, &server.password, &mut errors) {
            credentials.push(AuthCredential::Password(password));
        }
        let passphrase = secret(AuthKind::KeyFile, &server.key_passphrase, &mut errors);
        if let Some(key) = server.key.as_ref() {
            credentials.push(AuthCredential::KeyFile {
                path: expand_path(key),
                passphrase: passphrase.clone(),
            });
        }
        if let Some(command) = server.key_command.as_ref() {
            credentials.push(AuthCredential::KeyCommand {
                command: command.clone(),
                passphrase: passphrase.clone(),
            });
        }
        if let Some(cert) = server.cert.as_ref() {
            match server.cert_key.as_ref().or(server.key.as_ref()) {
                Some(key) => credentials.push(AuthCredential::Certificate {
                    cert: expand_path(cert),
                    key: expand_path(key),
                    passphrase: passphrase.clone(),
                }),
                None => errors.push(ConnectError::Credential {
                    server: name.to_string(),
                    kind: AuthKind::Certificate.as_str(),
                    reason: "certificate configured without a private key".to_string(),
                }),
            }
        }
        if let Some(provider) = server.pkcs11_provider.as_ref() {
            let pin = secret(AuthKind::Pkcs11, &server.pkcs11_pin, &mut errors);
            credentials.push(AuthCredential::Pkcs11 {
                provider: provider.clone(),
                pin: pin.unwrap_or_else(|| Secret {
                    stored: String::new(),
                    plain: Zeroizing::new(String::new()),
                }),
            });
        }

        // An unset `agent` means "use it when one is running".
        let agent = server
            .agent
            .unwrap_or_else(|| std::env::var_os("SSH_AUTH_SOCK").is_some());
        if agent {
            credentials.push(AuthCredential::Agent);
        }

        (credentials, errors)
    }
}

/// A ready-to-use authentication method.
pub enum AuthMethod {
    Password(Zeroizing<String>),
    PublicKey(Arc<PrivateKey>),
    Certificate {
        key: Arc<PrivateKey>,
        cert: Certificate,
    },
    /// Keys held by the agent after loading a PKCS#11 provider.
    AgentIdentities(Vec<PublicKey>),
    /// Every identity the running agent offers.
    Agent,
}

impl AuthMethod {
    pub fn kind_name(&self) -> &'static str {
        match self {
            AuthMethod::Password(_) => "password",
            AuthMethod::PublicKey(_) => "publickey",
            AuthMethod::Certificate { .. } => "certificate",
            AuthMethod::AgentIdentities(_) => "pkcs11",
            AuthMethod::Agent => "agent",
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthMethod({})", self.kind_name())
    }
}

/// Outcome of one resolution pass.
#[derive(Debug, Default)]
pub struct ResolutionReport {
    /// Servers with at least one usable method.
    pub resolved: Vec<String>,
    /// Servers left without any method; they are not dialed.
    pub excluded: Vec<String>,
    /// Every individual credential failure.
    pub failures: Vec<(String, ConnectError)>,
}

/// Resolved authentication methods of one session.
///
/// Written by [`AuthMethodCache::resolve`] and read-only afterwards.
pub struct AuthMethodCache {
    methods: Cache<AuthKey, Arc<AuthMethod>>,
    derivations: Arc<AtomicUsize>,
    servers: HashMap<String, Vec<Arc<AuthMethod>>>,
}

impl AuthMethodCache {
    pub fn new() -> Self {
        Self {
            methods: Cache::builder().max_capacity(4096).build(),
            derivations: Arc::new(AtomicUsize::new(0)),
            servers: HashMap::new(),
        }
    }

    /// Resolves the credentials of `servers` concurrently.
    pub async fn resolve(&mut self, inventory: &Inventory, servers: &[String]) -> ResolutionReport {
        let mut report = ResolutionReport::default();
        let mut tasks = JoinSet::new();

        for name in servers {
            let server = match inventory.server(name) {
                Ok(server) => server,
                Err(err) => {
                    report.failures.push((name.clone(), err));
                    report.excluded.push(name.clone());
                    continue;
                }
            };
            let (credentials, errors) = AuthCredential::from_server(name, server);
            report
                .failures
                .extend(errors.into_iter().map(|err| (name.clone(), err)));

            let methods = self.methods.clone();
            let derivations = self.derivations.clone();
            let name = name.clone();
            tasks.spawn(async move {
                let mut resolved = Vec::new();
                let mut failures = Vec::new();
                for credential in credentials {
                    let kind = credential.kind();
                    let key = credential.cache_key();
                    let counter = derivations.clone();
                    let result = methods
                        .try_get_with(key, async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            derive(credential).await.map(Arc::new)
                        })
                        .await;
                    match result {
                        Ok(method) => resolved.push(method),
                        Err(reason) => failures.push(ConnectError::Credential {
                            server: name.clone(),
                            kind: kind.as_str(),
                            reason: reason.to_string(),
                        }),
                    }
                }
                (name, resolved, failures)
            });
        }

        let mut resolved_by_name = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, methods, failures)) => {
                    for err in failures {
                        warn!("{}: {}", name, err);
                        report.failures.push((name.clone(), err));
                    }
                    resolved_by_name.insert(name, methods);
                }
                Err(err) => warn!("credential task failed: {}", err),
            }
        }

        for name in servers {
            let Some(methods) = resolved_by_name.remove(name) else {
                continue;
            };
            if methods.is_empty() {
                warn!("{} has no usable authentication method", name);
                report.excluded.push(name.clone());
            } else {
                debug!("{} resolved {} auth method(s)", name, methods.len());
                report.resolved.push(name.clone());
                self.servers.insert(name.clone(), methods);
            }
        }

        report
    }

    /// Methods of `server` in priority order.
    pub fn methods_for(&self, server: &str) -> Option<&[Arc<AuthMethod>]> {
        self.servers.get(server).map(Vec::as_slice)
    }

    /// Number of times credential material was actually read or derived.
    pub fn derivations(&self) -> usize {
        self.derivations.load(Ordering::SeqCst)
    }
}

impl Default for AuthMethodCache {
    fn default() -> Self {
        Self::new()
    }
}

async fn derive(credential: AuthCredential) -> Result<AuthMethod, String> {
    match credential {
        AuthCredential::Password(secret) => Ok(AuthMethod::Password(Zeroizing::new(
            secret.reveal().to_string(),
        ))),
        AuthCredential::KeyFile { path, passphrase } => {
            debug!("loading key file {}", path.display());
            let key = russh::keys::load_secret_key(&path, passphrase.as_ref().map(Secret::reveal))
                .map_err(|e| format!("{}: {e}", path.display()))?;
            Ok(AuthMethod::PublicKey(Arc::new(key)))
        }
        AuthCredential::KeyCommand {
            command,
            passphrase,
        } => {
            let argv = shlex::split(&command)
                .filter(|argv| !argv.is_empty())
                .ok_or_else(|| format!("invalid key command {command:?}"))?;
            debug!("running key command {}", argv[0]);
            let output = tokio::process::Command::new(&argv[0])
                .args(&argv[1..])
                .stdin(std::process::Stdio::null())
                .output()
                .await
                .map_err(|e| format!("{command}: {e}"))?;
            if !output.status.success() {
                return Err(format!("{command}: exited with {}", output.status));
            }
            let pem = Zeroizing::new(
                String::from_utf8(output.stdout).map_err(|e| format!("{command}: {e}"))?,
            );
            let key = russh::keys::decode_secret_key(&pem, passphrase.as_ref().map(Secret::reveal))
                .map_err(|e| format!("{command}: {e}"))?;
            Ok(AuthMethod::PublicKey(Arc::new(key)))
        }
        AuthCredential::Certificate {
            cert,
            key,
            passphrase,
        } => {
            let private = russh::keys::load_secret_key(&key, passphrase.as_ref().map(Secret::reveal))
                .map_err(|e| format!("{}: {e}", key.display()))?;
            let cert = russh::keys::load_openssh_certificate(&cert)
                .map_err(|e| format!("{}: {e}", cert.display()))?;
            Ok(AuthMethod::Certificate {
                key: Arc::new(private),
                cert,
            })
        }
        AuthCredential::Pkcs11 { provider, pin } => load_pkcs11(&provider, pin.reveal()).await,
        AuthCredential::Agent => probe_agent().await,
    }
}

#[cfg(unix)]
async fn load_pkcs11(provider: &str, pin: &str) -> Result<AuthMethod, String> {
    use russh::keys::agent::client::AgentClient;

    let mut agent = AgentClient::connect_env()
        .await
        .map_err(|e| format!("ssh agent unavailable: {e}"))?;
    agent
        .add_smartcard_key(provider, pin.as_bytes(), &[])
        .await
        .map_err(|e| format!("{provider}: {e}"))?;
    let identities = agent
        .request_identities()
        .await
        .map_err(|e| format!("{provider}: {e}"))?;
    if identities.is_empty() {
        return Err(format!("{provider}: no keys exposed"));
    }
    Ok(AuthMethod::AgentIdentities(identities))
}

#[cfg(not(unix))]
async fn load_pkcs11(provider: &str, _pin: &str) -> Result<AuthMethod, String> {
    Err(format!("{provider}: PKCS#11 requires an ssh agent socket"))
}

#[cfg(unix)]
async fn probe_agent() -> Result<AuthMethod, String> {
    use russh::keys::agent::client::AgentClient;

    let mut agent = AgentClient::connect_env()
        .await
        .map_err(|e| format!("ssh agent unavailable: {e}"))?;
    let identities = agent
        .request_identities()
        .await
        .map_err(|e| format!("ssh agent: {e}"))?;
    if identities.is_empty() {
        return Err("ssh agent holds no identities".to_string());
    }
    Ok(AuthMethod::Agent)
}

#[cfg(not(unix))]
async fn probe_agent() -> Result<AuthMethod, String> {
    Err("ssh agent is not supported on this platform".to_string())
}

/// Expands a leading `~/` to the home directory.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(stripped);
    }
    if path == "~"
        && let Some(home) = dirs::home_dir()
    {
        return home;
    }
    PathBuf::from(path)
}
