//! Typed host inventory.
//!
//! The inventory is what the configuration subsystem hands over: named
//! servers, named HTTP/SOCKS proxy services and a `common` block of defaults.
//! Every server field is optional so that "unset" is explicit and
//! [`Inventory::merge_common`] can fill the gaps once, at load time.

use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::auth::{AuthKind, Secret};
use crate::error::ConnectError;

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

static ADHOC_HOST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:(?P<user>[^@\s]+)@)?(?:\[(?P<v6>[0-9A-Fa-f:.]+)\]|(?P<host>[^:@\s\[\]]+))(?::(?P<port>\d+))?$",
    )
    .expect("valid host regex")
});

/// How a server reaches the host named in its `proxy` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    /// `proxy` names another server entry used as a bastion.
    Ssh,
    Http,
    Https,
    Socks,
    Socks5,
}

impl ProxyType {
    /// True for proxy services, which live in the `proxies` table.
    pub fn is_service(self) -> bool {
        !matches!(self, ProxyType::Ssh)
    }
}

/// One server entry. Every field may be absent until merged with `common`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ServerConfig {
    pub addr: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,

    /// Plain or `b64:`-obfuscated password.
    pub password: Option<String>,
    pub key: Option<String>,
    pub key_passphrase: Option<String>,
    /// Command whose stdout is a private key.
    pub key_command: Option<String>,
    pub cert: Option<String>,
    /// Private key matching `cert`; defaults to `key`.
    pub cert_key: Option<String>,
    pub pkcs11_provider: Option<String>,
    pub pkcs11_pin: Option<String>,
    pub agent: Option<bool>,

    pub proxy: Option<String>,
    pub proxy_type: Option<ProxyType>,
    /// Local relay command; `%h` and `%p` expand to the target address.
    pub proxy_command: Option<String>,

    pub groups: Vec<String>,
}

macro_rules! inherit {
    ($dst:ident, $src:ident, $($field:ident),+ $(,)?) => {
        $(
            if $dst.$field.is_none() {
                $dst.$field = $src.$field.clone();
            }
        )+
    };
}

impl ServerConfig {
    /// Fills every unset field from `common`.
    pub fn inherit_from(&mut self, common: &ServerConfig) {
        let this = self;
        inherit!(
            this,
            common,
            addr,
            port,
            user,
            password,
            key,
            key_passphrase,
            key_command,
            cert,
            cert_key,
            pkcs11_provider,
            pkcs11_pin,
            agent,
            proxy,
            proxy_type,
            proxy_command,
        );
    }

    /// Rewrites every plaintext secret in its obfuscated at-rest form.
    pub fn seal_secrets(&mut self, server: &str) -> Result<(), ConnectError> {
        let fields = [
            (AuthKind::Password, &mut self.password),
            (AuthKind::KeyFile, &mut self.key_passphrase),
            (AuthKind::Pkcs11, &mut self.pkcs11_pin),
        ];
        for (kind, field) in fields {
            if let Some(value) = field.as_mut() {
                let secret = Secret::parse(value).map_err(|reason| ConnectError::Credential {
                    server: server.to_string(),
                    kind: kind.as_str(),
                    reason,
                })?;
                *value = secret.to_stored();
            }
        }
        Ok(())
    }

    /// Address to dial, falling back to the entry name.
    pub fn address<'a>(&'a self, name: &'a str) -> &'a str {
        self.addr.as_deref().unwrap_or(name)
    }

    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_SSH_PORT)
    }

    /// Login user, falling back to the local user name.
    pub fn user_or_default(&self) -> String {
        self.user.clone().unwrap_or_else(local_user)
    }

    /// Effective proxy kind of the `proxy` reference.
    pub fn proxy_kind(&self) -> ProxyType {
        self.proxy_type.unwrap_or(ProxyType::Ssh)
    }

    pub fn in_group(&self, label: &str) -> bool {
        self.groups.iter().any(|g| g == label)
    }
}

/// An HTTP, HTTPS or SOCKS proxy service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ProxyConfig {
    pub addr: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub kind: ProxyType,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Named servers and proxies as read from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Inventory {
    pub common: ServerConfig,
    pub servers: BTreeMap<String, ServerConfig>,
    pub proxies: BTreeMap<String, ProxyConfig>,
}

impl Inventory {
    /// Applies `common` to every server. Call once after loading.
    pub fn merge_common(&mut self) {
        let common = self.common.clone();
        for server in self.servers.values_mut() {
            server.inherit_from(&common);
        }
    }

    pub fn server(&self, name: &str) -> Result<&ServerConfig, ConnectError> {
        self.servers
            .get(name)
            .ok_or_else(|| ConnectError::UnknownServer(name.to_string()))
    }

    pub fn proxy(&self, name: &str) -> Result<&ProxyConfig, ConnectError> {
        self.proxies
            .get(name)
            .ok_or_else(|| ConnectError::UnknownProxy(name.to_string()))
    }

    /// Names of the servers carrying `label`, in name order.
    pub fn servers_in_group(&self, label: &str) -> Vec<String> {
        self.servers
            .iter()
            .filter(|(_, server)| server.in_group(label))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Stores an ephemeral server so later lookups by name succeed.
    pub fn remember(&mut self, name: impl Into<String>, server: ServerConfig) {
        self.servers.insert(name.into(), server);
    }
}

/// Parses `user@host:port`, `host:port`, `user@[v6]:port` or `host`.
///
/// The returned entry inherits nothing; callers merge `common` themselves.
pub fn parse_adhoc(spec: &str) -> Result<ServerConfig, ConnectError> {
    let invalid = || ConnectError::InvalidHost(spec.to_string());
    let caps = ADHOC_HOST.captures(spec.trim()).ok_or_else(invalid)?;

    let addr = caps
        .name("v6")
        .or_else(|| caps.name("host"))
        .map(|m| m.as_str().to_string())
        .ok_or_else(invalid)?;
    let port = match caps.name("port") {
        Some(port) => Some(port.as_str().parse::<u16>().map_err(|_| invalid())?),
        None => None,
    };

    Ok(ServerConfig {
        addr: Some(addr),
        port,
        user: caps.name("user").map(|m| m.as_str().to_string()),
        ..Default::default()
    })
}

fn local_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "root".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn adhoc_full_form() {
        let server = parse_adhoc("admin@10.0.0.5:2222").expect("parse");
        assert_eq!(server.user.as_deref(), Some("admin"));
        assert_eq!(server.addr.as_deref(), Some("10.0.0.5"));
        assert_eq!(server.port, Some(2222));
    }

    #[test]
    fn adhoc_host_only_and_ipv6() {
        let server = parse_adhoc("web1").expect("parse");
        assert_eq!(server.addr.as_deref(), Some("web1"));
        assert_eq!(server.port, None);
        assert_eq!(server.user, None);

        let server = parse_adhoc("root@[fe80::1]:22").expect("parse");
        assert_eq!(server.addr.as_deref(), Some("fe80::1"));
        assert_eq!(server.port, Some(22));
    }

    #[test]
    fn adhoc_rejects_bad_port() {
        assert!(matches!(
            parse_adhoc("host:99999"),
            Err(ConnectError::InvalidHost(_))
        ));
        assert!(matches!(
            parse_adhoc("a@b@c"),
            Err(ConnectError::InvalidHost(_))
        ));
    }

    #[test]
    fn sealed_secrets_are_never_plaintext() {
        let mut server = ServerConfig {
            password: Some("hunter2".to_string()),
            key_passphrase: Some(Secret::obfuscate("phrase")),
            pkcs11_pin: Some("1234".to_string()),
            ..Default::default()
        };
        server.seal_secrets("web1").expect("seal");

        assert_eq!(server.password, Some(Secret::obfuscate("hunter2")));
        assert_eq!(server.key_passphrase, Some(Secret::obfuscate("phrase")));
        assert_eq!(server.pkcs11_pin, Some(Secret::obfuscate("1234")));
        let json = serde_json::to_string(&server).expect("json");
        assert!(!json.contains("hunter2"));

        let mut broken = ServerConfig {
            password: Some("b64:!!".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            broken.seal_secrets("web1"),
            Err(ConnectError::Credential { kind: "password", .. })
        ));
    }

    #[test]
    fn merge_common_fills_only_unset_fields() {
        let mut inventory = Inventory {
            common: ServerConfig {
                user: Some("ops".to_string()),
                port: Some(2200),
                key: Some("~/.ssh/id_ed25519".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        inventory.remember(
            "db",
            ServerConfig {
                addr: Some("10.0.0.9".to_string()),
                user: Some("postgres".to_string()),
                ..Default::default()
            },
        );
        inventory.merge_common();

        let db = inventory.server("db").expect("db");
        assert_eq!(db.user.as_deref(), Some("postgres"));
        assert_eq!(db.port, Some(2200));
        assert_eq!(db.key.as_deref(), Some("~/.ssh/id_ed25519"));
    }

    #[test]
    fn inventory_deserializes_from_json() {
        let inventory: Inventory = serde_json::from_str(
            r#"{
                "servers": {
                    "web1": {"addr": "10.0.1.1", "proxy": "b1", "groups": ["web"]},
                    "b1": {"addr": "bastion.example.com"}
                },
                "proxies": {
                    "corp": {"addr": "proxy.example.com", "port": 3128, "type": "http"}
                }
            }"#,
        )
        .expect("inventory");

        assert_eq!(inventory.servers_in_group("web"), vec!["web1".to_string()]);
        assert_eq!(
            inventory.server("web1").expect("web1").proxy_kind(),
            ProxyType::Ssh
        );
        assert_eq!(inventory.proxy("corp").expect("corp").kind, ProxyType::Http);
        assert!(matches!(
            inventory.server("nope"),
            Err(ConnectError::UnknownServer(_))
        ));
    }
}
