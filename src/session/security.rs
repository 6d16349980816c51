use super::*;

/// Algorithm profile offered during key exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum SecurityLevel {
    /// Modern algorithms only (default).
    Secure,
    /// Adds SHA-1 MACs and CBC ciphers for older servers.
    Balanced,
    /// Everything russh can speak.
    LegacyCompatible,
}

/// How a server host key is verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Accept any key.
    NoCheck,
    /// Require a matching entry in `~/.ssh/known_hosts`.
    KnownHosts,
    /// Require a matching entry in the given file.
    KnownHostsFile(PathBuf),
    /// Reject changed keys, record unknown ones in `~/.ssh/known_hosts`.
    AcceptNew,
}

impl HostKeyPolicy {
    /// Checks `key` presented by `host:port`. `Ok(false)` aborts the handshake.
    pub(super) fn verify(&self, host: &str, port: u16, key: &PublicKey) -> Result<bool, ConnectError> {
        match self {
            HostKeyPolicy::NoCheck => Ok(true),
            HostKeyPolicy::KnownHosts => match russh::keys::check_known_hosts(host, port, key) {
                Ok(known) => {
                    if !known {
                        warn!("{}:{} is not in known_hosts", host, port);
                    }
                    Ok(known)
                }
                Err(err) => {
                    warn!("host key check for {}:{} failed: {}", host, port, err);
                    Ok(false)
                }
            },
            HostKeyPolicy::KnownHostsFile(path) => {
                match russh::keys::check_known_hosts_path(host, port, key, path) {
                    Ok(known) => Ok(known),
                    Err(err) => {
                        warn!(
                            "host key check for {}:{} against {} failed: {}",
                            host,
                            port,
                            path.display(),
                            err
                        );
                        Ok(false)
                    }
                }
            }
            HostKeyPolicy::AcceptNew => match russh::keys::check_known_hosts(host, port, key) {
                Ok(true) => Ok(true),
                Ok(false) => {
                    info!("learning host key of {}:{}", host, port);
                    russh::keys::known_hosts::learn_known_hosts(host, port, key)?;
                    Ok(true)
                }
                Err(err) => {
                    warn!("host key of {}:{} changed: {}", host, port, err);
                    Ok(false)
                }
            },
        }
    }
}

/// Algorithm profile plus host key policy of every hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSecurityOptions {
    pub level: SecurityLevel,
    pub host_key: HostKeyPolicy,
}

impl Default for ConnectionSecurityOptions {
    fn default() -> Self {
        Self::secure_default()
    }
}

impl ConnectionSecurityOptions {
    pub fn secure_default() -> Self {
        Self {
            level: SecurityLevel::Secure,
            host_key: HostKeyPolicy::KnownHosts,
        }
    }

    /// Broader algorithms; unknown hosts are trusted on first use.
    pub fn balanced() -> Self {
        Self {
            level: SecurityLevel::Balanced,
            host_key: HostKeyPolicy::AcceptNew,
        }
    }

    pub fn legacy_compatible() -> Self {
        Self {
            level: SecurityLevel::LegacyCompatible,
            host_key: HostKeyPolicy::NoCheck,
        }
    }

    pub(crate) fn preferred(&self) -> Preferred {
        match self.level {
            SecurityLevel::Secure => Preferred {
                kex: Cow::Borrowed(config::SECURE_KEX_ORDER),
                key: Cow::Borrowed(config::SECURE_KEY_TYPES),
                cipher: Cow::Borrowed(config::SECURE_CIPHERS),
                mac: Cow::Borrowed(config::SECURE_MAC_ALGORITHMS),
                compression: Cow::Borrowed(config::DEFAULT_COMPRESSION_ALGORITHMS),
            },
            SecurityLevel::Balanced => Preferred {
                kex: Cow::Borrowed(config::BALANCED_KEX_ORDER),
                key: Cow::Borrowed(config::BALANCED_KEY_TYPES),
                cipher: Cow::Borrowed(config::BALANCED_CIPHERS),
                mac: Cow::Borrowed(config::BALANCED_MAC_ALGORITHMS),
                compression: Cow::Borrowed(config::DEFAULT_COMPRESSION_ALGORITHMS),
            },
            SecurityLevel::LegacyCompatible => Preferred {
                kex: Cow::Borrowed(config::LEGACY_KEX_ORDER),
                key: Cow::Borrowed(config::LEGACY_KEY_TYPES),
                cipher: Cow::Borrowed(config::LEGACY_CIPHERS),
                mac: Cow::Borrowed(config::LEGACY_MAC_ALGORITHMS),
                compression: Cow::Borrowed(config::DEFAULT_COMPRESSION_ALGORITHMS),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ConnectionSecurityOptions, HostKeyPolicy, SecurityLevel};
    use russh::keys::PrivateKey;
    use russh::keys::ssh_key::private::Ed25519Keypair;
    use russh::{cipher, kex, mac};

    #[test]
    fn default_security_options_are_strict() {
        let options = ConnectionSecurityOptions::default();
        assert_eq!(options.level, SecurityLevel::Secure);
        assert_eq!(options.host_key, HostKeyPolicy::KnownHosts);
    }

    #[test]
    fn legacy_profile_skips_host_check() {
        let options = ConnectionSecurityOptions::legacy_compatible();
        assert_eq!(options.level, SecurityLevel::LegacyCompatible);
        assert_eq!(options.host_key, HostKeyPolicy::NoCheck);
    }

    #[test]
    fn secure_profile_excludes_weak_algorithms() {
        let preferred = ConnectionSecurityOptions::secure_default().preferred();

        assert!(preferred.kex.iter().all(|alg| *alg != kex::NONE));
        assert!(preferred.cipher.iter().all(|alg| *alg != cipher::NONE));
        assert!(preferred.cipher.iter().all(|alg| *alg != cipher::CLEAR));
        assert!(preferred.mac.iter().all(|alg| *alg != mac::NONE));
    }

    #[test]
    fn legacy_profile_keeps_old_algorithms() {
        let preferred = ConnectionSecurityOptions::legacy_compatible().preferred();

        assert!(preferred.kex.contains(&kex::DH_G1_SHA1));
        assert!(preferred.cipher.contains(&cipher::NONE));
        assert!(preferred.mac.contains(&mac::NONE));
    }

    #[test]
    fn unknown_host_fails_custom_known_hosts_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("known_hosts");
        std::fs::write(&path, "").expect("write known_hosts");
        let key = PrivateKey::from(Ed25519Keypair::from_seed(&[3u8; 32]));

        let policy = HostKeyPolicy::KnownHostsFile(path);
        let accepted = policy
            .verify("10.0.0.1", 22, key.public_key())
            .expect("verify");
        assert!(!accepted);
        assert!(
            HostKeyPolicy::NoCheck
                .verify("10.0.0.1", 22, key.public_key())
                .expect("verify")
        );
    }
}
