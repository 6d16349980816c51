//! Proxy route resolution.
//!
//! A route is the ordered list of hops that must be dialed to reach a
//! target, outermost first. It is found by walking the `proxy` references of
//! the inventory backwards from the target and reversing the result.

use std::collections::HashSet;
use std::fmt;

use log::debug;

use crate::error::ConnectError;
use crate::host::{Inventory, ProxyType};

/// Transport used to reach or traverse one hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HopKind {
    Ssh,
    Http,
    Https,
    Socks,
    Socks5,
    /// Local relay process; always the first hop dialed.
    Command,
}

impl From<ProxyType> for HopKind {
    fn from(kind: ProxyType) -> Self {
        match kind {
            ProxyType::Ssh => HopKind::Ssh,
            ProxyType::Http => HopKind::Http,
            ProxyType::Https => HopKind::Https,
            ProxyType::Socks => HopKind::Socks,
            ProxyType::Socks5 => HopKind::Socks5,
        }
    }
}

impl fmt::Display for HopKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HopKind::Ssh => "ssh",
            HopKind::Http => "http",
            HopKind::Https => "https",
            HopKind::Socks => "socks",
            HopKind::Socks5 => "socks5",
            HopKind::Command => "command",
        };
        f.write_str(name)
    }
}

/// One step of a route.
///
/// For `Ssh` hops `name` is a server entry, for proxy services it is a
/// proxy entry, and for `Command` hops it is the relay command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyHop {
    pub name: String,
    pub kind: HopKind,
    pub port: u16,
}

/// Hops to dial for one target, outermost first, ending at the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRoute {
    hops: Vec<ProxyHop>,
}

impl ProxyRoute {
    pub fn hops(&self) -> &[ProxyHop] {
        &self.hops
    }

    /// The target itself, always the last hop.
    pub fn target(&self) -> &ProxyHop {
        // resolve() always pushes the target first, so hops is never empty.
        &self.hops[self.hops.len() - 1]
    }

    /// True when the target is dialed over plain TCP.
    pub fn is_direct(&self) -> bool {
        self.hops.len() == 1
    }

    /// Human readable path, e.g. `corp(http) -> b1(ssh) -> web1(ssh)`.
    pub fn path_description(&self) -> String {
        self.hops
            .iter()
            .map(|hop| format!("{}({})", hop.name, hop.kind))
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}

/// Builds dial routes from an inventory.
pub struct ProxyRouteResolver<'a> {
    inventory: &'a Inventory,
}

impl<'a> ProxyRouteResolver<'a> {
    pub fn new(inventory: &'a Inventory) -> Self {
        Self { inventory }
    }

    /// Resolves the route of `target`.
    ///
    /// A `proxy_command` takes precedence over a `proxy` reference and ends
    /// the walk, as does a reference to an HTTP/SOCKS proxy service.
    pub fn resolve(&self, target: &str) -> Result<ProxyRoute, ConnectError> {
        let mut seen = HashSet::new();
        let mut hops = Vec::new();
        let mut current = target.to_string();

        loop {
            if !seen.insert(current.clone()) {
                return Err(ConnectError::ProxyLoop {
                    target: target.to_string(),
                    name: current,
                });
            }
            let server = self.inventory.server(&current)?;
            hops.push(ProxyHop {
                name: current.clone(),
                kind: HopKind::Ssh,
                port: server.port_or_default(),
            });

            if let Some(command) = server.proxy_command.as_ref() {
                hops.push(ProxyHop {
                    name: command.clone(),
                    kind: HopKind::Command,
                    port: 0,
                });
                break;
            }

            let Some(proxy_name) = server.proxy.as_ref() else {
                break;
            };
            let kind = server.proxy_kind();
            if kind.is_service() {
                let proxy = self.inventory.proxy(proxy_name)?;
                if !seen.insert(proxy_name.clone()) {
                    return Err(ConnectError::ProxyLoop {
                        target: target.to_string(),
                        name: proxy_name.clone(),
                    });
                }
                hops.push(ProxyHop {
                    name: proxy_name.clone(),
                    kind: proxy.kind.into(),
                    port: proxy.port,
                });
                break;
            }
            current = proxy_name.clone();
        }

        hops.reverse();
        let route = ProxyRoute { hops };
        debug!("route for {}: {}", target, route.path_description());
        Ok(route)
    }

    /// Every server that needs credentials to reach `targets`: the targets
    /// plus all ssh hops on their routes, deduplicated in first-seen order.
    ///
    /// Targets whose route cannot be resolved are returned separately.
    pub fn auth_scope(&self, targets: &[String]) -> (Vec<String>, Vec<(String, ConnectError)>) {
        let mut seen = HashSet::new();
        let mut servers = Vec::new();
        let mut failures = Vec::new();

        for target in targets {
            match self.resolve(target) {
                Ok(route) => {
                    for hop in route.hops() {
                        if hop.kind == HopKind::Ssh && seen.insert(hop.name.clone()) {
                            servers.push(hop.name.clone());
                        }
                    }
                }
                Err(err) => failures.push((target.clone(), err)),
            }
        }

        (servers, failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{ProxyConfig, ServerConfig};
    use pretty_assertions::assert_eq;

    fn server(proxy: Option<(&str, ProxyType)>) -> ServerConfig {
        ServerConfig {
            addr: Some("127.0.0.1".to_string()),
            proxy: proxy.map(|(name, _)| name.to_string()),
            proxy_type: proxy.map(|(_, kind)| kind),
            ..Default::default()
        }
    }

    fn names(route: &ProxyRoute) -> Vec<&str> {
        route.hops().iter().map(|hop| hop.name.as_str()).collect()
    }

    #[test]
    fn direct_route_is_just_the_target() {
        let mut inventory = Inventory::default();
        inventory.remember("web1", server(None));

        let route = ProxyRouteResolver::new(&inventory)
            .resolve("web1")
            .expect("route");
        assert!(route.is_direct());
        assert_eq!(route.target().name, "web1");
        assert_eq!(route.target().port, 22);
    }

    #[test]
    fn bastion_chain_is_outermost_first() {
        let mut inventory = Inventory::default();
        inventory.remember("web1", server(Some(("b2", ProxyType::Ssh))));
        inventory.remember("b2", server(Some(("b1", ProxyType::Ssh))));
        inventory.remember("b1", server(Some(("corp", ProxyType::Socks5))));
        inventory.proxies.insert(
            "corp".to_string(),
            ProxyConfig {
                addr: "10.0.0.1".to_string(),
                port: 1080,
                kind: ProxyType::Socks5,
                user: None,
                password: None,
            },
        );

        let route = ProxyRouteResolver::new(&inventory)
            .resolve("web1")
            .expect("route");
        assert_eq!(names(&route), vec!["corp", "b1", "b2", "web1"]);
        assert_eq!(route.hops()[0].kind, HopKind::Socks5);
        assert_eq!(route.hops()[0].port, 1080);
        assert_eq!(
            route.path_description(),
            "corp(socks5) -> b1(ssh) -> b2(ssh) -> web1(ssh)"
        );
    }

    #[test]
    fn relay_command_is_terminal() {
        let mut inventory = Inventory::default();
        let mut web = server(Some(("b1", ProxyType::Ssh)));
        web.proxy_command = Some("nc %h %p".to_string());
        inventory.remember("web1", web);

        let route = ProxyRouteResolver::new(&inventory)
            .resolve("web1")
            .expect("route");
        assert_eq!(route.hops()[0].kind, HopKind::Command);
        assert_eq!(names(&route), vec!["nc %h %p", "web1"]);
    }

    #[test]
    fn cycle_is_rejected() {
        let mut inventory = Inventory::default();
        inventory.remember("a", server(Some(("b", ProxyType::Ssh))));
        inventory.remember("b", server(Some(("c", ProxyType::Ssh))));
        inventory.remember("c", server(Some(("a", ProxyType::Ssh))));

        let err = ProxyRouteResolver::new(&inventory)
            .resolve("a")
            .expect_err("cycle");
        assert!(matches!(err, ConnectError::ProxyLoop { ref name, .. } if name == "a"));
    }

    #[test]
    fn self_reference_is_rejected() {
        let mut inventory = Inventory::default();
        inventory.remember("a", server(Some(("a", ProxyType::Ssh))));

        assert!(matches!(
            ProxyRouteResolver::new(&inventory).resolve("a"),
            Err(ConnectError::ProxyLoop { .. })
        ));
    }

    #[test]
    fn missing_references_are_configuration_errors() {
        let mut inventory = Inventory::default();
        inventory.remember("web1", server(Some(("ghost", ProxyType::Ssh))));
        inventory.remember("web2", server(Some(("nowhere", ProxyType::Http))));
        let resolver = ProxyRouteResolver::new(&inventory);

        assert!(matches!(
            resolver.resolve("web1"),
            Err(ConnectError::UnknownServer(ref name)) if name == "ghost"
        ));
        assert!(matches!(
            resolver.resolve("web2"),
            Err(ConnectError::UnknownProxy(ref name)) if name == "nowhere"
        ));
    }

    #[test]
    fn auth_scope_includes_bastions_once() {
        let mut inventory = Inventory::default();
        inventory.remember("web1", server(Some(("b1", ProxyType::Ssh))));
        inventory.remember("web2", server(Some(("b1", ProxyType::Ssh))));
        inventory.remember("b1", server(None));

        let targets = vec!["web1".to_string(), "web2".to_string(), "bad".to_string()];
        let (servers, failures) = ProxyRouteResolver::new(&inventory).auth_scope(&targets);
        assert_eq!(servers, vec!["b1", "web1", "web2"]);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "bad");
    }
}
