use super::*;

use crate::host::ServerConfig;
use crate::route::ProxyHop;
use client::HopTarget;
use dialer::{dial_proxy, dial_tcp};
use std::collections::HashSet;
use std::future::Future;
use std::sync::{RwLock, RwLockReadGuard};
use tokio::task::JoinSet;

type ConnectFuture<'a> = Pin<Box<dyn Future<Output = Result<Connection, ConnectError>> + Send + 'a>>;

/// Outcome of connecting a set of targets.
#[derive(Debug, Default)]
pub struct ConnectReport {
    /// Live connections, in the order the targets were given.
    pub connected: Vec<Connection>,
    /// Targets that could not be connected.
    pub failures: Vec<(String, ConnectError)>,
    /// Individual credentials that failed to resolve.
    pub credential_failures: Vec<(String, ConnectError)>,
}

/// Everything needed to dial one server, copied out of the inventory.
struct DialPlan {
    server: ServerConfig,
    outer: Option<ProxyHop>,
    proxy: Option<ProxyConfig>,
    path: String,
}

/// Builds authenticated connections from an inventory.
///
/// Credentials are resolved once per session by [`prepare`](Self::prepare)
/// and shared by every connection afterwards.
pub struct ConnectionFactory {
    inventory: RwLock<Inventory>,
    auth: tokio::sync::RwLock<AuthMethodCache>,
    options: ConnectOptions,
}

impl ConnectionFactory {
    pub fn new(inventory: Inventory, options: ConnectOptions) -> Self {
        Self {
            inventory: RwLock::new(inventory),
            auth: tokio::sync::RwLock::new(AuthMethodCache::new()),
            options,
        }
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    fn inventory(&self) -> Result<RwLockReadGuard<'_, Inventory>, ConnectError> {
        self.inventory
            .read()
            .map_err(|_| ConnectError::InternalServerError("inventory lock poisoned".to_string()))
    }

    /// True when `name` is a configured or remembered server.
    pub fn knows(&self, name: &str) -> bool {
        self.inventory()
            .map(|inventory| inventory.servers.contains_key(name))
            .unwrap_or(false)
    }

    /// Names of the servers carrying `label`.
    pub fn group(&self, label: &str) -> Result<Vec<String>, ConnectError> {
        Ok(self.inventory()?.servers_in_group(label))
    }

    /// Dial route of `target`, outermost hop first.
    pub fn route(&self, target: &str) -> Result<ProxyRoute, ConnectError> {
        let inventory = self.inventory()?;
        ProxyRouteResolver::new(&inventory).resolve(target)
    }

    /// Resolves the credentials of `targets` and of every bastion on their
    /// routes. Targets whose route is invalid are returned as failures.
    pub async fn prepare(&self, targets: &[String]) -> (ResolutionReport, Vec<(String, ConnectError)>) {
        let snapshot = match self.inventory() {
            Ok(inventory) => inventory.clone(),
            Err(err) => {
                let failures = targets
                    .iter()
                    .map(|t| {
                        (
                            t.clone(),
                            ConnectError::InternalServerError(err.to_string()),
                        )
                    })
                    .collect();
                return (ResolutionReport::default(), failures);
            }
        };
        let (servers, route_failures) = ProxyRouteResolver::new(&snapshot).auth_scope(targets);
        for (target, err) in &route_failures {
            warn!("{}: {}", target, err);
        }

        let mut auth = self.auth.write().await;
        let report = auth.resolve(&snapshot, &servers).await;
        debug!(
            "resolved credentials for {} server(s), {} excluded",
            report.resolved.len(),
            report.excluded.len()
        );
        (report, route_failures)
    }

    async fn methods(&self, name: &str) -> Result<Vec<Arc<AuthMethod>>, ConnectError> {
        self.auth
            .read()
            .await
            .methods_for(name)
            .map(<[Arc<AuthMethod>]>::to_vec)
            .ok_or_else(|| ConnectError::NoAuthMethods(name.to_string()))
    }

    fn plan(&self, name: &str) -> Result<DialPlan, ConnectError> {
        let inventory = self.inventory()?;
        let route = ProxyRouteResolver::new(&inventory).resolve(name)?;
        let server = inventory.server(name)?.clone();
        let hops = route.hops();
        let outer = hops.len().checked_sub(2).map(|i| hops[i].clone());
        let proxy = match outer.as_ref() {
            Some(hop) if !matches!(hop.kind, HopKind::Ssh | HopKind::Command) => {
                Some(inventory.proxy(&hop.name)?.clone())
            }
            _ => None,
        };
        Ok(DialPlan {
            server,
            outer,
            proxy,
            path: route.path_description(),
        })
    }

    /// Connects `name` along its route.
    ///
    /// An ssh bastion is fully connected and authenticated, recursively,
    /// before the next hop is dialed through it.
    pub fn create_connection<'a>(&'a self, name: &'a str) -> ConnectFuture<'a> {
        Box::pin(async move {
            let plan = self.plan(name)?;
            let methods = self.methods(name).await?;
            debug!("connecting {} via {}", name, plan.path);

            let addr = plan.server.address(name).to_string();
            let port = plan.server.port_or_default();
            let user = plan.server.user_or_default();
            let timeout = self.options.connect_timeout;

            let (transport, via): (BoxedTransport, Option<Connection>) = match plan.outer {
                None => (
                    Box::new(dial_tcp(name, &addr, port, timeout).await?) as BoxedTransport,
                    None,
                ),
                Some(hop) => match hop.kind {
                    HopKind::Ssh => {
                        let bastion = self.create_connection(&hop.name).await?;
                        let tunnel = bastion.open_tunnel(&addr, port, timeout).await?;
                        (tunnel, Some(bastion))
                    }
                    HopKind::Command => (
                        Box::new(RelayProcess::spawn(&hop.name, &addr, port)?) as BoxedTransport,
                        None,
                    ),
                    HopKind::Http | HopKind::Https | HopKind::Socks | HopKind::Socks5 => {
                        let proxy = plan
                            .proxy
                            .ok_or_else(|| ConnectError::UnknownProxy(hop.name.clone()))?;
                        (dial_proxy(&hop.name, &proxy, &addr, port, timeout).await?, None)
                    }
                },
            };

            let target = HopTarget {
                name,
                addr: &addr,
                port,
                user: &user,
            };
            Connection::establish(target, transport, &methods, &self.options, via).await
        })
    }

    /// Resolves credentials, then connects every target concurrently.
    ///
    /// Fails with [`ConnectError::AllTargetsFailed`] only when not a single
    /// target could be connected.
    pub async fn connect_all(self: &Arc<Self>, targets: &[String]) -> Result<ConnectReport, ConnectError> {
        let (resolution, route_failures) = self.prepare(targets).await;
        let mut report = ConnectReport {
            credential_failures: resolution.failures,
            ..Default::default()
        };

        let unroutable: HashSet<String> = route_failures.iter().map(|(t, _)| t.clone()).collect();
        report.failures.extend(route_failures);

        let mut tasks = JoinSet::new();
        for target in targets.iter().filter(|t| !unroutable.contains(*t)) {
            let factory = Arc::clone(self);
            let target = target.clone();
            tasks.spawn(async move {
                let result = factory.create_connection(&target).await;
                (target, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(connection))) => report.connected.push(connection),
                Ok((target, Err(err))) => {
                    warn!("{}: {}", target, err);
                    report.failures.push((target, err));
                }
                Err(err) => warn!("connect task failed: {}", err),
            }
        }
        report.connected.sort_by_key(|c| {
            targets
                .iter()
                .position(|t| t == c.name())
                .unwrap_or(usize::MAX)
        });

        if report.connected.is_empty() && !targets.is_empty() {
            return Err(ConnectError::AllTargetsFailed(targets.len()));
        }
        info!(
            "connected {} of {} target(s)",
            report.connected.len(),
            targets.len()
        );
        Ok(report)
    }

    /// Connects a host given as `user@host:port` instead of a configured name.
    ///
    /// The host inherits the `common` defaults, its secrets stored
    /// obfuscated. With `persist` it stays in the inventory after a
    /// successful connection.
    pub async fn connect_adhoc(&self, spec: &str, persist: bool) -> Result<Connection, ConnectError> {
        let name = spec.trim().to_string();
        let known = self.knows(&name);
        if !known {
            let mut server = parse_adhoc(&name)?;
            let mut inventory = self
                .inventory
                .write()
                .map_err(|_| ConnectError::InternalServerError("inventory lock poisoned".to_string()))?;
            server.inherit_from(&inventory.common);
            server.seal_secrets(&name)?;
            inventory.remember(name.clone(), server);
        }

        let resolved = self.auth.read().await.methods_for(&name).is_some();
        if !resolved {
            self.prepare(std::slice::from_ref(&name)).await;
        }
        let result = self.create_connection(&name).await;

        if !known && (!persist || result.is_err()) {
            self.forget(&name);
        }
        result
    }

    fn forget(&self, name: &str) {
        if let Ok(mut inventory) = self.inventory.write() {
            inventory.servers.remove(name);
        }
    }
}
