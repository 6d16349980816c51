use super::*;

use russh::Disconnect;

/// russh callbacks of one hop.
pub struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl ClientHandler {
    pub fn new(host: impl Into<String>, port: u16, policy: HostKeyPolicy) -> Self {
        Self {
            host: host.into(),
            port,
            policy,
        }
    }
}

impl russh::client::Handler for ClientHandler {
    type Error = ConnectError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        self.policy.verify(&self.host, self.port, server_public_key)
    }
}

/// Address and login of the host at the end of a transport.
pub(super) struct HopTarget<'a> {
    pub name: &'a str,
    pub addr: &'a str,
    pub port: u16,
    pub user: &'a str,
}

/// A live, authenticated connection to one server.
///
/// A connection reached through a bastion owns the bastion's connection,
/// so the whole chain lives exactly as long as the target.
pub struct Connection {
    name: String,
    handle: Handle<ClientHandler>,
    via: Option<Box<Connection>>,
}

impl Connection {
    /// Runs the SSH handshake over `transport` and authenticates with
    /// `methods` in order.
    pub(super) async fn establish(
        target: HopTarget<'_>,
        transport: BoxedTransport,
        methods: &[Arc<AuthMethod>],
        options: &ConnectOptions,
        via: Option<Connection>,
    ) -> Result<Self, ConnectError> {
        let handler = ClientHandler::new(target.addr, target.port, options.security.host_key.clone());
        let config = Arc::new(options.client_config());

        // One deadline covers the handshake and authentication.
        let setup = async {
            let mut handle = russh::client::connect_stream(config, transport, handler)
                .await
                .map_err(|err| match err {
                    ConnectError::RusshError(russh::Error::UnknownKey) => {
                        ConnectError::HostKeyRejected(target.name.to_string())
                    }
                    err => err,
                })?;
            debug!(
                "{} handshake with {}:{} complete",
                target.name, target.addr, target.port
            );
            authenticate(&mut handle, target.name, target.user, methods).await?;
            Ok::<_, ConnectError>(handle)
        };
        let handle = tokio::time::timeout(options.connect_timeout, setup)
            .await
            .map_err(|_| ConnectError::ConnectTimeout(target.name.to_string()))??;
        info!("connected to {}", target.name);

        Ok(Self {
            name: target.name.to_string(),
            handle,
            via: via.map(Box::new),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the bastion this connection is tunneled through.
    pub fn via(&self) -> Option<&str> {
        self.via.as_deref().map(Connection::name)
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Opens a `direct-tcpip` channel to `host:port` for the next hop.
    pub(super) async fn open_tunnel(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<BoxedTransport, ConnectError> {
        trace!("{} opening tunnel to {}:{}", self.name, host, port);
        let open = self
            .handle
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0);
        let channel = tokio::time::timeout(timeout, open)
            .await
            .map_err(|_| ConnectError::ConnectTimeout(format!("{} via {}", host, self.name)))??;
        Ok(Box::new(channel.into_stream()))
    }

    /// Disconnects this connection, then every bastion behind it.
    pub async fn close(&self) -> Result<(), ConnectError> {
        let mut current = Some(self);
        while let Some(conn) = current {
            debug!("closing connection to {}", conn.name);
            if !conn.handle.is_closed() {
                conn.handle
                    .disconnect(Disconnect::ByApplication, "", "en")
                    .await?;
            }
            current = conn.via.as_deref();
        }
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("via", &self.via())
            .finish()
    }
}

async fn rsa_hash(handle: &Handle<ClientHandler>) -> Option<russh::keys::HashAlg> {
    handle.best_supported_rsa_hash().await.ok().flatten().flatten()
}

async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    name: &str,
    user: &str,
    methods: &[Arc<AuthMethod>],
) -> Result<(), ConnectError> {
    for method in methods {
        trace!("{} trying {} auth as {}", name, method.kind_name(), user);
        let accepted = match method.as_ref() {
            AuthMethod::Password(password) => handle
                .authenticate_password(user, password.as_str())
                .await?
                .success(),
            AuthMethod::PublicKey(key) => {
                let hash = rsa_hash(handle).await;
                handle
                    .authenticate_publickey(user, PrivateKeyWithHashAlg::new(key.clone(), hash))
                    .await?
                    .success()
            }
            AuthMethod::Certificate { key, cert } => handle
                .authenticate_openssh_cert(user, key.clone(), cert.clone())
                .await?
                .success(),
            AuthMethod::AgentIdentities(keys) => agent_auth(handle, user, Some(keys.as_slice())).await?,
            AuthMethod::Agent => agent_auth(handle, user, None).await?,
        };
        if accepted {
            debug!("{} accepted {} auth", name, method.kind_name());
            return Ok(());
        }
        debug!("{} rejected {} auth", name, method.kind_name());
    }
    Err(ConnectError::AuthRejected(name.to_string()))
}

#[cfg(unix)]
async fn agent_auth(
    handle: &mut Handle<ClientHandler>,
    user: &str,
    only: Option<&[PublicKey]>,
) -> Result<bool, ConnectError> {
    use russh::keys::agent::client::AgentClient;

    let mut agent = match AgentClient::connect_env().await {
        Ok(agent) => agent,
        Err(err) => {
            debug!("ssh agent unavailable: {}", err);
            return Ok(false);
        }
    };
    let identities = match only {
        Some(keys) => keys.to_vec(),
        None => agent.request_identities().await?,
    };
    for identity in identities {
        let hash = rsa_hash(handle).await;
        match handle
            .authenticate_publickey_with(user, identity, hash, &mut agent)
            .await
        {
            Ok(result) if result.success() => return Ok(true),
            Ok(_) => {}
            Err(err) => debug!("agent signing failed: {:?}", err),
        }
    }
    Ok(false)
}

#[cfg(not(unix))]
async fn agent_auth(
    _handle: &mut Handle<ClientHandler>,
    _user: &str,
    _only: Option<&[PublicKey]>,
) -> Result<bool, ConnectError> {
    Ok(false)
}

#[async_trait]
impl RemoteHost for Connection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn close(&self) -> Result<(), ConnectError> {
        Connection::close(self).await
    }

    async fn run(&self, command: &str, io: RemoteIo) -> Result<Option<u32>, ConnectError> {
        let RemoteIo {
            mut stdin,
            mut stdout,
            mut stderr,
            cancel,
        } = io;

        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, command).await?;
        trace!("{} exec {:?}", self.name, command);

        let mut exit_status = None;
        let mut stdin_open = true;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("{} interrupting {:?}", self.name, command);
                    if let Err(err) = channel.signal(russh::Sig::INT).await {
                        debug!("{} interrupt not delivered: {}", self.name, err);
                    }
                    if let Err(err) = channel.close().await {
                        debug!("{} channel close failed: {}", self.name, err);
                    }
                    break;
                }
                chunk = stdin.recv(), if stdin_open => match chunk {
                    Some(data) => channel.data(&data[..]).await?,
                    None => {
                        stdin_open = false;
                        channel.eof().await?;
                    }
                },
                msg = channel.wait() => match msg {
                    Some(ChannelMsg::Data { data }) => {
                        if let Err(err) = stdout.write_all(&data).await {
                            debug!("{} stdout consumer went away: {}", self.name, err);
                            if let Err(err) = channel.close().await {
                                debug!("{} channel close failed: {}", self.name, err);
                            }
                            break;
                        }
                    }
                    Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                        stderr.write_all(&data).await?;
                    }
                    Some(ChannelMsg::ExitStatus { exit_status: status }) => {
                        exit_status = Some(status);
                    }
                    Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                        debug!("{} command killed by {:?}", self.name, signal_name);
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        }

        if let Err(err) = stdout.shutdown().await {
            debug!("{} stdout shutdown failed: {}", self.name, err);
        }
        stderr.flush().await?;
        Ok(exit_status)
    }
}
