use super::*;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_socks::tcp::{Socks4Stream, Socks5Stream};

/// Byte stream an SSH handshake can run over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

pub type BoxedTransport = Box<dyn Transport>;

/// Opens a TCP connection within `timeout`.
pub(super) async fn dial_tcp(
    name: &str,
    addr: &str,
    port: u16,
    timeout: Duration,
) -> Result<TcpStream, ConnectError> {
    trace!("dialing {} at {}:{}", name, addr, port);
    let stream = tokio::time::timeout(timeout, TcpStream::connect((addr, port)))
        .await
        .map_err(|_| ConnectError::ConnectTimeout(name.to_string()))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Dials proxy service `name` and asks it for a tunnel to `host:port`.
pub(super) async fn dial_proxy(
    name: &str,
    proxy: &ProxyConfig,
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<BoxedTransport, ConnectError> {
    let stream = dial_tcp(name, &proxy.addr, proxy.port, timeout).await?;
    let credentials = match (proxy.user.as_deref(), proxy.password.as_deref()) {
        (Some(user), password) => {
            let password = crate::auth::Secret::parse(password.unwrap_or_default()).map_err(
                |reason| ConnectError::ProxyHandshake {
                    proxy: name.to_string(),
                    reason,
                },
            )?;
            Some((user.to_string(), password))
        }
        (None, _) => None,
    };
    let credentials = credentials
        .as_ref()
        .map(|(user, password)| (user.as_str(), password.reveal()));

    let handshake = async {
        let transport: BoxedTransport = match proxy.kind {
            ProxyType::Http => {
                Box::new(http_connect(name, stream, host, port, credentials).await?)
            }
            ProxyType::Https => {
                let tls = tls_wrap(name, &proxy.addr, stream).await?;
                Box::new(http_connect(name, tls, host, port, credentials).await?)
            }
            ProxyType::Socks5 => match credentials {
                Some((user, password)) => Box::new(
                    Socks5Stream::connect_with_password_and_socket(
                        stream,
                        (host, port),
                        user,
                        password,
                    )
                    .await?,
                ),
                None => Box::new(Socks5Stream::connect_with_socket(stream, (host, port)).await?),
            },
            ProxyType::Socks => {
                Box::new(Socks4Stream::connect_with_socket(stream, (host, port)).await?)
            }
            ProxyType::Ssh => {
                return Err(ConnectError::InternalServerError(format!(
                    "{name} is a server, not a proxy service"
                )));
            }
        };
        Ok::<_, ConnectError>(transport)
    };

    let transport = tokio::time::timeout(timeout, handshake)
        .await
        .map_err(|_| ConnectError::ConnectTimeout(name.to_string()))??;
    debug!("proxy {} opened tunnel to {}:{}", name, host, port);
    Ok(transport)
}

/// Sends an HTTP `CONNECT` and consumes the response head.
///
/// The returned reader keeps any bytes the proxy forwarded past the head,
/// such as an eager SSH banner.
pub(super) async fn http_connect<S>(
    name: &str,
    stream: S,
    host: &str,
    port: u16,
    credentials: Option<(&str, &str)>,
) -> Result<BufReader<S>, ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let authority = if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if let Some((user, password)) = credentials {
        let token = BASE64.encode(format!("{user}:{password}"));
        request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    request.push_str("\r\n");

    let mut reader = BufReader::new(stream);
    reader.get_mut().write_all(request.as_bytes()).await?;
    reader.get_mut().flush().await?;

    let refused = |reason: String| ConnectError::ProxyHandshake {
        proxy: name.to_string(),
        reason,
    };
    let mut status = String::new();
    if reader.read_line(&mut status).await? == 0 {
        return Err(refused("connection closed before response".to_string()));
    }
    let status = status.trim_end();
    let code = status.split_whitespace().nth(1);
    if !status.starts_with("HTTP/1.") || code != Some("200") {
        return Err(refused(status.to_string()));
    }

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(refused("truncated response head".to_string()));
        }
        if line == "\r\n" || line == "\n" {
            break;
        }
    }
    Ok(reader)
}

async fn tls_wrap(
    name: &str,
    server: &str,
    stream: TcpStream,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, ConnectError> {
    let mut roots = RootCertStore::empty();
    let loaded = rustls_native_certs::load_native_certs();
    for cert in loaded.certs {
        roots.add(cert).ok();
    }
    if !loaded.errors.is_empty() {
        warn!("some native certificates failed to load: {:?}", loaded.errors);
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let server_name =
        ServerName::try_from(server.to_string()).map_err(|e| ConnectError::ProxyHandshake {
            proxy: name.to_string(),
            reason: e.to_string(),
        })?;
    let tls = TlsConnector::from(Arc::new(config))
        .connect(server_name, stream)
        .await?;
    Ok(tls)
}

/// Expands `%h`, `%p` and `%%` in a relay command template.
pub(super) fn expand_relay_command(template: &str, host: &str, port: u16) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('h') => out.push_str(host),
            Some('p') => out.push_str(&port.to_string()),
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

/// A local process whose stdin/stdout carry the SSH stream.
///
/// The process is killed when the transport is dropped.
pub struct RelayProcess {
    _child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl RelayProcess {
    pub(super) fn spawn(template: &str, host: &str, port: u16) -> Result<Self, ConnectError> {
        let command = expand_relay_command(template, host, port);
        let argv = shlex::split(&command)
            .filter(|argv| !argv.is_empty())
            .ok_or_else(|| ConnectError::ProxyHandshake {
                proxy: template.to_string(),
                reason: "invalid relay command".to_string(),
            })?;
        debug!("spawning relay {:?}", argv);

        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        let missing = || ConnectError::InternalServerError("relay stdio not captured".to_string());
        let stdin = child.stdin.take().ok_or_else(missing)?;
        let stdout = child.stdout.take().ok_or_else(missing)?;
        Ok(Self {
            _child: child,
            stdin,
            stdout,
        })
    }
}

impl AsyncRead for RelayProcess {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for RelayProcess {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().stdin).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stdin).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stdin).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn relay_template_expansion() {
        assert_eq!(
            expand_relay_command("nc %h %p", "10.0.0.7", 2222),
            "nc 10.0.0.7 2222"
        );
        assert_eq!(expand_relay_command("echo 100%% %x", "h", 1), "echo 100% %x");
    }

    #[tokio::test]
    async fn http_connect_sends_auth_and_keeps_early_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let proxy = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut head = Vec::new();
            let mut byte = [0u8; 1];
            while !head.ends_with(b"\r\n\r\n") {
                socket.read_exact(&mut byte).await.expect("read");
                head.push(byte[0]);
            }
            socket
                .write_all(b"HTTP/1.1 200 Connection established\r\nX-Proxy: test\r\n\r\nSSH-2.0-fake\r\n")
                .await
                .expect("write");
            String::from_utf8(head).expect("utf8")
        });

        let stream = TcpStream::connect(addr).await.expect("connect");
        let mut tunnel = http_connect("corp", stream, "10.0.0.7", 22, Some(("alice", "pw")))
            .await
            .expect("tunnel");
        let mut banner = String::new();
        tunnel.read_line(&mut banner).await.expect("banner");
        assert_eq!(banner, "SSH-2.0-fake\r\n");

        let head = proxy.await.expect("proxy task");
        assert!(head.starts_with("CONNECT 10.0.0.7:22 HTTP/1.1\r\n"));
        assert!(head.contains("Proxy-Authorization: Basic YWxpY2U6cHc=\r\n"));
    }

    #[tokio::test]
    async fn http_connect_refusal_is_a_handshake_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buf = [0u8; 512];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await;
        });

        let stream = TcpStream::connect(addr).await.expect("connect");
        let err = http_connect("corp", stream, "web1", 22, None)
            .await
            .expect_err("refused");
        assert!(matches!(
            err,
            ConnectError::ProxyHandshake { ref proxy, ref reason }
                if proxy == "corp" && reason.contains("407")
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn relay_process_carries_bytes() {
        let mut relay = RelayProcess::spawn("cat", "ignored", 0).expect("spawn");
        relay.write_all(b"ping\n").await.expect("write");
        relay.flush().await.expect("flush");
        let mut buf = [0u8; 5];
        relay.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"ping\n");
    }
}
