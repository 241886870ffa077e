use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{
        Mutex, MutexGuard, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use openssl::ssl::SslConnector;
use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
    time,
};
use tokio_openssl::SslStream;

use crate::jumper::net;

pub mod pipe;
pub mod set;
pub mod tls;

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// Local bind spec requesting an OS-assigned ephemeral port.
pub const DEFAULT_LOCAL_SPEC: &str = "127.0.0.1:0";

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("tunnel: bind {addr} failed: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("tunnel: already listening on {0}")]
    AlreadyListening(String),
    #[error("tunnel: not listening")]
    NotListening,
    #[error("tunnel: accept failed: {0}")]
    Accept(#[source] io::Error),
    #[error("tunnel: dial {addr} failed: {source}")]
    Dial {
        addr: String,
        #[source]
        source: DialFailure,
    },
    #[error("tunnel: tls configuration failed: {0}")]
    TlsConfig(#[from] openssl::error::ErrorStack),
}

#[derive(Debug, Error)]
pub enum DialFailure {
    #[error("connect: {0}")]
    Connect(#[from] io::Error),
    #[error("tls setup: {0}")]
    Tls(#[from] openssl::error::ErrorStack),
    #[error("tls handshake: {0}")]
    Handshake(#[from] openssl::ssl::Error),
}

/// How the remote leg of a tunnel is secured.
#[derive(Clone)]
pub enum SecurityMode {
    /// Raw TCP; nothing on the wire is protected.
    Plain,
    /// Certificate-based TLS. Verification is an explicit choice here, not a
    /// hidden default; see `config::ForwardConfig::verify_certificates`.
    CertificateTls { verify_certificates: bool },
    /// TLS restricted to the classic PSK suite family; no certificates are
    /// exchanged.
    PresharedKeyTls { identity: String, key: Vec<u8> },
}

impl SecurityMode {
    pub fn preshared_key(secret: &crate::jumper::secret::SharedSecret) -> Self {
        SecurityMode::PresharedKeyTls {
            identity: secret.identity.clone(),
            key: secret.key.clone(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SecurityMode::Plain => "plain",
            SecurityMode::CertificateTls { .. } => "tls",
            SecurityMode::PresharedKeyTls { .. } => "psk",
        }
    }
}

impl std::fmt::Debug for SecurityMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecurityMode::Plain => f.write_str("Plain"),
            SecurityMode::CertificateTls {
                verify_certificates,
            } => f
                .debug_struct("CertificateTls")
                .field("verify_certificates", verify_certificates)
                .finish(),
            SecurityMode::PresharedKeyTls { identity, .. } => f
                .debug_struct("PresharedKeyTls")
                .field("identity", identity)
                .field("key", &"<redacted>")
                .finish(),
        }
    }
}

enum ListenerSlot {
    Idle,
    Bound(TcpListener),
    Serving,
    Closed,
}

/// One local listening endpoint relaying accepted connections to one remote
/// target.
///
/// Lifecycle: construct (no I/O) -> `listen` binds the local socket ->
/// `serve` accepts until shut down -> `shutdown` closes the listener and
/// wakes a running `serve`. Spawned connection pipes are fire-and-forget and
/// drain on their own once either peer closes.
pub struct Tunnel {
    local_spec: String,
    security: SecurityMode,
    dialer: Dialer,
    slot: Mutex<ListenerSlot>,
    bound_addr: OnceLock<SocketAddr>,
    shutdown_tx: watch::Sender<bool>,
}

impl Tunnel {
    pub fn new(
        local_spec: impl Into<String>,
        remote_addr: impl Into<String>,
        security: SecurityMode,
    ) -> Result<Self, TunnelError> {
        let local_spec = local_spec.into();
        let remote_addr = remote_addr.into();

        let connector = match &security {
            SecurityMode::Plain => None,
            SecurityMode::CertificateTls {
                verify_certificates,
            } => Some(tls::certificate_connector(*verify_certificates)?),
            SecurityMode::PresharedKeyTls { identity, key } => {
                Some(tls::preshared_key_connector(identity, key)?)
            }
        };
        let verify_hostname = matches!(
            security,
            SecurityMode::CertificateTls {
                verify_certificates: true
            }
        );

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            dialer: Dialer {
                server_name: net::host_of(&remote_addr).to_string(),
                remote_addr,
                connector,
                verify_hostname,
                dial_timeout: DEFAULT_DIAL_TIMEOUT,
            },
            local_spec,
            security,
            slot: Mutex::new(ListenerSlot::Idle),
            bound_addr: OnceLock::new(),
            shutdown_tx,
        })
    }

    /// Plain relay on an ephemeral local port.
    pub fn plain(remote_addr: impl Into<String>) -> Result<Self, TunnelError> {
        Self::new(DEFAULT_LOCAL_SPEC, remote_addr, SecurityMode::Plain)
    }

    /// Certificate-TLS relay. `verify_certificates` is deliberately a
    /// required argument; see `SecurityMode::CertificateTls`.
    pub fn with_certificate_tls(
        local_spec: impl Into<String>,
        remote_addr: impl Into<String>,
        verify_certificates: bool,
    ) -> Result<Self, TunnelError> {
        Self::new(
            local_spec,
            remote_addr,
            SecurityMode::CertificateTls {
                verify_certificates,
            },
        )
    }

    /// PSK-TLS relay using credentials from a parsed shared secret.
    pub fn with_preshared_key(
        local_spec: impl Into<String>,
        remote_addr: impl Into<String>,
        secret: &crate::jumper::secret::SharedSecret,
    ) -> Result<Self, TunnelError> {
        Self::new(local_spec, remote_addr, SecurityMode::preshared_key(secret))
    }

    pub fn remote_addr(&self) -> &str {
        &self.dialer.remote_addr
    }

    /// The local address bound by `listen`, once it has run.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound_addr.get().copied()
    }

    /// Zero dial timeout removes the bound entirely.
    pub fn set_dial_timeout(&mut self, timeout: Duration) {
        self.dialer.dial_timeout = timeout;
    }

    /// Bind the local listener and return the resolved address, so callers
    /// can advertise OS-assigned ephemeral ports. Binding twice is refused
    /// instead of leaking the first socket.
    pub async fn listen(&mut self) -> Result<SocketAddr, TunnelError> {
        if !matches!(*self.slot(), ListenerSlot::Idle) {
            return Err(TunnelError::AlreadyListening(self.local_spec.clone()));
        }

        let bind_addr = net::normalize_bind_addr(&self.local_spec);
        let listener = TcpListener::bind(bind_addr.as_ref())
            .await
            .map_err(|source| TunnelError::Bind {
                addr: self.local_spec.clone(),
                source,
            })?;
        let addr = listener.local_addr().map_err(|source| TunnelError::Bind {
            addr: self.local_spec.clone(),
            source,
        })?;

        let _ = self.bound_addr.set(addr);
        *self.slot() = ListenerSlot::Bound(listener);
        Ok(addr)
    }

    /// Accept local connections until shut down. Each accepted connection
    /// dials the remote leg in its own task and, on success, relays through a
    /// duplex pipe; a failed dial costs only that connection, never the loop.
    ///
    /// Returns `Ok(())` after `shutdown`, or `TunnelError::Accept` on an
    /// OS-level accept failure.
    pub async fn serve(&self) -> Result<(), TunnelError> {
        let mut shutdown = self.shutdown_tx.subscribe();

        let listener = {
            let mut slot = self.slot();
            match std::mem::replace(&mut *slot, ListenerSlot::Serving) {
                ListenerSlot::Bound(listener) => listener,
                // Shut down before serve got going: a clean, if abrupt, stop.
                ListenerSlot::Closed => {
                    *slot = ListenerSlot::Closed;
                    return Ok(());
                }
                ListenerSlot::Serving => return Err(TunnelError::AlreadyListening(
                    self.local_spec.clone(),
                )),
                ListenerSlot::Idle => {
                    *slot = ListenerSlot::Idle;
                    return Err(TunnelError::NotListening);
                }
            }
        };

        tracing::info!(
            local = %self.bound_addr.get().map(|a| a.to_string()).unwrap_or_default(),
            remote = %self.dialer.remote_addr,
            mode = %self.security.label(),
            "tunnel: serving"
        );

        let result = loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break Ok(());
                    }
                }
                res = listener.accept() => {
                    match res {
                        Ok((conn, peer)) => self.spawn_conn(conn, peer),
                        Err(err) => break Err(TunnelError::Accept(err)),
                    }
                }
            }
        };

        *self.slot() = ListenerSlot::Closed;
        result
    }

    /// Close the listener and wake a running `serve`. In-flight connection
    /// pairs are left to drain on their own.
    pub fn shutdown(&self) -> Result<(), TunnelError> {
        let mut slot = self.slot();
        match std::mem::replace(&mut *slot, ListenerSlot::Closed) {
            ListenerSlot::Bound(listener) => {
                drop(slot);
                drop(listener);
                self.shutdown_tx.send_replace(true);
                Ok(())
            }
            ListenerSlot::Serving => {
                drop(slot);
                self.shutdown_tx.send_replace(true);
                Ok(())
            }
            ListenerSlot::Idle => {
                *slot = ListenerSlot::Idle;
                Err(TunnelError::NotListening)
            }
            ListenerSlot::Closed => Err(TunnelError::NotListening),
        }
    }

    fn spawn_conn(&self, conn: TcpStream, peer: SocketAddr) {
        let dialer = self.dialer.clone();
        let cid = next_conn_id();

        tokio::spawn(async move {
            let _active = ActiveConnGuard::new();

            let remote = match dialer.dial().await {
                Ok(remote) => remote,
                Err(source) => {
                    let err = TunnelError::Dial {
                        addr: dialer.remote_addr.clone(),
                        source,
                    };
                    tracing::warn!(cid = %cid, client = %peer, err = %err, "tunnel: dial failed");
                    drop(conn);
                    return;
                }
            };

            if tracing::enabled!(tracing::Level::DEBUG) {
                tracing::debug!(cid = %cid, client = %peer, remote = %dialer.remote_addr, "tunnel: relaying");
            }

            match pipe::pipe(conn, remote).await {
                Ok((to_remote, to_local)) => {
                    metrics::counter!("jumper_bytes_egress_total").increment(to_remote);
                    metrics::counter!("jumper_bytes_ingress_total").increment(to_local);
                    tracing::debug!(cid = %cid, to_remote, to_local, "tunnel: connection closed");
                }
                Err(err) => {
                    tracing::debug!(cid = %cid, err = %err, "tunnel: connection ended with error");
                }
            }
        });
    }

    fn slot(&self) -> MutexGuard<'_, ListenerSlot> {
        match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("local_spec", &self.local_spec)
            .field("remote_addr", &self.dialer.remote_addr)
            .field("security", &self.security)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
struct Dialer {
    remote_addr: String,
    server_name: String,
    connector: Option<SslConnector>,
    verify_hostname: bool,
    dial_timeout: Duration,
}

impl Dialer {
    async fn dial(&self) -> Result<BoxedStream, DialFailure> {
        let tcp = if self.dial_timeout > Duration::ZERO {
            time::timeout(self.dial_timeout, TcpStream::connect(&self.remote_addr))
                .await
                .map_err(|_| {
                    DialFailure::Connect(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "connect timed out",
                    ))
                })??
        } else {
            TcpStream::connect(&self.remote_addr).await?
        };

        let Some(connector) = &self.connector else {
            return Ok(Box::new(tcp));
        };

        let mut config = connector.configure()?;
        config.set_verify_hostname(self.verify_hostname);
        let ssl = config.into_ssl(&self.server_name)?;
        let mut stream = SslStream::new(ssl, tcp)?;
        Pin::new(&mut stream).connect().await?;
        Ok(Box::new(stream))
    }
}

struct ActiveConnGuard;

impl ActiveConnGuard {
    fn new() -> Self {
        metrics::counter!("jumper_connections_total").increment(1);
        metrics::gauge!("jumper_active_connections").increment(1.0);
        Self
    }
}

impl Drop for ActiveConnGuard {
    fn drop(&mut self) {
        metrics::gauge!("jumper_active_connections").decrement(1.0);
    }
}

fn next_conn_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(1);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("c{n}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Duration};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn spawn_echo() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind echo");
        let addr = listener.local_addr().expect("echo addr");
        tokio::spawn(async move {
            loop {
                let (mut conn, _) = match listener.accept().await {
                    Ok(v) => v,
                    Err(_) => break,
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        match conn.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if conn.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn listen_assigns_an_ephemeral_port() {
        let mut t = Tunnel::plain("127.0.0.1:9").expect("tunnel");
        let addr = t.listen().await.expect("listen");
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
        assert_ne!(addr.port(), 0);
        assert_eq!(t.local_addr(), Some(addr));
        t.shutdown().expect("shutdown");
    }

    #[tokio::test]
    async fn listen_twice_is_refused() {
        let mut t = Tunnel::plain("127.0.0.1:9").expect("tunnel");
        t.listen().await.expect("listen");
        let err = t.listen().await.unwrap_err();
        assert!(matches!(err, TunnelError::AlreadyListening(_)));
        t.shutdown().expect("shutdown");
    }

    #[tokio::test]
    async fn shutdown_before_listen_reports_not_listening() {
        let t = Tunnel::plain("127.0.0.1:9").expect("tunnel");
        assert!(matches!(t.shutdown(), Err(TunnelError::NotListening)));
    }

    #[tokio::test]
    async fn shutdown_twice_reports_not_listening() {
        let mut t = Tunnel::plain("127.0.0.1:9").expect("tunnel");
        t.listen().await.expect("listen");
        t.shutdown().expect("first shutdown");
        assert!(matches!(t.shutdown(), Err(TunnelError::NotListening)));
    }

    #[tokio::test]
    async fn shutdown_stops_a_running_serve() {
        let mut t = Tunnel::plain("127.0.0.1:9").expect("tunnel");
        t.listen().await.expect("listen");
        let t = Arc::new(t);

        let serve = tokio::spawn({
            let t = t.clone();
            async move { t.serve().await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        t.shutdown().expect("shutdown");

        tokio::time::timeout(Duration::from_secs(2), serve)
            .await
            .expect("serve returns in bounded time")
            .expect("serve task")
            .expect("serve result");
    }

    #[tokio::test]
    async fn plain_tunnel_relays_through_echo_server() {
        let echo = spawn_echo().await;

        let mut t = Tunnel::plain(echo.to_string()).expect("tunnel");
        let addr = t.listen().await.expect("listen");
        let t = Arc::new(t);
        let serve = tokio::spawn({
            let t = t.clone();
            async move { t.serve().await }
        });

        let mut client = TcpStream::connect(addr).await.expect("connect");
        client.write_all(b"ping").await.expect("write");
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"ping");

        t.shutdown().expect("shutdown");
        tokio::time::timeout(Duration::from_secs(2), serve)
            .await
            .expect("serve returns")
            .expect("serve task")
            .expect("serve result");
    }

    #[tokio::test]
    async fn concurrent_tunnels_do_not_cross_talk() {
        let echo_a = spawn_echo().await;
        let echo_b = spawn_echo().await;

        let mut ta = Tunnel::plain(echo_a.to_string()).expect("tunnel a");
        let mut tb = Tunnel::plain(echo_b.to_string()).expect("tunnel b");
        let addr_a = ta.listen().await.expect("listen a");
        let addr_b = tb.listen().await.expect("listen b");
        let (ta, tb) = (Arc::new(ta), Arc::new(tb));

        let serve_a = tokio::spawn({
            let t = ta.clone();
            async move { t.serve().await }
        });
        let serve_b = tokio::spawn({
            let t = tb.clone();
            async move { t.serve().await }
        });

        let mut ca = TcpStream::connect(addr_a).await.expect("connect a");
        let mut cb = TcpStream::connect(addr_b).await.expect("connect b");

        ca.write_all(b"alpha-payload").await.expect("write a");
        cb.write_all(b"beta-payload!").await.expect("write b");

        let mut buf_a = [0u8; 13];
        let mut buf_b = [0u8; 13];
        ca.read_exact(&mut buf_a).await.expect("read a");
        cb.read_exact(&mut buf_b).await.expect("read b");
        assert_eq!(&buf_a, b"alpha-payload");
        assert_eq!(&buf_b, b"beta-payload!");

        ta.shutdown().expect("shutdown a");
        tb.shutdown().expect("shutdown b");
        for serve in [serve_a, serve_b] {
            tokio::time::timeout(Duration::from_secs(2), serve)
                .await
                .expect("serve returns")
                .expect("serve task")
                .expect("serve result");
        }
    }

    #[tokio::test]
    async fn dial_failure_only_costs_that_connection() {
        // Bind-then-drop gives a local port that refuses connections.
        let closed = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("addr")
        };

        let mut t = Tunnel::plain(closed.to_string()).expect("tunnel");
        let addr = t.listen().await.expect("listen");
        let t = Arc::new(t);
        let serve = tokio::spawn({
            let t = t.clone();
            async move { t.serve().await }
        });

        for _ in 0..2 {
            let mut client = TcpStream::connect(addr).await.expect("connect");
            // The tunnel closes the local side once the remote dial fails.
            let mut buf = [0u8; 1];
            let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
                .await
                .expect("read returns")
                .unwrap_or(0);
            assert_eq!(n, 0);
        }

        assert!(!serve.is_finished(), "accept loop must survive dial failures");

        t.shutdown().expect("shutdown");
        tokio::time::timeout(Duration::from_secs(2), serve)
            .await
            .expect("serve returns")
            .expect("serve task")
            .expect("serve result");
    }

    #[tokio::test]
    async fn payload_integrity_through_tunnel() {
        use rand::RngCore;

        let echo = spawn_echo().await;
        let mut t = Tunnel::plain(echo.to_string()).expect("tunnel");
        let addr = t.listen().await.expect("listen");
        let t = Arc::new(t);
        let serve = tokio::spawn({
            let t = t.clone();
            async move { t.serve().await }
        });

        let mut payload = vec![0u8; 10 * 1024];
        rand::rng().fill_bytes(&mut payload);

        let mut client = TcpStream::connect(addr).await.expect("connect");
        let (mut read_half, mut write_half) = client.split();

        let write = async {
            write_half.write_all(&payload).await.expect("write payload");
        };
        let read = async {
            let mut echoed = vec![0u8; payload.len()];
            read_half.read_exact(&mut echoed).await.expect("read payload");
            echoed
        };
        let (_, echoed) = tokio::join!(write, read);
        assert_eq!(echoed, payload);

        t.shutdown().expect("shutdown");
        tokio::time::timeout(Duration::from_secs(2), serve)
            .await
            .expect("serve returns")
            .expect("serve task")
            .expect("serve result");
    }

    #[test]
    fn security_mode_debug_redacts_psk_key() {
        let mode = SecurityMode::PresharedKeyTls {
            identity: "id".into(),
            key: b"supersecret".to_vec(),
        };
        let dbg = format!("{mode:?}");
        assert!(!dbg.contains("supersecret"));
        assert!(dbg.contains("id"));
    }
}
