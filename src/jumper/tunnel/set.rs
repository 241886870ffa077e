use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{sync::watch, task::JoinSet};

use crate::jumper::secret;

use super::{DEFAULT_DIAL_TIMEOUT, DEFAULT_LOCAL_SPEC, SecurityMode, Tunnel, TunnelError};

/// A group of tunnels managed as one unit: all of them bind before any of
/// them serves, and one external termination request shuts all of them down.
pub struct TunnelSet {
    tunnels: Vec<Arc<Tunnel>>,
}

impl TunnelSet {
    /// Construct and bind one tunnel per remote host, each on an ephemeral
    /// local port. The first bind failure aborts the whole set so callers
    /// never see a partially-working group.
    pub async fn bind(hosts: &[String], security: &SecurityMode) -> Result<Self, TunnelError> {
        Self::bind_with_dial_timeout(hosts, security, DEFAULT_DIAL_TIMEOUT).await
    }

    pub async fn bind_with_dial_timeout(
        hosts: &[String],
        security: &SecurityMode,
        dial_timeout: Duration,
    ) -> Result<Self, TunnelError> {
        let mut tunnels = Vec::with_capacity(hosts.len());
        for host in hosts {
            let mut tunnel = Tunnel::new(DEFAULT_LOCAL_SPEC, host.clone(), security.clone())?;
            tunnel.set_dial_timeout(dial_timeout);
            let addr = tunnel.listen().await?;
            tracing::info!(local = %addr, remote = %host, mode = %security.label(), "tunnel: bound");
            tunnels.push(Arc::new(tunnel));
        }
        Ok(Self { tunnels })
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.tunnels.iter().filter_map(|t| t.local_addr()).collect()
    }

    /// Run every tunnel's accept loop until the shutdown signal flips, then
    /// shut all of them down and drain the serve tasks. A single tunnel's
    /// serve failure is reported and does not cancel its siblings.
    pub async fn serve_with_shutdown(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let mut tasks = JoinSet::new();
        for tunnel in &self.tunnels {
            let tunnel = tunnel.clone();
            tasks.spawn(async move {
                let remote = tunnel.remote_addr().to_string();
                (remote, tunnel.serve().await)
            });
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                res = tasks.join_next(), if !tasks.is_empty() => {
                    match res {
                        Some(Ok((remote, Err(err)))) => {
                            tracing::warn!(remote = %remote, err = %err, "tunnel: serve failed");
                        }
                        Some(Ok((_, Ok(())))) => {}
                        Some(Err(join_err)) => {
                            tracing::warn!(err = %join_err, "tunnel: serve task aborted");
                        }
                        None => {}
                    }
                }
            }
        }

        self.shutdown_all();

        // Serve loops observe the shutdown promptly; the cap only guards
        // against a wedged task.
        let drain = async {
            while tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        Ok(())
    }

    /// Shut down every tunnel, reporting failures without giving up on the
    /// remaining ones.
    pub fn shutdown_all(&self) {
        for tunnel in &self.tunnels {
            if let Err(err) = tunnel.shutdown() {
                tracing::warn!(remote = %tunnel.remote_addr(), err = %err, "tunnel: shutdown failed");
            }
        }
    }
}

/// Parse the shared secret, bind a PSK tunnel per host, and serve until the
/// process receives an interrupt or terminate request.
pub async fn run(hosts: &[String], shared_secret: &str) -> anyhow::Result<()> {
    run_until(hosts, shared_secret, shutdown_signal()).await
}

/// `run` with an explicit cancellation future, for callers (and tests) that
/// deliver termination some other way.
pub async fn run_until(
    hosts: &[String],
    shared_secret: &str,
    cancel: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let secret = secret::parse_shared_secret(shared_secret)?;
    let set = TunnelSet::bind(hosts, &SecurityMode::preshared_key(&secret)).await?;

    for addr in set.local_addrs() {
        tracing::info!(local = %addr, "tunnel: listening");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let serve = set.serve_with_shutdown(shutdown_rx);
    tokio::pin!(serve);

    tokio::select! {
        () = cancel => {
            tracing::info!("shutdown: requested");
            shutdown_tx.send_replace(true);
            serve.as_mut().await?;
        }
        res = &mut serve => res?,
    }

    Ok(())
}

/// Resolves when the process is asked to stop (Ctrl-C, or SIGTERM on unix).
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
