use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;

use crate::jumper::{
    api, config, logging, output, secret,
    tunnel::{
        SecurityMode,
        set::{TunnelSet, shutdown_signal},
    },
};

#[derive(Debug, Parser)]
#[command(
    name = "jumper",
    version,
    about = "Local tunnels to brokered service forwards, secured with PSK-TLS"
)]
pub struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). Falls back to
    /// JUMPER_CONFIG, then jumper.toml in the working directory, then the OS
    /// default path (Linux: /etc/jumper/jumper.toml).
    #[arg(long, env = "JUMPER_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show or set the control-plane API endpoint
    Target {
        /// Endpoint URL to persist; omit to show the current one
        url: Option<String>,
        /// Clear the persisted endpoint
        #[arg(long, conflicts_with = "url")]
        clear: bool,
    },
    /// Create a forward for a service and tunnel to it until interrupted
    Open {
        /// Service instance to open a forward for
        service: String,
        /// Control-plane access token
        #[arg(long, env = "JUMPER_TOKEN", hide_env_values = true)]
        token: String,
        /// Control-plane endpoint, overriding the persisted target
        #[arg(long)]
        api: Option<String>,
    },
    /// List open forwards for a service
    List {
        service: String,
        #[arg(long, env = "JUMPER_TOKEN", hide_env_values = true)]
        token: String,
        #[arg(long)]
        api: Option<String>,
    },
    /// Close a forward
    Close {
        service: String,
        connection_id: String,
        #[arg(long, env = "JUMPER_TOKEN", hide_env_values = true)]
        token: String,
        #[arg(long)]
        api: Option<String>,
    },
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(cli.config)?;
    let created = config::ensure_config_file(&resolved.path)?;
    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let _logrt = logging::init(&cfg.logging)?;

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    match cli.command {
        Command::Target { url, clear } => target(&resolved.path, &cfg, url, clear),
        Command::Open {
            service,
            token,
            api,
        } => open(&cfg, &service, &token, api.as_deref()).await,
        Command::List {
            service,
            token,
            api,
        } => list(&cfg, &service, &token, api.as_deref()).await,
        Command::Close {
            service,
            connection_id,
            token,
            api,
        } => close(&cfg, &service, &connection_id, &token, api.as_deref()).await,
    }
}

fn target(
    path: &std::path::Path,
    cfg: &config::Config,
    url: Option<String>,
    clear: bool,
) -> anyhow::Result<()> {
    if clear {
        config::set_target(path, "")?;
        println!("target cleared");
        return Ok(());
    }

    match url {
        Some(url) => {
            let parsed = reqwest::Url::parse(&url).context("target: invalid url")?;
            if !matches!(parsed.scheme(), "http" | "https") {
                anyhow::bail!("target: unsupported scheme {:?}", parsed.scheme());
            }
            config::set_target(path, &url)?;
            println!("target set to {url}");
            Ok(())
        }
        None => {
            if cfg.target.is_empty() {
                println!("target not set (run `jumper target <url>`)");
            } else {
                println!("target {}", cfg.target);
            }
            Ok(())
        }
    }
}

async fn open(
    cfg: &config::Config,
    service: &str,
    token: &str,
    api_override: Option<&str>,
) -> anyhow::Result<()> {
    let client = api_client(cfg, token, api_override)?;

    let forward = client.create_forward(service).await?;
    tracing::info!(
        service = %service,
        forward_id = forward.id,
        hosts = forward.hosts.len(),
        "forward: created"
    );
    if forward.hosts.is_empty() {
        anyhow::bail!("forward {}: control plane returned no hosts", forward.id);
    }

    let credentials = forward.credentials_map();
    output::print_credentials(&credentials);

    let security = security_mode(&cfg.forward, &forward.shared_secret)?;
    let set =
        TunnelSet::bind_with_dial_timeout(&forward.hosts, &security, cfg.forward.dial_timeout)
            .await?;

    let printer = output::select_printer(&credentials);
    let mut sample_cmds = Vec::new();
    for addr in set.local_addrs() {
        println!("Listening on {addr}");
        let cmd = printer.sample_call(&addr.to_string());
        if !cmd.is_empty() {
            sample_cmds.push(cmd);
        }
    }
    output::print_sample_cmds(&sample_cmds);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let serve = set.serve_with_shutdown(shutdown_rx);
    tokio::pin!(serve);

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            shutdown_tx.send_replace(true);
            serve.as_mut().await?;
        }
        res = &mut serve => res?,
    }

    println!("\nRemember to run `jumper close {service} {}`!", forward.id);
    Ok(())
}

async fn list(
    cfg: &config::Config,
    service: &str,
    token: &str,
    api_override: Option<&str>,
) -> anyhow::Result<()> {
    let client = api_client(cfg, token, api_override)?;
    let forwards = client.list_forwards(service).await?;
    output::print_forwards(&forwards);
    Ok(())
}

async fn close(
    cfg: &config::Config,
    service: &str,
    connection_id: &str,
    token: &str,
    api_override: Option<&str>,
) -> anyhow::Result<()> {
    let client = api_client(cfg, token, api_override)?;
    let body = client.delete_forward(service, connection_id).await?;
    if !body.trim().is_empty() {
        println!("{}", body.trim());
    }
    tracing::info!(service = %service, connection_id = %connection_id, "forward: closed");
    Ok(())
}

fn api_client(
    cfg: &config::Config,
    token: &str,
    api_override: Option<&str>,
) -> anyhow::Result<api::Client> {
    let endpoint = api_override.unwrap_or(&cfg.target);
    api::Client::new(endpoint, token, cfg.api.insecure_skip_verify)
}

fn security_mode(
    forward: &config::ForwardConfig,
    shared_secret: &str,
) -> anyhow::Result<SecurityMode> {
    match forward.security.as_str() {
        "psk" => {
            let secret = secret::parse_shared_secret(shared_secret)
                .context("forward: control plane returned an unusable shared secret")?;
            Ok(SecurityMode::preshared_key(&secret))
        }
        "tls" => Ok(SecurityMode::CertificateTls {
            verify_certificates: forward.verify_certificates,
        }),
        "plain" => Ok(SecurityMode::Plain),
        other => anyhow::bail!("forward: unknown security mode {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn forward_config(security: &str) -> config::ForwardConfig {
        config::ForwardConfig {
            security: security.to_string(),
            verify_certificates: false,
            dial_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn psk_mode_requires_a_parsable_secret() {
        let err = security_mode(&forward_config("psk"), "broken").unwrap_err();
        assert!(err.to_string().contains("unusable shared secret"));

        let mode = security_mode(&forward_config("psk"), "id:key").expect("mode");
        assert!(matches!(mode, SecurityMode::PresharedKeyTls { .. }));
    }

    #[test]
    fn tls_mode_carries_the_verify_flag() {
        let mut fw = forward_config("tls");
        fw.verify_certificates = true;
        let mode = security_mode(&fw, "").expect("mode");
        assert!(matches!(
            mode,
            SecurityMode::CertificateTls {
                verify_certificates: true
            }
        ));
    }

    #[test]
    fn plain_mode_ignores_the_secret() {
        let mode = security_mode(&forward_config("plain"), "").expect("mode");
        assert!(matches!(mode, SecurityMode::Plain));
    }
}
