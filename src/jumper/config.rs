use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

/// Resolve the config file location: `--config` flag, then `JUMPER_CONFIG`,
/// then `jumper.{toml,yaml,yml}` in the working directory, then the OS
/// default path.
pub fn resolve_config_path(flag_path: Option<PathBuf>) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = flag_path {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    // clap maps JUMPER_CONFIG into the flag when unset; keep the precedence
    // visible by labelling the env case separately.
    if let Some(p) = std::env::var_os("JUMPER_CONFIG") {
        if !p.is_empty() {
            return Ok(ResolvedConfigPath {
                path: normalize_explicit_path(Path::new(&p))?,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Some(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(meta) = fs::metadata(p) {
        if meta.is_dir() {
            if let Some(found) = discover_config_path(p) {
                return Ok(found);
            }
            return Ok(p.join("jumper.toml"));
        }
        return Ok(p.to_path_buf());
    }

    // Non-existent path: default to .toml if no extension was given.
    let mut out = p.to_path_buf();
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    ["jumper.toml", "jumper.yaml", "jumper.yml"]
        .iter()
        .map(|c| dir.join(c))
        .find(|p| fs::metadata(p).map(|m| m.is_file()).unwrap_or(false))
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/jumper/jumper.toml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj =
            ProjectDirs::from("dev", "jumper", "jumper").context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("jumper.toml"))
    }
}

/// Create the config file from the default template if it does not exist yet.
/// Returns true when a new file was written.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!("config: {} exists but is not a regular file", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let template = match extension_of(path).as_str() {
        "toml" => DEFAULT_CONFIG_TEMPLATE_TOML,
        "yaml" | "yml" => DEFAULT_CONFIG_TEMPLATE_YAML,
        other => anyhow::bail!(
            "config: unsupported config extension {other:?} (expected .toml or .yaml/.yml)"
        ),
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    // Create once; a concurrent writer wins and we keep its file.
    use std::io::Write;
    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    f.write_all(template.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Control-plane API endpoint, persisted by `jumper target`.
    pub target: String,
    pub api: ApiConfig,
    pub forward: ForwardConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Skip TLS verification when talking to the control-plane API.
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone)]
pub struct ForwardConfig {
    /// Security mode for the relay's remote leg: psk | tls | plain.
    pub security: String,
    /// Only meaningful with `security = "tls"`. Off by default because
    /// forward endpoints commonly present certificates for internal names;
    /// turn it on whenever the endpoint has a verifiable chain.
    pub verify_certificates: bool,
    /// Remote dial timeout; zero disables the bound.
    pub dial_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let fc = load_file_config(path)?;
    Config::from_file_config(fc)
}

/// Persist the control-plane endpoint into the config file, keeping the rest
/// of the file's settings. An empty target clears it.
pub fn set_target(path: &Path, target: &str) -> anyhow::Result<()> {
    let mut fc = if fs::metadata(path).map(|m| m.is_file()).unwrap_or(false) {
        load_file_config(path)?
    } else {
        FileConfig::default()
    };

    fc.target = target.trim().to_string();

    let data = match extension_of(path).as_str() {
        "toml" => toml::to_string_pretty(&fc)
            .with_context(|| format!("config: encode toml {}", path.display()))?,
        "yaml" | "yml" => serde_yaml::to_string(&fc)
            .with_context(|| format!("config: encode yaml {}", path.display()))?,
        other => anyhow::bail!("config: unsupported config extension {other:?}"),
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }
    fs::write(path, data).with_context(|| format!("config: write {}", path.display()))
}

fn load_file_config(path: &Path) -> anyhow::Result<FileConfig> {
    let data = fs::read(path).with_context(|| format!("config: read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    match extension_of(path).as_str() {
        "toml" => {
            toml::from_str(&s).with_context(|| format!("config: parse toml {}", path.display()))
        }
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("config: parse yaml {}", path.display()))
        }
        other => anyhow::bail!("config: unsupported config extension {other:?}"),
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    target: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    api: Option<FileApi>,

    #[serde(skip_serializing_if = "Option::is_none")]
    forward: Option<FileForward>,

    #[serde(skip_serializing_if = "Option::is_none")]
    logging: Option<FileLogging>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FileApi {
    #[serde(default)]
    insecure_skip_verify: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct FileForward {
    #[serde(skip_serializing_if = "Option::is_none")]
    security: Option<String>,
    #[serde(default)]
    verify_certificates: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    dial_timeout_ms: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FileLogging {
    #[serde(skip_serializing_if = "Option::is_none")]
    level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let security = fc
            .forward
            .as_ref()
            .and_then(|f| f.security.clone())
            .unwrap_or_else(|| "psk".into())
            .trim()
            .to_ascii_lowercase();
        if !matches!(security.as_str(), "psk" | "tls" | "plain") {
            anyhow::bail!("config: unknown forward.security {security:?} (expected psk|tls|plain)");
        }

        let mut cfg = Config {
            target: fc.target.trim().to_string(),
            api: ApiConfig {
                insecure_skip_verify: fc.api.as_ref().map(|a| a.insecure_skip_verify).unwrap_or(false),
            },
            forward: ForwardConfig {
                security,
                verify_certificates: fc
                    .forward
                    .as_ref()
                    .map(|f| f.verify_certificates)
                    .unwrap_or(false),
                dial_timeout: Duration::from_millis(
                    fc.forward
                        .as_ref()
                        .and_then(|f| f.dial_timeout_ms)
                        .unwrap_or(5000)
                        .max(0) as u64,
                ),
            },
            logging: LoggingConfig {
                level: "info".into(),
                format: "text".into(),
                output: "stderr".into(),
                add_source: false,
            },
        };

        if let Some(l) = &fc.logging {
            if let Some(level) = l.level.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                cfg.logging.level = level.to_string();
            }
            if let Some(format) = l.format.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                cfg.logging.format = format.to_string();
            }
            if let Some(output) = l.output.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                cfg.logging.output = output.to_string();
            }
            cfg.logging.add_source = l.add_source;
        }

        Ok(cfg)
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# jumper configuration (auto-generated)
#
# `target` is the service-forward control-plane endpoint. Set it here or with
# `jumper target <url>`.

target = ""

[api]
# Skip TLS verification when talking to the control-plane API.
insecure_skip_verify = false

[forward]
# Security mode for the relay's remote leg: psk | tls | plain.
security = "psk"
# Only used with security = "tls". Off by default because forward endpoints
# commonly present certificates for internal names; turn it on whenever the
# endpoint has a verifiable chain.
verify_certificates = false
# Remote dial timeout in milliseconds; 0 disables the bound.
dial_timeout_ms = 5000

[logging]
level = "info"
format = "text" # text | json
output = "stderr" # stderr | stdout | discard | <file path>
add_source = false
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# jumper configuration (auto-generated)
#
# `target` is the service-forward control-plane endpoint. Set it here or with
# `jumper target <url>`.

target: ""

api:
  # Skip TLS verification when talking to the control-plane API.
  insecure_skip_verify: false

forward:
  # Security mode for the relay's remote leg: psk | tls | plain.
  security: "psk"
  # Only used with security = "tls". Off by default because forward endpoints
  # commonly present certificates for internal names; turn it on whenever the
  # endpoint has a verifiable chain.
  verify_certificates: false
  # Remote dial timeout in milliseconds; 0 disables the bound.
  dial_timeout_ms: 5000

logging:
  level: "info"
  format: "text" # text | json
  output: "stderr" # stderr | stdout | discard | <file path>
  add_source: false
"#;
