use anyhow::{Context, Result};
use std::{
    fs, io,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
};

use crate::engine::DEFAULT_YTDLP_BIN;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/mediagrab-env";
pub const DEFAULT_STORAGE_ROOT: &str = "downloads";
pub const DEFAULT_MEDIAGRAB_PORT: u16 = 8080;
pub const DEFAULT_MEDIAGRAB_HOST: &str = "127.0.0.1";

/// Values found in the env-style config file (or on the command line). Every
/// field is optional; [`RuntimeConfig::resolve`] fills in defaults.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub storage_root: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub ytdlp_bin: Option<PathBuf>,
}

impl EnvConfig {
    /// Fields set in `overrides` win.
    pub fn overridden_by(self, overrides: EnvConfig) -> EnvConfig {
        EnvConfig {
            storage_root: overrides.storage_root.or(self.storage_root),
            host: overrides.host.or(self.host),
            port: overrides.port.or(self.port),
            ytdlp_bin: overrides.ytdlp_bin.or(self.ytdlp_bin),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub storage_root: PathBuf,
    pub host: String,
    pub port: u16,
    pub ytdlp_bin: PathBuf,
}

impl RuntimeConfig {
    pub fn resolve(cfg: EnvConfig) -> Self {
        Self {
            storage_root: cfg
                .storage_root
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_ROOT)),
            host: cfg
                .host
                .unwrap_or_else(|| DEFAULT_MEDIAGRAB_HOST.to_string()),
            port: cfg.port.unwrap_or(DEFAULT_MEDIAGRAB_PORT),
            ytdlp_bin: cfg
                .ytdlp_bin
                .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP_BIN)),
        }
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .host
            .parse()
            .with_context(|| format!("Parsing listen host {}", self.host))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Reads `KEY=VALUE` lines from `path`. Returns `None` when the file does not
/// exist. Blank values count as unset.
fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("Reading {}", path.display())),
    };
    parse_env_config(&content)
        .with_context(|| format!("Parsing {}", path.display()))
        .map(Some)
}

fn parse_env_config(content: &str) -> Result<EnvConfig> {
    let mut cfg = EnvConfig::default();
    let entries = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim(), value.trim().trim_matches('"')));

    for (key, value) in entries {
        match key {
            _ if value.is_empty() => {}
            "STORAGE_ROOT" => cfg.storage_root = Some(PathBuf::from(value)),
            "MEDIAGRAB_HOST" => cfg.host = Some(value.to_owned()),
            "MEDIAGRAB_PORT" => {
                cfg.port = Some(
                    value
                        .parse()
                        .with_context(|| format!("MEDIAGRAB_PORT {value:?} is not a port"))?,
                );
            }
            "YTDLP_BIN" => cfg.ytdlp_bin = Some(PathBuf::from(value)),
            _ => {}
        }
    }
    Ok(cfg)
}

/// Config file (if present) with `overrides` applied on top, then defaults
/// for whatever is still unset.
pub fn load_runtime_config(path: &Path, overrides: EnvConfig) -> Result<RuntimeConfig> {
    let file = read_env_config(path)?.unwrap_or_default();
    Ok(RuntimeConfig::resolve(file.overridden_by(overrides)))
}
