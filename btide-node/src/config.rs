//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use btide_core::FetchOptions;
use serde::Deserialize;

/// Node configuration. File: the `--config` path, else ~/.config/btide/config.toml
/// or /etc/btide/config.toml.
/// Env overrides: BTIDE_DIRECTORY, BTIDE_PORT, BTIDE_MAX_PEERS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Where package data files live (default ./btide-data). Created if missing.
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    /// Concurrent inbound connections, 1..=2048 (default 32).
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
    /// TCP listen port, 1025..=65535 (default 9856).
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_receive_timeout_secs")]
    pub receive_timeout_secs: u64,
    #[serde(default = "default_max_skipped_packets")]
    pub max_skipped_packets: usize,
}

fn default_directory() -> PathBuf {
    PathBuf::from("btide-data")
}
fn default_max_peers() -> usize {
    32
}
fn default_port() -> u16 {
    9856
}
fn default_receive_timeout_secs() -> u64 {
    30
}
fn default_max_skipped_packets() -> usize {
    16
}

impl Default for Config {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            max_peers: default_max_peers(),
            port: default_port(),
            receive_timeout_secs: default_receive_timeout_secs(),
            max_skipped_packets: default_max_skipped_packets(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(1..=2048).contains(&self.max_peers) {
            bail!("max_peers must be within 1..=2048, got {}", self.max_peers);
        }
        if self.port < 1025 {
            bail!("port must be within 1025..=65535, got {}", self.port);
        }
        if self.receive_timeout_secs == 0 {
            bail!("receive_timeout_secs must be at least 1");
        }
        if self.directory.as_os_str().is_empty() {
            bail!("directory must not be empty");
        }
        Ok(())
    }

    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            receive_timeout: Duration::from_secs(self.receive_timeout_secs),
            max_skipped: self.max_skipped_packets,
        }
    }
}

/// Load config: default, then config file (if present), then env vars.
/// Validates the result and creates the data directory.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => load_file(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => load_file(&path)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |key| std::env::var(key).ok())?;
    c.validate()?;
    if !c.directory.exists() {
        std::fs::create_dir_all(&c.directory)
            .with_context(|| format!("creating {}", c.directory.display()))?;
        tracing::info!(path = %c.directory.display(), "created data directory");
    } else if !c.directory.is_dir() {
        bail!("{} is not a directory", c.directory.display());
    }
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
    if let Some(s) = var("BTIDE_DIRECTORY") {
        c.directory = PathBuf::from(s);
    }
    if let Some(s) = var("BTIDE_PORT") {
        c.port = s
            .parse()
            .with_context(|| format!("BTIDE_PORT={s} is not a port"))?;
    }
    if let Some(s) = var("BTIDE_MAX_PEERS") {
        c.max_peers = s
            .parse()
            .with_context(|| format!("BTIDE_MAX_PEERS={s} is not a number"))?;
    }
    Ok(())
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/btide/config.toml"));
    }
    out.push(PathBuf::from("/etc/btide/config.toml"));
    out
}

fn load_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))
}
