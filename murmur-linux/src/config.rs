//! Load config from file and environment.

use std::path::{Path, PathBuf};

use anyhow::Context;
use murmur_core::CoreConfig;
use serde::Deserialize;

/// Node configuration. File: ~/.config/murmur/config.toml or /etc/murmur/config.toml.
/// Env overrides: MURMUR_LISTEN_PORT, MURMUR_NODE_NAME, MURMUR_DOWNLOAD_DIR, MURMUR_AUTO_ANSWER.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// TCP port peers connect to (default 47000).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Name announced in the hello; peers address us by it.
    #[serde(default = "default_node_name")]
    pub node_name: String,
    /// Where received files land.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Accept incoming calls without asking.
    #[serde(default)]
    pub auto_answer: bool,
    /// Raw PCM played into calls as our microphone. Silence when unset.
    #[serde(default)]
    pub audio_in: Option<PathBuf>,
    /// Raw PCM file remote call audio is appended to. Discarded when unset.
    #[serde(default)]
    pub audio_out: Option<PathBuf>,
    #[serde(default)]
    pub core: CoreConfig,
}

fn default_listen_port() -> u16 {
    47000
}

fn default_node_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "murmur".to_string())
}

fn default_download_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join("Downloads/murmur"),
        None => PathBuf::from("downloads"),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            node_name: default_node_name(),
            download_dir: default_download_dir(),
            auto_answer: false,
            audio_in: None,
            audio_out: None,
            core: CoreConfig::default(),
        }
    }
}

/// Load config: defaults, then the config file (explicit path or first one found), then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => parse_file(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => parse_file(&path)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

fn parse_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing config {}", path.display()))
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("MURMUR_LISTEN_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.listen_port = p;
    }
    if let Some(name) = var("MURMUR_NODE_NAME").filter(|s| !s.is_empty()) {
        c.node_name = name;
    }
    if let Some(dir) = var("MURMUR_DOWNLOAD_DIR").filter(|s| !s.is_empty()) {
        c.download_dir = PathBuf::from(dir);
    }
    if let Some(v) = var("MURMUR_AUTO_ANSWER") {
        c.auto_answer = matches!(v.as_str(), "1" | "true" | "yes" | "on");
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/murmur/config.toml"));
    }
    out.push(PathBuf::from("/etc/murmur/config.toml"));
    out
}
