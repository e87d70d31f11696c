//! Load node config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use dfs_core::{
    cas_path_transform, plain_path_transform, FileServerOpts, PathTransformFunc, TcpTransportOpts,
};
use serde::Deserialize;

/// Node configuration. File: ~/.config/dfs/config.toml or /etc/dfs/config.toml.
/// Env overrides: DFS_LISTEN_ADDR, DFS_ID, DFS_STORAGE_ROOT, DFS_BOOTSTRAP
/// (comma separated), DFS_PATH_TRANSFORM.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// TCP listen address (default 0.0.0.0:3000).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Node id, used as the storage namespace. Empty selects the default namespace.
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
    #[serde(default)]
    pub bootstrap_nodes: Vec<String>,
    /// "cas" or "plain".
    #[serde(default = "default_path_transform")]
    pub path_transform: String,
    #[serde(default = "default_store_settle_ms")]
    pub store_settle_ms: u64,
    #[serde(default = "default_get_settle_ms")]
    pub get_settle_ms: u64,
    #[serde(default = "default_stream_timeout_secs")]
    pub stream_timeout_secs: u64,
}

fn default_listen_addr() -> String {
    "0.0.0.0:3000".to_string()
}
fn default_storage_root() -> PathBuf {
    PathBuf::from(dfs_core::store::DEFAULT_ROOT)
}
fn default_path_transform() -> String {
    "cas".to_string()
}
fn default_store_settle_ms() -> u64 {
    dfs_core::server::DEFAULT_STORE_SETTLE_DELAY.as_millis() as u64
}
fn default_get_settle_ms() -> u64 {
    dfs_core::server::DEFAULT_GET_SETTLE_DELAY.as_millis() as u64
}
fn default_stream_timeout_secs() -> u64 {
    dfs_core::server::DEFAULT_STREAM_TIMEOUT.as_secs()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            id: String::new(),
            storage_root: default_storage_root(),
            bootstrap_nodes: Vec::new(),
            path_transform: default_path_transform(),
            store_settle_ms: default_store_settle_ms(),
            get_settle_ms: default_get_settle_ms(),
            stream_timeout_secs: default_stream_timeout_secs(),
        }
    }
}

impl Config {
    pub fn path_transform_func(&self) -> anyhow::Result<PathTransformFunc> {
        match self.path_transform.as_str() {
            "cas" => Ok(cas_path_transform),
            "plain" => Ok(plain_path_transform),
            other => bail!("unknown path_transform {other:?} (expected \"cas\" or \"plain\")"),
        }
    }

    pub fn to_server_opts(&self) -> anyhow::Result<FileServerOpts> {
        Ok(FileServerOpts {
            id: self.id.clone(),
            storage_root: self.storage_root.clone(),
            path_transform: self.path_transform_func()?,
            bootstrap_nodes: self.bootstrap_nodes.clone(),
            store_settle_delay: Duration::from_millis(self.store_settle_ms),
            get_settle_delay: Duration::from_millis(self.get_settle_ms),
            stream_timeout: Duration::from_secs(self.stream_timeout_secs),
        })
    }

    pub fn to_transport_opts(&self) -> TcpTransportOpts {
        TcpTransportOpts {
            listen_addr: self.listen_addr.clone(),
            handoff_timeout: Duration::from_secs(self.stream_timeout_secs),
            ..Default::default()
        }
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(s) = var("DFS_LISTEN_ADDR") {
            self.listen_addr = s;
        }
        if let Some(s) = var("DFS_ID") {
            self.id = s;
        }
        if let Some(s) = var("DFS_STORAGE_ROOT") {
            self.storage_root = PathBuf::from(s);
        }
        if let Some(s) = var("DFS_BOOTSTRAP") {
            self.bootstrap_nodes = s
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(s) = var("DFS_PATH_TRANSFORM") {
            self.path_transform = s;
        }
    }
}

/// Load config: defaults, then config file, then env vars. An explicit `path`
/// must exist and parse; the default locations are skipped when absent.
pub fn load(path: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match path {
        Some(p) => read_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => read_file(&p)?,
            None => Config::default(),
        },
    };
    c.apply_env(|k| std::env::var(k).ok());
    c.path_transform_func()?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/dfs/config.toml"));
    }
    out.push(PathBuf::from("/etc/dfs/config.toml"));
    out
}

fn read_file(p: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing {}", p.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_gives_defaults() {
        let c: Config = toml::from_str("").unwrap();
        assert_eq!(c, Config::default());
        let opts = c.to_server_opts().unwrap();
        assert_eq!(opts.store_settle_delay, Duration::from_millis(1000));
        assert_eq!(opts.get_settle_delay, Duration::from_millis(500));
        let transport = c.to_transport_opts();
        assert_eq!(transport.listen_addr, "0.0.0.0:3000");
        assert_eq!(transport.handoff_timeout, Duration::from_secs(30));
    }

    #[test]
    fn file_values_parse() {
        let c: Config = toml::from_str(
            r#"
            listen_addr = "0.0.0.0:4000"
            id = "node-b"
            storage_root = "/var/lib/dfs"
            bootstrap_nodes = ["10.0.0.1:3000", "10.0.0.2:3000"]
            path_transform = "plain"
            store_settle_ms = 10
            "#,
        )
        .unwrap();
        assert_eq!(c.listen_addr, "0.0.0.0:4000");
        assert_eq!(c.bootstrap_nodes.len(), 2);
        let opts = c.to_server_opts().unwrap();
        assert_eq!(opts.id, "node-b");
        assert_eq!(opts.store_settle_delay, Duration::from_millis(10));
        assert_eq!((opts.path_transform)("k").full_path(), "k/k");
    }

    #[test]
    fn unknown_field_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
    }

    #[test]
    fn unknown_transform_rejected() {
        let c = Config {
            path_transform: "md5".to_string(),
            ..Default::default()
        };
        assert!(c.to_server_opts().is_err());
    }

    #[test]
    fn env_overrides_file() {
        let env: HashMap<&str, &str> = [
            ("DFS_LISTEN_ADDR", "127.0.0.1:5000"),
            ("DFS_ID", "from-env"),
            ("DFS_BOOTSTRAP", " a:1, ,b:2 "),
        ]
        .into_iter()
        .collect();
        let mut c = Config {
            id: "from-file".to_string(),
            ..Default::default()
        };
        c.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.listen_addr, "127.0.0.1:5000");
        assert_eq!(c.id, "from-env");
        assert_eq!(c.bootstrap_nodes, vec!["a:1", "b:2"]);
        assert_eq!(c.path_transform, "cas");
    }

    #[test]
    fn explicit_path_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(Some(&dir.path().join("missing.toml"))).is_err());

        let p = dir.path().join("node.toml");
        std::fs::write(&p, "store_settle_ms = 5\n").unwrap();
        let c = read_file(&p).unwrap();
        assert_eq!(c.store_settle_ms, 5);
    }
}
