//! Daemon configuration.
//!
//! Loaded from a TOML file at startup and again on reconfigure. A missing file
//! yields the defaults so a node can come up with nothing but a key in the
//! environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use noded_common::StepKey;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/noded/noded.toml";
pub const AUTH_KEY_ENV: &str = "NODED_AUTH_KEY";
const DEFAULT_AUTH_KEY: &str = "change-me-in-production";

/// Interconnect plugin selected for this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FabricKind {
    #[default]
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub node_name: String,
    pub listen_addr: String,
    pub controller_addr: String,
    pub privileged_uid: u32,
    pub spool_dir: PathBuf,
    pub pid_file: PathBuf,
    pub log_file: Option<PathBuf>,
    pub prolog: Option<PathBuf>,
    pub epilog: Option<PathBuf>,
    pub script_timeout_secs: u64,
    pub kill_wait_secs: u64,
    pub max_threads: usize,
    pub max_steps: usize,
    pub auth_key: Option<String>,
    pub auth_key_file: Option<PathBuf>,
    pub cred_key: Option<String>,
    pub cred_key_file: Option<PathBuf>,
    pub cred_expire_grace_secs: u64,
    pub tmp_dir: PathBuf,
    /// Variables copied from the launch request into task environments.
    /// `None` copies everything the client sent.
    pub propagate_env: Option<Vec<String>>,
    pub epilog_per_step: bool,
    pub fabric: FabricKind,
    pub cpus: u32,
    pub real_memory_mb: u64,
    pub tmp_disk_mb: u64,
    pub manager_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            listen_addr: "0.0.0.0:6818".to_string(),
            controller_addr: "127.0.0.1:6817".to_string(),
            privileged_uid: 0,
            spool_dir: PathBuf::from("/var/spool/noded"),
            pid_file: PathBuf::from("/run/noded.pid"),
            log_file: None,
            prolog: None,
            epilog: None,
            script_timeout_secs: 120,
            kill_wait_secs: 30,
            max_threads: 64,
            max_steps: 128,
            auth_key: None,
            auth_key_file: None,
            cred_key: None,
            cred_key_file: None,
            cred_expire_grace_secs: 120,
            tmp_dir: PathBuf::from("/tmp"),
            propagate_env: None,
            epilog_per_step: false,
            fabric: FabricKind::None,
            cpus: 0,
            real_memory_mb: 0,
            tmp_disk_mb: 0,
            manager_path: None,
        }
    }
}

impl Config {
    /// Read `path`, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str::<Config>(&raw)
                .with_context(|| format!("parsing {}", path.display()))?
        } else {
            Config::default()
        };
        config.fill_node_facts();
        Ok(config)
    }

    fn fill_node_facts(&mut self) {
        if self.node_name.is_empty() {
            self.node_name = nix::unistd::gethostname()
                .ok()
                .and_then(|name| name.into_string().ok())
                .map(|name| name.split('.').next().unwrap_or_default().to_string())
                .unwrap_or_else(|| "localhost".to_string());
        }
        if self.cpus == 0 {
            self.cpus = std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1);
        }
        if self.real_memory_mb == 0 {
            self.real_memory_mb = read_mem_total_mb().unwrap_or(0);
        }
        if self.max_threads == 0 {
            self.max_threads = 1;
        }
    }

    /// Message authentication key: environment, inline value, key file, then
    /// the built-in default.
    pub fn auth_key(&self) -> Result<String> {
        if let Ok(value) = std::env::var(AUTH_KEY_ENV) {
            if !value.trim().is_empty() {
                return Ok(value.trim().to_string());
            }
        }
        if let Some(key) = self.auth_key.as_ref() {
            return Ok(key.clone());
        }
        if let Some(path) = self.auth_key_file.as_ref() {
            return read_key_file(path);
        }
        warn!("using default authentication key - set {AUTH_KEY_ENV} or auth_key in production");
        Ok(DEFAULT_AUTH_KEY.to_string())
    }

    /// Launch-credential verification key. Falls back to the message key.
    pub fn cred_key(&self) -> Result<String> {
        if let Some(key) = self.cred_key.as_ref() {
            return Ok(key.clone());
        }
        if let Some(path) = self.cred_key_file.as_ref() {
            return read_key_file(path);
        }
        self.auth_key()
    }

    pub fn is_privileged(&self, uid: u32) -> bool {
        uid == 0 || uid == self.privileged_uid
    }

    pub fn kill_wait(&self) -> Duration {
        Duration::from_secs(self.kill_wait_secs)
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_secs(self.script_timeout_secs)
    }

    pub fn cred_expire_grace(&self) -> Duration {
        Duration::from_secs(self.cred_expire_grace_secs)
    }

    pub fn cred_state_path(&self) -> PathBuf {
        self.spool_dir.join("cred_state")
    }

    pub fn job_spool_dir(&self, job_id: u32) -> PathBuf {
        self.spool_dir.join(format!("job{job_id}"))
    }

    /// Control socket of an interactive step's manager.
    pub fn step_socket_path(&self, key: StepKey) -> PathBuf {
        self.spool_dir
            .join(format!("step{}.{}.sock", key.job_id, key.step_id))
    }

    /// Address a local step manager uses to reach this daemon.
    pub fn local_daemon_addr(&self) -> String {
        match self.listen_addr.rsplit_once(':') {
            Some((host, port)) if host == "0.0.0.0" || host == "[::]" || host.is_empty() => {
                format!("127.0.0.1:{port}")
            }
            _ => self.listen_addr.clone(),
        }
    }
}

fn read_key_file(path: &Path) -> Result<String> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading key file {}", path.display()))?;
    let key = raw.trim().to_string();
    anyhow::ensure!(!key.is_empty(), "key file {} is empty", path.display());
    Ok(key)
}

fn read_mem_total_mb() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb / 1024)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_gives_defaults() {
        let config = Config::load(Path::new("/nonexistent/noded.toml")).unwrap();
        assert_eq!(config.kill_wait(), Duration::from_secs(30));
        assert!(!config.node_name.is_empty());
        assert!(config.cpus >= 1);
    }

    #[test]
    fn parses_known_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
node_name = "n0"
listen_addr = "0.0.0.0:7000"
privileged_uid = 100
kill_wait_secs = 2
max_steps = 2
prolog = "/etc/noded/prolog"
propagate_env = ["PATH", "HOME"]
fabric = "none"
"#
        )
        .unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.node_name, "n0");
        assert_eq!(config.max_steps, 2);
        assert!(config.is_privileged(100));
        assert!(config.is_privileged(0));
        assert!(!config.is_privileged(42));
        assert_eq!(config.local_daemon_addr(), "127.0.0.1:7000");
        assert_eq!(
            config.propagate_env.as_deref(),
            Some(&["PATH".to_string(), "HOME".to_string()][..])
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "no_such_key = 1").unwrap();
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn cred_key_falls_back_to_inline_then_file() {
        let mut key_file = tempfile::NamedTempFile::new().unwrap();
        writeln!(key_file, "  from-file  ").unwrap();
        let config = Config {
            cred_key_file: Some(key_file.path().to_path_buf()),
            ..Config::default()
        };
        assert_eq!(config.cred_key().unwrap(), "from-file");

        let config = Config {
            cred_key: Some("inline".into()),
            cred_key_file: Some(key_file.path().to_path_buf()),
            ..Config::default()
        };
        assert_eq!(config.cred_key().unwrap(), "inline");
    }

    #[test]
    fn step_socket_lives_in_spool() {
        let config = Config {
            spool_dir: PathBuf::from("/var/spool/noded"),
            ..Config::default()
        };
        assert_eq!(
            config.step_socket_path(StepKey::new(7, 1)),
            PathBuf::from("/var/spool/noded/step7.1.sock")
        );
    }
}
