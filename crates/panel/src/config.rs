use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use system_utils::path::expand_tilde;

use crate::listener::{
    ListenerSettings, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_RECONNECT_DELAY, DEFAULT_RETRY_DELAY,
};
use crate::supervisor::{SupervisorSettings, DEFAULT_STOP_GRACE};
use crate::tasks::DEFAULT_HISTORY_LIMIT;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:19527";
const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_AGENT_DIR: &str = "~/.openclaw";
const DEFAULT_BINARY_NAME: &str = "openclaw";
const DEFAULT_SUBCOMMAND: &str = "start";
const DEFAULT_DIR_ENV: &str = "OPENCLAW_DIR";
const DEFAULT_LOG_CAPACITY: usize = 5000;
const DEFAULT_ONEBOT_URL: &str = "ws://127.0.0.1:3001";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    listen_addr: Option<String>,
    data_dir: Option<PathBuf>,
    #[serde(default)]
    agent: AgentSection,
    #[serde(default)]
    listener: ListenerSection,
    #[serde(default)]
    tasks: TasksSection,
    #[serde(default)]
    installers: Vec<InstallerConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct AgentSection {
    dir: Option<PathBuf>,
    binary: Option<PathBuf>,
    binary_name: Option<String>,
    subcommand: Option<String>,
    dir_env: Option<String>,
    log_capacity: Option<usize>,
    #[serde(default, with = "humantime_serde_opt")]
    stop_grace: Option<Duration>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ListenerSection {
    enabled: Option<bool>,
    url: Option<String>,
    access_token: Option<String>,
    #[serde(default, with = "humantime_serde_opt")]
    retry_delay: Option<Duration>,
    #[serde(default, with = "humantime_serde_opt")]
    reconnect_delay: Option<Duration>,
    #[serde(default, with = "humantime_serde_opt")]
    handshake_timeout: Option<Duration>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TasksSection {
    history_limit: Option<usize>,
    sudo_password: Option<String>,
}

/// One entry of the installable-software catalog.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub(crate) struct InstallerConfig {
    pub(crate) software: String,
    pub(crate) name: String,
    pub(crate) script: String,
    #[serde(default)]
    pub(crate) sudo: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct PanelConfig {
    pub(crate) listen_addr: String,
    pub(crate) data_dir: PathBuf,
    pub(crate) supervisor: SupervisorSettings,
    pub(crate) listener_enabled: bool,
    pub(crate) listener: ListenerSettings,
    pub(crate) access_token: Option<String>,
    pub(crate) history_limit: usize,
    pub(crate) sudo_password: Option<String>,
    pub(crate) installers: Vec<InstallerConfig>,
}

impl PanelConfig {
    pub(crate) fn installer(&self, software: &str) -> Option<&InstallerConfig> {
        self.installers
            .iter()
            .find(|installer| installer.software == software)
    }

    pub(crate) fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Builds a config from TOML alone, ignoring the process environment.
    #[cfg(test)]
    pub(crate) fn from_toml(raw: &str) -> anyhow::Result<Self> {
        resolve(parse_file_config(raw)?, |_| None)
    }
}

/// Reads `path` (a missing file means all defaults) and applies environment
/// overrides on top.
pub(crate) fn load_panel_config(path: &Path) -> anyhow::Result<PanelConfig> {
    let file = match std::fs::read_to_string(path) {
        Ok(raw) => parse_file_config(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => FileConfig::default(),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read config {}", path.display()))
        }
    };
    resolve(file, |key| std::env::var(key).ok())
}

fn parse_file_config(raw: &str) -> anyhow::Result<FileConfig> {
    Ok(toml::from_str(raw)?)
}

fn resolve(file: FileConfig, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<PanelConfig> {
    let env = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

    let agent_dir = env("OPENCLAW_DIR")
        .map(PathBuf::from)
        .or(file.agent.dir)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_AGENT_DIR));
    let binary = env("OPENCLAW_BIN").map(PathBuf::from).or(file.agent.binary);
    let log_capacity = file.agent.log_capacity.unwrap_or(DEFAULT_LOG_CAPACITY);
    if log_capacity == 0 {
        anyhow::bail!("agent.log_capacity must be greater than zero");
    }

    let url = env("ONEBOT_URL")
        .or(file.listener.url)
        .unwrap_or_else(|| DEFAULT_ONEBOT_URL.to_string());
    if !(url.starts_with("ws://") || url.starts_with("wss://")) {
        anyhow::bail!("listener.url must be a ws:// or wss:// url, got {url}");
    }

    let installers = file.installers;
    for (index, installer) in installers.iter().enumerate() {
        if installers[..index]
            .iter()
            .any(|other| other.software == installer.software)
        {
            anyhow::bail!("duplicate installer for software {}", installer.software);
        }
    }

    Ok(PanelConfig {
        listen_addr: env("CLAWPANEL_LISTEN")
            .or(file.listen_addr)
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string()),
        data_dir: expand_tilde(
            &env("CLAWPANEL_DATA")
                .map(PathBuf::from)
                .or(file.data_dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
        ),
        supervisor: SupervisorSettings {
            agent_dir: expand_tilde(&agent_dir),
            binary: binary.map(|path| expand_tilde(&path)),
            binary_name: file
                .agent
                .binary_name
                .unwrap_or_else(|| DEFAULT_BINARY_NAME.to_string()),
            subcommand: file
                .agent
                .subcommand
                .unwrap_or_else(|| DEFAULT_SUBCOMMAND.to_string()),
            dir_env: file
                .agent
                .dir_env
                .unwrap_or_else(|| DEFAULT_DIR_ENV.to_string()),
            log_capacity,
            stop_grace: file.agent.stop_grace.unwrap_or(DEFAULT_STOP_GRACE),
            home: system_utils::path::home_dir(),
            search_path: std::env::var_os("PATH"),
        },
        listener_enabled: file.listener.enabled.unwrap_or(true),
        listener: ListenerSettings {
            url,
            retry_delay: file.listener.retry_delay.unwrap_or(DEFAULT_RETRY_DELAY),
            reconnect_delay: file
                .listener
                .reconnect_delay
                .unwrap_or(DEFAULT_RECONNECT_DELAY),
            handshake_timeout: file
                .listener
                .handshake_timeout
                .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT),
        },
        access_token: env("ONEBOT_TOKEN").or(file.listener.access_token),
        history_limit: file.tasks.history_limit.unwrap_or(DEFAULT_HISTORY_LIMIT),
        sudo_password: env("CLAWPANEL_SUDO_PASSWORD").or(file.tasks.sudo_password),
        installers,
    })
}

/// Optional humantime durations such as `"5s"` or `"1m 30s"`.
mod humantime_serde_opt {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|value| humantime::parse_duration(&value).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolve_with(raw: &str, vars: &[(&str, &str)]) -> anyhow::Result<PanelConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        resolve(parse_file_config(raw)?, |key| vars.get(key).cloned())
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = resolve_with("", &[]).expect("config");
        assert_eq!(config.listen_addr, "0.0.0.0:19527");
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.supervisor.binary_name, "openclaw");
        assert_eq!(config.supervisor.subcommand, "start");
        assert_eq!(config.supervisor.dir_env, "OPENCLAW_DIR");
        assert_eq!(config.supervisor.log_capacity, 5000);
        assert_eq!(config.supervisor.stop_grace, Duration::from_secs(5));
        assert!(config.listener_enabled);
        assert_eq!(config.listener.url, "ws://127.0.0.1:3001");
        assert_eq!(config.listener.retry_delay, Duration::from_secs(10));
        assert_eq!(config.listener.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.listener.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.history_limit, 50);
        assert!(config.installers.is_empty());
        assert!(config.sudo_password.is_none());
    }

    #[test]
    fn file_values_and_env_overrides_are_layered() {
        let raw = r#"
listen_addr = "127.0.0.1:9000"

[agent]
dir = "/srv/openclaw"
stop_grace = "2s 500ms"

[listener]
url = "ws://10.0.0.2:3001"
access_token = "from-file"
retry_delay = "1m"

[tasks]
history_limit = 10

[[installers]]
software = "ffmpeg"
name = "Install FFmpeg"
script = "apt-get install -y ffmpeg"
sudo = true
"#;
        let config = resolve_with(
            raw,
            &[
                ("ONEBOT_TOKEN", "from-env"),
                ("CLAWPANEL_LISTEN", "0.0.0.0:8080"),
                ("OPENCLAW_BIN", "/opt/openclaw/bin/openclaw"),
                ("ONEBOT_URL", "  "),
            ],
        )
        .expect("config");
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.supervisor.agent_dir, PathBuf::from("/srv/openclaw"));
        assert_eq!(
            config.supervisor.binary,
            Some(PathBuf::from("/opt/openclaw/bin/openclaw"))
        );
        assert_eq!(config.supervisor.stop_grace, Duration::from_millis(2500));
        assert_eq!(config.listener.url, "ws://10.0.0.2:3001");
        assert_eq!(config.listener.retry_delay, Duration::from_secs(60));
        assert_eq!(config.access_token.as_deref(), Some("from-env"));
        assert_eq!(config.history_limit, 10);
        let installer = config.installer("ffmpeg").expect("installer");
        assert!(installer.sudo);
        assert_eq!(installer.name, "Install FFmpeg");
        assert!(config.installer("redis").is_none());
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(resolve_with("[agent]\nstop_grace = \"soon\"\n", &[]).is_err());
        assert!(resolve_with("[listener]\nurl = \"http://x\"\n", &[]).is_err());
        assert!(resolve_with("[agent]\nlog_capacity = 0\n", &[]).is_err());
        assert!(resolve_with("unknown_key = 1\n", &[]).is_err());
        let duplicate = r#"
[[installers]]
software = "git"
name = "a"
script = "true"

[[installers]]
software = "git"
name = "b"
script = "true"
"#;
        assert!(resolve_with(duplicate, &[]).is_err());
    }

    #[test]
    fn shipped_sample_config_parses() {
        let config = resolve_with(include_str!("../../../config/clawpanel.toml"), &[])
            .expect("sample config");
        assert!(config.installer("git").is_some_and(|git| git.sudo));
        assert!(config.installer("openclaw").is_some_and(|openclaw| !openclaw.sudo));
    }

    #[test]
    fn missing_file_means_defaults() {
        let dir = crate::test_utils::temp_dir("clawpanel-config");
        let config = load_panel_config(&dir.join("absent.toml")).expect("config");
        assert_eq!(config.history_limit, 50);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn tilde_paths_are_expanded() {
        let config = resolve_with("[agent]\ndir = \"~/agent\"\n", &[]).expect("config");
        if let Some(home) = system_utils::path::home_dir() {
            assert_eq!(config.supervisor.agent_dir, home.join("agent"));
        }
    }
}
