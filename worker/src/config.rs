// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for parsing the provisioner's own configuration file

use camino::Utf8Path;
use camino::Utf8PathBuf;
use dropshot::ConfigLogging;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Configuration for one latent build worker
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Logging configuration for the process hosting this worker.
    pub log: ConfigLogging,
    /// Identity of the build worker and the profile used to create it.
    pub worker: WorkerConfig,
    /// Locations of the salt configuration documents.
    #[serde(default)]
    pub salt: SaltConfigPaths,
    /// How to find the address instances should use to reach the master
    /// when the profile does not pin one.
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// Retry budgets and delays for the provisioning lifecycle.
    #[serde(default)]
    pub tunables: Tunables,
}

impl Config {
    /// Load a `Config` from the given TOML file
    pub fn from_file(path: &Utf8Path) -> Result<Config, LoadError> {
        let file_contents = std::fs::read_to_string(path)
            .map_err(|err| LoadError::Io { path: path.into(), err })?;
        let config_parsed: Config = toml::from_str(&file_contents)
            .map_err(|err| LoadError::Parse { path: path.into(), err })?;
        Ok(config_parsed)
    }

    /// Builds the host's root logger from the `[log]` section.
    pub fn to_logger(&self) -> std::io::Result<slog::Logger> {
        self.log.to_logger(format!("saltcloud-worker-{}", self.worker.name))
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Name the build worker registers with on the orchestration host.
    pub name: String,
    /// Credential the worker presents when it registers.
    pub password: WorkerCredential,
    /// Name of the salt-cloud profile instances are created from.
    pub profile: String,
}

/// A worker's registration credential. Never printed.
#[derive(Clone, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct WorkerCredential(String);

impl WorkerCredential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for WorkerCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WorkerCredential(<redacted>)")
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SaltConfigPaths {
    pub master: Utf8PathBuf,
    pub cloud: Utf8PathBuf,
    pub profiles: Utf8PathBuf,
    pub providers: Utf8PathBuf,
}

impl Default for SaltConfigPaths {
    fn default() -> Self {
        Self {
            master: Utf8PathBuf::from("/etc/salt/master"),
            cloud: Utf8PathBuf::from("/etc/salt/cloud"),
            profiles: Utf8PathBuf::from("/etc/salt/cloud.profiles"),
            providers: Utf8PathBuf::from("/etc/salt/cloud.providers"),
        }
    }
}

impl SaltConfigPaths {
    /// Directory the salt CLI tools should read the master config from.
    pub fn config_dir(&self) -> &Utf8Path {
        self.master.parent().unwrap_or_else(|| Utf8Path::new("/etc/salt"))
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Endpoint answering `GET` with our public address as plain text.
    pub url: String,
    pub attempts: u32,
    #[serde(rename = "backoff_ms", with = "duration_ms")]
    pub backoff: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            url: String::from("https://api.ipify.org"),
            attempts: 5,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Retry budgets and delays used while substantiating a worker.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Tunables {
    /// Attempts made to publish the highstate job before giving up.
    pub dispatch_attempts: u32,
    #[serde(rename = "dispatch_retry_delay_ms", with = "duration_ms")]
    pub dispatch_retry_delay: Duration,
    /// Time given to a freshly dispatched job to show up on the minion.
    #[serde(rename = "post_dispatch_delay_ms", with = "duration_ms")]
    pub post_dispatch_delay: Duration,
    /// Polls that may time out (or observe nothing before the job was ever
    /// seen) in a row before polling gives up.
    pub poll_retry_budget: u32,
    #[serde(rename = "poll_interval_ms", with = "duration_ms")]
    pub poll_interval: Duration,
    #[serde(rename = "poll_timeout_ms", with = "duration_ms")]
    pub poll_timeout: Duration,
    /// Consecutive empty polls, after the job was seen running, required
    /// to declare it finished.
    pub completion_confirmations: u32,
    #[serde(rename = "fetch_timeout_ms", with = "duration_ms")]
    pub fetch_timeout: Duration,
    /// Wait between instance creation and job dispatch.
    #[serde(rename = "settle_delay_ms", with = "duration_ms")]
    pub settle_delay: Duration,
    /// Wait between teardown and telling the scheduler the slot is free.
    #[serde(rename = "slot_free_delay_ms", with = "duration_ms")]
    pub slot_free_delay: Duration,
    /// The host should stop the worker after a single build.
    pub single_build: bool,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            dispatch_attempts: 11,
            dispatch_retry_delay: Duration::from_secs(2),
            post_dispatch_delay: Duration::from_secs(5),
            poll_retry_budget: 6,
            poll_interval: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(10),
            completion_confirmations: 2,
            fetch_timeout: Duration::from_secs(15),
            settle_delay: Duration::from_secs(2),
            slot_free_delay: Duration::from_secs(5),
            single_build: false,
        }
    }
}

mod duration_ms {
    use serde::Deserialize;
    use serde::Deserializer;
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("error reading \"{path}\": {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("error parsing \"{path}\": {err}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
}

#[cfg(test)]
mod test {
    use super::*;
    use camino_tempfile::Utf8TempDir;

    fn write_config(dir: &Utf8TempDir, contents: &str) -> Utf8PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let dir = Utf8TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
            [log]
            mode = "stderr-terminal"
            level = "info"

            [worker]
            name = "linux-x64"
            password = "hunter2"
            profile = "ubuntu-small"
            "#,
        );

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.worker.name, "linux-x64");
        assert_eq!(config.worker.password.expose(), "hunter2");
        assert_eq!(config.salt, SaltConfigPaths::default());
        assert_eq!(config.discovery, DiscoveryConfig::default());
        assert_eq!(config.tunables, Tunables::default());
        assert_eq!(config.tunables.dispatch_attempts, 11);
        assert_eq!(config.salt.config_dir(), "/etc/salt");
        let _log = config.to_logger().unwrap();
    }

    #[test]
    fn test_tunables_override() {
        let dir = Utf8TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
            [log]
            mode = "stderr-terminal"
            level = "debug"

            [worker]
            name = "w"
            password = "p"
            profile = "prof"

            [salt]
            master = "/srv/salt/master"

            [tunables]
            poll_interval_ms = 250
            poll_retry_budget = 11
            single_build = true
            "#,
        );

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.salt.master, "/srv/salt/master");
        assert_eq!(config.salt.cloud, "/etc/salt/cloud");
        assert_eq!(config.tunables.poll_interval, Duration::from_millis(250));
        assert_eq!(config.tunables.poll_retry_budget, 11);
        assert!(config.tunables.single_build);
        assert_eq!(
            config.tunables.dispatch_retry_delay,
            Tunables::default().dispatch_retry_delay
        );
    }

    #[test]
    fn test_load_errors() {
        let dir = Utf8TempDir::new().unwrap();
        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            Config::from_file(&missing),
            Err(LoadError::Io { .. })
        ));

        let path = write_config(&dir, "[worker]\nname = 3\n");
        assert!(matches!(
            Config::from_file(&path),
            Err(LoadError::Parse { .. })
        ));
    }

    #[test]
    fn test_credential_is_redacted() {
        let credential = WorkerCredential::new("s3cret");
        assert!(!format!("{credential:?}").contains("s3cret"));
    }
}
