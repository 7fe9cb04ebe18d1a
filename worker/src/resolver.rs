// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Merging the salt configuration documents into one snapshot.
//!
//! The provider ("cloud") document is overlaid on the master document, the
//! profile and provider sets are attached as sub-maps, and a fixed set of
//! non-interactive defaults is applied last. Salt's logging directives are
//! then resolved so that every directive is present in the snapshot, each
//! falling back from its per-channel key to the general key to a built-in
//! default.

use crate::config::SaltConfigPaths;
use crate::config::Tunables;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use serde_json::Map;
use serde_json::Value;
use std::sync::Arc;
use std::sync::OnceLock;
use thiserror::Error;

pub const DEFAULT_LOG_FILE: &str = "/var/log/salt/cloud";
pub const DEFAULT_LOG_LEVEL: &str = "warning";
pub const DEFAULT_LOG_FMT_CONSOLE: &str = "[%(levelname)-8s] %(message)s";
pub const DEFAULT_LOG_FMT_LOGFILE: &str =
    "%(asctime)s,%(msecs)03.0f [%(name)-17s][%(levelname)-8s] %(message)s";
pub const DEFAULT_LOG_DATEFMT: &str = "%H:%M:%S";
pub const DEFAULT_LOG_DATEFMT_LOGFILE: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("error reading salt config \"{path}\": {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("error parsing salt config \"{path}\": {err}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: serde_yaml::Error,
    },
    #[error("salt config \"{path}\" is not a mapping")]
    NotAMapping { path: Utf8PathBuf },
    #[error("profile \"{profile}\" not found in \"{path}\"")]
    NoSuchProfile { profile: String, path: Utf8PathBuf },
    #[error("profile \"{profile}\" is not a mapping")]
    InvalidProfile { profile: String },
    #[error("reading salt config was interrupted")]
    Interrupted(#[source] tokio::task::JoinError),
}

/// A salt-cloud instance profile.
#[derive(Clone, Debug, PartialEq)]
pub struct Profile(Map<String, Value>);

impl Profile {
    pub fn new(settings: Map<String, Value>) -> Self {
        Self(settings)
    }

    /// The master address pinned in the profile's minion settings, if any.
    pub fn master_address(&self) -> Option<&str> {
        self.0
            .get("minion")
            .and_then(|minion| minion.get("master"))
            .and_then(Value::as_str)
            .filter(|master| !master.is_empty())
    }

    pub fn settings(&self) -> &Map<String, Value> {
        &self.0
    }
}

/// Salt's logging directives, fully resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoggingDirectives {
    pub log_file: String,
    pub log_level: String,
    pub log_level_logfile: String,
    pub log_fmt_console: String,
    pub log_fmt_logfile: String,
    pub log_datefmt: String,
    pub log_datefmt_logfile: String,
    pub log_granular_levels: Map<String, Value>,
}

impl LoggingDirectives {
    fn resolve(opts: &Map<String, Value>) -> Self {
        LoggingDirectives {
            log_file: directive(opts, &["log_file"], DEFAULT_LOG_FILE),
            log_level: directive(opts, &["log_level"], DEFAULT_LOG_LEVEL),
            log_level_logfile: directive(
                opts,
                &["log_level_logfile", "log_level"],
                DEFAULT_LOG_LEVEL,
            ),
            log_fmt_console: directive(
                opts,
                &["log_fmt_console", "log_fmt"],
                DEFAULT_LOG_FMT_CONSOLE,
            ),
            log_fmt_logfile: directive(
                opts,
                &["log_fmt_logfile", "log_fmt"],
                DEFAULT_LOG_FMT_LOGFILE,
            ),
            log_datefmt: directive(
                opts,
                &["log_datefmt"],
                DEFAULT_LOG_DATEFMT,
            ),
            log_datefmt_logfile: directive(
                opts,
                &["log_datefmt_logfile", "log_datefmt"],
                DEFAULT_LOG_DATEFMT_LOGFILE,
            ),
            log_granular_levels: opts
                .get("log_granular_levels")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        }
    }

    fn write_into(&self, opts: &mut Map<String, Value>) {
        let strings = [
            ("log_file", &self.log_file),
            ("log_level", &self.log_level),
            ("log_level_logfile", &self.log_level_logfile),
            ("log_fmt_console", &self.log_fmt_console),
            ("log_fmt_logfile", &self.log_fmt_logfile),
            ("log_datefmt", &self.log_datefmt),
            ("log_datefmt_logfile", &self.log_datefmt_logfile),
        ];
        for (key, value) in strings {
            opts.insert(key.to_string(), Value::String(value.clone()));
        }
        opts.insert(
            "log_granular_levels".to_string(),
            Value::Object(self.log_granular_levels.clone()),
        );
    }
}

// First non-empty string among `keys`, else `default`.
fn directive(
    opts: &Map<String, Value>,
    keys: &[&str],
    default: &str,
) -> String {
    keys.iter()
        .filter_map(|key| opts.get(*key))
        .filter_map(Value::as_str)
        .find(|value| !value.is_empty())
        .unwrap_or(default)
        .to_string()
}

/// Immutable result of merging the salt configuration documents.
#[derive(Debug)]
pub struct ConfigSnapshot {
    paths: SaltConfigPaths,
    opts: Map<String, Value>,
    profile_name: String,
    profile: Profile,
    logging: LoggingDirectives,
    tunables: Tunables,
}

impl ConfigSnapshot {
    pub fn paths(&self) -> &SaltConfigPaths {
        &self.paths
    }

    /// The merged options, including the `profiles` and `providers`
    /// sub-maps and the resolved logging directives.
    pub fn opts(&self) -> &Map<String, Value> {
        &self.opts
    }

    pub fn profile_name(&self) -> &str {
        &self.profile_name
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn logging(&self) -> &LoggingDirectives {
        &self.logging
    }

    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }
}

/// Produces the [`ConfigSnapshot`] for one controller, at most once.
#[derive(Debug)]
pub struct ConfigResolver {
    paths: SaltConfigPaths,
    profile_name: String,
    tunables: Tunables,
    snapshot: OnceLock<Arc<ConfigSnapshot>>,
}

impl ConfigResolver {
    pub fn new(
        paths: SaltConfigPaths,
        profile_name: impl Into<String>,
        tunables: Tunables,
    ) -> Self {
        Self {
            paths,
            profile_name: profile_name.into(),
            tunables,
            snapshot: OnceLock::new(),
        }
    }

    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    /// Returns the snapshot, reading and merging the documents on the first
    /// successful call only.
    pub fn resolve(&self) -> Result<Arc<ConfigSnapshot>, ConfigError> {
        if let Some(snapshot) = self.snapshot.get() {
            return Ok(Arc::clone(snapshot));
        }
        let snapshot = Arc::new(self.merge()?);
        // If another caller won the race its snapshot is kept; both were
        // built from the same files.
        Ok(Arc::clone(self.snapshot.get_or_init(|| snapshot)))
    }

    /// Like [`ConfigResolver::resolve`], but reads the documents on the
    /// runtime's blocking pool.
    pub async fn resolve_blocking(
        self: &Arc<Self>,
    ) -> Result<Arc<ConfigSnapshot>, ConfigError> {
        if let Some(snapshot) = self.snapshot.get() {
            return Ok(Arc::clone(snapshot));
        }
        let resolver = Arc::clone(self);
        tokio::task::spawn_blocking(move || resolver.resolve())
            .await
            .map_err(ConfigError::Interrupted)?
    }

    fn merge(&self) -> Result<ConfigSnapshot, ConfigError> {
        let mut opts = read_mapping(&self.paths.master)?;
        let cloud = read_mapping(&self.paths.cloud)?;
        let profiles = read_mapping(&self.paths.profiles)?;
        let providers = read_mapping(&self.paths.providers)?;

        opts.extend(cloud);

        let profile = match profiles.get(&self.profile_name) {
            Some(Value::Object(settings)) => Profile::new(settings.clone()),
            Some(_) => {
                return Err(ConfigError::InvalidProfile {
                    profile: self.profile_name.clone(),
                });
            }
            None => {
                return Err(ConfigError::NoSuchProfile {
                    profile: self.profile_name.clone(),
                    path: self.paths.profiles.clone(),
                });
            }
        };

        opts.insert("profiles".to_string(), Value::Object(profiles));
        opts.insert("providers".to_string(), Value::Object(providers));

        // We're never attached to a terminal.
        opts.insert("deploy".to_string(), Value::Bool(true));
        opts.insert("assume_yes".to_string(), Value::Bool(true));
        opts.insert("parallel".to_string(), Value::Bool(false));
        opts.insert("keep_tmp".to_string(), Value::Bool(false));

        let logging = LoggingDirectives::resolve(&opts);
        logging.write_into(&mut opts);

        Ok(ConfigSnapshot {
            paths: self.paths.clone(),
            opts,
            profile_name: self.profile_name.clone(),
            profile,
            logging,
            tunables: self.tunables.clone(),
        })
    }
}

fn read_mapping(path: &Utf8Path) -> Result<Map<String, Value>, ConfigError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|err| ConfigError::Io { path: path.into(), err })?;
    let document: Value = serde_yaml::from_str(&contents)
        .map_err(|err| ConfigError::Parse { path: path.into(), err })?;
    match document {
        Value::Object(map) => Ok(map),
        // An empty document is an empty configuration.
        Value::Null => Ok(Map::new()),
        _ => Err(ConfigError::NotAMapping { path: path.into() }),
    }
}
