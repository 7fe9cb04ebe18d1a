// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Creating and destroying instances with the `salt-cloud` tool.

use crate::provisioning::DestroyResult;
use crate::provisioning::DestroyStatus;
use crate::provisioning::InstanceStatus;
use crate::provisioning::ProvisioningApi;
use crate::provisioning::ProvisioningError;
use crate::provisioning::ProvisioningRequest;
use crate::provisioning::ProvisioningResult;
use crate::resolver::ConfigSnapshot;
use camino::Utf8Path;
use camino_tempfile::NamedUtf8TempFile;
use saltcloud_worker_common::process::execute_async_with_timeout;
use serde_json::Map;
use serde_json::Value;
use slog::debug;
use slog::info;
use slog::o;
use slog::Logger;
use std::collections::BTreeSet;
use std::io::Write;
use std::time::Duration;
use tokio::process::Command;

pub const SALT_CLOUD: &str = "salt-cloud";

/// Creating an instance includes the provider booting it and salt-cloud
/// deploying a minion onto it.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

const NOTHING_TO_DESTROY: &str = "No machines were found to be destroyed";

/// What a single salt-cloud invocation should do.
#[derive(Debug)]
enum Action<'a> {
    Create { profile: &'a str, name: &'a str },
    Destroy { names: &'a BTreeSet<String> },
}

/// Private files handed to one salt-cloud invocation. They are removed
/// when this is dropped.
struct InvocationFiles {
    /// The merged cloud options.
    cloud: NamedUtf8TempFile,
    /// The profile being created, with its minion directives.
    profiles: Option<NamedUtf8TempFile>,
}

/// A salt-cloud command line and the files it refers to.
struct Invocation {
    args: Vec<String>,
    files: InvocationFiles,
}

/// [`ProvisioningApi`] backed by the salt-cloud command-line tool.
pub struct SaltCloud {
    log: Logger,
    program: String,
    timeout: Duration,
}

impl SaltCloud {
    pub fn new(log: &Logger) -> Self {
        Self {
            log: log.new(o!("component" => "SaltCloud")),
            program: SALT_CLOUD.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Runs `program` instead of whatever `salt-cloud` is on the `PATH`.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(
        &self,
        invocation: Invocation,
    ) -> Result<String, ProvisioningError> {
        let mut command = Command::new(&self.program);
        command.args(&invocation.args);
        debug!(self.log, "running salt-cloud"; "args" => ?invocation.args);
        let output =
            execute_async_with_timeout(&mut command, self.timeout).await?;
        drop(invocation.files);
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait::async_trait]
impl ProvisioningApi for SaltCloud {
    async fn create(
        &self,
        config: &ConfigSnapshot,
        request: &ProvisioningRequest,
    ) -> Result<ProvisioningResult, ProvisioningError> {
        // The profile carries the worker's credential, so it goes to a
        // private file that is removed once salt-cloud is done with it.
        let invocation = prepare(
            config,
            Action::Create {
                profile: &request.profile_name,
                name: &request.instance_name,
            },
            Some(profile_document(config, request)),
        )
        .await?;

        info!(
            self.log, "creating instance";
            "instance" => &request.instance_name,
            "profile" => &request.profile_name,
        );
        let stdout = self.run(invocation).await?;
        parse_create_output(&stdout)
    }

    async fn destroy(
        &self,
        config: &ConfigSnapshot,
        names: &BTreeSet<String>,
    ) -> Result<DestroyResult, ProvisioningError> {
        let invocation =
            prepare(config, Action::Destroy { names }, None).await?;
        info!(self.log, "destroying instances"; "instances" => ?names);
        let stdout = self.run(invocation).await?;
        parse_destroy_output(&stdout, names)
    }
}

/// Writes the private files for `action` and builds its command line.
///
/// salt-cloud reads the merged cloud options from our own file rather than
/// from the user's, so the non-interactive settings of the snapshot always
/// apply.
async fn prepare(
    config: &ConfigSnapshot,
    action: Action<'_>,
    profiles: Option<Map<String, Value>>,
) -> Result<Invocation, ProvisioningError> {
    let files = write_invocation_files(cloud_options(config), profiles)
        .await
        .map_err(ProvisioningError::PrivateFiles)?;
    let profiles = match &files.profiles {
        Some(file) => file.path(),
        None => config.paths().profiles.as_path(),
    };
    let args = command_args(config, files.cloud.path(), profiles, &action);
    Ok(Invocation { args, files })
}

/// The merged options, less the profiles and providers that salt-cloud is
/// given in their own files.
fn cloud_options(config: &ConfigSnapshot) -> Map<String, Value> {
    let mut opts = config.opts().clone();
    opts.remove("profiles");
    opts.remove("providers");
    opts
}

fn profile_document(
    config: &ConfigSnapshot,
    request: &ProvisioningRequest,
) -> Map<String, Value> {
    let mut profiles = Map::new();
    profiles.insert(
        request.profile_name.clone(),
        Value::Object(request.profile_settings(config.profile())),
    );
    profiles
}

async fn write_invocation_files(
    cloud: Map<String, Value>,
    profiles: Option<Map<String, Value>>,
) -> std::io::Result<InvocationFiles> {
    tokio::task::spawn_blocking(move || -> std::io::Result<InvocationFiles> {
        let cloud = write_private(&cloud, ".cloud")?;
        let profiles = profiles
            .map(|profiles| write_private(&profiles, ".profiles"))
            .transpose()?;
        Ok(InvocationFiles { cloud, profiles })
    })
    .await
    .map_err(std::io::Error::other)?
}

// Temporary files are created readable by their owner only.
fn write_private(
    document: &Map<String, Value>,
    suffix: &str,
) -> std::io::Result<NamedUtf8TempFile> {
    let contents = serde_yaml::to_string(document).map_err(|err| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, err)
    })?;

    let mut file = camino_tempfile::Builder::new()
        .prefix("saltcloud-worker-")
        .suffix(suffix)
        .tempfile()?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    Ok(file)
}

fn command_args(
    config: &ConfigSnapshot,
    cloud: &Utf8Path,
    profiles: &Utf8Path,
    action: &Action<'_>,
) -> Vec<String> {
    let paths = config.paths();
    let logging = config.logging();
    let mut args: Vec<String> = vec![
        "--out=json".into(),
        "-y".into(),
        "-C".into(),
        cloud.to_string(),
        "-M".into(),
        paths.master.to_string(),
        "--providers-config".into(),
        paths.providers.to_string(),
        "-V".into(),
        profiles.to_string(),
        "--log-level".into(),
        logging.log_level.clone(),
        "--log-file".into(),
        logging.log_file.clone(),
        "--log-file-level".into(),
        logging.log_level_logfile.clone(),
    ];
    match action {
        Action::Create { profile, name } => {
            args.extend([
                "-p".to_string(),
                profile.to_string(),
                name.to_string(),
            ]);
        }
        Action::Destroy { names } => {
            args.push("-d".to_string());
            args.extend(names.iter().cloned());
        }
    }
    args
}

fn parse_json(stdout: &str) -> Result<Option<Value>, ProvisioningError> {
    let stdout = stdout.trim();
    if stdout.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(stdout).map(Some).map_err(|err| {
        ProvisioningError::Parse { reason: format!("invalid JSON: {err}") }
    })
}

fn describe(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_create_output(
    stdout: &str,
) -> Result<ProvisioningResult, ProvisioningError> {
    let Some(document) = parse_json(stdout)? else {
        return Ok(ProvisioningResult::default());
    };
    let entries = match document {
        Value::Object(entries) => entries,
        other => {
            return Err(ProvisioningError::Parse {
                reason: format!("expected a mapping, got: {other}"),
            });
        }
    };

    let mut result = ProvisioningResult::default();
    for (name, details) in entries {
        if name == "Error" || name == "error" {
            result.error = Some(describe(&details));
            continue;
        }
        let errors = match &details {
            Value::Object(fields) => fields
                .get("Error")
                .or_else(|| fields.get("error"))
                .map(|error| vec![describe(error)])
                .unwrap_or_default(),
            Value::Bool(false) | Value::Null => {
                vec![String::from("instance was not created")]
            }
            Value::String(message) => vec![message.clone()],
            _ => Vec::new(),
        };
        result.instances.insert(name, InstanceStatus { details, errors });
    }
    Ok(result)
}

fn parse_destroy_output(
    stdout: &str,
    names: &BTreeSet<String>,
) -> Result<DestroyResult, ProvisioningError> {
    let mut result = DestroyResult::default();
    let Some(document) = parse_json(stdout)? else {
        return Ok(result);
    };
    match &document {
        Value::String(message) if message.contains(NOTHING_TO_DESTROY) => {}
        Value::Object(_) => find_destroyed(&document, names, &mut result),
        other => {
            return Err(ProvisioningError::Parse {
                reason: format!("unexpected destroy output: {other}"),
            });
        }
    }
    Ok(result)
}

// salt-cloud nests destroy results under the provider and driver names, so
// look for the instance names at any depth. An error anywhere else belongs
// to the call or to a provider, and keeps us from calling the unlisted
// instances absent.
fn find_destroyed(
    value: &Value,
    names: &BTreeSet<String>,
    result: &mut DestroyResult,
) {
    let Value::Object(entries) = value else {
        return;
    };
    for (key, entry) in entries {
        if names.contains(key) {
            result
                .instances
                .entry(key.clone())
                .or_insert_with(|| destroy_status(entry));
        } else if key == "Error" || key == "error" {
            let message = describe(entry);
            if result.error.is_none() && !message.contains(NOTHING_TO_DESTROY)
            {
                result.error = Some(message);
            }
        } else {
            find_destroyed(entry, names, result);
        }
    }
}

fn destroy_status(entry: &Value) -> DestroyStatus {
    match entry {
        Value::Object(fields) => {
            match fields.get("Error").or_else(|| fields.get("error")) {
                Some(error) => DestroyStatus::Failed(describe(error)),
                None => DestroyStatus::Destroyed,
            }
        }
        Value::Bool(false) => {
            DestroyStatus::Failed(String::from("destroy reported failure"))
        }
        _ => DestroyStatus::Destroyed,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::SaltConfigPaths;
    use crate::config::Tunables;
    use crate::config::WorkerCredential;
    use crate::provisioning::MinionDirectives;
    use crate::resolver::test_helpers::default_salt_config;
    use crate::resolver::test_helpers::write_salt_config;
    use crate::resolver::test_helpers::MASTER;
    use crate::resolver::test_helpers::PROFILES;
    use crate::resolver::test_helpers::PROVIDERS;
    use crate::resolver::ConfigResolver;
    use camino_tempfile::Utf8TempDir;
    use saltcloud_worker_test_utils::dev::test_setup_log;
    use std::sync::Arc;

    fn snapshot(dir: &Utf8TempDir) -> (SaltConfigPaths, Arc<ConfigSnapshot>) {
        let paths = default_salt_config(dir);
        let resolver = ConfigResolver::new(
            paths.clone(),
            "ubuntu-small",
            Tunables::default(),
        );
        (paths, resolver.resolve().unwrap())
    }

    fn names(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn test_create_args() {
        let dir = Utf8TempDir::new().unwrap();
        let (paths, config) = snapshot(&dir);
        let args = command_args(
            &config,
            Utf8Path::new("/tmp/p.cloud"),
            Utf8Path::new("/tmp/p.profiles"),
            &Action::Create {
                profile: "ubuntu-small",
                name: "w-worker-rnd0042",
            },
        );

        assert_eq!(args[..2], ["--out=json", "-y"]);
        let flag = |flag: &str| {
            let at = args.iter().position(|arg| arg == flag).unwrap();
            args[at + 1].clone()
        };
        assert_eq!(flag("-C"), "/tmp/p.cloud");
        assert_eq!(flag("-M"), paths.master.as_str());
        assert_eq!(flag("--providers-config"), paths.providers.as_str());
        assert_eq!(flag("-V"), "/tmp/p.profiles");
        // From the fixture: log_level in master, the logfile settings in
        // cloud.
        assert_eq!(flag("--log-level"), "info");
        assert_eq!(flag("--log-file"), "/var/log/salt/cloud-buildbot");
        assert_eq!(flag("--log-file-level"), "debug");
        assert_eq!(
            args[args.len() - 3..],
            ["-p", "ubuntu-small", "w-worker-rnd0042"]
        );
    }

    #[tokio::test]
    async fn test_destroy_uses_configured_profiles() {
        let dir = Utf8TempDir::new().unwrap();
        let (paths, config) = snapshot(&dir);
        let targets = names(&["b", "a"]);
        let invocation =
            prepare(&config, Action::Destroy { names: &targets }, None)
                .await
                .unwrap();
        let args = &invocation.args;

        assert!(invocation.files.profiles.is_none());
        let at = args.iter().position(|arg| arg == "-V").unwrap();
        assert_eq!(args[at + 1], paths.profiles.as_str());
        assert_eq!(args[args.len() - 3..], ["-d", "a", "b"]);
    }

    #[tokio::test]
    async fn test_merged_options_reach_salt_cloud() {
        let dir = Utf8TempDir::new().unwrap();
        // Settings that would make salt-cloud skip the minion deploy or
        // leave the credential-bearing scripts behind.
        let paths = write_salt_config(
            &dir,
            MASTER,
            "deploy: false\nparallel: true\nkeep_tmp: true\n",
            PROFILES,
            PROVIDERS,
        );
        let config = ConfigResolver::new(
            paths.clone(),
            "ubuntu-small",
            Tunables::default(),
        )
        .resolve()
        .unwrap();
        let targets = names(&["w-worker-rnd0042"]);

        let invocation =
            prepare(&config, Action::Destroy { names: &targets }, None)
                .await
                .unwrap();
        let cloud = invocation.files.cloud.path();
        let at = invocation.args.iter().position(|arg| arg == "-C").unwrap();
        assert_eq!(invocation.args[at + 1], cloud.as_str());
        assert_ne!(cloud, paths.cloud.as_path());

        let contents = std::fs::read_to_string(cloud).unwrap();
        let written: Value = serde_yaml::from_str(&contents).unwrap();
        assert_eq!(written["deploy"], true);
        assert_eq!(written["assume_yes"], true);
        assert_eq!(written["parallel"], false);
        assert_eq!(written["keep_tmp"], false);
        // Master settings and resolved logging come along; the profile and
        // provider sets have files of their own.
        assert_eq!(written["interface"], "0.0.0.0");
        assert_eq!(written["log_level"], "info");
        assert!(written.get("profiles").is_none());
        assert!(written.get("providers").is_none());

        let cloud = cloud.to_path_buf();
        drop(invocation);
        assert!(!cloud.exists());
    }

    #[tokio::test]
    async fn test_profile_file_carries_directives() {
        let dir = Utf8TempDir::new().unwrap();
        let (_, config) = snapshot(&dir);
        let request = ProvisioningRequest {
            profile_name: "ubuntu-small".to_string(),
            instance_name: "w-worker-rnd0042".to_string(),
            directives: MinionDirectives {
                master: "198.51.100.1".to_string(),
                worker_name: "w".to_string(),
                worker_password: WorkerCredential::new("hunter2"),
            },
        };

        let invocation = prepare(
            &config,
            Action::Create {
                profile: &request.profile_name,
                name: &request.instance_name,
            },
            Some(profile_document(&config, &request)),
        )
        .await
        .unwrap();
        let file = invocation.files.profiles.as_ref().unwrap();
        let at = invocation.args.iter().position(|arg| arg == "-V").unwrap();
        assert_eq!(invocation.args[at + 1], file.path().as_str());

        let contents = std::fs::read_to_string(file.path()).unwrap();
        let written: Value = serde_yaml::from_str(&contents).unwrap();
        let profile = &written["ubuntu-small"];
        assert_eq!(profile["image"], "ami-1234");
        assert_eq!(profile["minion"]["master"], "198.51.100.1");
        let grains = &profile["minion"]["grains"];
        assert_eq!(grains["buildworker"]["password"], "hunter2");
    }

    #[test]
    fn test_parse_create_output() {
        let result = parse_create_output(
            r#"{"w-worker-rnd0042": {"instanceId": "i-1", "state": "running"}}"#,
        )
        .unwrap();
        assert_eq!(result.embedded_error("w-worker-rnd0042"), None);
        assert_eq!(
            result.instances["w-worker-rnd0042"].details["instanceId"],
            "i-1"
        );

        let result = parse_create_output(
            r#"{"w-worker-rnd0042": {"Error": "InsufficientInstanceCapacity"}}"#,
        )
        .unwrap();
        assert_eq!(
            result.embedded_error("w-worker-rnd0042").as_deref(),
            Some("InsufficientInstanceCapacity")
        );

        let result =
            parse_create_output(r#"{"Error": "profile not found"}"#).unwrap();
        assert_eq!(result.error.as_deref(), Some("profile not found"));

        let result = parse_create_output("\n").unwrap();
        assert!(result.embedded_error("w-worker-rnd0042").is_some());

        assert!(matches!(
            parse_create_output("[1, 2]"),
            Err(ProvisioningError::Parse { .. })
        ));
    }

    #[test]
    fn test_parse_destroy_output() {
        let targets = names(&["w-worker-rnd0042", "w-worker-rnd0044"]);
        let result = parse_destroy_output(
            r#"{
                "my-ec2": {
                    "ec2": {
                        "w-worker-rnd0042": {
                            "currentState": {"name": "shutting-down"}
                        },
                        "w-worker-rnd0044": {"Error": "throttled"}
                    }
                }
            }"#,
            &targets,
        )
        .unwrap();
        assert_eq!(result.status("w-worker-rnd0042"), DestroyStatus::Destroyed);
        assert_eq!(
            result.status("w-worker-rnd0044"),
            DestroyStatus::Failed("throttled".to_string())
        );

        let result = parse_destroy_output(
            r#""No machines were found to be destroyed""#,
            &targets,
        )
        .unwrap();
        assert_eq!(result.status("w-worker-rnd0042"), DestroyStatus::Absent);

        let result = parse_destroy_output(
            r#"{"Error": "No machines were found to be destroyed"}"#,
            &targets,
        )
        .unwrap();
        assert_eq!(result.status("w-worker-rnd0042"), DestroyStatus::Absent);

        let result =
            parse_destroy_output(r#"{"my-ec2": {"ec2": {}}}"#, &targets)
                .unwrap();
        assert_eq!(result.status("w-worker-rnd0044"), DestroyStatus::Absent);
    }

    #[test]
    fn test_destroy_errors_without_instance_names() {
        let targets = names(&["w-worker-rnd0042"]);

        let result = parse_destroy_output(
            r#"{"Error": "Failed to authenticate against remote ec2"}"#,
            &targets,
        )
        .unwrap();
        assert_eq!(
            result.status("w-worker-rnd0042"),
            DestroyStatus::Failed(
                "Failed to authenticate against remote ec2".to_string()
            )
        );

        let result = parse_destroy_output(
            r#"{"my-ec2": {"ec2": {"Error": "throttled"}}}"#,
            &targets,
        )
        .unwrap();
        assert_eq!(result.error.as_deref(), Some("throttled"));
        assert_eq!(
            result.status("w-worker-rnd0042"),
            DestroyStatus::Failed("throttled".to_string())
        );
    }

    #[tokio::test]
    async fn test_tool_failure_is_reported() {
        let logctx = test_setup_log("test_tool_failure_is_reported");
        let dir = Utf8TempDir::new().unwrap();
        let (_, config) = snapshot(&dir);
        let cloud = SaltCloud::new(&logctx.log)
            .with_program("/nonexistent/salt-cloud");

        let err = cloud
            .destroy(&config, &names(&["w-worker-rnd0042"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisioningError::Execution(_)), "{err}");
        logctx.cleanup_successful();
    }
}
