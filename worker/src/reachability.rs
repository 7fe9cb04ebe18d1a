// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Determining the address new instances use to reach the salt master.

use crate::config::DiscoveryConfig;
use crate::resolver::Profile;
use saltcloud_worker_common::backoff::retry_notify;
use saltcloud_worker_common::backoff::retry_policy_short;
use saltcloud_worker_common::backoff::AttemptBudget;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("address discovery request failed")]
    Request(#[from] reqwest::Error),

    #[error("address discovery returned status {status}")]
    Status { status: u16 },

    #[error("address discovery returned {body:?}, which is not an address")]
    InvalidAddress { body: String },
}

#[derive(Debug, thiserror::Error)]
#[error("could not discover our public address after {attempts} attempts")]
pub struct ReachabilityError {
    pub attempts: u32,
    #[source]
    pub last_error: DiscoveryError,
}

/// Something that can tell us our own public address.
#[async_trait::async_trait]
pub trait AddressDiscovery: Send + Sync {
    async fn public_address(&self) -> Result<IpAddr, DiscoveryError>;
}

/// Asks a "what is my address" HTTP endpoint, which answers `GET` with the
/// address as plain text.
pub struct HttpAddressDiscovery {
    client: reqwest::Client,
    url: String,
}

impl HttpAddressDiscovery {
    pub fn new(url: impl Into<String>) -> Result<Self, DiscoveryError> {
        let client = reqwest::ClientBuilder::new()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait::async_trait]
impl AddressDiscovery for HttpAddressDiscovery {
    async fn public_address(&self) -> Result<IpAddr, DiscoveryError> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DiscoveryError::Status { status: status.as_u16() });
        }
        let body = response.text().await?;
        body.trim()
            .parse()
            .map_err(|_| DiscoveryError::InvalidAddress { body })
    }
}

pub struct ReachabilityResolver {
    log: Logger,
    discovery: Arc<dyn AddressDiscovery>,
    attempts: u32,
    backoff: Duration,
}

impl ReachabilityResolver {
    pub fn new(
        log: &Logger,
        discovery: Arc<dyn AddressDiscovery>,
        config: &DiscoveryConfig,
    ) -> Self {
        Self {
            log: log.new(o!("component" => "ReachabilityResolver")),
            discovery,
            attempts: config.attempts,
            backoff: config.backoff,
        }
    }

    /// Returns the master address pinned in `profile`, or else our public
    /// address as reported by the discovery service.
    pub async fn resolve_master_address(
        &self,
        profile: &Profile,
    ) -> Result<String, ReachabilityError> {
        if let Some(master) = profile.master_address() {
            debug!(
                self.log, "using master address from profile";
                "master" => master,
            );
            return Ok(master.to_string());
        }

        let budget = Mutex::new(AttemptBudget::new(self.attempts));
        let discovery = &self.discovery;
        let log = &self.log;

        let query = || async {
            let attempt = budget.lock().unwrap().start_attempt();
            let result = discovery.public_address().await;
            let budget = budget.lock().unwrap();
            result.map_err(|err| {
                warn!(
                    log, "address discovery failed";
                    "attempt" => attempt,
                    "error" => %err,
                );
                budget.classify(err)
            })
        };

        let address = retry_notify(
            retry_policy_short(self.backoff),
            query,
            |_, _| {},
        )
        .await
        .map_err(|last_error| ReachabilityError {
            attempts: budget.lock().unwrap().attempts(),
            last_error,
        })?;

        info!(self.log, "discovered master address"; "master" => %address);
        Ok(address.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fakes::discovery::FakeDiscovery;
    use httptest::matchers::request;
    use httptest::responders::status_code;
    use httptest::Expectation;
    use saltcloud_worker_test_utils::dev::test_setup_log;
    use serde_json::json;

    fn config(attempts: u32) -> DiscoveryConfig {
        DiscoveryConfig {
            url: String::from("http://unused.invalid"),
            attempts,
            backoff: Duration::from_millis(10),
        }
    }

    fn profile(settings: serde_json::Value) -> Profile {
        Profile::new(settings.as_object().unwrap().clone())
    }

    #[tokio::test(start_paused = true)]
    async fn test_pinned_master_skips_discovery() {
        let logctx = test_setup_log("test_pinned_master_skips_discovery");
        let discovery = FakeDiscovery::new();
        let resolver = ReachabilityResolver::new(
            &logctx.log,
            discovery.clone(),
            &config(5),
        );

        let master = resolver
            .resolve_master_address(&profile(
                json!({ "minion": { "master": "salt.example.com" } }),
            ))
            .await
            .unwrap();
        assert_eq!(master, "salt.example.com");
        assert_eq!(discovery.calls(), 0);
        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_retries() {
        let logctx = test_setup_log("test_discovery_retries");
        let discovery = FakeDiscovery::new()
            .with_failures(2)
            .with_address("198.51.100.20".parse().unwrap());
        let resolver = ReachabilityResolver::new(
            &logctx.log,
            discovery.clone(),
            &config(5),
        );

        let master =
            resolver.resolve_master_address(&profile(json!({}))).await.unwrap();
        assert_eq!(master, "198.51.100.20");
        assert_eq!(discovery.calls(), 3);
        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_gives_up() {
        let logctx = test_setup_log("test_discovery_gives_up");
        let discovery = FakeDiscovery::new().with_failures(u32::MAX);
        let resolver = ReachabilityResolver::new(
            &logctx.log,
            discovery.clone(),
            &config(5),
        );

        let err = resolver
            .resolve_master_address(&profile(json!({ "minion": {} })))
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 5);
        assert_eq!(discovery.calls(), 5);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_http_discovery() {
        let server = httptest::Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/ip"))
                .respond_with(status_code(200).body("203.0.113.9\n")),
        );
        let discovery =
            HttpAddressDiscovery::new(server.url_str("/ip")).unwrap();
        assert_eq!(
            discovery.public_address().await.unwrap(),
            "203.0.113.9".parse::<IpAddr>().unwrap()
        );
    }

    #[tokio::test]
    async fn test_http_discovery_errors() {
        let server = httptest::Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/down"))
                .respond_with(status_code(503)),
        );
        server.expect(
            Expectation::matching(request::method_path("GET", "/html"))
                .respond_with(status_code(200).body("<html>hi</html>")),
        );

        let down = HttpAddressDiscovery::new(server.url_str("/down")).unwrap();
        assert!(matches!(
            down.public_address().await,
            Err(DiscoveryError::Status { status: 503 })
        ));
        let html = HttpAddressDiscovery::new(server.url_str("/html")).unwrap();
        assert!(matches!(
            html.public_address().await,
            Err(DiscoveryError::InvalidAddress { .. })
        ));
    }
}
