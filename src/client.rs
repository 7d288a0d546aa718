//! Shortener client orchestrating settings, server selection, cache and relay

use crate::api::{ApiAction, ApiFailure, ApiRequest, ApiResponse};
use crate::cache::{CachedStats, QueryKind, StatsCache};
use crate::coalesce::Coalescer;
use crate::config::Config;
use crate::errors::{RelayError, Result};
use crate::profile::{ServerKey, ServerProfile, is_absolute_url};
use crate::relay::{Relay, RelayRequest, dispatch_with_timeout};
use crate::selector::{self, ResolvedServer};
use crate::settings::{Settings, SettingsStore};

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

type ShortenKey = (ServerKey, String, Option<String>);

/// Result of a successful shortening
#[derive(Debug, Clone, PartialEq)]
pub struct ShortenResult {
    pub short_url: String,
    pub long_url: String,
    pub server: ServerKey,
    pub response: ApiResponse,
}

/// Result of a connection test that reached the server
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionReport {
    Connected,
    /// The server answered, but not in a recognizable shape
    UnexpectedFormat(Value),
}

/// Statistics for one server and query kind
#[derive(Debug, Clone)]
pub struct StatsReport {
    pub server: ServerKey,
    pub server_label: String,
    pub kind: QueryKind,
    pub stats: CachedStats,
}

impl StatsReport {
    fn totals(&self) -> Option<&Value> {
        let payload = &self.stats.payload;
        payload
            .get("db-stats")
            .filter(|t| t.is_object())
            .or_else(|| payload.get("stats").filter(|t| t.is_object()))
    }

    pub fn total_links(&self) -> Option<u64> {
        self.totals().and_then(|t| count(&t["total_links"]))
    }

    pub fn total_clicks(&self) -> Option<u64> {
        self.totals().and_then(|t| count(&t["total_clicks"]))
    }

    /// Per-link entries of an analytics payload, in server order
    pub fn links(&self) -> Vec<&Value> {
        match self.stats.payload.get("links") {
            Some(Value::Object(map)) => map.values().collect(),
            Some(Value::Array(items)) => items.iter().collect(),
            _ => Vec::new(),
        }
    }
}

/// The API sends counters as numbers or numeric strings
fn count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Main entry point: every user-facing operation goes through here
pub struct ShortenerClient {
    config: Config,
    settings: Arc<dyn SettingsStore>,
    relay: Arc<dyn Relay>,
    cache: StatsCache,
    shortening: Coalescer<ShortenKey, Result<ShortenResult>>,
}

impl ShortenerClient {
    pub fn new(config: Config, settings: Arc<dyn SettingsStore>, relay: Arc<dyn Relay>) -> Self {
        let cache = StatsCache::new(config.cache_ttl());
        Self {
            config,
            settings,
            relay,
            cache,
            shortening: Coalescer::new(),
        }
    }

    pub fn cache(&self) -> &StatsCache {
        &self.cache
    }

    pub async fn load_settings(&self) -> Result<Settings> {
        self.settings.load().await
    }

    /// Validate and persist a complete settings object.
    pub async fn save_settings(&self, settings: &Settings) -> Result<Settings> {
        let clean = settings.validated()?;
        self.settings.save(&clean).await?;
        Ok(clean)
    }

    pub async fn resolve(&self, choice: ServerKey) -> Result<ResolvedServer> {
        let settings = self.settings.load().await?;
        selector::resolve(&settings, choice)
    }

    pub async fn admin_url(&self, choice: ServerKey) -> Result<String> {
        Ok(self.resolve(choice).await?.profile.admin_url())
    }

    /// Shorten `long_url` on the chosen server.
    ///
    /// Identical requests issued while one is pending share its outcome.
    #[instrument(skip(self), fields(server = %choice))]
    pub async fn shorten(
        &self,
        long_url: &str,
        keyword: Option<&str>,
        choice: ServerKey,
    ) -> Result<ShortenResult> {
        let long_url = long_url.trim().to_string();
        if !is_absolute_url(&long_url) {
            return Err(RelayError::InvalidInput(format!(
                "'{}' is not a valid absolute URL",
                long_url
            )));
        }

        let server = self.resolve(choice).await?;
        let keyword = keyword
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string);

        let request = ApiRequest::shorten(server.credential(), &long_url, keyword.as_deref());
        let relay = Arc::clone(&self.relay);
        let endpoint = server.api_endpoint();
        let timeout = self.config.shorten_timeout;
        let key = (server.key, long_url.clone(), keyword);

        self.shortening
            .run(key, move || async move {
                let response =
                    call_api(relay.as_ref(), &endpoint, &request, "shorten", timeout).await?;

                if !response.is_success() {
                    let failure =
                        ApiFailure::classify(response.message.as_deref().unwrap_or("API Error"));
                    warn!("Server refused to shorten {}: {}", long_url, failure);
                    return Err(RelayError::Application(failure));
                }

                match response.shorturl.clone() {
                    Some(short_url) if !short_url.is_empty() => {
                        info!("Shortened {} to {}", long_url, short_url);
                        Ok(ShortenResult {
                            short_url,
                            long_url,
                            server: server.key,
                            response,
                        })
                    }
                    _ => Err(RelayError::Transport(
                        "response did not include a short URL".to_string(),
                    )),
                }
            })
            .await
    }

    /// Check that a server accepts the given URL and signature, without
    /// requiring them to be saved first.
    #[instrument(skip(self, credential))]
    pub async fn test_connection(&self, base_url: &str, credential: &str) -> Result<ConnectionReport> {
        let profile = ServerProfile::primary(base_url, credential);
        if !profile.is_complete() {
            return Err(RelayError::Configuration(
                "server URL and API signature are both required".to_string(),
            ));
        }

        let request = ApiRequest::new(&profile.credential, ApiAction::Stats);
        let data = call_api_raw(
            self.relay.as_ref(),
            &profile.api_endpoint(),
            &request,
            "connection test",
            self.config.test_timeout,
        )
        .await?;

        // Judged on the raw reply: anything that is not an object with a
        // recognized status or stats block is reported back as-is.
        let status = data.get("status").and_then(Value::as_str);
        if status == Some("fail") {
            let message = data
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("API Error");
            return Err(RelayError::Application(ApiFailure::classify(message)));
        }

        if status == Some("success") || data.get("stats").is_some() {
            info!("Connection to {} verified", profile.base_url);
            Ok(ConnectionReport::Connected)
        } else {
            debug!("Unrecognized connection test response: {}", data);
            Ok(ConnectionReport::UnexpectedFormat(data))
        }
    }

    /// Database totals (`db-stats`), cached for the dashboard TTL.
    pub async fn dashboard(&self, choice: ServerKey, force_refresh: bool) -> Result<StatsReport> {
        self.statistics(choice, QueryKind::Dashboard, force_refresh).await
    }

    /// Top links (`stats`), cached for the analytics TTL.
    pub async fn analytics(&self, choice: ServerKey, force_refresh: bool) -> Result<StatsReport> {
        self.statistics(choice, QueryKind::Analytics, force_refresh).await
    }

    #[instrument(skip(self))]
    pub async fn statistics(
        &self,
        choice: ServerKey,
        kind: QueryKind,
        force_refresh: bool,
    ) -> Result<StatsReport> {
        let server = self.resolve(choice).await?;

        let (request, operation, timeout) = match kind {
            QueryKind::Dashboard => (
                ApiRequest::new(server.credential(), ApiAction::DbStats),
                "dashboard",
                self.config.dashboard_timeout,
            ),
            QueryKind::Analytics => (
                ApiRequest::new(server.credential(), ApiAction::Stats)
                    .with_filter(&self.config.analytics_filter, self.config.analytics_limit),
                "analytics",
                self.config.analytics_timeout,
            ),
        };

        let relay = Arc::clone(&self.relay);
        let endpoint = server.api_endpoint();

        // Cached under the server that actually answered, so a fallback to
        // primary reads and writes the primary slot.
        let stats = self
            .cache
            .get_or_fetch(server.key, kind, force_refresh, move || async move {
                let data =
                    call_api_raw(relay.as_ref(), &endpoint, &request, operation, timeout).await?;

                if let Some(failure) = ApiResponse::from_value(data.clone())?.failure() {
                    return Err(RelayError::Application(failure));
                }

                Ok(data)
            })
            .await?;

        Ok(StatsReport {
            server: server.key,
            server_label: server.profile.label(),
            kind,
            stats,
        })
    }
}

/// Send one API request through the relay and decode the answer.
async fn call_api(
    relay: &dyn Relay,
    endpoint: &str,
    request: &ApiRequest,
    operation: &'static str,
    timeout: Duration,
) -> Result<ApiResponse> {
    let data = call_api_raw(relay, endpoint, request, operation, timeout).await?;
    ApiResponse::from_value(data)
}

async fn call_api_raw(
    relay: &dyn Relay,
    endpoint: &str,
    request: &ApiRequest,
    operation: &'static str,
    timeout: Duration,
) -> Result<Value> {
    let relay_request = RelayRequest::post_form(endpoint, request.to_form()?)
        .with_header("Accept", "application/json");

    debug!("Calling {} for {}", request.action().as_str(), operation);

    dispatch_with_timeout(relay, relay_request, operation, timeout)
        .await?
        .into_result()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{HttpRelay, RelayOutcome, spawn_relay};
    use crate::settings::MemorySettingsStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Replays canned outcomes and records what it was asked to send
    #[derive(Default)]
    struct ScriptedRelay {
        outcomes: Mutex<VecDeque<RelayOutcome>>,
        requests: Mutex<Vec<RelayRequest>>,
        delay: Option<Duration>,
    }

    impl ScriptedRelay {
        fn new(outcomes: Vec<RelayOutcome>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                ..Self::default()
            })
        }

        fn slow(delay: Duration, outcomes: Vec<RelayOutcome>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                delay: Some(delay),
                ..Self::default()
            })
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        fn last(&self) -> RelayRequest {
            self.requests.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl Relay for ScriptedRelay {
        async fn dispatch(&self, request: RelayRequest) -> RelayOutcome {
            self.requests.lock().unwrap().push(request);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| RelayOutcome::Failure("no scripted outcome".into()))
        }
    }

    fn settings() -> Settings {
        Settings {
            server_url: "https://main.test".to_string(),
            credential: "main-key".to_string(),
            additional_server_url: "https://backup.test".to_string(),
            additional_credential: "backup-key".to_string(),
            additional_server_name: "Backup".to_string(),
            ..Settings::default()
        }
    }

    fn client_with(settings: Settings, relay: Arc<dyn Relay>) -> ShortenerClient {
        ShortenerClient::new(
            Config::default(),
            Arc::new(MemorySettingsStore::new(settings)),
            relay,
        )
    }

    fn success(data: Value) -> RelayOutcome {
        RelayOutcome::Success(data)
    }

    #[tokio::test]
    async fn test_shorten_returns_short_url() {
        let relay = ScriptedRelay::new(vec![success(json!({
            "status": "success",
            "shorturl": "https://main.test/ab",
            "url": {"keyword": "ab"}
        }))]);
        let client = client_with(settings(), relay.clone());

        let result = client
            .shorten("https://example.com/page", Some("ab"), ServerKey::Primary)
            .await
            .unwrap();

        assert_eq!(result.short_url, "https://main.test/ab");
        assert_eq!(result.server, ServerKey::Primary);

        let sent = relay.last();
        assert_eq!(sent.url, "https://main.test/yourls-api.php");
        assert!(sent.body.contains("signature=main-key"));
        assert!(sent.body.contains("action=shorturl"));
        assert!(sent.body.contains("keyword=ab"));
        assert_eq!(sent.headers["Accept"], "application/json");
    }

    #[tokio::test]
    async fn test_additional_choice_with_flag_off_uses_primary() {
        let relay = ScriptedRelay::new(vec![success(json!({
            "status": "success",
            "shorturl": "https://main.test/x"
        }))]);
        let client = client_with(settings(), relay.clone());

        let result = client
            .shorten("https://example.com", None, ServerKey::Additional)
            .await
            .unwrap();

        assert_eq!(result.server, ServerKey::Primary);
        let sent = relay.last();
        assert_eq!(sent.url, "https://main.test/yourls-api.php");
        assert!(sent.body.contains("signature=main-key"));
        assert!(!sent.body.contains("keyword"));
    }

    #[tokio::test]
    async fn test_additional_server_is_used_when_enabled() {
        let relay = ScriptedRelay::new(vec![success(json!({
            "status": "success",
            "shorturl": "https://backup.test/x"
        }))]);
        let mut settings = settings();
        settings.enable_additional_server = true;
        let client = client_with(settings, relay.clone());

        let result = client
            .shorten("https://example.com", None, ServerKey::Additional)
            .await
            .unwrap();

        assert_eq!(result.server, ServerKey::Additional);
        assert!(relay.last().body.contains("signature=backup-key"));
    }

    #[tokio::test]
    async fn test_server_failure_is_classified() {
        let relay = ScriptedRelay::new(vec![success(json!({
            "status": "fail",
            "message": "https://example.com already exists in database",
            "code": "error:url"
        }))]);
        let client = client_with(settings(), relay);

        let err = client
            .shorten("https://example.com", Some("ab"), ServerKey::Primary)
            .await
            .unwrap_err();

        assert_eq!(err, RelayError::Application(ApiFailure::UrlExists));
    }

    #[tokio::test]
    async fn test_shorten_without_success_status_is_application_error() {
        let relay = ScriptedRelay::new(vec![
            success(json!({"shorturl": "https://main.test/ghost"})),
            success(json!({
                "status": "error",
                "message": "Short URL Keyword already exists in database or is reserved"
            })),
        ]);
        let client = client_with(settings(), relay.clone());

        let err = client
            .shorten("https://example.com/a", None, ServerKey::Primary)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RelayError::Application(ApiFailure::Unknown("API Error".into()))
        );

        let err = client
            .shorten("https://example.com/b", Some("taken"), ServerKey::Primary)
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::Application(ApiFailure::KeywordExists));
        assert_eq!(relay.calls(), 2);
    }

    #[tokio::test]
    async fn test_relay_failure_is_transport_error() {
        let relay = ScriptedRelay::new(vec![RelayOutcome::Failure(
            "HTTP error 502: Bad Gateway".into(),
        )]);
        let client = client_with(settings(), relay);

        let err = client
            .shorten("https://example.com", None, ServerKey::Primary)
            .await
            .unwrap_err();

        assert_eq!(err, RelayError::Transport("HTTP error 502: Bad Gateway".into()));
    }

    #[tokio::test]
    async fn test_missing_configuration_is_reported_without_network() {
        let relay = ScriptedRelay::new(vec![]);
        let client = client_with(Settings::default(), relay.clone());

        let err = client
            .shorten("https://example.com", None, ServerKey::Primary)
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Configuration(_)));
        assert_eq!(relay.calls(), 0);
    }

    #[tokio::test]
    async fn test_invalid_long_url_is_rejected() {
        let relay = ScriptedRelay::new(vec![]);
        let client = client_with(settings(), relay.clone());

        let err = client
            .shorten("not a url", None, ServerKey::Primary)
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::InvalidInput(_)));
        assert_eq!(relay.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_shorten_times_out() {
        let relay = ScriptedRelay::slow(
            Duration::from_secs(60),
            vec![success(json!({"status": "success", "shorturl": "https://main.test/late"}))],
        );
        let client = client_with(settings(), relay);

        let err = client
            .shorten("https://example.com", None, ServerKey::Primary)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            RelayError::Timeout {
                operation: "shorten",
                after: Duration::from_secs(30),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_shorten_requests_share_one_call() {
        let relay = ScriptedRelay::slow(
            Duration::from_secs(1),
            vec![success(json!({"status": "success", "shorturl": "https://main.test/d"}))],
        );
        let client = client_with(settings(), relay.clone());

        let (a, b) = tokio::join!(
            client.shorten("https://example.com", None, ServerKey::Primary),
            client.shorten("https://example.com", None, ServerKey::Primary)
        );

        assert_eq!(a.unwrap().short_url, "https://main.test/d");
        assert_eq!(b.unwrap().short_url, "https://main.test/d");
        assert_eq!(relay.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dashboard_reads_within_ttl_fetch_once() {
        let relay = ScriptedRelay::new(vec![success(json!({
            "db-stats": {"total_links": "42", "total_clicks": 1337},
            "statusCode": 200
        }))]);
        let client = client_with(settings(), relay.clone());

        let first = client.dashboard(ServerKey::Primary, false).await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        let second = client.dashboard(ServerKey::Primary, false).await.unwrap();

        assert_eq!(relay.calls(), 1);
        assert!(!first.stats.from_cache);
        assert!(second.stats.from_cache);
        assert_eq!(second.total_links(), Some(42));
        assert_eq!(second.total_clicks(), Some(1337));
        assert!(relay.last().body.contains("action=db-stats"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_refresh_failure_keeps_cached_dashboard() {
        let relay = ScriptedRelay::new(vec![
            success(json!({"db-stats": {"total_links": 1, "total_clicks": 2}})),
            RelayOutcome::Failure("network error: connection refused".into()),
        ]);
        let client = client_with(settings(), relay.clone());

        client.dashboard(ServerKey::Primary, false).await.unwrap();
        let err = client.dashboard(ServerKey::Primary, true).await.unwrap_err();
        assert!(matches!(err, RelayError::Transport(_)));

        let cached = client.dashboard(ServerKey::Primary, false).await.unwrap();
        assert_eq!(cached.total_links(), Some(1));
        assert_eq!(relay.calls(), 2);
    }

    #[tokio::test]
    async fn test_fallback_statistics_use_primary_slot() {
        let relay = ScriptedRelay::new(vec![success(json!({
            "stats": {"total_links": 3, "total_clicks": 9},
            "links": {
                "link_1": {"shorturl": "https://main.test/a", "clicks": "5"},
                "link_2": {"shorturl": "https://main.test/b", "clicks": "4"}
            }
        }))]);
        let client = client_with(settings(), relay.clone());

        let report = client.analytics(ServerKey::Additional, false).await.unwrap();
        assert_eq!(report.server, ServerKey::Primary);
        assert_eq!(report.links().len(), 2);
        assert!(relay.last().body.contains("filter=top&limit=10"));

        assert!(client
            .cache()
            .lookup(ServerKey::Primary, QueryKind::Analytics)
            .is_some());
        assert!(client
            .cache()
            .lookup(ServerKey::Additional, QueryKind::Analytics)
            .is_none());
    }

    #[tokio::test]
    async fn test_failed_status_is_not_cached() {
        let relay = ScriptedRelay::new(vec![
            success(json!({"status": "fail", "message": "Please log in"})),
            success(json!({"db-stats": {"total_links": 1, "total_clicks": 1}})),
        ]);
        let client = client_with(settings(), relay.clone());

        let err = client.dashboard(ServerKey::Primary, false).await.unwrap_err();
        assert_eq!(
            err,
            RelayError::Application(ApiFailure::Unknown("Please log in".into()))
        );

        client.dashboard(ServerKey::Primary, false).await.unwrap();
        assert_eq!(relay.calls(), 2);
    }

    #[tokio::test]
    async fn test_connection_test_outcomes() {
        let relay = ScriptedRelay::new(vec![
            success(json!({"stats": {"total_links": 0}})),
            success(json!({"statusCode": 200})),
            success(json!({"status": "fail", "message": "Invalid username or password"})),
        ]);
        let client = client_with(Settings::default(), relay.clone());

        assert_eq!(
            client.test_connection("https://sho.rt", "k").await.unwrap(),
            ConnectionReport::Connected
        );
        assert_eq!(relay.last().url, "https://sho.rt/yourls-api.php");
        assert!(relay.last().body.contains("action=stats"));

        assert!(matches!(
            client.test_connection("https://sho.rt/", "k").await.unwrap(),
            ConnectionReport::UnexpectedFormat(_)
        ));

        assert!(matches!(
            client.test_connection("https://sho.rt", "k").await,
            Err(RelayError::Application(ApiFailure::Unknown(_)))
        ));

        assert!(matches!(
            client.test_connection("", "k").await,
            Err(RelayError::Configuration(_))
        ));
        assert_eq!(relay.calls(), 3);
    }

    #[tokio::test]
    async fn test_connection_reports_unrecognized_replies_verbatim() {
        let replies = vec![json!([]), json!("ok"), json!({"status": 200})];
        let relay = ScriptedRelay::new(replies.iter().cloned().map(success).collect());
        let client = client_with(Settings::default(), relay.clone());

        for expected in replies {
            assert_eq!(
                client.test_connection("https://sho.rt", "k").await.unwrap(),
                ConnectionReport::UnexpectedFormat(expected)
            );
        }
        assert_eq!(relay.calls(), 3);
    }

    #[tokio::test]
    async fn test_save_settings_normalizes_before_persisting() {
        let client = client_with(Settings::default(), ScriptedRelay::new(vec![]));

        let saved = client.save_settings(&settings()).await.unwrap();
        assert_eq!(saved.server_url, "https://main.test/");
        assert_eq!(client.load_settings().await.unwrap(), saved);
        assert_eq!(
            client.admin_url(ServerKey::Primary).await.unwrap(),
            "https://main.test/admin"
        );

        let mut broken = settings();
        broken.server_url = " ".into();
        assert!(client.save_settings(&broken).await.is_err());
        assert_eq!(client.load_settings().await.unwrap(), saved);

        broken.server_url = "sho.rt".into();
        assert!(matches!(
            client.save_settings(&broken).await,
            Err(RelayError::Configuration(_))
        ));
        assert_eq!(client.load_settings().await.unwrap(), saved);
    }

    #[tokio::test]
    async fn test_shorten_through_bridge_and_http() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/yourls-api.php"))
            .and(body_string_contains("action=shorturl"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "shorturl": "https://x.test/ab"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (handle, _worker) = spawn_relay(Arc::new(HttpRelay::new().unwrap()), 4);
        let settings = Settings {
            server_url: server.uri(),
            credential: "sig".to_string(),
            ..Settings::default()
        };
        let client = client_with(settings, Arc::new(handle));

        let result = client
            .shorten("https://example.com/long", None, ServerKey::Primary)
            .await
            .unwrap();
        assert_eq!(result.short_url, "https://x.test/ab");
    }
}
