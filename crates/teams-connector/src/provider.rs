use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::{ConnectorSettings, Environment};
use crate::connector::{ConnectorClient, CredentialStrategy};
use crate::credentials::AppCredentials;
use crate::error::ConnectorError;
use crate::token_cache::TokenCache;
use crate::transport::{TransportError, TransportName, TransportRegistry};

/// Cache key for the health probe's last successful token.
const LAST_TOKEN_CACHE_KEY: &str = "ConnectorClientProvider.lastToken";

/// Builds connector clients bound to a service URL and answers the
/// authentication health check.
///
/// The environment is supplied once, explicitly, at construction; the
/// emulator branch never activates when it is production.
pub struct ConnectorClientProvider {
    settings: ConnectorSettings,
    environment: Environment,
    registry: TransportRegistry,
    token_cache: TokenCache,
}

impl ConnectorClientProvider {
    pub fn new(
        settings: ConnectorSettings,
        environment: Environment,
    ) -> Result<Self, TransportError> {
        let registry =
            TransportRegistry::new(settings.login_proxy_url(), settings.service_proxy_url())?;
        Ok(Self {
            settings,
            environment,
            registry,
            token_cache: TokenCache::new(),
        })
    }

    /// Fallback target for inbound messages that carry no service URL.
    pub fn default_service_url(&self) -> &Url {
        self.settings.default_service_url()
    }

    /// Build a client bound to `service_url`.
    ///
    /// Plain-http localhost URLs in a non-production environment get the
    /// unauthenticated emulator client; everything else gets a production
    /// client whose credential is freshly derived from the app identity.
    /// No caching happens here.
    pub fn create_connector(&self, service_url: &str) -> Result<ConnectorClient, ConnectorError> {
        let service_url = Url::parse(service_url)
            .map_err(|_| ConnectorError::InvalidServiceUrl(service_url.to_string()))?;
        let service = self.registry.transport(TransportName::TeamsService);

        if !self.environment.is_production() && is_emulator_url(&service_url) {
            return Ok(ConnectorClient::new(
                service_url,
                CredentialStrategy::Anonymous,
                service,
            ));
        }

        let login = self.registry.transport(TransportName::MicrosoftLogin);
        let credentials = AppCredentials::new(
            self.settings.identity().clone(),
            login,
            self.settings.login_authority(),
        );
        Ok(ConnectorClient::new(
            service_url,
            CredentialStrategy::App(credentials),
            service,
        ))
    }

    /// Can we currently authenticate against the identity provider?
    ///
    /// The last successful token is reused until it expires, so frequent
    /// orchestrator health polling does not hammer the identity provider.
    /// Failures are logged and reported as `false`, never propagated; the
    /// cache is only populated on success.
    pub async fn check_authentication(&self, cancel: &CancellationToken) -> bool {
        if self.token_cache.try_get(LAST_TOKEN_CACHE_KEY).is_some() {
            return true;
        }

        let login = self.registry.transport(TransportName::MicrosoftLogin);
        let credentials = AppCredentials::new(
            self.settings.identity().clone(),
            login,
            self.settings.login_authority(),
        );
        match credentials.token(cancel).await {
            Ok(token) => {
                self.token_cache.set(LAST_TOKEN_CACHE_KEY, token);
                true
            }
            Err(err) => {
                tracing::warn!("health token acquisition failed: {err}");
                false
            }
        }
    }
}

fn is_emulator_url(url: &Url) -> bool {
    url.scheme() == "http" && url.host_str() == Some("localhost")
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};
    use std::sync::atomic::{AtomicU16, Ordering};

    use axum::extract::State;
    use axum::routing::post;
    use axum::{Json, Router};
    use tokio::sync::oneshot;

    use super::*;
    use crate::config::AppIdentity;
    use crate::credentials::{BearerToken, now_epoch_seconds};

    fn settings() -> ConnectorSettings {
        let identity = AppIdentity::new("app-id", "app-secret", "tenant-id").expect("identity");
        ConnectorSettings::new(identity, "https://smba.trafficmanager.net/emea/")
            .expect("settings")
    }

    fn provider(environment: Environment) -> ConnectorClientProvider {
        ConnectorClientProvider::new(settings(), environment).expect("provider")
    }

    #[test]
    fn emulator_urls_get_the_unauthenticated_client() {
        let provider = provider(Environment::NonProduction);
        let client = provider
            .create_connector("http://localhost:3978")
            .expect("client");
        assert!(!client.is_authenticated());
    }

    #[test]
    fn emulator_rule_is_exact_about_scheme_and_host() {
        let provider = provider(Environment::NonProduction);
        assert!(provider
            .create_connector("https://localhost:3978")
            .expect("https localhost")
            .is_authenticated());
        assert!(provider
            .create_connector("http://127.0.0.1:3978")
            .expect("loopback ip")
            .is_authenticated());
    }

    #[test]
    fn production_never_takes_the_emulator_path() {
        let provider = provider(Environment::Production);
        let client = provider
            .create_connector("http://localhost:3978")
            .expect("client");
        assert!(client.is_authenticated());
    }

    #[test]
    fn malformed_service_urls_fail_the_call() {
        let provider = provider(Environment::Production);
        let err = provider.create_connector("not a url").unwrap_err();
        assert!(matches!(err, ConnectorError::InvalidServiceUrl(_)));
    }

    #[tokio::test]
    async fn health_reuses_the_cached_token_until_expiry() {
        let provider = provider(Environment::Production);
        provider.token_cache.set(
            LAST_TOKEN_CACHE_KEY,
            BearerToken::new("t", now_epoch_seconds() + 3600),
        );
        // Cache hit short-circuits before any transport is touched.
        assert!(provider.check_authentication(&CancellationToken::new()).await);
    }

    #[tokio::test]
    async fn expired_cache_entry_is_a_miss_for_health() {
        let provider = provider(Environment::Production);
        provider.token_cache.set(
            LAST_TOKEN_CACHE_KEY,
            BearerToken::new("t", now_epoch_seconds().saturating_sub(1)),
        );
        // The miss forces a fresh fetch; cancel it immediately so the test
        // never leaves the process. A cancelled fetch is a failure, so the
        // probe reports false and leaves the cache unpopulated.
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!provider.check_authentication(&cancel).await);
        assert!(provider.token_cache.try_get(LAST_TOKEN_CACHE_KEY).is_none());
    }

    struct StubIdentityProvider {
        base_url: String,
        hits: Arc<AtomicU16>,
        shutdown: Option<oneshot::Sender<()>>,
    }

    #[derive(Clone)]
    struct StubState {
        hits: Arc<AtomicU16>,
        status: Arc<Mutex<u16>>,
    }

    async fn token_handler(
        State(state): State<StubState>,
    ) -> (axum::http::StatusCode, Json<serde_json::Value>) {
        state.hits.fetch_add(1, Ordering::SeqCst);
        let status = *state.status.lock().expect("status lock");
        (
            axum::http::StatusCode::from_u16(status).expect("status"),
            Json(serde_json::json!({
                "token_type": "Bearer",
                "expires_in": 3600,
                "access_token": "opaque-token",
            })),
        )
    }

    impl StubIdentityProvider {
        async fn start(status: u16) -> Self {
            let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
                .await
                .expect("bind stub listener");
            let addr = listener.local_addr().expect("local addr");
            let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
            let hits = Arc::new(AtomicU16::new(0));
            let status = Arc::new(Mutex::new(status));
            let state = StubState {
                hits: Arc::clone(&hits),
                status: Arc::clone(&status),
            };

            let app = Router::new()
                .route("/{tenant}/oauth2/v2.0/token", post(token_handler))
                .with_state(state);
            let server = axum::serve(listener, app.into_make_service());
            tokio::spawn(async move {
                let _ = server
                    .with_graceful_shutdown(async {
                        let _ = shutdown_rx.await;
                    })
                    .await;
            });

            Self {
                base_url: format!("http://{addr}"),
                hits,
                shutdown: Some(shutdown_tx),
            }
        }

        fn hits(&self) -> u16 {
            self.hits.load(Ordering::SeqCst)
        }
    }

    impl Drop for StubIdentityProvider {
        fn drop(&mut self) {
            if let Some(tx) = self.shutdown.take() {
                let _ = tx.send(());
            }
        }
    }

    fn provider_against(stub: &StubIdentityProvider) -> ConnectorClientProvider {
        let settings = settings()
            .with_login_authority(&stub.base_url)
            .expect("authority");
        ConnectorClientProvider::new(settings, Environment::Production).expect("provider")
    }

    #[cfg_attr(
        not(feature = "network-tests"),
        ignore = "requires loopback networking"
    )]
    #[tokio::test]
    async fn cold_health_fetches_once_then_serves_from_cache() {
        let stub = StubIdentityProvider::start(200).await;
        let provider = provider_against(&stub);
        let cancel = CancellationToken::new();

        assert!(provider.check_authentication(&cancel).await);
        assert!(provider.check_authentication(&cancel).await);
        assert_eq!(stub.hits(), 1);
    }

    #[cfg_attr(
        not(feature = "network-tests"),
        ignore = "requires loopback networking"
    )]
    #[tokio::test]
    async fn failed_health_leaves_the_cache_cold() {
        let stub = StubIdentityProvider::start(401).await;
        let provider = provider_against(&stub);
        let cancel = CancellationToken::new();

        assert!(!provider.check_authentication(&cancel).await);
        assert!(!provider.check_authentication(&cancel).await);
        // Every probe attempted a fresh fetch; nothing was cached.
        assert_eq!(stub.hits(), 2);
        assert!(provider.token_cache.try_get(LAST_TOKEN_CACHE_KEY).is_none());
    }
}
