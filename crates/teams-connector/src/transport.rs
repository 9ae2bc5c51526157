use std::borrow::Cow;

use reqwest::header::{CONTENT_TYPE, HeaderMap};
use reqwest::{Client, Method, NoProxy, Proxy, Request, RequestBuilder, StatusCode};
use tokio_util::sync::CancellationToken;
use url::{Host, Url};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to build http client: {0}")]
    Build(#[source] reqwest::Error),
    #[error("invalid proxy url `{0}`")]
    InvalidProxy(String),
    #[error("failed to construct request: {0}")]
    Request(#[source] reqwest::Error),
    #[error("{method} {url} failed: {source}")]
    Send {
        method: String,
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{method} {url} cancelled")]
    Cancelled { method: String, url: String },
    #[error("failed to read response body from {url}: {source}")]
    Body {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// The two logical transport names. Everything that talks HTTP requests a
/// transport by one of these, so proxy configuration and request logging
/// apply uniformly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportName {
    /// Identity-provider traffic (token requests).
    MicrosoftLogin,
    /// Messaging-service traffic (everything else).
    TeamsService,
}

impl TransportName {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportName::MicrosoftLogin => "microsoft-login",
            TransportName::TeamsService => "teams-service",
        }
    }
}

/// Supplies the two independently proxiable HTTP transports. Transports are
/// process-wide, long-lived, and safe for concurrent use; handles returned
/// by [`TransportRegistry::transport`] are cheap clones over shared state.
#[derive(Clone)]
pub struct TransportRegistry {
    login: Transport,
    service: Transport,
}

impl TransportRegistry {
    pub fn new(
        login_proxy: Option<&Url>,
        service_proxy: Option<&Url>,
    ) -> Result<Self, TransportError> {
        Ok(Self {
            login: Transport::new(TransportName::MicrosoftLogin, login_proxy)?,
            service: Transport::new(TransportName::TeamsService, service_proxy)?,
        })
    }

    pub fn transport(&self, name: TransportName) -> Transport {
        match name {
            TransportName::MicrosoftLogin => self.login.clone(),
            TransportName::TeamsService => self.service.clone(),
        }
    }
}

/// A named HTTP sender. Every exchange through [`Transport::execute`] is
/// logged in full: request and response bodies are buffered whole before
/// logging, and transport failures are logged with their request context
/// and then propagated unchanged.
#[derive(Clone, Debug)]
pub struct Transport {
    name: TransportName,
    http: Client,
}

impl Transport {
    fn new(name: TransportName, proxy_url: Option<&Url>) -> Result<Self, TransportError> {
        let mut builder = Client::builder();
        if let Some(proxy_url) = proxy_url {
            let mut proxy = Proxy::all(proxy_url.as_str())
                .map_err(|_| TransportError::InvalidProxy(proxy_url.to_string()))?;
            // A loopback proxy is a local debugging proxy, so local requests
            // must keep flowing through it; only a remote proxy gets the
            // loopback bypass.
            if !proxy_is_loopback(proxy_url) {
                proxy = proxy.no_proxy(NoProxy::from_string("localhost,127.0.0.1,::1"));
            }
            builder = builder.proxy(proxy);
        }
        let http = builder.build().map_err(TransportError::Build)?;
        Ok(Self { name, http })
    }

    pub fn name(&self) -> TransportName {
        self.name
    }

    /// Start a request bound to this transport's client.
    pub fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http.request(method, url)
    }

    /// Send a request and buffer the response.
    ///
    /// Cancelling `cancel` fails the call with [`TransportError::Cancelled`]
    /// instead of hanging on the in-flight exchange.
    pub async fn execute(
        &self,
        request: Request,
        cancel: &CancellationToken,
    ) -> Result<BufferedResponse, TransportError> {
        let method = request.method().to_string();
        let url = request.url().to_string();
        self.log_request(&request);

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(TransportError::Cancelled { method, url });
            }
            outcome = self.http.execute(request) => outcome,
        };

        let response = match outcome {
            Ok(response) => response,
            Err(source) => {
                tracing::error!(
                    transport = self.name.as_str(),
                    "error while sending request {method} {url}: {source}"
                );
                return Err(TransportError::Send {
                    method,
                    url,
                    source,
                });
            }
        };

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|source| TransportError::Body {
                url: url.clone(),
                source,
            })?
            .to_vec();

        tracing::info!(
            transport = self.name.as_str(),
            "{method} {url} : {status}\n{}\n{}",
            content_type_of(&headers),
            String::from_utf8_lossy(&body),
        );

        Ok(BufferedResponse {
            status,
            headers,
            body,
        })
    }

    fn log_request(&self, request: &Request) {
        let headers = format_headers(request.headers());
        match request.body().and_then(|body| body.as_bytes()) {
            Some(bytes) => tracing::info!(
                transport = self.name.as_str(),
                "{} {} ...\nHeaders:\n{headers}\n{}\n{}",
                request.method(),
                request.url(),
                content_type_of(request.headers()),
                String::from_utf8_lossy(bytes),
            ),
            None => tracing::info!(
                transport = self.name.as_str(),
                "{} {} ...\nHeaders:\n{headers}",
                request.method(),
                request.url(),
            ),
        }
    }
}

/// A fully buffered HTTP response.
#[derive(Clone, Debug)]
pub struct BufferedResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl BufferedResponse {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

fn format_headers(headers: &HeaderMap) -> String {
    headers
        .iter()
        .map(|(name, value)| format!("{name}: {}", value.to_str().unwrap_or("<binary>")))
        .collect::<Vec<_>>()
        .join("\n")
}

fn content_type_of(headers: &HeaderMap) -> &str {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
}

fn proxy_is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(value: &str) -> Url {
        Url::parse(value).expect("valid url")
    }

    #[test]
    fn loopback_proxy_detection() {
        assert!(proxy_is_loopback(&url("http://127.0.0.1:8888")));
        assert!(proxy_is_loopback(&url("http://localhost:8888")));
        assert!(proxy_is_loopback(&url("http://[::1]:8888")));
        assert!(!proxy_is_loopback(&url("http://proxy.corp.example:8080")));
        assert!(!proxy_is_loopback(&url("http://10.1.2.3:8080")));
    }

    #[test]
    fn registry_hands_out_both_transports() {
        let registry = TransportRegistry::new(None, None).expect("registry");
        assert_eq!(
            registry.transport(TransportName::MicrosoftLogin).name(),
            TransportName::MicrosoftLogin
        );
        assert_eq!(
            registry.transport(TransportName::TeamsService).name(),
            TransportName::TeamsService
        );
    }

    #[test]
    fn registry_accepts_proxied_transports() {
        let proxy = url("http://proxy.corp.example:8080");
        TransportRegistry::new(Some(&proxy), None).expect("login proxy");
        TransportRegistry::new(None, Some(&proxy)).expect("service proxy");
        TransportRegistry::new(Some(&proxy), Some(&url("http://127.0.0.1:8888")))
            .expect("both proxies");
    }

    #[test]
    fn header_serialization_is_line_per_header() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, "application/json".parse().unwrap());
        headers.insert("x-ms-conversation-id", "19:abc".parse().unwrap());
        let rendered = format_headers(&headers);
        assert!(rendered.contains("content-type: application/json"));
        assert!(rendered.contains("x-ms-conversation-id: 19:abc"));
    }

    #[cfg_attr(
        not(feature = "network-tests"),
        ignore = "requires loopback networking"
    )]
    #[tokio::test]
    async fn send_failures_propagate_with_request_context() {
        let transport = Transport::new(TransportName::TeamsService, None).expect("transport");
        // Nothing listens on this port; the connection error must surface
        // unchanged as a Send error carrying method and url.
        let request = transport
            .request(Method::GET, url("http://127.0.0.1:9/v3/conversations/x/members"))
            .build()
            .expect("request");
        let err = transport
            .execute(request, &CancellationToken::new())
            .await
            .expect_err("unroutable request must fail");
        match err {
            TransportError::Send { method, url, .. } => {
                assert_eq!(method, "GET");
                assert!(url.contains("/v3/conversations/x/members"));
            }
            other => panic!("expected Send error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_fails_the_call() {
        let transport = Transport::new(TransportName::MicrosoftLogin, None).expect("transport");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let request = transport
            .request(Method::GET, url("http://192.0.2.1/token"))
            .build()
            .expect("request");
        let err = transport
            .execute(request, &cancel)
            .await
            .expect_err("cancelled call must fail");
        assert!(matches!(err, TransportError::Cancelled { .. }));
    }
}
