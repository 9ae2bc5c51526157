use async_trait::async_trait;
use reqwest::Method;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::activity::{Activity, ChannelAccount, ResourceResponse};
use crate::credentials::AppCredentials;
use crate::error::ConnectorError;
use crate::transport::{BufferedResponse, Transport, TransportError};

/// Conversation operations shared by both client variants.
#[async_trait]
pub trait ConversationApi {
    async fn get_conversation_members(
        &self,
        conversation_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ChannelAccount>, ConnectorError>;

    async fn send_to_conversation(
        &self,
        conversation_id: &str,
        activity: &Activity,
        cancel: &CancellationToken,
    ) -> Result<ResourceResponse, ConnectorError>;

    async fn reply_to_activity(
        &self,
        conversation_id: &str,
        activity_id: &str,
        activity: &Activity,
        cancel: &CancellationToken,
    ) -> Result<ResourceResponse, ConnectorError>;
}

/// Credential strategy bound to a connector client.
#[derive(Clone, Debug)]
pub enum CredentialStrategy {
    /// Local-emulator path: no credential attached to outbound calls.
    Anonymous,
    /// Production path: bearer tokens minted from the app identity.
    App(AppCredentials),
}

/// A handle for issuing conversation operations against one service URL
/// with one credential strategy.
///
/// Clients are scoped to a single operation: acquired, used, and dropped.
/// The transport handle they hold is a clone of registry state; dropping a
/// client never tears down the registry's transports.
#[derive(Debug)]
pub struct ConnectorClient {
    service_url: Url,
    credentials: CredentialStrategy,
    transport: Transport,
}

impl ConnectorClient {
    pub(crate) fn new(
        service_url: Url,
        credentials: CredentialStrategy,
        transport: Transport,
    ) -> Self {
        Self {
            service_url,
            credentials,
            transport,
        }
    }

    pub fn service_url(&self) -> &Url {
        &self.service_url
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.credentials, CredentialStrategy::App(_))
    }

    fn conversation_url(&self, segments: &[&str]) -> Result<Url, ConnectorError> {
        let mut url = self.service_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| ConnectorError::InvalidServiceUrl(self.service_url.to_string()))?;
            path.pop_if_empty();
            path.extend(["v3", "conversations"]);
            path.extend(segments);
        }
        Ok(url)
    }

    async fn authorize(
        &self,
        builder: reqwest::RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<reqwest::RequestBuilder, ConnectorError> {
        match &self.credentials {
            CredentialStrategy::Anonymous => Ok(builder),
            CredentialStrategy::App(credentials) => {
                let token = credentials.token(cancel).await?;
                Ok(builder.bearer_auth(token.value()))
            }
        }
    }

    async fn execute(
        &self,
        builder: reqwest::RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<BufferedResponse, ConnectorError> {
        let request = builder.build().map_err(TransportError::Request)?;
        let response = self.transport.execute(request, cancel).await?;
        if !response.status().is_success() {
            return Err(ConnectorError::Service {
                status: response.status(),
                message: response.text().into_owned(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ConversationApi for ConnectorClient {
    async fn get_conversation_members(
        &self,
        conversation_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ChannelAccount>, ConnectorError> {
        let url = self.conversation_url(&[conversation_id, "members"])?;
        let builder = self.authorize(self.transport.request(Method::GET, url), cancel).await?;
        let response = self.execute(builder, cancel).await?;
        response
            .json()
            .map_err(|err| ConnectorError::InvalidResponse(err.to_string()))
    }

    async fn send_to_conversation(
        &self,
        conversation_id: &str,
        activity: &Activity,
        cancel: &CancellationToken,
    ) -> Result<ResourceResponse, ConnectorError> {
        let url = self.conversation_url(&[conversation_id, "activities"])?;
        let builder = self
            .authorize(self.transport.request(Method::POST, url).json(activity), cancel)
            .await?;
        let response = self.execute(builder, cancel).await?;
        response
            .json()
            .map_err(|err| ConnectorError::InvalidResponse(err.to_string()))
    }

    async fn reply_to_activity(
        &self,
        conversation_id: &str,
        activity_id: &str,
        activity: &Activity,
        cancel: &CancellationToken,
    ) -> Result<ResourceResponse, ConnectorError> {
        let url = self.conversation_url(&[conversation_id, "activities", activity_id])?;
        let builder = self
            .authorize(self.transport.request(Method::POST, url).json(activity), cancel)
            .await?;
        let response = self.execute(builder, cancel).await?;
        response
            .json()
            .map_err(|err| ConnectorError::InvalidResponse(err.to_string()))
    }
}
