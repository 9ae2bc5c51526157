use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use teams_connector::{
    Activity, ChannelAccount, ConnectorClient, ConnectorClientProvider, ConnectorError,
    ConversationApi,
};

/// Handles one inbound activity: logs it, looks up the conversation
/// members, and echoes message activities back to the sender.
pub struct ActivityReceiver {
    provider: Arc<ConnectorClientProvider>,
}

impl ActivityReceiver {
    pub fn new(provider: Arc<ConnectorClientProvider>) -> Self {
        Self { provider }
    }

    /// Connectors are scoped to one operation: built from the activity's
    /// own service URL when it carries one, the configured default
    /// otherwise, and dropped when the operation completes.
    fn create_connector(&self, source: &Activity) -> Result<ConnectorClient, ConnectorError> {
        match source.service_url.as_deref() {
            Some(service_url) => self.provider.create_connector(service_url),
            None => self
                .provider
                .create_connector(self.provider.default_service_url().as_str()),
        }
    }

    pub async fn process_activity(
        &self,
        activity: Activity,
        cancel: &CancellationToken,
    ) -> Result<(), ConnectorError> {
        info!(
            "received activity {}",
            serde_json::to_string(&activity).unwrap_or_default()
        );

        let members = self.get_conversation_members(&activity, cancel).await?;
        info!(
            "members in conversation {} are: {}",
            activity.conversation.id,
            serde_json::to_string(&members).unwrap_or_default()
        );

        if activity.is_message() {
            let text = activity.text.as_deref().unwrap_or_default();
            let reply = activity.create_reply(format!("You said: {text}"));
            self.post_activity(reply, &activity, cancel).await?;
        }

        Ok(())
    }

    async fn get_conversation_members(
        &self,
        source: &Activity,
        cancel: &CancellationToken,
    ) -> Result<Vec<ChannelAccount>, ConnectorError> {
        let connector = self.create_connector(source)?;
        connector
            .get_conversation_members(&source.conversation.id, cancel)
            .await
    }

    async fn post_activity(
        &self,
        activity: Activity,
        parent: &Activity,
        cancel: &CancellationToken,
    ) -> Result<(), ConnectorError> {
        let connector = self.create_connector(parent)?;
        let response = match activity.reply_to_id.as_deref().filter(|id| is_threaded_id(id)) {
            Some(reply_to_id) => {
                connector
                    .reply_to_activity(&activity.conversation.id, reply_to_id, &activity, cancel)
                    .await?
            }
            None => {
                connector
                    .send_to_conversation(&activity.conversation.id, &activity, cancel)
                    .await?
            }
        };
        info!("activity sent: {}", response.id);
        Ok(())
    }
}

/// The gateway uses `0` and `-1` (and sometimes an empty id) for activities
/// that did not originate from a threadable message.
fn is_threaded_id(id: &str) -> bool {
    !matches!(id, "" | "0" | "-1")
}
