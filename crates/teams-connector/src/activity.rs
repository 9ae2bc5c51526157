use serde::{Deserialize, Serialize};

pub const ACTIVITY_TYPE_MESSAGE: &str = "message";

/// One inbound or outbound chat activity, in the gateway's camelCase wire
/// form. Unknown wire fields are ignored on the way in.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Activity {
    #[serde(rename = "type")]
    pub activity_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    pub conversation: ConversationAccount,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<ChannelAccount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<ChannelAccount>,
}

impl Activity {
    pub fn is_message(&self) -> bool {
        self.activity_type == ACTIVITY_TYPE_MESSAGE
    }

    /// Build the reply to this activity: same conversation, sender and
    /// recipient swapped, threaded onto this activity's id.
    pub fn create_reply(&self, text: impl Into<String>) -> Activity {
        Activity {
            activity_type: ACTIVITY_TYPE_MESSAGE.to_string(),
            id: None,
            text: Some(text.into()),
            service_url: self.service_url.clone(),
            reply_to_id: self.id.clone(),
            conversation: self.conversation.clone(),
            from: self.recipient.clone(),
            recipient: self.from.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConversationAccount {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A party in a conversation (user or bot).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelAccount {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Id the service assigned to a posted activity.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceResponse {
    pub id: String,
}
