use crate::error::CoreError;
use crate::ids::{Jid, MessageKey};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MediaPayload {
    pub mimetype: String,
    pub direct_path: Option<String>,
    pub media_key: Vec<u8>,
    pub file_sha256: Vec<u8>,
    pub file_length: u64,
    pub caption: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NativeFlowButton {
    pub name: String,
    pub params_json: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerDataOperationRequest {
    pub request_type: String,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum ProtocolMessage {
    Revoke { key: MessageKey },
    Edit { key: MessageKey, edited: Box<Message> },
    PeerDataOperation { request: PeerDataOperationRequest },
}

/// Logical outbound payload. Classification for the stanza is derived by
/// exhaustive matches over this set rather than by probing fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Message {
    Text { text: String },
    ExtendedText { text: String, matched_url: Option<String> },
    Image(MediaPayload),
    Video { media: MediaPayload, gif_playback: bool },
    Audio { media: MediaPayload, ptt: bool },
    Document(MediaPayload),
    Sticker(MediaPayload),
    Contact { display_name: String, vcard: String },
    ContactsArray { display_name: String, vcards: Vec<String> },
    LiveLocation { latitude: f64, longitude: f64, sequence: u64 },
    List { title: String, rows: Vec<String> },
    ListResponse { selected_row_id: String },
    Buttons { text: String, buttons: Vec<String> },
    ButtonsResponse { selected_button_id: String },
    Order { order_id: String },
    Product { product_id: String },
    Interactive { body: String, native_flow: Option<Vec<NativeFlowButton>> },
    InteractiveResponse { body: String, native_flow_name: Option<String> },
    GroupInvite { group: Jid, code: String },
    Reaction { key: MessageKey, text: String },
    PinInChat { key: MessageKey },
    KeepInChat { key: MessageKey },
    PollCreation { name: String, options: Vec<String> },
    Protocol(ProtocolMessage),
    DeviceSent { destination: Jid, message: Box<Message> },
    SenderKeyDistribution { group: Jid, payload: Vec<u8> },
    Ephemeral { message: Box<Message> },
    ViewOnce { message: Box<Message> },
}

#[derive(Serialize)]
struct NewsletterPlaintext<'a> {
    message: Option<&'a Message>,
}

impl Message {
    pub fn text(text: impl Into<String>) -> Self {
        Message::Text { text: text.into() }
    }

    /// Strips ephemeral and view-once wrappers.
    pub fn normalized(&self) -> &Message {
        match self {
            Message::Ephemeral { message } | Message::ViewOnce { message } => message.normalized(),
            other => other,
        }
    }

    pub fn stanza_type(&self) -> &'static str {
        let message = self.normalized();
        if matches!(message, Message::Reaction { .. }) {
            "reaction"
        } else if message.media_type().is_some() {
            "media"
        } else {
            "text"
        }
    }

    pub fn media_type(&self) -> Option<&'static str> {
        match self.normalized() {
            Message::Image(_) => Some("image"),
            Message::Video { gif_playback, .. } => Some(if *gif_playback { "gif" } else { "video" }),
            Message::Audio { ptt, .. } => Some(if *ptt { "ptt" } else { "audio" }),
            Message::Contact { .. } => Some("vcard"),
            Message::Document(_) => Some("document"),
            Message::ContactsArray { .. } => Some("contact_array"),
            Message::LiveLocation { .. } => Some("livelocation"),
            Message::Sticker(_) => Some("sticker"),
            Message::List { .. } => Some("list"),
            Message::ListResponse { .. } => Some("list_response"),
            Message::ButtonsResponse { .. } => Some("buttons_response"),
            Message::Order { .. } => Some("order"),
            Message::Product { .. } => Some("product"),
            Message::InteractiveResponse { .. } => Some("native_flow_response"),
            Message::GroupInvite { .. } => Some("url"),
            Message::ExtendedText { text, .. } if is_product_link(text) => Some("productlink"),
            _ => None,
        }
    }

    pub fn button_type(&self) -> Option<&str> {
        match self.normalized() {
            Message::List { .. } => Some("list"),
            Message::Buttons { .. } => Some("buttons"),
            Message::Interactive {
                native_flow: Some(buttons),
                ..
            } => match buttons.first().map(|b| b.name.as_str()) {
                Some(
                    name @ ("review_and_pay" | "review_order" | "payment_info"
                    | "payment_status" | "payment_method"),
                ) => Some(name),
                _ => Some("interactive"),
            },
            _ => None,
        }
    }

    /// Receivers should not surface a decryption failure for these.
    pub fn hides_decrypt_failure(&self) -> bool {
        matches!(
            self.normalized(),
            Message::PinInChat { .. }
                | Message::KeepInChat { .. }
                | Message::Reaction { .. }
                | Message::Protocol(ProtocolMessage::Edit { .. })
        )
    }

    pub fn native_flow_name(&self) -> Option<&str> {
        match self.normalized() {
            Message::InteractiveResponse {
                native_flow_name: Some(name),
                ..
            } => Some(name),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CoreError> {
        serde_json::to_vec(self).map_err(|_| CoreError::Crypto)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CoreError> {
        serde_json::from_slice(bytes).map_err(|_| CoreError::Crypto)
    }
}

/// Plaintext body for channel posts. `None` is an empty (revoked) post.
pub fn encode_newsletter(message: Option<&Message>) -> Result<Vec<u8>, CoreError> {
    serde_json::to_vec(&NewsletterPlaintext { message }).map_err(|_| CoreError::Crypto)
}

// https://wa.me/p/<digits>/<digits>
fn is_product_link(text: &str) -> bool {
    const PREFIX: &str = "https://wa.me/p/";
    text.match_indices(PREFIX).any(|(idx, _)| {
        let rest = &text[idx + PREFIX.len()..];
        let first = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if first == 0 || !rest[first..].starts_with('/') {
            return false;
        }
        rest[first + 1..]
            .chars()
            .next()
            .map(|c| c.is_ascii_digit())
            .unwrap_or(false)
    })
}
