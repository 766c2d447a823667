//! The message envelope.
//!
//! A [`Message`] is an immutable envelope created per send/receive event.
//! Sync requests carry a `sync_token` correlating them to their response;
//! responses copy that token, set the response flag, and use the fixed
//! topics [`TOPIC_SUCCESS`] / [`TOPIC_FAILURE`].

use serde::{Deserialize, Serialize};

/// Topic of a successful sync response.
pub const TOPIC_SUCCESS: &str = "success";
/// Topic of a failed sync response.
pub const TOPIC_FAILURE: &str = "failure";
/// Topic of a resolution request sent to the directory service.
pub const TOPIC_RESOLVE: &str = "resolve";
/// Topic of a resolution reply carrying a broker address.
pub const TOPIC_RESOLUTION: &str = "resolution";

/// Envelope construction and decode errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The byte stream did not parse as a serialized envelope.
    #[error("failed to decode message: {0}")]
    Decode(#[from] serde_json::Error),

    /// A response cannot be constructed from a message that is itself a
    /// response; each sync request receives at most one reply.
    #[error("cannot create a response to a response")]
    ResponseToResponse,
}

/// An immutable message envelope.
///
/// `origin` identifies the sending peer. It is set by the receiver from
/// connection identity during [`Message::deserialize`] and is excluded from
/// the serialized form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    topic: String,
    sync_token: String,
    response: bool,
    payload: String,
    origin: String,
}

/// On-wire shape of an envelope. Field names are part of the protocol.
#[derive(Serialize, Deserialize)]
struct MessageData {
    topic: String,
    #[serde(rename = "syncToken")]
    sync_token: String,
    #[serde(rename = "isResponse")]
    response: bool,
    payload: String,
}

impl Message {
    /// Create a pure async message. Carries no sync token and expects no
    /// reply.
    pub fn new_async(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            sync_token: String::new(),
            response: false,
            payload: payload.into(),
            origin: String::new(),
        }
    }

    /// Create a sync request carrying a correlation token.
    pub fn new_sync(
        topic: impl Into<String>,
        payload: impl Into<String>,
        sync_token: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            sync_token: sync_token.into(),
            response: false,
            payload: payload.into(),
            origin: String::new(),
        }
    }

    /// Dispatch key of this message.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Correlation token; empty for pure async messages.
    pub fn sync_token(&self) -> &str {
        &self.sync_token
    }

    /// Opaque payload.
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Identity of the sending peer, stamped locally by the receiver.
    /// Empty on messages this side constructed.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Whether this message was created as a reply to a sync request.
    pub fn is_response(&self) -> bool {
        self.response
    }

    /// Build the success reply to this sync request.
    ///
    /// # Errors
    ///
    /// Fails with [`ProtocolError::ResponseToResponse`] if this message is
    /// already a response.
    pub fn success_response(&self, payload: impl Into<String>) -> Result<Self, ProtocolError> {
        self.response_with_topic(TOPIC_SUCCESS, payload.into())
    }

    /// Build the failure reply to this sync request.
    ///
    /// # Errors
    ///
    /// Fails with [`ProtocolError::ResponseToResponse`] if this message is
    /// already a response.
    pub fn failure_response(&self, payload: impl Into<String>) -> Result<Self, ProtocolError> {
        self.response_with_topic(TOPIC_FAILURE, payload.into())
    }

    fn response_with_topic(&self, topic: &str, payload: String) -> Result<Self, ProtocolError> {
        if self.response {
            return Err(ProtocolError::ResponseToResponse);
        }
        Ok(Self {
            topic: topic.to_string(),
            sync_token: self.sync_token.clone(),
            response: true,
            payload,
            origin: String::new(),
        })
    }

    /// Serialize to the on-wire JSON form. `origin` is not included.
    ///
    /// # Errors
    ///
    /// Fails if the envelope cannot be encoded, which only happens on
    /// allocation failure inside the serializer.
    pub fn serialize(&self) -> Result<Vec<u8>, ProtocolError> {
        let data = MessageData {
            topic: self.topic.clone(),
            sync_token: self.sync_token.clone(),
            response: self.response,
            payload: self.payload.clone(),
        };
        Ok(serde_json::to_vec(&data)?)
    }

    /// Deserialize from the on-wire form, stamping `origin` from the
    /// transport-supplied peer identity.
    ///
    /// # Errors
    ///
    /// Fails with [`ProtocolError::Decode`] when the bytes do not parse as
    /// an envelope or a required field is absent.
    pub fn deserialize(bytes: &[u8], origin: impl Into<String>) -> Result<Self, ProtocolError> {
        let data: MessageData = serde_json::from_slice(bytes)?;
        Ok(Self {
            topic: data.topic,
            sync_token: data.sync_token,
            response: data.response,
            payload: data.payload,
            origin: origin.into(),
        })
    }
}

/// Serialize a batch of messages as a JSON array of envelopes.
///
/// # Errors
///
/// Propagates the first envelope that fails to encode.
pub fn serialize_messages(messages: &[Message]) -> Result<Vec<u8>, ProtocolError> {
    let data: Vec<MessageData> = messages
        .iter()
        .map(|message| MessageData {
            topic: message.topic.clone(),
            sync_token: message.sync_token.clone(),
            response: message.response,
            payload: message.payload.clone(),
        })
        .collect();
    Ok(serde_json::to_vec(&data)?)
}

/// Deserialize a batch of messages. Origins are left empty; batches are a
/// local convenience, not a transport-delimited unit.
///
/// # Errors
///
/// Fails with [`ProtocolError::Decode`] when the bytes do not parse as an
/// array of envelopes.
pub fn deserialize_messages(bytes: &[u8]) -> Result<Vec<Message>, ProtocolError> {
    let data: Vec<MessageData> = serde_json::from_slice(bytes)?;
    Ok(data
        .into_iter()
        .map(|data| Message {
            topic: data.topic,
            sync_token: data.sync_token,
            response: data.response,
            payload: data.payload,
            origin: String::new(),
        })
        .collect())
}
