//! HTTP surface of the Ollama API.
//!
//! [`Client`] is the async dispatcher, [`blocking::Client`] the blocking
//! one. Both are built from a [`ClientBuilder`] and share the endpoint
//! table, body preparation and status handling defined here.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::envconfig::EnvConfig;
use crate::error::{Error, Result};
use crate::history::{ConversationKey, ConversationStore, Transcript};
use crate::stream::{Observer, StreamHandler};

pub mod blocking;
pub mod client;
pub mod request;
pub mod types;

pub use client::{Client, ResponseStream};
pub use request::{
    ChatRequest, CreateRequest, EmbedInput, EmbedRequest, GenerateRequest, ImageSource,
    MessageInput, Options,
};
pub use types::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Generate,
    Chat,
    Create,
    ListModels,
    Show,
    Copy,
    Delete,
    Pull,
    Push,
    Embed,
    ListRunning,
    Version,
    BlobExists,
    PushBlob,
}

impl Endpoint {
    pub fn method(&self) -> Method {
        match self {
            Endpoint::ListModels | Endpoint::ListRunning | Endpoint::Version => Method::GET,
            Endpoint::Delete => Method::DELETE,
            Endpoint::BlobExists => Method::HEAD,
            _ => Method::POST,
        }
    }

    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::Generate => "generate",
            Endpoint::Chat => "chat",
            Endpoint::Create => "create",
            Endpoint::ListModels => "tags",
            Endpoint::Show => "show",
            Endpoint::Copy => "copy",
            Endpoint::Delete => "delete",
            Endpoint::Pull => "pull",
            Endpoint::Push => "push",
            Endpoint::Embed => "embed",
            Endpoint::ListRunning => "ps",
            Endpoint::Version => "version",
            Endpoint::BlobExists | Endpoint::PushBlob => "blobs",
        }
    }

    /// Whether the endpoint can answer with an NDJSON stream.
    pub fn streams(&self) -> bool {
        matches!(
            self,
            Endpoint::Generate | Endpoint::Chat | Endpoint::Create | Endpoint::Pull | Endpoint::Push
        )
    }
}

pub(crate) fn endpoint_url(api_base: &str, endpoint: Endpoint, digest: Option<&str>) -> String {
    match digest {
        Some(digest) => format!("{}/{}/{}", api_base, endpoint.path(), digest),
        None => format!("{}/{}", api_base, endpoint.path()),
    }
}

/// Classifies a status >= 400. The message is the server's `error` field
/// when the body carries one.
pub(crate) fn status_error(status: StatusCode, body: &str) -> Error {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(String::from))
        .unwrap_or_else(|| status.to_string());

    warn!("Request failed with status {}: {}", status, message);

    if status == StatusCode::NOT_FOUND {
        Error::ModelNotFound(message)
    } else {
        Error::Request {
            status: status.as_u16(),
            message,
        }
    }
}

/// Decodes a successful buffered body. Created/no-content answers and
/// empty bodies decode as an empty object.
pub(crate) fn decode_payload(status: StatusCode, text: &str) -> Result<Value> {
    if status == StatusCode::CREATED || status == StatusCode::NO_CONTENT || text.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    serde_json::from_str(text).map_err(|e| Error::Decode(format!("invalid JSON body: {}", e)))
}

pub(crate) fn to_body<T: Serialize>(body: &T) -> Result<Value> {
    serde_json::to_value(body).map_err(|e| Error::Unexpected(format!("failed to encode request: {}", e)))
}

pub(crate) struct PreparedChat {
    pub body: Value,
    pub transcript: Option<Transcript>,
}

/// Applies system prompt and images, records the outgoing messages in the
/// conversation (when the request names one) and encodes the body.
pub(crate) fn prepare_chat(
    mut request: ChatRequest,
    images: Vec<String>,
    store: &Arc<ConversationStore>,
    stream: bool,
) -> Result<PreparedChat> {
    request.stream = stream;
    request.prepare_messages(images);

    let transcript = request.conversation.map(|handle| {
        let key = ConversationKey::new(request.model.as_str(), handle);
        store.merge(&key, &request.messages);
        Transcript::new(Arc::clone(store), key)
    });

    Ok(PreparedChat {
        body: to_body(&request)?,
        transcript,
    })
}

pub(crate) fn prepare_generate(mut request: GenerateRequest, images: Vec<String>, stream: bool) -> Result<Value> {
    request.stream = stream;
    request.encoded_images = images;
    to_body(&request)
}

pub(crate) fn prepare_create(mut request: CreateRequest, stream: bool) -> Result<Value> {
    request.stream = stream;
    to_body(&request)
}

/// Configures and builds either dispatcher.
#[derive(Clone, Default)]
pub struct ClientBuilder {
    config: EnvConfig,
    conversations: Option<Arc<ConversationStore>>,
    observer: Option<Observer>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_env() -> Self {
        Self {
            config: EnvConfig::from_env(),
            ..Default::default()
        }
    }

    pub fn config(mut self, config: EnvConfig) -> Self {
        self.config = config;
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Shares a history store between clients. Each client gets its own
    /// store otherwise.
    pub fn conversations(mut self, store: Arc<ConversationStore>) -> Self {
        self.conversations = Some(store);
        self
    }

    /// Receives every decoded stream frame.
    pub fn stream_handler<H>(mut self, handler: H) -> Self
    where
        H: StreamHandler + 'static,
    {
        self.observer = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> Result<Client> {
        let (api_base, settings) = self.into_settings()?;
        Ok(Client::new(api_base, settings))
    }

    pub fn build_blocking(self) -> Result<blocking::Client> {
        let (api_base, settings) = self.into_settings()?;
        blocking::Client::new(api_base, settings)
    }

    fn into_settings(self) -> Result<(String, Settings)> {
        let api_base = self.config.api_base()?;
        Ok((
            api_base,
            Settings {
                timeout: self.config.timeout,
                conversations: self.conversations.unwrap_or_default(),
                observer: self.observer,
            },
        ))
    }
}

/// What both dispatchers carry besides their transport.
#[derive(Clone)]
pub(crate) struct Settings {
    pub timeout: Duration,
    pub conversations: Arc<ConversationStore>,
    pub observer: Option<Observer>,
}
