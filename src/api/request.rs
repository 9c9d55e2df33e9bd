use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::api::types::{from_payload, Message, Role};
use crate::error::{Error, Result};
use crate::history::ConversationHandle;
use crate::utils::encode_bytes;

/// Model parameters. Unset fields are omitted from the request.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Options {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_predict: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat_last_n: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirostat: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirostat_tau: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirostat_eta: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_ctx: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_keep: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub typical_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub penalize_newline: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub numa: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_batch: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_gpu: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_gpu: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub low_vram: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vocab_only: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_mmap: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_mlock: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_thread: Option<u32>,
    /// Parameters without a typed field.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn temperature(mut self, value: f32) -> Self {
        self.temperature = Some(value);
        self
    }

    pub fn top_p(mut self, value: f32) -> Self {
        self.top_p = Some(value);
        self
    }

    pub fn num_ctx(mut self, value: u32) -> Self {
        self.num_ctx = Some(value);
        self
    }

    pub fn seed(mut self, value: i64) -> Self {
        self.seed = Some(value);
        self
    }

    pub fn stop(mut self, value: Vec<String>) -> Self {
        self.stop = Some(value);
        self
    }

    pub fn set(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(name.into(), value.into());
        self
    }
}

/// An image given either as a file path or as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

impl ImageSource {
    pub fn encode(&self) -> Result<String> {
        match self {
            ImageSource::Path(path) => Ok(encode_bytes(&std::fs::read(path)?)),
            ImageSource::Bytes(data) => Ok(encode_bytes(data)),
        }
    }

    pub async fn encode_async(&self) -> Result<String> {
        match self {
            ImageSource::Path(path) => Ok(encode_bytes(&tokio::fs::read(path).await?)),
            ImageSource::Bytes(data) => Ok(encode_bytes(data)),
        }
    }
}

impl From<PathBuf> for ImageSource {
    fn from(path: PathBuf) -> Self {
        ImageSource::Path(path)
    }
}

impl From<&Path> for ImageSource {
    fn from(path: &Path) -> Self {
        ImageSource::Path(path.to_path_buf())
    }
}

impl From<&str> for ImageSource {
    fn from(path: &str) -> Self {
        ImageSource::Path(PathBuf::from(path))
    }
}

impl From<Vec<u8>> for ImageSource {
    fn from(data: Vec<u8>) -> Self {
        ImageSource::Bytes(data)
    }
}

pub(crate) fn encode_images(images: &[ImageSource]) -> Result<Vec<String>> {
    images.iter().map(ImageSource::encode).collect()
}

pub(crate) async fn encode_images_async(images: &[ImageSource]) -> Result<Vec<String>> {
    let mut encoded = Vec::with_capacity(images.len());
    for image in images {
        encoded.push(image.encode_async().await?);
    }
    Ok(encoded)
}

/// A chat message as supplied by the caller, either already typed or as a
/// raw JSON object.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageInput {
    Raw(Value),
    Typed(Message),
}

impl MessageInput {
    pub fn resolve(self) -> Result<Message> {
        match self {
            MessageInput::Typed(message) => Ok(message),
            MessageInput::Raw(value) => {
                let object = value
                    .as_object()
                    .ok_or_else(|| Error::InvalidInput("message must be a JSON object".into()))?;
                for field in ["role", "content"] {
                    if !object.contains_key(field) {
                        return Err(Error::InvalidInput(format!(
                            "message missing required '{}' field",
                            field
                        )));
                    }
                }
                from_payload(value).map_err(|e| Error::InvalidInput(e.to_string()))
            }
        }
    }
}

impl From<Message> for MessageInput {
    fn from(message: Message) -> Self {
        MessageInput::Typed(message)
    }
}

impl From<Value> for MessageInput {
    fn from(value: Value) -> Self {
        MessageInput::Raw(value)
    }
}

impl From<Map<String, Value>> for MessageInput {
    fn from(map: Map<String, Value>) -> Self {
        MessageInput::Raw(Value::Object(map))
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Options>,
    pub raw: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_alive: Option<String>,
    #[serde(skip)]
    pub images: Vec<ImageSource>,
    #[serde(rename = "images", skip_serializing_if = "Vec::is_empty")]
    pub(crate) encoded_images: Vec<String>,
    pub(crate) stream: bool,
}

impl GenerateRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = Some(suffix.into());
        self
    }

    /// `"json"` or a JSON schema.
    pub fn format(mut self, format: impl Into<Value>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn options(mut self, options: Options) -> Self {
        self.options = Some(options);
        self
    }

    pub fn raw(mut self, raw: bool) -> Self {
        self.raw = raw;
        self
    }

    pub fn keep_alive(mut self, keep_alive: impl Into<String>) -> Self {
        self.keep_alive = Some(keep_alive.into());
        self
    }

    pub fn image(mut self, image: impl Into<ImageSource>) -> Self {
        self.images.push(image.into());
        self
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Options>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_alive: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    /// Prepended as a system message when sent.
    #[serde(skip)]
    pub system: Option<String>,
    /// Attached to the last user message when sent.
    #[serde(skip)]
    pub images: Vec<ImageSource>,
    #[serde(skip)]
    pub conversation: Option<ConversationHandle>,
    pub(crate) stream: bool,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            ..Default::default()
        }
    }

    /// Accepts typed messages and raw JSON objects alike.
    pub fn from_inputs<I, M>(model: impl Into<String>, inputs: I) -> Result<Self>
    where
        I: IntoIterator<Item = M>,
        M: Into<MessageInput>,
    {
        let messages = inputs
            .into_iter()
            .map(|input| input.into().resolve())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(model, messages))
    }

    /// Records this exchange in the history kept for `handle`.
    pub fn in_conversation(mut self, handle: ConversationHandle) -> Self {
        self.conversation = Some(handle);
        self
    }

    pub fn system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn format(mut self, format: impl Into<Value>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn options(mut self, options: Options) -> Self {
        self.options = Some(options);
        self
    }

    pub fn keep_alive(mut self, keep_alive: impl Into<String>) -> Self {
        self.keep_alive = Some(keep_alive.into());
        self
    }

    pub fn tools(mut self, tools: Vec<Value>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn image(mut self, image: impl Into<ImageSource>) -> Self {
        self.images.push(image.into());
        self
    }

    /// Applies the system prompt and encoded images to the message list.
    pub(crate) fn prepare_messages(&mut self, images: Vec<String>) {
        if let Some(system) = self.system.take() {
            self.messages.insert(0, Message::system(system));
        }
        if images.is_empty() {
            return;
        }
        if let Some(last_user) = self.messages.iter_mut().rev().find(|m| m.role == Role::User) {
            last_user.images = Some(images);
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CreateRequest {
    pub model: String,
    #[serde(rename = "from", skip_serializing_if = "Option::is_none")]
    pub from_model: Option<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub files: HashMap<String, String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub adapters: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub license: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantize: Option<String>,
    pub(crate) stream: bool,
}

impl CreateRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn from_model(mut self, from: impl Into<String>) -> Self {
        self.from_model = Some(from.into());
        self
    }

    /// Maps a file name to the digest of an uploaded blob.
    pub fn file(mut self, name: impl Into<String>, digest: impl Into<String>) -> Self {
        self.files.insert(name.into(), digest.into());
        self
    }

    pub fn adapter(mut self, name: impl Into<String>, digest: impl Into<String>) -> Self {
        self.adapters.insert(name.into(), digest.into());
        self
    }

    pub fn template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn license(mut self, license: impl Into<String>) -> Self {
        self.license.push(license.into());
        self
    }

    pub fn system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    pub fn quantize(mut self, quantize: impl Into<String>) -> Self {
        self.quantize = Some(quantize.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EmbedInput {
    Single(String),
    Batch(Vec<String>),
}

impl From<&str> for EmbedInput {
    fn from(text: &str) -> Self {
        EmbedInput::Single(text.to_string())
    }
}

impl From<String> for EmbedInput {
    fn from(text: String) -> Self {
        EmbedInput::Single(text)
    }
}

impl From<Vec<String>> for EmbedInput {
    fn from(texts: Vec<String>) -> Self {
        EmbedInput::Batch(texts)
    }
}

impl From<Vec<&str>> for EmbedInput {
    fn from(texts: Vec<&str>) -> Self {
        EmbedInput::Batch(texts.into_iter().map(String::from).collect())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedRequest {
    pub model: String,
    pub input: EmbedInput,
    pub truncate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Options>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_alive: Option<String>,
}

impl EmbedRequest {
    pub fn new(model: impl Into<String>, input: impl Into<EmbedInput>) -> Self {
        Self {
            model: model.into(),
            input: input.into(),
            truncate: true,
            options: None,
            keep_alive: None,
        }
    }

    pub fn truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }

    pub fn options(mut self, options: Options) -> Self {
        self.options = Some(options);
        self
    }

    pub fn keep_alive(mut self, keep_alive: impl Into<String>) -> Self {
        self.keep_alive = Some(keep_alive.into());
        self
    }
}

#[derive(Serialize)]
pub(crate) struct ShowBody<'a> {
    pub model: &'a str,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub verbose: bool,
}

#[derive(Serialize)]
pub(crate) struct CopyBody<'a> {
    pub source: &'a str,
    pub destination: &'a str,
}

#[derive(Serialize)]
pub(crate) struct DeleteBody<'a> {
    pub model: &'a str,
}

/// Body of pull and push.
#[derive(Serialize)]
pub(crate) struct TransferBody<'a> {
    pub model: &'a str,
    pub insecure: bool,
    pub stream: bool,
}
