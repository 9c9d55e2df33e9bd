use std::fmt;

use chrono::{DateTime, FixedOffset};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::utils::{format_duration, TokenUsage};

/// Maps an untyped server payload onto a typed record. Missing optional
/// fields take their defaults; wrong types become [`Error::Decode`].
pub fn from_payload<T: DeserializeOwned>(payload: Value) -> Result<T> {
    serde_json::from_value(payload).map_err(|e| Error::Decode(e.to_string()))
}

/// Treats an explicit JSON `null` like a missing field.
fn nullable<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn is_empty_list<T>(value: &Option<Vec<T>>) -> bool {
    value.as_ref().map_or(true, Vec::is_empty)
}

fn parse_timestamp(value: Option<&str>) -> Option<DateTime<FixedOffset>> {
    value.and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
}

/// Terminal-frame detection for streamed records.
pub trait StreamFrame {
    fn is_terminal(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    #[default]
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, deserialize_with = "nullable")]
    pub role: Role,
    #[serde(default, deserialize_with = "nullable")]
    pub content: String,
    #[serde(default, skip_serializing_if = "is_empty_list")]
    pub images: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "is_empty_list")]
    pub tool_calls: Option<Vec<Value>>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            images: None,
            tool_calls: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(Role::Tool, content)
    }

    /// Attaches base64-encoded images.
    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = Some(images);
        self
    }
}

/// Performance counters shared by generate and chat responses. Durations
/// are in nanoseconds.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_eval_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_eval_duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_duration: Option<u64>,
}

impl Metrics {
    pub fn total_seconds(&self) -> Option<f64> {
        format_duration(self.total_duration)
    }

    pub fn load_seconds(&self) -> Option<f64> {
        format_duration(self.load_duration)
    }

    pub fn eval_seconds(&self) -> Option<f64> {
        format_duration(self.eval_duration)
    }

    pub fn token_usage(&self) -> TokenUsage {
        TokenUsage::new(
            self.prompt_eval_count.unwrap_or(0),
            self.eval_count.unwrap_or(0),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GenerateResponse {
    #[serde(default, deserialize_with = "nullable")]
    pub model: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub response: String,
    #[serde(default, deserialize_with = "nullable")]
    pub done: bool,
    #[serde(default)]
    pub done_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Vec<i64>>,
    #[serde(flatten)]
    pub metrics: Metrics,
}

impl StreamFrame for GenerateResponse {
    fn is_terminal(&self) -> bool {
        self.done
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChatResponse {
    #[serde(default, deserialize_with = "nullable")]
    pub model: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default, deserialize_with = "nullable")]
    pub done: bool,
    #[serde(default)]
    pub done_reason: Option<String>,
    #[serde(flatten)]
    pub metrics: Metrics,
}

impl ChatResponse {
    /// Text of the carried message, empty when there is none.
    pub fn content(&self) -> &str {
        self.message.as_ref().map_or("", |m| m.content.as_str())
    }
}

impl StreamFrame for ChatResponse {
    fn is_terminal(&self) -> bool {
        self.done
    }
}

#[derive(Deserialize)]
struct RawEmbedResponse {
    #[serde(default, deserialize_with = "nullable")]
    model: String,
    #[serde(default)]
    embeddings: Option<Vec<Vec<f64>>>,
    #[serde(default)]
    embedding: Option<Vec<f64>>,
    #[serde(default)]
    total_duration: Option<u64>,
    #[serde(default)]
    load_duration: Option<u64>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
}

/// Embeddings in the plural shape, whichever shape the server sent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "RawEmbedResponse")]
pub struct EmbedResponse {
    pub model: String,
    pub embeddings: Vec<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_duration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_duration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_eval_count: Option<u64>,
}

impl From<RawEmbedResponse> for EmbedResponse {
    fn from(raw: RawEmbedResponse) -> Self {
        let embeddings = match (raw.embeddings, raw.embedding) {
            (Some(many), _) if !many.is_empty() => many,
            (_, Some(single)) => vec![single],
            (many, None) => many.unwrap_or_default(),
        };

        Self {
            model: raw.model,
            embeddings,
            total_duration: raw.total_duration,
            load_duration: raw.load_duration,
            prompt_eval_count: raw.prompt_eval_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModelDetails {
    #[serde(default)]
    pub parent_model: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub family: Option<String>,
    #[serde(default)]
    pub families: Option<Vec<String>>,
    #[serde(default)]
    pub parameter_size: Option<String>,
    #[serde(default)]
    pub quantization_level: Option<String>,
}

/// One entry of the local model list.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModelInfo {
    #[serde(default, deserialize_with = "nullable")]
    pub name: String,
    #[serde(default, deserialize_with = "nullable")]
    pub model: String,
    #[serde(default, deserialize_with = "nullable")]
    pub modified_at: String,
    #[serde(default, deserialize_with = "nullable")]
    pub size: u64,
    #[serde(default, deserialize_with = "nullable")]
    pub digest: String,
    #[serde(default)]
    pub details: Option<ModelDetails>,
}

impl ModelInfo {
    pub fn modified_datetime(&self) -> Option<DateTime<FixedOffset>> {
        parse_timestamp(Some(self.modified_at.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunningModel {
    #[serde(default, deserialize_with = "nullable")]
    pub name: String,
    #[serde(default, deserialize_with = "nullable")]
    pub model: String,
    #[serde(default, deserialize_with = "nullable")]
    pub size: u64,
    #[serde(default, deserialize_with = "nullable")]
    pub digest: String,
    #[serde(default)]
    pub details: Option<ModelDetails>,
    #[serde(default)]
    pub expires_at: Option<String>,
    #[serde(default)]
    pub size_vram: Option<u64>,
}

impl RunningModel {
    pub fn expires_datetime(&self) -> Option<DateTime<FixedOffset>> {
        parse_timestamp(self.expires_at.as_deref())
    }
}

#[derive(Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub(crate) struct ModelList<T> {
    #[serde(default = "Vec::new", deserialize_with = "nullable")]
    pub models: Vec<T>,
}

/// Detailed information about one model, as returned by `/api/show`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ShowResponse {
    #[serde(default)]
    pub modelfile: Option<String>,
    #[serde(default)]
    pub parameters: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub details: Option<ModelDetails>,
    #[serde(default)]
    pub model_info: Option<Map<String, Value>>,
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,
    #[serde(default)]
    pub modified_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VersionResponse {
    #[serde(default, deserialize_with = "nullable")]
    pub version: String,
}

/// Status frame of create, pull and push.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProgressResponse {
    #[serde(default, deserialize_with = "nullable")]
    pub status: String,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub completed: Option<u64>,
}

impl ProgressResponse {
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

impl StreamFrame for ProgressResponse {
    fn is_terminal(&self) -> bool {
        self.is_success()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlobStatus {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl BlobStatus {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}
