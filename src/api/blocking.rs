//! Blocking dispatcher. All calls run on the caller's thread over one
//! long-lived connection pool owned by the [`Client`].

use std::io::BufReader;
use std::marker::PhantomData;
use std::path::Path;
use std::time::Duration;

use reqwest::blocking::multipart::Form;
use reqwest::blocking::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::api::client::{file_name, report};
use crate::api::request::{encode_images, CopyBody, DeleteBody, ShowBody, TransferBody};
use crate::api::types::{
    from_payload, BlobStatus, ChatResponse, EmbedResponse, GenerateResponse, Message, ModelInfo,
    ModelList, ProgressResponse, RunningModel, ShowResponse, StreamFrame, VersionResponse,
};
use crate::api::{
    decode_payload, endpoint_url, prepare_chat, prepare_create, prepare_generate, status_error,
    to_body, ChatRequest, ClientBuilder, CreateRequest, EmbedRequest, Endpoint, GenerateRequest,
    PreparedChat, Settings,
};
use crate::error::{Error, Result};
use crate::history::{ConversationHandle, ConversationKey, ConversationStore, Transcript};
use crate::stream::JsonLines;

enum State {
    Failed(Error),
    Open(JsonLines<BufReader<Response>>),
    Finished,
}

/// Typed frames of one streamed response. Reading blocks at each line;
/// dropping the iterator closes the connection.
pub struct Frames<T> {
    state: State,
    endpoint: Endpoint,
    terminal: bool,
    _frame: PhantomData<fn() -> T>,
}

impl<T> Frames<T> {
    fn new(endpoint: Endpoint, opened: Result<Response>, settings: &Settings) -> Self {
        let state = match opened {
            Ok(response) => State::Open(JsonLines::new(
                BufReader::new(response),
                settings.observer.clone(),
            )),
            Err(e) => State::Failed(e),
        };
        Self {
            state,
            endpoint,
            terminal: false,
            _frame: PhantomData,
        }
    }

    /// True once the frame marking the end of the operation was read.
    /// Exhaustion without it means the exchange was interrupted.
    pub fn is_complete(&self) -> bool {
        self.terminal
    }
}

impl<T> Iterator for Frames<T>
where
    T: DeserializeOwned + StreamFrame,
{
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        match std::mem::replace(&mut self.state, State::Finished) {
            State::Finished => None,
            State::Failed(e) => Some(Err(e)),
            State::Open(mut lines) => match lines.next() {
                Some(item) => {
                    let item = item.and_then(from_payload::<T>);
                    if let Ok(frame) = &item {
                        self.terminal = self.terminal || frame.is_terminal();
                    }
                    self.state = State::Open(lines);
                    Some(item)
                }
                None => {
                    if !self.terminal {
                        warn!("{} stream ended before its final frame", self.endpoint.path());
                    }
                    None
                }
            },
        }
    }
}

/// Chat frames that record the assistant turn on the final frame.
pub struct ChatFrames {
    frames: Frames<ChatResponse>,
    transcript: Option<Transcript>,
}

impl ChatFrames {
    pub fn is_complete(&self) -> bool {
        self.frames.is_complete()
    }
}

impl Iterator for ChatFrames {
    type Item = Result<ChatResponse>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.frames.next()?;
        if let (Ok(frame), Some(transcript)) = (&item, self.transcript.as_mut()) {
            transcript.observe(frame);
        }
        Some(item)
    }
}

#[derive(Clone)]
pub struct Client {
    api_base: String,
    http: reqwest::blocking::Client,
    settings: Settings,
}

impl Client {
    pub(crate) fn new(api_base: String, settings: Settings) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .connect_timeout(settings.timeout)
            .timeout(None::<Duration>)
            .build()
            .map_err(|e| Error::Unexpected(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            api_base,
            http,
            settings,
        })
    }

    pub fn from_env() -> Result<Self> {
        ClientBuilder::from_env().build_blocking()
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    fn request(&self, endpoint: Endpoint, digest: Option<&str>, stream: bool) -> RequestBuilder {
        let url = endpoint_url(&self.api_base, endpoint, digest);
        debug!("{} {} (stream: {})", endpoint.method(), url, stream);

        let builder = self.http.request(endpoint.method(), url);
        if stream {
            builder
        } else {
            builder.timeout(self.settings.timeout)
        }
    }

    fn execute(builder: RequestBuilder) -> Result<Response> {
        let response = builder.send()?;
        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            let text = response.text().unwrap_or_default();
            return Err(status_error(status, &text));
        }
        Ok(response)
    }

    fn call(&self, endpoint: Endpoint, digest: Option<&str>, body: Option<Value>) -> Result<Value> {
        let mut builder = self.request(endpoint, digest, false);
        if let Some(body) = body {
            builder = builder.json(&body);
        }

        let response = Self::execute(builder)?;
        let status = response.status();
        let text = response.text()?;
        decode_payload(status, &text)
    }

    fn call_typed<T: DeserializeOwned>(&self, endpoint: Endpoint, body: Option<Value>) -> Result<T> {
        from_payload(self.call(endpoint, None, body)?)
    }

    fn stream_endpoint<T>(&self, endpoint: Endpoint, body: Result<Value>) -> Frames<T> {
        let opened = body.and_then(|body| Self::execute(self.request(endpoint, None, true).json(&body)));
        Frames::new(endpoint, opened, &self.settings)
    }

    fn chat_body(&self, request: ChatRequest, stream: bool) -> Result<PreparedChat> {
        let images = encode_images(&request.images)?;
        prepare_chat(request, images, &self.settings.conversations, stream)
    }

    fn generate_body(&self, request: GenerateRequest, stream: bool) -> Result<Value> {
        let images = encode_images(&request.images)?;
        prepare_generate(request, images, stream)
    }

    pub fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse> {
        let body = self.generate_body(request, false)?;
        self.call_typed(Endpoint::Generate, Some(body))
    }

    pub fn generate_stream(&self, request: GenerateRequest) -> Frames<GenerateResponse> {
        self.stream_endpoint(Endpoint::Generate, self.generate_body(request, true))
    }

    pub fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        let PreparedChat { body, transcript } = self.chat_body(request, false)?;
        let response: ChatResponse = self.call_typed(Endpoint::Chat, Some(body))?;
        if let Some(mut transcript) = transcript {
            transcript.commit_response(&response);
        }
        Ok(response)
    }

    pub fn chat_stream(&self, request: ChatRequest) -> ChatFrames {
        match self.chat_body(request, true) {
            Ok(PreparedChat { body, transcript }) => ChatFrames {
                frames: self.stream_endpoint(Endpoint::Chat, Ok(body)),
                transcript,
            },
            Err(e) => ChatFrames {
                frames: Frames::new(Endpoint::Chat, Err(e), &self.settings),
                transcript: None,
            },
        }
    }

    pub fn create(&self, request: CreateRequest) -> Result<ProgressResponse> {
        let body = prepare_create(request, false)?;
        self.call_typed(Endpoint::Create, Some(body))
    }

    pub fn create_stream(&self, request: CreateRequest) -> Frames<ProgressResponse> {
        self.stream_endpoint(Endpoint::Create, prepare_create(request, true))
    }

    pub fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let list: ModelList<ModelInfo> = self.call_typed(Endpoint::ListModels, None)?;
        Ok(list.models)
    }

    pub fn show(&self, model: &str, verbose: bool) -> Result<ShowResponse> {
        let body = to_body(&ShowBody { model, verbose })?;
        self.call_typed(Endpoint::Show, Some(body))
    }

    pub fn try_copy(&self, source: &str, destination: &str) -> Result<()> {
        let body = to_body(&CopyBody { source, destination })?;
        self.call(Endpoint::Copy, None, Some(body)).map(|_| ())
    }

    pub fn copy(&self, source: &str, destination: &str) -> bool {
        report("copy", self.try_copy(source, destination))
    }

    pub fn try_delete(&self, model: &str) -> Result<()> {
        let body = to_body(&DeleteBody { model })?;
        self.call(Endpoint::Delete, None, Some(body)).map(|_| ())
    }

    pub fn delete(&self, model: &str) -> bool {
        report("delete", self.try_delete(model))
    }

    pub fn pull(&self, model: &str, insecure: bool) -> Result<ProgressResponse> {
        self.transfer(Endpoint::Pull, model, insecure)
    }

    pub fn pull_stream(&self, model: &str, insecure: bool) -> Frames<ProgressResponse> {
        self.transfer_stream(Endpoint::Pull, model, insecure)
    }

    pub fn push(&self, model: &str, insecure: bool) -> Result<ProgressResponse> {
        self.transfer(Endpoint::Push, model, insecure)
    }

    pub fn push_stream(&self, model: &str, insecure: bool) -> Frames<ProgressResponse> {
        self.transfer_stream(Endpoint::Push, model, insecure)
    }

    fn transfer(&self, endpoint: Endpoint, model: &str, insecure: bool) -> Result<ProgressResponse> {
        let body = to_body(&TransferBody {
            model,
            insecure,
            stream: false,
        })?;
        self.call_typed(endpoint, Some(body))
    }

    fn transfer_stream(&self, endpoint: Endpoint, model: &str, insecure: bool) -> Frames<ProgressResponse> {
        let body = to_body(&TransferBody {
            model,
            insecure,
            stream: true,
        });
        self.stream_endpoint(endpoint, body)
    }

    pub fn embed(&self, request: EmbedRequest) -> Result<EmbedResponse> {
        let body = to_body(&request)?;
        self.call_typed(Endpoint::Embed, Some(body))
    }

    pub fn list_running_models(&self) -> Result<Vec<RunningModel>> {
        let list: ModelList<RunningModel> = self.call_typed(Endpoint::ListRunning, None)?;
        Ok(list.models)
    }

    pub fn version(&self) -> Result<VersionResponse> {
        self.call_typed(Endpoint::Version, None)
    }

    pub fn try_blob_exists(&self, digest: &str) -> Result<()> {
        self.call(Endpoint::BlobExists, Some(digest), None).map(|_| ())
    }

    pub fn blob_exists(&self, digest: &str) -> bool {
        report("blob check", self.try_blob_exists(digest))
    }

    pub fn push_blob(&self, path: impl AsRef<Path>, digest: &str) -> BlobStatus {
        match self.try_push_blob(path.as_ref(), digest) {
            Ok(()) => BlobStatus::ok(),
            Err(e) => {
                warn!("Blob upload of {} failed: {}", digest, e);
                BlobStatus::failed(e.to_string())
            }
        }
    }

    fn try_push_blob(&self, path: &Path, digest: &str) -> Result<()> {
        let form = Form::new().file("file", path)?;
        debug!("Uploading {} as {}", file_name(path), digest);
        let builder = self.request(Endpoint::PushBlob, Some(digest), false).multipart(form);
        Self::execute(builder).map(|_| ())
    }

    pub fn conversations(&self) -> &std::sync::Arc<ConversationStore> {
        &self.settings.conversations
    }

    pub fn conversation_history(&self, model: &str, handle: ConversationHandle) -> Vec<Message> {
        self.settings
            .conversations
            .history(&ConversationKey::new(model, handle))
    }

    pub fn clear_conversation_history(&self, model: &str, handle: ConversationHandle) -> bool {
        self.settings
            .conversations
            .clear(&ConversationKey::new(model, handle))
    }
}
