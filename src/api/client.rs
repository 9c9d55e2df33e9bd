use std::path::Path;

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::api::request::{encode_images_async, CopyBody, DeleteBody, ShowBody, TransferBody};
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
use crate::history::{ConversationHandle, ConversationKey, ConversationStore};
use crate::stream::json_stream;

/// Lazy sequence of decoded frames. Errors, including the ones raised while
/// opening the request, are yielded in order.
pub type ResponseStream<T> = BoxStream<'static, Result<T>>;

/// Async dispatcher.
///
/// Every call opens its own connection scope, released when the call
/// returns or, for streams, when the stream is dropped.
#[derive(Clone)]
pub struct Client {
    api_base: String,
    settings: Settings,
}

impl Client {
    pub(crate) fn new(api_base: String, settings: Settings) -> Self {
        Self { api_base, settings }
    }

    pub fn from_env() -> Result<Self> {
        ClientBuilder::from_env().build()
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    fn scope(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .connect_timeout(self.settings.timeout)
            .build()
            .map_err(|e| Error::Unexpected(format!("failed to build HTTP client: {}", e)))
    }

    fn request(
        &self,
        http: &reqwest::Client,
        endpoint: Endpoint,
        digest: Option<&str>,
        stream: bool,
    ) -> RequestBuilder {
        let url = endpoint_url(&self.api_base, endpoint, digest);
        debug!("{} {} (stream: {})", endpoint.method(), url, stream);

        let builder = http.request(endpoint.method(), url);
        if stream {
            builder
        } else {
            builder.timeout(self.settings.timeout)
        }
    }

    async fn execute(builder: RequestBuilder) -> Result<Response> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, &text));
        }
        Ok(response)
    }

    async fn call(&self, endpoint: Endpoint, digest: Option<&str>, body: Option<Value>) -> Result<Value> {
        let http = self.scope()?;
        let mut builder = self.request(&http, endpoint, digest, false);
        if let Some(body) = body {
            builder = builder.json(&body);
        }

        let response = Self::execute(builder).await?;
        let status = response.status();
        let text = response.text().await?;
        decode_payload(status, &text)
    }

    async fn call_typed<T: DeserializeOwned>(&self, endpoint: Endpoint, body: Option<Value>) -> Result<T> {
        from_payload(self.call(endpoint, None, body).await?)
    }

    /// Sends a streaming request. The scope travels with the response.
    async fn open_stream(&self, endpoint: Endpoint, body: Value) -> Result<(reqwest::Client, Response)> {
        let http = self.scope()?;
        let builder = self.request(&http, endpoint, None, true).json(&body);
        let response = Self::execute(builder).await?;
        Ok((http, response))
    }

    async fn stream_endpoint<T>(&self, endpoint: Endpoint, body: Result<Value>) -> ResponseStream<T>
    where
        T: DeserializeOwned + StreamFrame + Send + 'static,
    {
        let opened = match body {
            Ok(body) => self.open_stream(endpoint, body).await,
            Err(e) => Err(e),
        };
        self.frames(endpoint, opened)
    }

    fn frames<T>(&self, endpoint: Endpoint, opened: Result<(reqwest::Client, Response)>) -> ResponseStream<T>
    where
        T: DeserializeOwned + StreamFrame + Send + 'static,
    {
        let (scope, response) = match opened {
            Ok(opened) => opened,
            Err(e) => return failed(e),
        };
        let observer = self.settings.observer.clone();

        Box::pin(async_stream::stream! {
            let _scope = scope;
            let mut lines = Box::pin(json_stream(response.bytes_stream(), observer));
            let mut terminal = false;

            while let Some(item) = lines.next().await {
                let item = item.and_then(from_payload::<T>);
                if let Ok(frame) = &item {
                    terminal = terminal || frame.is_terminal();
                }
                yield item;
            }

            if !terminal {
                warn!("{} stream ended before its final frame", endpoint.path());
            }
        })
    }

    async fn chat_body(&self, request: ChatRequest, stream: bool) -> Result<PreparedChat> {
        let images = encode_images_async(&request.images).await?;
        prepare_chat(request, images, &self.settings.conversations, stream)
    }

    async fn generate_body(&self, request: GenerateRequest, stream: bool) -> Result<Value> {
        let images = encode_images_async(&request.images).await?;
        prepare_generate(request, images, stream)
    }

    pub async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse> {
        let body = self.generate_body(request, false).await?;
        self.call_typed(Endpoint::Generate, Some(body)).await
    }

    pub async fn generate_stream(&self, request: GenerateRequest) -> ResponseStream<GenerateResponse> {
        let body = self.generate_body(request, true).await;
        self.stream_endpoint(Endpoint::Generate, body).await
    }

    /// Buffered chat. A request opened with
    /// [`ChatRequest::in_conversation`] records both sides of the exchange.
    pub async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        let PreparedChat { body, transcript } = self.chat_body(request, false).await?;
        let response: ChatResponse = self.call_typed(Endpoint::Chat, Some(body)).await?;
        if let Some(mut transcript) = transcript {
            transcript.commit_response(&response);
        }
        Ok(response)
    }

    /// Streamed chat. The assistant turn is recorded once the final frame
    /// arrives; a stream that stops early records nothing.
    pub async fn chat_stream(&self, request: ChatRequest) -> ResponseStream<ChatResponse> {
        let PreparedChat { body, transcript } = match self.chat_body(request, true).await {
            Ok(prepared) => prepared,
            Err(e) => return failed(e),
        };
        let frames = self.stream_endpoint::<ChatResponse>(Endpoint::Chat, Ok(body)).await;

        let mut transcript = match transcript {
            Some(transcript) => transcript,
            None => return frames,
        };
        Box::pin(frames.map(move |item| {
            if let Ok(frame) = &item {
                transcript.observe(frame);
            }
            item
        }))
    }

    pub async fn create(&self, request: CreateRequest) -> Result<ProgressResponse> {
        let body = prepare_create(request, false)?;
        self.call_typed(Endpoint::Create, Some(body)).await
    }

    pub async fn create_stream(&self, request: CreateRequest) -> ResponseStream<ProgressResponse> {
        self.stream_endpoint(Endpoint::Create, prepare_create(request, true)).await
    }

    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let list: ModelList<ModelInfo> = self.call_typed(Endpoint::ListModels, None).await?;
        Ok(list.models)
    }

    pub async fn show(&self, model: &str, verbose: bool) -> Result<ShowResponse> {
        let body = to_body(&ShowBody { model, verbose })?;
        self.call_typed(Endpoint::Show, Some(body)).await
    }

    pub async fn try_copy(&self, source: &str, destination: &str) -> Result<()> {
        let body = to_body(&CopyBody { source, destination })?;
        self.call(Endpoint::Copy, None, Some(body)).await.map(|_| ())
    }

    pub async fn copy(&self, source: &str, destination: &str) -> bool {
        report("copy", self.try_copy(source, destination).await)
    }

    pub async fn try_delete(&self, model: &str) -> Result<()> {
        let body = to_body(&DeleteBody { model })?;
        self.call(Endpoint::Delete, None, Some(body)).await.map(|_| ())
    }

    pub async fn delete(&self, model: &str) -> bool {
        report("delete", self.try_delete(model).await)
    }

    pub async fn pull(&self, model: &str, insecure: bool) -> Result<ProgressResponse> {
        self.transfer(Endpoint::Pull, model, insecure).await
    }

    pub async fn pull_stream(&self, model: &str, insecure: bool) -> ResponseStream<ProgressResponse> {
        self.transfer_stream(Endpoint::Pull, model, insecure).await
    }

    pub async fn push(&self, model: &str, insecure: bool) -> Result<ProgressResponse> {
        self.transfer(Endpoint::Push, model, insecure).await
    }

    pub async fn push_stream(&self, model: &str, insecure: bool) -> ResponseStream<ProgressResponse> {
        self.transfer_stream(Endpoint::Push, model, insecure).await
    }

    async fn transfer(&self, endpoint: Endpoint, model: &str, insecure: bool) -> Result<ProgressResponse> {
        let body = to_body(&TransferBody {
            model,
            insecure,
            stream: false,
        })?;
        self.call_typed(endpoint, Some(body)).await
    }

    async fn transfer_stream(&self, endpoint: Endpoint, model: &str, insecure: bool) -> ResponseStream<ProgressResponse> {
        let body = to_body(&TransferBody {
            model,
            insecure,
            stream: true,
        });
        self.stream_endpoint(endpoint, body).await
    }

    pub async fn embed(&self, request: EmbedRequest) -> Result<EmbedResponse> {
        let body = to_body(&request)?;
        self.call_typed(Endpoint::Embed, Some(body)).await
    }

    pub async fn list_running_models(&self) -> Result<Vec<RunningModel>> {
        let list: ModelList<RunningModel> = self.call_typed(Endpoint::ListRunning, None).await?;
        Ok(list.models)
    }

    pub async fn version(&self) -> Result<VersionResponse> {
        self.call_typed(Endpoint::Version, None).await
    }

    pub async fn try_blob_exists(&self, digest: &str) -> Result<()> {
        self.call(Endpoint::BlobExists, Some(digest), None).await.map(|_| ())
    }

    pub async fn blob_exists(&self, digest: &str) -> bool {
        report("blob check", self.try_blob_exists(digest).await)
    }

    /// Uploads a file as a blob. Failures are reported in the returned
    /// status rather than raised.
    pub async fn push_blob(&self, path: impl AsRef<Path>, digest: &str) -> BlobStatus {
        match self.try_push_blob(path.as_ref(), digest).await {
            Ok(()) => BlobStatus::ok(),
            Err(e) => {
                warn!("Blob upload of {} failed: {}", digest, e);
                BlobStatus::failed(e.to_string())
            }
        }
    }

    async fn try_push_blob(&self, path: &Path, digest: &str) -> Result<()> {
        let file = tokio::fs::File::open(path).await?;
        let length = file.metadata().await?.len();
        let part = Part::stream_with_length(file, length).file_name(file_name(path));
        let form = Form::new().part("file", part);

        let http = self.scope()?;
        let builder = self.request(&http, Endpoint::PushBlob, Some(digest), false).multipart(form);
        Self::execute(builder).await.map(|_| ())
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

fn failed<T: Send + 'static>(err: Error) -> ResponseStream<T> {
    Box::pin(stream::iter(std::iter::once(Err(err))))
}

pub(crate) fn report(operation: &str, result: Result<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            debug!("{} failed: {}", operation, e);
            false
        }
    }
}

pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "blob".to_string())
}
