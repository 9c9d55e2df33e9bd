use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, head, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::oneshot;

use ollama_client::{
    ChatRequest, Client, ClientBuilder, ConversationHandle, CreateRequest, EmbedRequest, ErrorKind,
    GenerateRequest, Message, Modelfile, Role,
};

const EMPTY_DIGEST: &str = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn ndjson(frames: &[Value]) -> Response {
    let mut body = String::new();
    for frame in frames {
        body.push_str(&frame.to_string());
        body.push('\n');
    }
    Response::builder()
        .header("Content-Type", "application/x-ndjson")
        .body(Body::from(body))
        .unwrap()
}

fn error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn streaming(body: &Value) -> bool {
    body["stream"].as_bool().unwrap_or(false)
}

async fn generate(Json(body): Json<Value>) -> Response {
    if streaming(&body) {
        let mut response = String::new();
        response.push_str("{\"model\":\"llama3.2\",\"response\":\"The sky\",\"done\":false}\n");
        response.push_str("XX\n");
        response.push_str("{\"model\":\"llama3.2\",\"response\":\" is blue.\",\"done\":false}\n");
        response.push_str("{\"model\":\"llama3.2\",\"response\":\"\",\"done\":true,\"done_reason\":\"stop\",\"eval_count\":2}\n");
        return Response::builder()
            .header("Content-Type", "application/x-ndjson")
            .body(Body::from(response))
            .unwrap();
    }
    Json(json!({
        "model": body["model"],
        "response": "The sky is blue.",
        "done": true,
        "total_duration": 1_000_000_000u64,
        "eval_count": 5,
    }))
    .into_response()
}

async fn chat(Json(body): Json<Value>) -> Response {
    let messages = body["messages"].as_array().cloned().unwrap_or_default();
    let last_user = messages.iter().rev().find(|m| m["role"] == "user");
    let images = last_user
        .and_then(|m| m["images"].as_array())
        .map_or(0, Vec::len);
    let reply = match last_user {
        Some(_) if images > 0 => format!("saw {} images", images),
        Some(m) => format!("echo: {}", m["content"].as_str().unwrap_or_default()),
        None => "nothing to say".to_string(),
    };

    if !streaming(&body) {
        return Json(json!({
            "model": body["model"],
            "message": {"role": "assistant", "content": reply},
            "done": true,
        }))
        .into_response();
    }

    let (head, tail) = reply.split_at(reply.len() / 2);
    let mut frames = vec![
        json!({"model": body["model"], "message": {"role": "assistant", "content": head}, "done": false}),
        json!({"model": body["model"], "message": {"role": "assistant", "content": tail}, "done": false}),
    ];
    if body["model"] != "interrupted" {
        frames.push(json!({"model": body["model"], "message": {"role": "assistant", "content": ""}, "done": true}));
    }
    ndjson(&frames)
}

async fn progress(Json(body): Json<Value>) -> Response {
    if !streaming(&body) {
        return Json(json!({"status": "success"})).into_response();
    }
    ndjson(&[
        json!({"status": "pulling manifest"}),
        json!({"status": "downloading", "digest": EMPTY_DIGEST, "total": 100, "completed": 50}),
        json!({"status": "success"}),
    ])
}

async fn show(Json(body): Json<Value>) -> Response {
    match body["model"].as_str() {
        Some("missing") => error(StatusCode::NOT_FOUND, "model 'missing' not found"),
        Some("broken") => error(StatusCode::INTERNAL_SERVER_ERROR, "internal failure"),
        _ => Json(json!({
            "modelfile": "FROM llama3.2",
            "template": "{{ .Prompt }}",
            "details": {"family": "llama", "parameter_size": "3.2B"},
            "capabilities": ["completion"],
        }))
        .into_response(),
    }
}

async fn copy(Json(body): Json<Value>) -> Response {
    if body["source"] == "missing" {
        return error(StatusCode::NOT_FOUND, "model 'missing' not found");
    }
    StatusCode::OK.into_response()
}

async fn remove(Json(body): Json<Value>) -> Response {
    if body["model"] == "missing" {
        return error(StatusCode::NOT_FOUND, "model 'missing' not found");
    }
    StatusCode::OK.into_response()
}

async fn tags() -> Json<Value> {
    Json(json!({"models": [{
        "name": "llama3.2:latest",
        "model": "llama3.2:latest",
        "modified_at": "2024-05-01T10:20:30Z",
        "size": 2019393189u64,
        "digest": "a80c4f17acd5",
        "details": {"family": "llama"}
    }]}))
}

async fn ps() -> Json<Value> {
    Json(json!({"models": [{
        "name": "llama3.2:latest",
        "size": 2019393189u64,
        "size_vram": 2019393189u64,
        "expires_at": "2024-05-01T10:25:30Z"
    }]}))
}

async fn version() -> Json<Value> {
    Json(json!({"version": "0.5.1"}))
}

async fn embed(Json(body): Json<Value>) -> Json<Value> {
    match body["input"].as_array() {
        Some(inputs) => Json(json!({
            "model": body["model"],
            "embeddings": inputs.iter().map(|_| json!([0.1, 0.2])).collect::<Vec<_>>(),
        })),
        None => Json(json!({"model": body["model"], "embedding": [0.1, 0.2]})),
    }
}

async fn head_blob(Path(digest): Path<String>) -> StatusCode {
    if digest == EMPTY_DIGEST {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn post_blob(headers: HeaderMap, body: Bytes) -> Response {
    let multipart = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("multipart/form-data"));
    let has_file = String::from_utf8_lossy(&body).contains("name=\"file\"");
    if multipart && has_file {
        StatusCode::CREATED.into_response()
    } else {
        error(StatusCode::BAD_REQUEST, "expected a multipart file")
    }
}

fn router() -> Router {
    Router::new()
        .route("/api/generate", post(generate))
        .route("/api/chat", post(chat))
        .route("/api/create", post(progress))
        .route("/api/pull", post(progress))
        .route("/api/push", post(progress))
        .route("/api/show", post(show))
        .route("/api/copy", post(copy))
        .route("/api/delete", delete(remove))
        .route("/api/tags", get(tags))
        .route("/api/ps", get(ps))
        .route("/api/version", get(version))
        .route("/api/embed", post(embed))
        .route("/api/blobs/:digest", head(head_blob).post(post_blob))
}

async fn spawn_server() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router()).await.unwrap();
    });
    addr
}

/// Signals when the response body is dropped, which happens once the
/// server notices the client went away.
struct Disconnect(Option<oneshot::Sender<()>>);

impl Drop for Disconnect {
    fn drop(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

type DisconnectSlot = Arc<Mutex<Option<oneshot::Sender<()>>>>;

/// Sends one partial chat frame, then stalls forever.
async fn endless_chat(State(slot): State<DisconnectSlot>, Json(body): Json<Value>) -> Response {
    let guard = Disconnect(slot.lock().unwrap().take());
    let line = format!(
        "{}\n",
        json!({"model": body["model"], "message": {"role": "assistant", "content": "one"}, "done": false})
    );
    let frames = futures::stream::unfold((guard, Some(line)), |(guard, line)| async move {
        match line {
            Some(line) => Some((Ok::<_, Infallible>(Bytes::from(line)), (guard, None))),
            None => {
                futures::future::pending::<()>().await;
                None
            }
        }
    });
    Response::builder()
        .header("Content-Type", "application/x-ndjson")
        .body(Body::from_stream(frames))
        .unwrap()
}

async fn spawn_endless_server() -> (SocketAddr, oneshot::Receiver<()>) {
    let (tx, rx) = oneshot::channel();
    let slot: DisconnectSlot = Arc::new(Mutex::new(Some(tx)));
    let app = Router::new()
        .route("/api/chat", post(endless_chat))
        .with_state(slot);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, rx)
}

/// Runs the mock on its own runtime so blocking clients can call it.
fn spawn_server_thread() -> SocketAddr {
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async move {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            tx.send(listener.local_addr().unwrap()).unwrap();
            axum::serve(listener, router()).await.unwrap();
        });
    });
    rx.recv().unwrap()
}

async fn async_client() -> Client {
    init_tracing();
    let addr = spawn_server().await;
    ClientBuilder::new().host(format!("http://{}", addr)).build().unwrap()
}

fn blocking_client() -> ollama_client::blocking::Client {
    init_tracing();
    let addr = spawn_server_thread();
    ClientBuilder::new()
        .host(format!("http://{}", addr))
        .build_blocking()
        .unwrap()
}

mod async_dispatch {
    use super::*;

    #[tokio::test]
    async fn test_generate_buffered_and_streamed() -> anyhow::Result<()> {
        let client = async_client().await;

        let response = client.generate(GenerateRequest::new("llama3.2", "Why is the sky blue?")).await?;
        assert!(response.done);
        assert_eq!(response.response, "The sky is blue.");
        assert_eq!(response.metrics.total_seconds(), Some(1.0));

        let frames: Vec<_> = client
            .generate_stream(GenerateRequest::new("llama3.2", "Why is the sky blue?"))
            .await
            .collect()
            .await;
        let frames = frames.into_iter().collect::<ollama_client::Result<Vec<_>>>()?;

        assert_eq!(frames.len(), 3);
        let text: String = frames.iter().map(|f| f.response.as_str()).collect();
        assert_eq!(text, response.response);
        assert!(frames[2].done);
        assert_eq!(frames[2].done_reason.as_deref(), Some("stop"));
        Ok(())
    }

    #[tokio::test]
    async fn test_chat_history_accumulates() -> anyhow::Result<()> {
        let client = async_client().await;
        let conversation = ConversationHandle::new();

        let first = client
            .chat(ChatRequest::new("llama3.2", vec![Message::user("hi")]).in_conversation(conversation))
            .await?;
        assert_eq!(first.content(), "echo: hi");

        let mut messages = client.conversation_history("llama3.2", conversation);
        messages.push(Message::user("again"));
        client
            .chat(ChatRequest::new("llama3.2", messages).in_conversation(conversation))
            .await?;

        let history = client.conversation_history("llama3.2", conversation);
        assert_eq!(history.len(), 4);
        assert_eq!(history[0], Message::user("hi"));
        assert_eq!(history[1], Message::assistant("echo: hi"));
        assert_eq!(history[3], Message::assistant("echo: again"));

        assert!(client.clear_conversation_history("llama3.2", conversation));
        assert!(client.conversation_history("llama3.2", conversation).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_chat_without_handle_is_untracked() -> anyhow::Result<()> {
        let client = async_client().await;
        client.chat(ChatRequest::new("llama3.2", vec![Message::user("hi")])).await?;
        assert!(client.conversations().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_streamed_chat_commits_on_final_frame() -> anyhow::Result<()> {
        let client = async_client().await;
        let conversation = ConversationHandle::new();

        let mut frames = client
            .chat_stream(ChatRequest::new("llama3.2", vec![Message::user("hello")]).in_conversation(conversation))
            .await;
        let mut text = String::new();
        while let Some(frame) = frames.next().await {
            let frame = frame?;
            text.push_str(frame.content());
            if !frame.done {
                assert_eq!(client.conversation_history("llama3.2", conversation).len(), 1);
            }
        }

        assert_eq!(text, "echo: hello");
        assert_eq!(
            client.conversation_history("llama3.2", conversation),
            vec![Message::user("hello"), Message::assistant("echo: hello")]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_interrupted_chat_commits_nothing() -> anyhow::Result<()> {
        let client = async_client().await;
        let conversation = ConversationHandle::new();

        let frames: Vec<_> = client
            .chat_stream(ChatRequest::new("interrupted", vec![Message::user("hello")]).in_conversation(conversation))
            .await
            .collect()
            .await;
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| matches!(f, Ok(frame) if !frame.done)));

        let history = client.conversation_history("interrupted", conversation);
        assert_eq!(history, vec![Message::user("hello")]);
        Ok(())
    }

    #[tokio::test]
    async fn test_dropped_stream_closes_connection() -> anyhow::Result<()> {
        init_tracing();
        let (addr, disconnected) = spawn_endless_server().await;
        let client = ClientBuilder::new().host(format!("http://{}", addr)).build()?;
        let conversation = ConversationHandle::new();

        let mut frames = client
            .chat_stream(ChatRequest::new("llama3.2", vec![Message::user("count")]).in_conversation(conversation))
            .await;
        let first = frames.next().await.unwrap()?;
        assert_eq!(first.content(), "one");
        assert!(!first.done);
        drop(frames);

        tokio::time::timeout(Duration::from_secs(5), disconnected).await??;
        assert_eq!(
            client.conversation_history("llama3.2", conversation),
            vec![Message::user("count")]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_chat_images_reach_last_user_message() -> anyhow::Result<()> {
        let client = async_client().await;
        let request = ChatRequest::new("llava", vec![Message::user("what is this?")])
            .image(b"\x89PNG".to_vec())
            .system("Describe images.");

        let response = client.chat(request).await?;
        assert_eq!(response.content(), "saw 1 images");
        Ok(())
    }

    #[tokio::test]
    async fn test_not_found_is_distinct_from_server_error() {
        let client = async_client().await;

        let missing = client.show("missing", false).await.unwrap_err();
        let broken = client.show("broken", false).await.unwrap_err();

        assert_eq!(missing.kind(), ErrorKind::ModelNotFound);
        assert_eq!(broken.kind(), ErrorKind::Request);
        assert_ne!(missing.kind(), broken.kind());
        assert!(broken.to_string().contains("internal failure"));

        let shown = client.show("llama3.2", true).await.unwrap();
        assert_eq!(shown.template.as_deref(), Some("{{ .Prompt }}"));
    }

    #[tokio::test]
    async fn test_model_management() -> anyhow::Result<()> {
        let client = async_client().await;

        assert!(client.copy("llama3.2", "llama3.2-backup").await);
        assert!(!client.copy("missing", "elsewhere").await);
        assert_eq!(
            client.try_copy("missing", "elsewhere").await.unwrap_err().kind(),
            ErrorKind::ModelNotFound
        );
        assert!(client.delete("llama3.2-backup").await);
        assert!(!client.delete("missing").await);

        let models = client.list_models().await?;
        assert_eq!(models.len(), 1);
        assert!(models[0].modified_datetime().is_some());

        let running = client.list_running_models().await?;
        assert_eq!(running[0].size_vram, Some(2019393189));
        assert!(running[0].expires_datetime().is_some());

        assert_eq!(client.version().await?.version, "0.5.1");
        Ok(())
    }

    #[tokio::test]
    async fn test_progress_streams() -> anyhow::Result<()> {
        let client = async_client().await;

        let frames: Vec<_> = client.pull_stream("llama3.2", false).await.collect().await;
        let frames = frames.into_iter().collect::<ollama_client::Result<Vec<_>>>()?;
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1].completed, Some(50));
        assert!(frames[2].is_success());

        assert!(client.push("me/llama3.2", true).await?.is_success());

        let request = Modelfile::from_model("llama3.2")
            .set_system("You are Mario.")
            .to_create_request("mario")?;
        assert!(client.create(request).await?.is_success());

        let frames: Vec<_> = client
            .create_stream(CreateRequest::new("mario").from_model("llama3.2"))
            .await
            .collect()
            .await;
        assert!(frames.last().unwrap().as_ref().unwrap().is_success());
        Ok(())
    }

    #[tokio::test]
    async fn test_embed_shapes() -> anyhow::Result<()> {
        let client = async_client().await;

        let single = client.embed(EmbedRequest::new("all-minilm", "hello")).await?;
        let batch = client.embed(EmbedRequest::new("all-minilm", vec!["a", "b"])).await?;

        assert_eq!(single.embeddings, vec![vec![0.1, 0.2]]);
        assert_eq!(batch.embeddings.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_blobs() -> anyhow::Result<()> {
        let client = async_client().await;
        let file = tempfile::NamedTempFile::new()?;
        std::fs::write(file.path(), b"weights")?;
        let digest = ollama_client::utils::calculate_sha256_async(file.path()).await?;

        assert!(client.blob_exists(EMPTY_DIGEST).await);
        assert!(!client.blob_exists(&digest).await);

        let status = client.push_blob(file.path(), &digest).await;
        assert!(status.success, "{:?}", status.error);
        Ok(())
    }

    #[tokio::test]
    async fn test_stream_handler_sees_frames() -> anyhow::Result<()> {
        init_tracing();
        let addr = spawn_server().await;
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let client = ClientBuilder::new()
            .host(format!("http://{}", addr))
            .stream_handler(move |_: &Value| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .build()?;

        let frames: Vec<_> = client
            .generate_stream(GenerateRequest::new("llama3.2", "hi"))
            .await
            .collect()
            .await;
        assert_eq!(frames.len(), 3);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_connection_failure() {
        init_tracing();
        let client = ClientBuilder::new().host("127.0.0.1:1").build().unwrap();

        let err = client.version().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);

        let mut frames = client.chat_stream(ChatRequest::new("llama3.2", vec![])).await;
        assert_eq!(frames.next().await.unwrap().unwrap_err().kind(), ErrorKind::Connection);
    }
}

mod blocking_dispatch {
    use super::*;

    #[test]
    fn test_generate_buffered_and_streamed() -> anyhow::Result<()> {
        let client = blocking_client();

        let response = client.generate(GenerateRequest::new("llama3.2", "Why is the sky blue?"))?;
        assert_eq!(response.response, "The sky is blue.");

        let mut frames = client.generate_stream(GenerateRequest::new("llama3.2", "Why is the sky blue?"));
        let mut text = String::new();
        for frame in frames.by_ref() {
            text.push_str(&frame?.response);
        }
        assert_eq!(text, "The sky is blue.");
        assert!(frames.is_complete());
        Ok(())
    }

    #[test]
    fn test_chat_history_accumulates() -> anyhow::Result<()> {
        let client = blocking_client();
        let conversation = ConversationHandle::new();

        client.chat(ChatRequest::new("llama3.2", vec![Message::user("hi")]).in_conversation(conversation))?;
        client.chat(
            ChatRequest::new("llama3.2", vec![Message::user("hi"), Message::user("again")])
                .in_conversation(conversation),
        )?;

        let history = client.conversation_history("llama3.2", conversation);
        assert_eq!(history.len(), 4);
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[2], Message::user("again"));
        Ok(())
    }

    #[test]
    fn test_streamed_chat_and_interruption() -> anyhow::Result<()> {
        let client = blocking_client();
        let conversation = ConversationHandle::new();

        let mut frames =
            client.chat_stream(ChatRequest::new("llama3.2", vec![Message::user("hello")]).in_conversation(conversation));
        let text = frames
            .by_ref()
            .map(|frame| frame.map(|f| f.content().to_string()))
            .collect::<ollama_client::Result<String>>()?;
        assert_eq!(text, "echo: hello");
        assert!(frames.is_complete());
        assert_eq!(client.conversation_history("llama3.2", conversation).len(), 2);

        let mut frames =
            client.chat_stream(ChatRequest::new("interrupted", vec![Message::user("hello")]).in_conversation(conversation));
        assert_eq!(frames.by_ref().count(), 2);
        assert!(!frames.is_complete());
        assert_eq!(client.conversation_history("interrupted", conversation).len(), 1);
        Ok(())
    }

    #[test]
    fn test_errors_and_booleans() -> anyhow::Result<()> {
        let client = blocking_client();

        assert_eq!(client.show("missing", false).unwrap_err().kind(), ErrorKind::ModelNotFound);
        assert_eq!(client.show("broken", false).unwrap_err().kind(), ErrorKind::Request);
        assert!(client.copy("llama3.2", "copy"));
        assert!(!client.delete("missing"));
        assert!(client.blob_exists(EMPTY_DIGEST));

        let file = tempfile::NamedTempFile::new()?;
        std::fs::write(file.path(), b"weights")?;
        let digest = ollama_client::utils::calculate_sha256(file.path())?;
        assert!(client.push_blob(file.path(), &digest).success);
        Ok(())
    }

    #[test]
    fn test_progress_and_listing() -> anyhow::Result<()> {
        let client = blocking_client();

        let frames = client
            .pull_stream("llama3.2", false)
            .collect::<ollama_client::Result<Vec<_>>>()?;
        assert_eq!(frames.len(), 3);
        assert!(client.pull("llama3.2", false)?.is_success());

        assert_eq!(client.list_models()?[0].name, "llama3.2:latest");
        assert_eq!(client.list_running_models()?.len(), 1);
        assert_eq!(client.version()?.version, "0.5.1");
        assert_eq!(
            client.embed(EmbedRequest::new("all-minilm", "hello"))?.embeddings,
            vec![vec![0.1, 0.2]]
        );
        Ok(())
    }
}
