//! Client for the Ollama HTTP API, in async and blocking flavors.
//!
//! ```no_run
//! use ollama_client::{ChatRequest, Client, ConversationHandle, Message};
//!
//! # async fn run() -> ollama_client::Result<()> {
//! let client = Client::from_env()?;
//! let conversation = ConversationHandle::new();
//! let request = ChatRequest::new("llama3.2", vec![Message::user("Why is the sky blue?")])
//!     .in_conversation(conversation);
//! let reply = client.chat(request).await?;
//! println!("{}", reply.content());
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod envconfig;
pub mod error;
pub mod history;
pub mod parser;
pub mod stream;
pub mod utils;

pub use api::blocking;
pub use api::{
    BlobStatus, ChatRequest, ChatResponse, Client, ClientBuilder, CreateRequest, EmbedInput,
    EmbedRequest, EmbedResponse, Endpoint, GenerateRequest, GenerateResponse, ImageSource,
    Message, MessageInput, Metrics, ModelDetails, ModelInfo, Options, ProgressResponse,
    ResponseStream, Role, RunningModel, ShowResponse, StreamFrame, VersionResponse,
};
pub use envconfig::EnvConfig;
pub use error::{Error, ErrorKind, Result};
pub use history::{ConversationHandle, ConversationKey, ConversationStore};
pub use parser::{load_modelfile, parse_modelfile, Modelfile, ParameterValue};
pub use stream::{Observer, StreamHandler};
