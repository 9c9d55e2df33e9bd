pub mod digest {
    use std::fs::File;
    use std::io::Read;
    use std::path::{Path, PathBuf};

    use sha2::{Digest, Sha256};

    use crate::error::{Error, Result};

    pub const CHUNK_SIZE: usize = 4096;

    /// Hashes a reader in fixed-size chunks, returning `sha256:<hex>`.
    pub fn sha256_digest<R: Read>(mut reader: R) -> Result<String> {
        let mut hasher = Sha256::new();
        let mut buf = [0u8; CHUNK_SIZE];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(format!("sha256:{:x}", hasher.finalize()))
    }

    pub fn calculate_sha256<P: AsRef<Path>>(path: P) -> Result<String> {
        let file = File::open(path)?;
        sha256_digest(file)
    }

    /// Same as [`calculate_sha256`], run on the blocking pool.
    pub async fn calculate_sha256_async<P: Into<PathBuf>>(path: P) -> Result<String> {
        let path = path.into();
        tokio::task::spawn_blocking(move || calculate_sha256(path))
            .await
            .map_err(|e| Error::Unexpected(format!("digest task failed: {}", e)))?
    }

    pub fn is_valid_digest(digest: &str) -> bool {
        digest
            .strip_prefix("sha256:")
            .map(|hex| {
                hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
            })
            .unwrap_or(false)
    }
}

pub mod encoding {
    use std::path::Path;

    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    use crate::error::Result;

    pub const TEXT_FILE_EXTENSIONS: &[&str] = &[
        "txt", "md", "py", "js", "html", "css", "json", "csv", "xml", "yaml", "yml",
    ];

    pub fn is_text_extension(ext: &str) -> bool {
        TEXT_FILE_EXTENSIONS.contains(&ext.to_lowercase().as_str())
    }

    pub fn encode_bytes(data: &[u8]) -> String {
        STANDARD.encode(data)
    }

    pub fn encode_image<P: AsRef<Path>>(path: P) -> Result<String> {
        let data = std::fs::read(path)?;
        Ok(encode_bytes(&data))
    }

    /// Wraps a file for inclusion in a prompt. Text files are inlined,
    /// anything else is base64-encoded.
    pub fn encode_file_content<P: AsRef<Path>>(path: P) -> Result<String> {
        let path = path.as_ref();
        let is_text = path
            .extension()
            .and_then(|e| e.to_str())
            .map(is_text_extension)
            .unwrap_or(false);

        let content = if is_text {
            std::fs::read_to_string(path)?
        } else {
            encode_bytes(&std::fs::read(path)?)
        };

        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(format!("<file name=\"{}\">\n{}\n</file>", filename, content))
    }

    pub fn format_file_prompt<P: AsRef<Path>>(path: P, description: Option<&str>) -> Result<String> {
        let content = encode_file_content(path)?;
        Ok(match description {
            Some(description) => format!("{}\n\n{}", description, content),
            None => content,
        })
    }
}

pub mod metrics {
    use serde::{Deserialize, Serialize};

    const NANOS_PER_SECOND: f64 = 1_000_000_000.0;

    pub fn format_duration(nanoseconds: Option<u64>) -> Option<f64> {
        nanoseconds.map(|ns| ns as f64 / NANOS_PER_SECOND)
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct TokenUsage {
        pub prompt_tokens: u64,
        pub completion_tokens: u64,
        pub total_tokens: u64,
    }

    impl TokenUsage {
        pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
            Self {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens.saturating_add(completion_tokens),
            }
        }
    }
}

pub mod conversation {
    use serde_json::{json, Value};

    use crate::api::types::Message;
    use crate::error::{Error, Result};

    pub const CONVERSATION_VERSION: u64 = 1;

    pub fn serialize_conversation(model: &str, messages: &[Message]) -> Value {
        json!({
            "model": model,
            "version": CONVERSATION_VERSION,
            "timestamp": chrono::Local::now().to_rfc3339(),
            "messages": messages,
        })
    }

    pub fn deserialize_conversation(data: &Value) -> Result<Vec<Message>> {
        let object = data
            .as_object()
            .ok_or_else(|| Error::InvalidInput("conversation data must be an object".into()))?;

        if !object.contains_key("version") || !object.contains_key("messages") {
            return Err(Error::InvalidInput(
                "conversation is missing 'version' or 'messages'".into(),
            ));
        }

        serde_json::from_value(object["messages"].clone())
            .map_err(|e| Error::InvalidInput(format!("invalid conversation messages: {}", e)))
    }
}

pub use conversation::{deserialize_conversation, serialize_conversation};
pub use digest::{calculate_sha256, calculate_sha256_async, is_valid_digest, sha256_digest};
pub use encoding::{encode_bytes, encode_file_content, encode_image, format_file_prompt};
pub use metrics::{format_duration, TokenUsage};
