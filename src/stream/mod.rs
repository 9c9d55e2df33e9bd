//! Newline-delimited JSON decoding for streamed responses.
//!
//! Each non-empty line is one JSON object. Lines that are not valid JSON
//! objects (keep-alives, partial writes) are skipped and the sequence
//! continues. A transport error is reported once and ends the sequence.

use std::io::BufRead;
use std::sync::Arc;

use bytes::BytesMut;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tracing::trace;

use crate::error::{Error, Result};

/// Receives every decoded frame before it is handed to the caller.
pub trait StreamHandler: Send + Sync {
    fn handle_chunk(&self, chunk: &Value);
}

impl<F> StreamHandler for F
where
    F: Fn(&Value) + Send + Sync,
{
    fn handle_chunk(&self, chunk: &Value) {
        self(chunk)
    }
}

pub type Observer = Arc<dyn StreamHandler>;

/// Decodes one line. `None` means the line carries no frame.
pub fn decode_line(line: &[u8]) -> Option<Value> {
    let text = std::str::from_utf8(line).ok()?.trim();
    if text.is_empty() {
        return None;
    }

    match serde_json::from_str::<Value>(text) {
        Ok(value) if value.is_object() => Some(value),
        Ok(_) => {
            trace!("Skipping non-object stream line: {}", text);
            None
        }
        Err(e) => {
            trace!("Skipping malformed stream line: {} - {}", text, e);
            None
        }
    }
}

fn notify(observer: &Option<Observer>, value: &Value) {
    if let Some(observer) = observer {
        observer.handle_chunk(value);
    }
}

/// Blocking decoder: one line read per step.
pub struct JsonLines<R> {
    reader: R,
    observer: Option<Observer>,
    buf: Vec<u8>,
    finished: bool,
}

impl<R: BufRead> JsonLines<R> {
    pub fn new(reader: R, observer: Option<Observer>) -> Self {
        Self {
            reader,
            observer,
            buf: Vec::new(),
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl<R: BufRead> Iterator for JsonLines<R> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            self.buf.clear();
            match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => self.finished = true,
                Ok(_) => {
                    if let Some(value) = decode_line(&self.buf) {
                        notify(&self.observer, &value);
                        return Some(Ok(value));
                    }
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(Error::Connection(format!("stream read failed: {}", e))));
                }
            }
        }
        None
    }
}

/// Reassembles lines across arbitrary chunk boundaries.
#[derive(Default)]
struct LineBuffer {
    pending: BytesMut,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<BytesMut> {
        let pos = self.pending.iter().position(|b| *b == b'\n')?;
        let mut line = self.pending.split_to(pos + 1);
        line.truncate(pos);
        Some(line)
    }

    fn take_rest(&mut self) -> Option<BytesMut> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.pending.split())
        }
    }
}

/// Cooperative decoder over a byte stream, suspending at chunk reads.
pub fn json_stream<S, B, E>(body: S, observer: Option<Observer>) -> impl Stream<Item = Result<Value>> + Send
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Into<Error> + Send,
{
    async_stream::stream! {
        let mut body = Box::pin(body);
        let mut lines = LineBuffer::default();

        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(chunk) => {
                    lines.push(chunk.as_ref());
                    while let Some(line) = lines.next_line() {
                        if let Some(value) = decode_line(&line) {
                            notify(&observer, &value);
                            yield Ok(value);
                        }
                    }
                }
                Err(e) => {
                    yield Err(e.into());
                    return;
                }
            }
        }

        if let Some(rest) = lines.take_rest() {
            if let Some(value) = decode_line(&rest) {
                notify(&observer, &value);
                yield Ok(value);
            }
        }
    }
}
