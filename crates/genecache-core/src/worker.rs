//! Background decode worker.
//!
//! Large payloads are handed to a dedicated thread as owned [`DecodeRequest`]
//! messages and come back as [`DecodedEntry`] replies, so decoding never runs
//! on an async task and the worker shares no state with its callers.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::compress::decode_text;
use crate::error::{CacheError, CacheResult};

/// Encoded key and its stored text, moved to the worker.
#[derive(Debug, Clone)]
pub struct DecodeRequest {
    pub key: String,
    pub text: String,
}

/// Decoded value returned by the worker, tagged with its key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedEntry {
    pub key: String,
    pub value: Value,
}

type Job = (DecodeRequest, oneshot::Sender<CacheResult<DecodedEntry>>);

pub struct DecodeWorker {
    tx: mpsc::UnboundedSender<Job>,
}

impl DecodeWorker {
    /// Start the worker thread. It exits once the worker handle is dropped.
    pub fn spawn() -> std::io::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        std::thread::Builder::new()
            .name("genecache-decode".into())
            .spawn(move || {
                while let Some((request, reply)) = rx.blocking_recv() {
                    // The caller may have given up; nothing to do then.
                    let _ = reply.send(decode(request));
                }
                tracing::debug!("decode worker stopped");
            })?;
        Ok(Self { tx })
    }

    pub async fn decode(&self, request: DecodeRequest) -> CacheResult<DecodedEntry> {
        let key = request.key.clone();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((request, reply_tx))
            .map_err(|_| CacheError::decompression(Some(&key), "decode worker is not running"))?;
        reply_rx
            .await
            .map_err(|_| CacheError::decompression(Some(&key), "decode worker dropped the request"))?
    }
}

/// Decode a request on the current thread.
pub fn decode(request: DecodeRequest) -> CacheResult<DecodedEntry> {
    let DecodeRequest { key, text } = request;
    match decode_text(&text) {
        Ok(value) => Ok(DecodedEntry { key, value }),
        Err(CacheError::Decompression { message, .. }) => {
            Err(CacheError::Decompression { key: Some(key), message })
        }
        Err(other) => Err(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::compress;
    use serde_json::json;

    #[tokio::test]
    async fn worker_replies_with_decoded_entry() {
        let worker = DecodeWorker::spawn().unwrap();
        let value = json!({"features": [1, 2, 3]});
        let text = compress(&value).unwrap().unwrap();
        let out = worker
            .decode(DecodeRequest {
                key: "k1".into(),
                text,
            })
            .await
            .unwrap();
        assert_eq!(out, DecodedEntry { key: "k1".into(), value });
    }

    #[tokio::test]
    async fn worker_errors_carry_the_key() {
        let worker = DecodeWorker::spawn().unwrap();
        let err = worker
            .decode(DecodeRequest {
                key: "broken".into(),
                text: "%%%".into(),
            })
            .await
            .unwrap_err();
        match err {
            CacheError::Decompression { key, .. } => assert_eq!(key.as_deref(), Some("broken")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
