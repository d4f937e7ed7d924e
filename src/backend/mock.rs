use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::body::Bytes;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::{sync::Notify, time::sleep};
use tracing::debug;

use crate::backend::{BackendDialect, BackendError, FrameStream, InferenceBackend};

#[derive(Clone)]
pub struct ScriptedEngine {
    name: String,
    reply: Value,
    frames: Vec<String>,
    frame_delay: Duration,
    hang_after_frames: bool,
    stall_replies: bool,
    reachable: Arc<AtomicBool>,
    probes: Arc<AtomicUsize>,
    payloads: Arc<Mutex<Vec<Value>>>,
    released: Arc<ReleaseFlag>,
}

#[derive(Default)]
struct ReleaseFlag {
    released: AtomicBool,
    notify: Notify,
}

struct ReleaseGuard(Arc<ReleaseFlag>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.released.store(true, Ordering::SeqCst);
        self.0.notify.notify_one();
    }
}

impl ScriptedEngine {
    pub fn new(reply: Value, frames: Vec<String>) -> Self {
        Self {
            name: "scripted-engine".to_owned(),
            reply,
            frames,
            frame_delay: Duration::from_millis(5),
            hang_after_frames: false,
            stall_replies: false,
            reachable: Arc::new(AtomicBool::new(true)),
            probes: Arc::new(AtomicUsize::new(0)),
            payloads: Arc::new(Mutex::new(Vec::new())),
            released: Arc::new(ReleaseFlag::default()),
        }
    }

    pub fn speaking(dialect: BackendDialect, pieces: &[&str]) -> Self {
        let mut frames = pieces
            .iter()
            .map(|piece| text_frame(dialect, piece))
            .collect::<Vec<_>>();
        frames.push(terminal_frame(dialect));
        Self::new(reply_for(dialect, &pieces.concat()), frames)
    }

    pub fn with_frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = delay;
        self
    }

    pub fn hanging(mut self) -> Self {
        self.hang_after_frames = true;
        self
    }

    pub fn stalling(mut self) -> Self {
        self.stall_replies = true;
        self
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn last_payload(&self) -> Option<Value> {
        self.payloads
            .lock()
            .ok()
            .and_then(|payloads| payloads.last().cloned())
    }

    pub fn stream_released(&self) -> bool {
        self.released.released.load(Ordering::SeqCst)
    }

    pub async fn wait_released(&self, limit: Duration) -> bool {
        if self.stream_released() {
            return true;
        }
        tokio::time::timeout(limit, self.released.notify.notified())
            .await
            .is_ok()
            || self.stream_released()
    }

    fn record(&self, payload: &Value) -> Result<(), BackendError> {
        if let Ok(mut payloads) = self.payloads.lock() {
            payloads.push(payload.clone());
        }
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::Unavailable("connection refused".to_owned()))
        }
    }
}

#[async_trait]
impl InferenceBackend for ScriptedEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, payload: &Value) -> Result<Value, BackendError> {
        self.record(payload)?;
        if self.stall_replies {
            std::future::pending::<()>().await;
        }
        Ok(self.reply.clone())
    }

    async fn submit_stream(&self, payload: &Value) -> Result<FrameStream, BackendError> {
        self.record(payload)?;

        let frames = self.frames.clone();
        let delay = self.frame_delay;
        let hang = self.hang_after_frames;
        let guard = ReleaseGuard(self.released.clone());

        let stream = async_stream::stream! {
            let _guard = guard;
            for frame in frames {
                sleep(delay).await;
                yield Ok::<Bytes, BackendError>(Bytes::from(frame));
            }
            if hang {
                std::future::pending::<()>().await;
            }
        };

        debug!(backend = %self.name, "scripted stream prepared");
        Ok(stream.boxed())
    }

    async fn probe(&self) -> Result<(), BackendError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::Unavailable("connection refused".to_owned()))
        }
    }
}

pub fn text_frame(dialect: BackendDialect, content: &str) -> String {
    match dialect {
        BackendDialect::LlamaCpp => {
            format!("data: {}\n\n", json!({"content": content, "stop": false}))
        }
        BackendDialect::Ollama => {
            format!("{}\n", json!({"response": content, "done": false}))
        }
        BackendDialect::OpenAi => format!(
            "data: {}\n\n",
            json!({"choices": [{"index": 0, "delta": {"content": content}}]})
        ),
    }
}

pub fn terminal_frame(dialect: BackendDialect) -> String {
    match dialect {
        BackendDialect::LlamaCpp => {
            format!("data: {}\n\n", json!({"content": "", "stop": true}))
        }
        BackendDialect::Ollama => format!("{}\n", json!({"response": "", "done": true})),
        BackendDialect::OpenAi => "data: [DONE]\n\n".to_owned(),
    }
}

pub fn reply_for(dialect: BackendDialect, text: &str) -> Value {
    match dialect {
        BackendDialect::LlamaCpp => json!({"content": text, "stop": true}),
        BackendDialect::Ollama => json!({"response": text, "done": true}),
        BackendDialect::OpenAi => json!({
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": text},
                "finish_reason": "stop"
            }]
        }),
    }
}
