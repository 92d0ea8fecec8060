//! Blocking HTTP client for the collaborator service.
//!
//! - `POST /question`: operator feedback on a recommendation.
//! - `POST /chat`: log of a chat exchange together with the field snapshot it was answered from.
//! - Both are best-effort. [`FeedbackSender`] moves the calls off the caller's thread and only
//!   logs failures; nothing is retried.

use crate::models::field::FieldState;
use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Sender};
use http::StatusCode;
use log::{debug, warn};
use serde::Serialize;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug)]
pub enum CollaboratorError {
    Transport(String),
    Http { status: StatusCode, message: String },
    Json(serde_json::Error),
}

impl core::fmt::Display for CollaboratorError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CollaboratorError::Transport(s) => write!(f, "transport error: {}", s),
            CollaboratorError::Http { status, message } => write!(f, "http {}: {}", status, message),
            CollaboratorError::Json(e) => write!(f, "json error: {}", e),
        }
    }
}

impl std::error::Error for CollaboratorError {}

impl From<serde_json::Error> for CollaboratorError {
    fn from(value: serde_json::Error) -> Self {
        CollaboratorError::Json(value)
    }
}

impl From<ureq::Error> for CollaboratorError {
    fn from(value: ureq::Error) -> Self {
        match value {
            ureq::Error::Json(e) => CollaboratorError::Json(e),
            other => CollaboratorError::Transport(other.to_string()),
        }
    }
}

/// Body of `POST /question`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Feedback {
    pub recommendation_id: String,
    pub comment: String,
}

/// Body of `POST /chat`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatLog {
    pub question: String,
    pub sensor_data: Arc<FieldState>,
    pub timestamp: DateTime<Utc>,
}

pub struct CollaboratorClient {
    agent: ureq::Agent,
    base_url: String,
}

impl CollaboratorClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();
        CollaboratorClient {
            agent,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn post_json<T: Serialize>(&self, path: &str, body: &T) -> Result<(), CollaboratorError> {
        let url = self.url(path);
        let mut res = self
            .agent
            .post(&url)
            .header("Accept", "application/json")
            .send_json(body)?;

        let status = res.status();
        if status.is_success() {
            debug!("POST {} -> {}", url, status);
            return Ok(());
        }
        let message = res
            .body_mut()
            .read_to_string()
            .unwrap_or_else(|_| String::from("<no body>"));
        Err(CollaboratorError::Http { status, message })
    }

    pub fn post_feedback(&self, feedback: &Feedback) -> Result<(), CollaboratorError> {
        self.post_json("/question", feedback)
    }

    pub fn post_chat_log(&self, log: &ChatLog) -> Result<(), CollaboratorError> {
        self.post_json("/chat", log)
    }
}

#[derive(Debug, Clone)]
pub enum Outbound {
    Feedback(Feedback),
    ChatLog(ChatLog),
}

/// Where the chat desk hands outbound calls. Implemented by [`FeedbackSender`]; tests swap in
/// a recorder.
pub trait OutboundSink: Send + Sync {
    fn submit(&self, message: Outbound);
}

/// Fire-and-forget delivery on a background thread.
pub struct FeedbackSender {
    tx: Option<Sender<Outbound>>,
    worker: Option<JoinHandle<()>>,
}

impl FeedbackSender {
    pub fn start(client: CollaboratorClient) -> io::Result<Self> {
        let (tx, rx) = channel::unbounded::<Outbound>();
        let worker = thread::Builder::new()
            .name("collaborator".to_string())
            .spawn(move || {
                for message in rx.iter() {
                    let (what, result) = match &message {
                        Outbound::Feedback(f) => ("feedback", client.post_feedback(f)),
                        Outbound::ChatLog(l) => ("chat log", client.post_chat_log(l)),
                    };
                    if let Err(e) = result {
                        warn!("Could not send {} to {}: {}", what, client.base_url(), e);
                    }
                }
            })?;
        Ok(FeedbackSender {
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    /// Waits for queued messages to be attempted, then stops the worker.
    pub fn shutdown(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            warn!("Collaborator worker panicked");
        }
    }
}

impl OutboundSink for FeedbackSender {
    fn submit(&self, message: Outbound) {
        let sent = self.tx.as_ref().map(|tx| tx.send(message).is_ok()).unwrap_or(false);
        if !sent {
            warn!("Collaborator sender is shut down; dropping message");
        }
    }
}

impl Drop for FeedbackSender {
    fn drop(&mut self) {
        self.shutdown();
    }
}
