use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pantry_protocol::{ConversationRecord, HistorySnapshot};
use parking_lot::Mutex;
use reqwest::StatusCode;
use thiserror::Error;
use url::Url;

use crate::auth::Credential;

const HISTORY_ENDPOINT: &str = "api/chat/history";

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("http error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected status code {0}")]
    HttpStatus(StatusCode),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("history unavailable: {0}")]
    Unavailable(String),
}

/// Request/response channel to the conversation store.
#[async_trait]
pub trait HistoryBackend: Send + Sync {
    async fn fetch_history(
        &self,
        credential: Option<&Credential>,
    ) -> Result<Vec<ConversationRecord>, HistoryError>;

    async fn clear_history(&self, credential: Option<&Credential>) -> Result<(), HistoryError>;
}

pub struct ReqwestHistoryBackend {
    client: reqwest::Client,
    endpoint: Url,
}

impl ReqwestHistoryBackend {
    pub fn new(base_url: &Url) -> Result<Self, HistoryError> {
        let endpoint = base_url.join(HISTORY_ENDPOINT).map_err(|err| {
            HistoryError::InvalidConfig(format!("invalid history endpoint: {err}"))
        })?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .no_proxy()
            .build()?;
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl HistoryBackend for ReqwestHistoryBackend {
    async fn fetch_history(
        &self,
        credential: Option<&Credential>,
    ) -> Result<Vec<ConversationRecord>, HistoryError> {
        let mut builder = self.client.get(self.endpoint.clone());
        if let Some(credential) = credential {
            builder = builder.bearer_auth(credential.token());
        }
        let response = builder.send().await?;
        if !response.status().is_success() {
            return Err(HistoryError::HttpStatus(response.status()));
        }
        let payload = response.json::<HistorySnapshot>().await?;
        Ok(payload.conversations)
    }

    async fn clear_history(&self, credential: Option<&Credential>) -> Result<(), HistoryError> {
        let mut builder = self.client.delete(self.endpoint.clone());
        if let Some(credential) = credential {
            builder = builder.bearer_auth(credential.token());
        }
        let response = builder.send().await?;
        if !response.status().is_success() {
            return Err(HistoryError::HttpStatus(response.status()));
        }
        Ok(())
    }
}

/// Scripted backend. Queued fetch results are served in order; once the queue
/// is empty every fetch returns the fallback result.
#[derive(Clone, Default)]
pub struct MockHistoryBackend {
    fetches: Arc<Mutex<VecDeque<Result<Vec<ConversationRecord>, String>>>>,
    fallback: Arc<Mutex<Vec<ConversationRecord>>>,
    fail_clear: Arc<Mutex<bool>>,
    fetch_calls: Arc<Mutex<usize>>,
    clear_calls: Arc<Mutex<usize>>,
}

impl MockHistoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history(records: Vec<ConversationRecord>) -> Self {
        let backend = Self::new();
        *backend.fallback.lock() = records;
        backend
    }

    pub fn push_fetch(&self, result: Result<Vec<ConversationRecord>, String>) {
        self.fetches.lock().push_back(result);
    }

    pub fn fail_next_fetch(&self, reason: impl Into<String>) {
        self.push_fetch(Err(reason.into()));
    }

    pub fn set_clear_fails(&self, fails: bool) {
        *self.fail_clear.lock() = fails;
    }

    pub fn fetch_calls(&self) -> usize {
        *self.fetch_calls.lock()
    }

    pub fn clear_calls(&self) -> usize {
        *self.clear_calls.lock()
    }
}

#[async_trait]
impl HistoryBackend for MockHistoryBackend {
    async fn fetch_history(
        &self,
        _credential: Option<&Credential>,
    ) -> Result<Vec<ConversationRecord>, HistoryError> {
        *self.fetch_calls.lock() += 1;
        let scripted = self.fetches.lock().pop_front();
        match scripted {
            Some(Ok(records)) => Ok(records),
            Some(Err(reason)) => Err(HistoryError::Unavailable(reason)),
            None => Ok(self.fallback.lock().clone()),
        }
    }

    async fn clear_history(&self, _credential: Option<&Credential>) -> Result<(), HistoryError> {
        *self.clear_calls.lock() += 1;
        if *self.fail_clear.lock() {
            return Err(HistoryError::Unavailable("clear rejected".into()));
        }
        self.fallback.lock().clear();
        Ok(())
    }
}
