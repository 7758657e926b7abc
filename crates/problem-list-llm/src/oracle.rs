//! The oracle seam and its canned test double.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::contract::OracleRequest;
use crate::extraction::{ExtractionError, ExtractionResult};

/// Natural-language service that proposes problem-list changes for a note.
///
/// Implementations return the raw response text; parsing and validation are
/// done by [`crate::parse_oracle_response`] on the consumer side.
pub trait ExtractionOracle: Send + Sync {
    fn extract_changes(&self, request: &OracleRequest) -> ExtractionResult<String>;
}

/// One scripted reply of a [`CannedOracle`].
#[derive(Debug, Clone)]
pub enum CannedReply {
    /// Return this text
    Text(String),
    /// Fail as if the service were down
    Unavailable(String),
    /// Sleep, then return the text (for exercising timeouts)
    Delayed(Duration, String),
}

/// Oracle returning fixed responses in order, for deterministic tests.
///
/// Once the queue is drained the fallback reply (if any) is repeated.
#[derive(Debug, Default)]
pub struct CannedOracle {
    replies: Mutex<VecDeque<CannedReply>>,
    fallback: Option<CannedReply>,
    requests: Mutex<Vec<OracleRequest>>,
}

impl CannedOracle {
    /// Create an oracle with no scripted replies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Oracle that answers every request with the same text.
    pub fn always(response: impl Into<String>) -> Self {
        Self {
            fallback: Some(CannedReply::Text(response.into())),
            ..Self::default()
        }
    }

    /// Oracle that is always unavailable.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            fallback: Some(CannedReply::Unavailable(message.into())),
            ..Self::default()
        }
    }

    /// Queue a text reply.
    pub fn then_reply(self, response: impl Into<String>) -> Self {
        self.then(CannedReply::Text(response.into()))
    }

    /// Queue an arbitrary reply.
    pub fn then(self, reply: CannedReply) -> Self {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(reply);
        }
        self
    }

    /// Requests seen so far, oldest first.
    pub fn recorded_requests(&self) -> Vec<OracleRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    fn next_reply(&self) -> Option<CannedReply> {
        let queued = self.replies.lock().ok().and_then(|mut r| r.pop_front());
        queued.or_else(|| self.fallback.clone())
    }
}

impl ExtractionOracle for CannedOracle {
    fn extract_changes(&self, request: &OracleRequest) -> ExtractionResult<String> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }

        match self.next_reply() {
            Some(CannedReply::Text(text)) => Ok(text),
            Some(CannedReply::Unavailable(message)) => Err(ExtractionError::Unavailable(message)),
            Some(CannedReply::Delayed(delay, text)) => {
                std::thread::sleep(delay);
                Ok(text)
            }
            None => Err(ExtractionError::Unavailable("no canned reply left".into())),
        }
    }
}
