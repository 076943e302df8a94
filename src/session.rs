//! Session manager: id handling, message persistence, and history paging.
//!
//! Wraps a [`SessionStore`] and converts its failures into
//! [`QueryError::PersistenceFailed`]. Client-supplied session ids are
//! accepted as-is once they pass [`validate_session_id`]. An id the store
//! has never seen starts a new session under that id.
//!
//! History is paged by `seq`: a page holds messages with `seq > after`, and
//! `next_cursor` is the last returned `seq` when more messages remain.

use std::sync::Arc;

use serde::Serialize;

use book_rag_core::models::{Message, NewMessage, Session};
use book_rag_core::store::{SessionKey, SessionStore};

use crate::config::SessionsConfig;
use crate::error::QueryError;

const MAX_SESSION_ID_LEN: usize = 64;

/// Accept 1 to 64 characters of `[A-Za-z0-9_-]`. UUIDs qualify.
pub fn validate_session_id(id: &str) -> Result<(), QueryError> {
    let ok = !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(QueryError::InvalidInput(format!(
            "session_id must be 1-{} characters of letters, digits, '-' or '_'",
            MAX_SESSION_ID_LEN
        )))
    }
}

/// One page of a session's history.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub session_id: String,
    pub messages: Vec<Message>,
    pub message_count: i64,
    /// Pass as `after` to fetch the next page; absent on the last page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<i64>,
}

pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    corpus_version: String,
    default_limit: usize,
    max_limit: usize,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, corpus_version: &str, config: &SessionsConfig) -> Self {
        Self {
            store,
            corpus_version: corpus_version.to_string(),
            default_limit: config.default_history_limit,
            max_limit: config.max_history_limit,
        }
    }

    /// The id a request will use: the supplied one if valid, else a new UUID.
    pub fn resolve_id(&self, requested: Option<&str>) -> Result<String, QueryError> {
        match requested.map(str::trim).filter(|s| !s.is_empty()) {
            Some(id) => {
                validate_session_id(id)?;
                Ok(id.to_string())
            }
            None => Ok(uuid::Uuid::new_v4().to_string()),
        }
    }

    pub async fn get_or_create(
        &self,
        session_id: &str,
        user_id: Option<&str>,
    ) -> Result<Session, QueryError> {
        self.store
            .get_or_create(SessionKey {
                session_id,
                user_id,
                corpus_version: &self.corpus_version,
            })
            .await
            .map_err(QueryError::persistence)
    }

    /// Ensure the session exists, then append `message` to it.
    pub async fn record(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        message: &NewMessage,
    ) -> Result<Message, QueryError> {
        self.get_or_create(session_id, user_id).await?;
        self.store
            .append_message(session_id, message)
            .await
            .map_err(QueryError::persistence)
    }

    /// A page of history. `limit` defaults and is clamped to the configured max.
    pub async fn history(
        &self,
        session_id: &str,
        limit: Option<usize>,
        after: Option<i64>,
    ) -> Result<HistoryPage, QueryError> {
        validate_session_id(session_id)?;
        let session = self
            .store
            .get_session(session_id)
            .await
            .map_err(QueryError::persistence)?
            .ok_or_else(|| QueryError::NotFound(session_id.to_string()))?;

        let limit = limit.unwrap_or(self.default_limit).clamp(1, self.max_limit);
        let after = after.unwrap_or(0).max(0);
        let messages = self
            .store
            .list_messages(session_id, after, limit)
            .await
            .map_err(QueryError::persistence)?;

        let next_cursor = match messages.last() {
            Some(last) if messages.len() == limit && last.seq < session.message_count => {
                Some(last.seq)
            }
            _ => None,
        };

        Ok(HistoryPage {
            session_id: session.session_id,
            messages,
            message_count: session.message_count,
            next_cursor,
        })
    }
}
