use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which remote source an update came from. Also selects the forum tag
/// applied to the destination thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Reddit,
    Discourse,
}

impl SourceKind {
    /// Stable key segment used in storage namespaces.
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Reddit => "reddit",
            SourceKind::Discourse => "discourse",
        }
    }

    /// Human-readable name used in the attribution line.
    pub fn label(&self) -> &'static str {
        match self {
            SourceKind::Reddit => "Reddit",
            SourceKind::Discourse => "Discourse",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One normalized item of new content from a source. Immutable once built.
///
/// `id` deduplicates messages in case pagination breaks; `topic_id` groups
/// updates into one destination thread per source-side conversation.
#[derive(Debug, Clone)]
pub struct Update {
    pub kind: SourceKind,
    pub id: String,
    pub topic_id: String,
    pub topic_title: String,
    pub url: String,

    pub time: DateTime<Utc>,

    pub author: String,
    pub author_url: String,
    pub author_image: Option<String>,

    pub html: Option<String>,
    pub text: Option<String>,
    pub link: Option<String>,
    pub image: Option<String>,
}

/// Last-seen item id per source feed, bounding the next fetch to newer
/// items only. Read at pass start, written back at pass end.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollCursor {
    pub reddit_id: Option<String>,
    pub reddit_comment_id: Option<String>,
    pub discourse_id: Option<i64>,
}

/// Persisted per (source kind, topic id): the destination thread plus the
/// ids of every update already posted into it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicRecord {
    pub thread_id: String,
    pub updates: Vec<String>,
}

/// One renderable chunk of an update. Transient, never persisted.
#[derive(Debug, Clone)]
pub struct RenderedBlock {
    pub title: String,
    pub color: u32,
    pub author: String,
    pub author_url: String,
    pub author_image: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub image: Option<String>,
    pub link: Option<String>,
    pub body: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(reqwest::StatusCode),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid proxy entry: {0}")]
    InvalidProxy(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("thread {0} no longer exists")]
    ThreadMissing(String),

    #[error("ran out of retries during fetch: {0}")]
    RetriesExhausted(String),

    #[error("{0}")]
    General(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;
