use crate::fetcher::{FetchExecutor, FetchRequest, Fetched, ShortCircuit};
use crate::types::{RelayError, RenderedBlock, Result, SourceKind};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use url::Url;

/// The destination forum-style container: create a thread seeded with a
/// first block, or append a block to an existing thread. The session and
/// command machinery of the messaging platform is outside this boundary.
#[async_trait]
pub trait ForumSink: Send + Sync {
    /// Create a thread tagged for `kind`, publishing `first` as its
    /// starter message. Returns the new thread's id.
    async fn create_thread(
        &self,
        title: &str,
        kind: SourceKind,
        first: &RenderedBlock,
    ) -> Result<String>;

    /// Append one block to an existing thread. Fails with
    /// [`RelayError::ThreadMissing`] when the thread has vanished.
    async fn append(&self, thread_id: &str, block: &RenderedBlock) -> Result<()>;
}

#[derive(Serialize)]
struct Embed {
    title: String,
    description: String,
    color: u32,
    timestamp: String,
    author: EmbedAuthor,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<EmbedImage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
}

#[derive(Serialize)]
struct EmbedAuthor {
    name: String,
    url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon_url: Option<String>,
}

#[derive(Serialize)]
struct EmbedImage {
    url: String,
}

impl From<&RenderedBlock> for Embed {
    fn from(block: &RenderedBlock) -> Self {
        Self {
            title: block.title.clone(),
            description: block.body.clone(),
            color: block.color,
            timestamp: block.timestamp.to_rfc3339(),
            author: EmbedAuthor {
                name: block.author.clone(),
                url: block.author_url.clone(),
                icon_url: block.author_image.clone(),
            },
            image: block
                .image
                .as_ref()
                .filter(|url| !url.is_empty())
                .map(|url| EmbedImage { url: url.clone() }),
            url: block.link.clone(),
        }
    }
}

#[derive(Deserialize)]
struct ThreadResponse {
    id: String,
}

/// Discord REST implementation of [`ForumSink`], publishing embeds into a
/// forum channel through the route pool.
pub struct DiscordForum {
    executor: Arc<FetchExecutor>,
    api_base: Url,
    token: String,
    forum_channel: String,
    reddit_tag: String,
    discourse_tag: String,
}

impl DiscordForum {
    pub fn new(
        executor: Arc<FetchExecutor>,
        api_base: Url,
        token: String,
        forum_channel: String,
        reddit_tag: String,
        discourse_tag: String,
    ) -> Self {
        Self {
            executor,
            api_base,
            token,
            forum_channel,
            reddit_tag,
            discourse_tag,
        }
    }

    fn tag_for(&self, kind: SourceKind) -> &str {
        match kind {
            SourceKind::Reddit => &self.reddit_tag,
            SourceKind::Discourse => &self.discourse_tag,
        }
    }

    fn authed(&self, request: FetchRequest) -> FetchRequest {
        request.header("authorization", format!("Bot {}", self.token))
    }
}

#[async_trait]
impl ForumSink for DiscordForum {
    async fn create_thread(
        &self,
        title: &str,
        kind: SourceKind,
        first: &RenderedBlock,
    ) -> Result<String> {
        let url = self
            .api_base
            .join(&format!("channels/{}/threads", self.forum_channel))?;
        let request = self.authed(FetchRequest::post(url).json_body(json!({
            "name": title,
            "applied_tags": [self.tag_for(kind)],
            "message": { "embeds": [Embed::from(first)] },
        })));

        let thread: ThreadResponse = self
            .executor
            .fetch_json(&request, &crate::fetcher::no_short_circuit)
            .await?
            .into_payload()?;
        Ok(thread.id)
    }

    async fn append(&self, thread_id: &str, block: &RenderedBlock) -> Result<()> {
        let url = self
            .api_base
            .join(&format!("channels/{thread_id}/messages"))?;
        let request = self.authed(FetchRequest::post(url).json_body(json!({
            "embeds": [Embed::from(block)],
        })));

        let fetched: Fetched<serde_json::Value> = self
            .executor
            .fetch_json(&request, &|status: StatusCode| {
                (status == StatusCode::NOT_FOUND).then_some(ShortCircuit::Gone)
            })
            .await?;

        match fetched {
            Fetched::Payload(_) => Ok(()),
            Fetched::ShortCircuit(_) => Err(RelayError::ThreadMissing(thread_id.to_string())),
        }
    }
}
