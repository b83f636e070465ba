use crate::fetcher::{no_short_circuit, FetchExecutor, FetchRequest};
use crate::types::{Result, SourceKind, Update};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;
use url::Url;

const AVATAR_SIZE: &str = "128";

#[derive(Debug, Deserialize)]
struct LatestPosts {
    latest_posts: Vec<DiscoursePost>,
}

#[derive(Debug, Deserialize)]
struct DiscoursePost {
    id: i64,
    topic_id: i64,
    topic_title: String,
    created_at: DateTime<Utc>,
    raw: String,
    excerpt: String,
    post_url: String,
    name: String,
    username: String,
    avatar_template: String,
}

/// Pulls the latest posts from a Discourse board. The endpoint is
/// unauthenticated and unpaginated, so new items are selected client-side
/// by numeric id against the cursor.
pub struct DiscourseSource {
    executor: Arc<FetchExecutor>,
    base: Url,
}

impl DiscourseSource {
    pub fn new(executor: Arc<FetchExecutor>, base: Url) -> Self {
        Self { executor, base }
    }

    /// Posts with id greater than the cursor, plus the newest id seen.
    pub async fn fetch_latest(&self, cursor: Option<i64>) -> Result<(Vec<Update>, Option<i64>)> {
        let request = FetchRequest::get(self.base.join("posts.json")?);
        let mut response: LatestPosts = self
            .executor
            .fetch_json(&request, &no_short_circuit)
            .await?
            .into_payload()?;

        if let Some(last_seen) = cursor {
            response.latest_posts.retain(|post| post.id > last_seen);
        }

        let newest = response.latest_posts.first().map(|post| post.id);
        let updates = response
            .latest_posts
            .into_iter()
            .map(|post| normalize(post, &self.base))
            .collect::<Result<Vec<_>>>()?;

        debug!(count = updates.len(), "fetched discourse posts");
        Ok((updates, newest))
    }
}

fn normalize(post: DiscoursePost, base: &Url) -> Result<Update> {
    let author = if post.name.is_empty() {
        post.username.clone()
    } else {
        post.name
    };
    let avatar = post.avatar_template.replace("{size}", AVATAR_SIZE);

    Ok(Update {
        kind: SourceKind::Discourse,
        id: post.id.to_string(),
        topic_id: post.topic_id.to_string(),
        topic_title: post.topic_title,
        url: base.join(&post.post_url)?.to_string(),
        time: post.created_at,
        author,
        author_url: base.join(&format!("/u/{}", post.username))?.to_string(),
        author_image: Some(base.join(&avatar)?.to_string()),
        text: Some(post.excerpt),
        html: Some(post.raw),
        link: None,
        image: None,
    })
}
