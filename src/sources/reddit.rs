use crate::auth::AuthCache;
use crate::fetcher::{FetchExecutor, FetchRequest, Fetched, ShortCircuit};
use crate::store::KvStore;
use crate::types::{RelayError, Result, SourceKind, Update};
use chrono::DateTime;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;
use url::Url;

const AVATAR_NAMESPACE: &str = "redditAvatar";
const DELETED_AUTHOR: &str = "[deleted]";

#[derive(Debug, Deserialize)]
struct Listing<T> {
    data: ListingData<T>,
}

#[derive(Debug, Deserialize)]
struct ListingData<T> {
    children: Vec<Child<T>>,
}

#[derive(Debug, Deserialize)]
struct Child<T> {
    data: T,
}

/// A submission from the subreddit's `new` listing.
#[derive(Debug, Deserialize)]
struct RedditPost {
    id: String,
    title: String,
    author: String,
    permalink: String,
    /// May be empty for link posts.
    selftext: String,
    selftext_html: Option<String>,
    url_overridden_by_dest: Option<String>,
    thumbnail: String,
    created_utc: f64,
}

#[derive(Debug, Deserialize)]
struct RedditComment {
    id: String,
    link_id: String,
    link_title: String,
    body: String,
    author: String,
    permalink: String,
    created_utc: f64,
}

#[derive(Debug, Deserialize)]
struct AboutResponse {
    data: AboutData,
}

#[derive(Debug, Deserialize)]
struct AboutData {
    icon_img: String,
}

/// Pulls new submissions and comments from one subreddit through the
/// authenticated API, normalizing them into [`Update`]s. Avatar lookups
/// are cached in the store so each author costs one request ever.
pub struct RedditSource {
    executor: Arc<FetchExecutor>,
    auth: Arc<AuthCache>,
    store: Arc<dyn KvStore>,
    /// Public site base, used for permalinks and author profile URLs.
    base: Url,
    /// Authenticated API base scoped to the subreddit, trailing slash.
    oauth_base: Url,
}

impl RedditSource {
    pub fn new(
        executor: Arc<FetchExecutor>,
        auth: Arc<AuthCache>,
        store: Arc<dyn KvStore>,
        base: Url,
        oauth_base: Url,
    ) -> Self {
        Self {
            executor,
            auth,
            store,
            base,
            oauth_base,
        }
    }

    /// Submissions newer than the cursor, oldest-exclusive, plus the
    /// newest id seen (listing order is newest-first).
    pub async fn fetch_posts(&self, cursor: Option<&str>) -> Result<(Vec<Update>, Option<String>)> {
        let request = FetchRequest::get(self.oauth_base.join("new.json")?)
            .query("before", cursor.map(|id| format!("t3_{id}")));
        let listing: Listing<RedditPost> = self.fetch_authed(&request).await?;

        let newest = listing
            .data
            .children
            .first()
            .map(|child| child.data.id.clone());

        let mut updates = Vec::with_capacity(listing.data.children.len());
        for child in listing.data.children {
            let avatar = self.author_avatar(&child.data.author).await?;
            updates.push(post_update(child.data, avatar, &self.base)?);
        }
        debug!(count = updates.len(), "fetched reddit posts");
        Ok((updates, newest))
    }

    /// Comments newer than the cursor, normalized against their parent
    /// submission's topic.
    pub async fn fetch_comments(
        &self,
        cursor: Option<&str>,
    ) -> Result<(Vec<Update>, Option<String>)> {
        let request = FetchRequest::get(self.oauth_base.join("comments.json")?)
            .query("before", cursor.map(|id| format!("t1_{id}")));
        let listing: Listing<RedditComment> = self.fetch_authed(&request).await?;

        let newest = listing
            .data
            .children
            .first()
            .map(|child| child.data.id.clone());

        let mut updates = Vec::with_capacity(listing.data.children.len());
        for child in listing.data.children {
            let avatar = self.author_avatar(&child.data.author).await?;
            updates.push(comment_update(child.data, avatar, &self.base)?);
        }
        debug!(count = updates.len(), "fetched reddit comments");
        Ok((updates, newest))
    }

    /// Issue an authenticated request, refreshing the credential and
    /// retrying exactly once if it is rejected.
    async fn fetch_authed<T: DeserializeOwned>(&self, request: &FetchRequest) -> Result<T> {
        let mut force_refresh = false;
        for _ in 0..2 {
            let token = self.auth.token(force_refresh).await?;
            let authed = request.clone().bearer(token);
            let fetched = self
                .executor
                .fetch_json::<T>(&authed, &|status: StatusCode| {
                    (status == StatusCode::UNAUTHORIZED).then_some(ShortCircuit::Reauth)
                })
                .await?;
            match fetched {
                Fetched::Payload(payload) => return Ok(payload),
                Fetched::ShortCircuit(_) => {
                    force_refresh = true;
                }
            }
        }
        Err(RelayError::Unauthorized)
    }

    /// Resolve an author's avatar URL, first from the store, then from the
    /// profile endpoint (caching the result). Deleted authors have none.
    async fn author_avatar(&self, author: &str) -> Result<Option<String>> {
        if author == DELETED_AUTHOR {
            return Ok(None);
        }

        let key = format!("{AVATAR_NAMESPACE}/{author}");
        let store = self.store.as_ref();
        if let Some(cached) = store.get_json::<String>(&key).await? {
            return Ok(Some(cached));
        }

        let request = FetchRequest::get(self.oauth_base.join(&format!("/u/{author}/about.json"))?);
        let about: AboutResponse = self.fetch_authed(&request).await?;
        let image = html_escape::decode_html_entities(&about.data.icon_img).into_owned();

        store.put_json(&key, &image).await?;
        Ok(Some(image))
    }
}

fn timestamp(created_utc: f64) -> Result<chrono::DateTime<chrono::Utc>> {
    DateTime::from_timestamp(created_utc as i64, 0)
        .ok_or_else(|| RelayError::General(format!("invalid timestamp {created_utc}")))
}

fn post_update(post: RedditPost, avatar: Option<String>, base: &Url) -> Result<Update> {
    Ok(Update {
        kind: SourceKind::Reddit,
        id: format!("t3_{}", post.id),
        topic_id: format!("t3_{}", post.id),
        topic_title: html_escape::decode_html_entities(&post.title).into_owned(),
        url: base.join(&post.permalink)?.to_string(),
        time: timestamp(post.created_utc)?,
        author_url: base.join(&format!("/u/{}", post.author))?.to_string(),
        author: post.author,
        author_image: avatar,
        text: if post.selftext.is_empty() {
            None
        } else {
            Some(html_escape::decode_html_entities(&post.selftext).into_owned())
        },
        html: post
            .selftext_html
            .map(|html| html_escape::decode_html_entities(&html).into_owned()),
        link: post.url_overridden_by_dest,
        // "self" is the listing's way of saying there is no thumbnail.
        image: (post.thumbnail != "self").then_some(post.thumbnail),
    })
}

fn comment_update(comment: RedditComment, avatar: Option<String>, base: &Url) -> Result<Update> {
    Ok(Update {
        kind: SourceKind::Reddit,
        id: format!("t1_{}", comment.id),
        topic_id: comment.link_id,
        topic_title: html_escape::decode_html_entities(&comment.link_title).into_owned(),
        url: base.join(&comment.permalink)?.to_string(),
        time: timestamp(comment.created_utc)?,
        author_url: base.join(&format!("/u/{}", comment.author))?.to_string(),
        author: comment.author,
        author_image: avatar,
        text: Some(comment.body.clone()),
        html: Some(comment.body),
        link: None,
        image: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://www.reddit.com/r/example").unwrap()
    }

    #[test]
    fn post_normalization_maps_fields() {
        let post = RedditPost {
            id: "abc12".to_string(),
            title: "Ints &amp; floats".to_string(),
            author: "alice".to_string(),
            permalink: "/r/example/comments/abc12/ints_floats/".to_string(),
            selftext: String::new(),
            selftext_html: Some("&lt;p&gt;hi&lt;/p&gt;".to_string()),
            url_overridden_by_dest: Some("https://example.org/post".to_string()),
            thumbnail: "self".to_string(),
            created_utc: 1_700_000_000.0,
        };

        let update = post_update(post, Some("https://img.example/a.png".to_string()), &base())
            .unwrap();
        assert_eq!(update.kind, SourceKind::Reddit);
        assert_eq!(update.id, "t3_abc12");
        assert_eq!(update.topic_id, "t3_abc12");
        assert_eq!(update.topic_title, "Ints & floats");
        assert_eq!(
            update.url,
            "https://www.reddit.com/r/example/comments/abc12/ints_floats/"
        );
        assert_eq!(update.author_url, "https://www.reddit.com/u/alice");
        assert_eq!(update.text, None, "empty selftext is elided");
        assert_eq!(update.html.as_deref(), Some("<p>hi</p>"));
        assert_eq!(update.image, None, "self thumbnail means no image");
        assert_eq!(update.link.as_deref(), Some("https://example.org/post"));
    }

    #[test]
    fn comment_normalization_reuses_parent_topic() {
        let comment = RedditComment {
            id: "c9".to_string(),
            link_id: "t3_abc12".to_string(),
            link_title: "Parent &quot;post&quot;".to_string(),
            body: "nice one".to_string(),
            author: "bob".to_string(),
            permalink: "/r/example/comments/abc12/x/c9/".to_string(),
            created_utc: 1_700_000_100.0,
        };

        let update = comment_update(comment, None, &base()).unwrap();
        assert_eq!(update.id, "t1_c9");
        assert_eq!(update.topic_id, "t3_abc12");
        assert_eq!(update.topic_title, "Parent \"post\"");
        assert_eq!(update.text.as_deref(), Some("nice one"));
        assert_eq!(update.html.as_deref(), Some("nice one"));
        assert_eq!(update.image, None);
        assert_eq!(update.link, None);
    }
}
