use crate::publish::ForumSink;
use crate::render::render_update;
use crate::store::KvStore;
use crate::types::{RelayError, Result, SourceKind, TopicRecord, Update};
use std::sync::Arc;
use tracing::{error, info, warn};

fn topic_key(kind: SourceKind, topic_id: &str) -> String {
    format!("topic/{kind}/{topic_id}")
}

/// Merges the updates of one poll pass into destination threads, at most
/// once per update id, persisting progress after every publish.
pub struct Reconciler {
    store: Arc<dyn KvStore>,
    sink: Arc<dyn ForumSink>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn KvStore>, sink: Arc<dyn ForumSink>) -> Self {
        Self { store, sink }
    }

    /// Publish all updates in ascending timestamp order (stable, so ties
    /// keep fetch order). A failure on one update is logged and does not
    /// stop the rest.
    pub async fn reconcile(&self, mut updates: Vec<Update>) {
        updates.sort_by_key(|update| update.time);

        for update in &updates {
            if let Err(err) = self.apply(update).await {
                error!(url = %update.url, error = %err, "failed to send update");
            }
        }
    }

    async fn apply(&self, update: &Update) -> Result<()> {
        let key = topic_key(update.kind, &update.topic_id);
        let store = self.store.as_ref();
        let record: Option<TopicRecord> = store.get_json(&key).await?;

        let blocks = render_update(update);
        let Some((first, rest)) = blocks.split_first() else {
            return Ok(());
        };

        match record {
            None => {
                let thread_id = self
                    .sink
                    .create_thread(&update.topic_title, update.kind, first)
                    .await?;
                for block in rest {
                    self.sink.append(&thread_id, block).await?;
                }
                info!(thread_id = %thread_id, url = %update.url, "created topic thread");
                store
                    .put_json(
                        &key,
                        &TopicRecord {
                            thread_id,
                            updates: vec![update.id.clone()],
                        },
                    )
                    .await?;
            }
            Some(mut record) if !record.updates.contains(&update.id) => {
                for block in &blocks {
                    match self.sink.append(&record.thread_id, block).await {
                        Err(RelayError::ThreadMissing(thread_id)) => {
                            warn!(
                                thread_id = %thread_id,
                                url = %update.url,
                                "thread no longer exists"
                            );
                            return Ok(());
                        }
                        other => other?,
                    }
                }
                record.updates.push(update.id.clone());
                store.put_json(&key, &record).await?;
            }
            Some(record) => {
                warn!(
                    url = %update.url,
                    thread_id = %record.thread_id,
                    "update already posted, skipping"
                );
            }
        }

        Ok(())
    }
}
