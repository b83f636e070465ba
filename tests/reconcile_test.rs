use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use forum_relay::{
    ForumSink, KvStore, MemoryStore, Reconciler, RelayError, RenderedBlock, SourceKind,
    TopicRecord, Update,
};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq)]
enum SinkCall {
    Create { title: String, kind: SourceKind },
    Append { thread_id: String, title: String },
}

/// Records publish calls; `fail_append_with_missing` simulates a vanished
/// destination thread.
#[derive(Default)]
struct RecordingSink {
    calls: Mutex<Vec<SinkCall>>,
    next_thread: Mutex<u64>,
    fail_append_with_missing: bool,
    fail_create_for: Option<String>,
}

impl RecordingSink {
    fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ForumSink for RecordingSink {
    async fn create_thread(
        &self,
        title: &str,
        kind: SourceKind,
        _first: &RenderedBlock,
    ) -> Result<String, RelayError> {
        if self.fail_create_for.as_deref() == Some(title) {
            return Err(RelayError::General("create rejected".to_string()));
        }
        self.calls.lock().unwrap().push(SinkCall::Create {
            title: title.to_string(),
            kind,
        });
        let mut next = self.next_thread.lock().unwrap();
        *next += 1;
        Ok(format!("thread-{}", *next))
    }

    async fn append(
        &self,
        thread_id: &str,
        block: &RenderedBlock,
    ) -> Result<(), RelayError> {
        if self.fail_append_with_missing {
            return Err(RelayError::ThreadMissing(thread_id.to_string()));
        }
        self.calls.lock().unwrap().push(SinkCall::Append {
            thread_id: thread_id.to_string(),
            title: block.title.clone(),
        });
        Ok(())
    }
}

fn update(id: &str, topic_id: &str, time: DateTime<Utc>) -> Update {
    Update {
        kind: SourceKind::Reddit,
        id: id.to_string(),
        topic_id: topic_id.to_string(),
        topic_title: format!("topic {topic_id}"),
        url: format!("https://www.reddit.com/r/example/{id}"),
        time,
        author: "alice".to_string(),
        author_url: "https://www.reddit.com/u/alice".to_string(),
        author_image: None,
        html: None,
        text: Some(format!("body of {id}")),
        link: None,
        image: None,
    }
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

#[tokio::test]
async fn first_update_creates_thread_and_record() {
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let sink = Arc::new(RecordingSink::default());
    let reconciler = Reconciler::new(Arc::clone(&store), sink.clone());

    reconciler.reconcile(vec![update("t3_a", "t3_a", at(0))]).await;

    assert_eq!(
        sink.calls(),
        vec![SinkCall::Create {
            title: "topic t3_a".to_string(),
            kind: SourceKind::Reddit,
        }]
    );

    let record: Option<TopicRecord> = store.get_json("topic/reddit/t3_a").await.unwrap();
    let record = record.expect("record persisted");
    assert_eq!(record.thread_id, "thread-1");
    assert_eq!(record.updates, vec!["t3_a".to_string()]);
}

#[tokio::test]
async fn updates_publish_in_ascending_time_order() {
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let sink = Arc::new(RecordingSink::default());
    let reconciler = Reconciler::new(Arc::clone(&store), sink.clone());

    reconciler
        .reconcile(vec![
            update("c", "tc", at(30)),
            update("a", "ta", at(10)),
            update("b", "tb", at(20)),
        ])
        .await;

    let titles: Vec<String> = sink
        .calls()
        .into_iter()
        .map(|call| match call {
            SinkCall::Create { title, .. } => title,
            SinkCall::Append { title, .. } => title,
        })
        .collect();
    assert_eq!(titles, vec!["topic ta", "topic tb", "topic tc"]);
}

#[tokio::test]
async fn replayed_update_is_skipped_without_publishing() {
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    store
        .put_json(
            "topic/reddit/t3_a",
            &TopicRecord {
                thread_id: "thread-9".to_string(),
                updates: vec!["t3_a".to_string()],
            },
        )
        .await
        .unwrap();

    let sink = Arc::new(RecordingSink::default());
    let reconciler = Reconciler::new(Arc::clone(&store), sink.clone());

    reconciler.reconcile(vec![update("t3_a", "t3_a", at(0))]).await;

    assert!(sink.calls().is_empty(), "duplicate must not publish");
    let record: Option<TopicRecord> = store.get_json("topic/reddit/t3_a").await.unwrap();
    assert_eq!(record.unwrap().updates, vec!["t3_a".to_string()]);
}

#[tokio::test]
async fn same_pass_duplicate_publishes_once() {
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let sink = Arc::new(RecordingSink::default());
    let reconciler = Reconciler::new(Arc::clone(&store), sink.clone());

    // The same update arrives twice in one pass (feed overlap).
    reconciler
        .reconcile(vec![
            update("t3_u1", "t3_t1", at(0)),
            update("t3_u1", "t3_t1", at(0)),
        ])
        .await;

    let creates = sink
        .calls()
        .iter()
        .filter(|call| matches!(call, SinkCall::Create { .. }))
        .count();
    assert_eq!(creates, 1);
}

#[tokio::test]
async fn later_update_appends_to_existing_thread() {
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let sink = Arc::new(RecordingSink::default());
    let reconciler = Reconciler::new(Arc::clone(&store), sink.clone());

    reconciler.reconcile(vec![update("t3_p", "t3_p", at(0))]).await;
    reconciler.reconcile(vec![update("t1_c", "t3_p", at(5))]).await;

    let calls = sink.calls();
    assert_eq!(calls.len(), 2);
    assert!(matches!(&calls[1], SinkCall::Append { thread_id, .. } if thread_id == "thread-1"));

    let record: Option<TopicRecord> = store.get_json("topic/reddit/t3_p").await.unwrap();
    assert_eq!(
        record.unwrap().updates,
        vec!["t3_p".to_string(), "t1_c".to_string()]
    );
}

#[tokio::test]
async fn vanished_thread_is_logged_not_recorded() {
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    store
        .put_json(
            "topic/reddit/t3_p",
            &TopicRecord {
                thread_id: "thread-gone".to_string(),
                updates: vec!["t3_p".to_string()],
            },
        )
        .await
        .unwrap();

    let sink = Arc::new(RecordingSink {
        fail_append_with_missing: true,
        ..Default::default()
    });
    let reconciler = Reconciler::new(Arc::clone(&store), sink.clone());

    reconciler.reconcile(vec![update("t1_c", "t3_p", at(5))]).await;

    // The update id is not recorded, so a later pass could retry it.
    let record: Option<TopicRecord> = store.get_json("topic/reddit/t3_p").await.unwrap();
    assert_eq!(record.unwrap().updates, vec!["t3_p".to_string()]);
}

#[tokio::test]
async fn one_failing_update_does_not_stop_the_rest() {
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let sink = Arc::new(RecordingSink {
        fail_create_for: Some("topic bad".to_string()),
        ..Default::default()
    });
    let reconciler = Reconciler::new(Arc::clone(&store), sink.clone());

    reconciler
        .reconcile(vec![update("u1", "bad", at(0)), update("u2", "good", at(1))])
        .await;

    // The second topic still got its thread.
    assert!(sink
        .calls()
        .iter()
        .any(|call| matches!(call, SinkCall::Create { title, .. } if title == "topic good")));
}
