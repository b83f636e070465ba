use crate::reconcile::Reconciler;
use crate::sources::{DiscourseSource, RedditSource};
use crate::store::KvStore;
use crate::types::{PollCursor, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

const POLL_CURSOR_KEY: &str = "poll";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollState {
    Idle,
    Polling,
}

/// Gate in front of the pass task: a tick that lands while a pass is
/// still running is skipped, not queued. The guard returns the gate to
/// idle on drop, so even a pass that panics cannot wedge the loop.
struct PassGate {
    state: Mutex<PollState>,
}

impl PassGate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PollState::Idle),
        })
    }

    /// Transition Idle -> Polling; `None` when a pass is already running.
    fn begin(self: &Arc<Self>) -> Option<PassGuard> {
        let mut state = self.lock();
        if *state == PollState::Polling {
            return None;
        }
        *state = PollState::Polling;
        Some(PassGuard {
            gate: Arc::clone(self),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PollState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

struct PassGuard {
    gate: Arc<PassGate>,
}

impl Drop for PassGuard {
    fn drop(&mut self) {
        *self.gate.lock() = PollState::Idle;
    }
}

/// Drives one pipeline pass per interval: read cursor, fetch every source,
/// reconcile, write cursor. A failed pass is logged and the loop returns
/// to idle so the next tick can retry.
pub struct PollLoop {
    reddit: Arc<RedditSource>,
    discourse: Arc<DiscourseSource>,
    reconciler: Arc<Reconciler>,
    store: Arc<dyn KvStore>,
    interval: Duration,
    gate: Arc<PassGate>,
}

impl PollLoop {
    pub fn new(
        reddit: Arc<RedditSource>,
        discourse: Arc<DiscourseSource>,
        reconciler: Arc<Reconciler>,
        store: Arc<dyn KvStore>,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            reddit,
            discourse,
            reconciler,
            store,
            interval,
            gate: PassGate::new(),
        })
    }

    /// Run forever. Each pass executes on its own task so a slow pass
    /// never blocks the ticker; the gate keeps passes from overlapping.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let Some(guard) = self.gate.begin() else {
                debug!("previous pass still running, skipping tick");
                continue;
            };

            let this = Arc::clone(&self);
            tokio::spawn(async move {
                let _running = guard;
                if let Err(err) = this.pass().await {
                    error!(error = %err, "poll pass failed");
                }
            });
        }
    }

    async fn pass(&self) -> Result<()> {
        debug!("updating...");
        let store = self.store.as_ref();
        let cursor: PollCursor = store.get_json(POLL_CURSOR_KEY).await?.unwrap_or_default();

        let (posts, newest_post) = self.reddit.fetch_posts(cursor.reddit_id.as_deref()).await?;
        let (comments, newest_comment) = self
            .reddit
            .fetch_comments(cursor.reddit_comment_id.as_deref())
            .await?;
        let (latest, newest_discourse) = self.discourse.fetch_latest(cursor.discourse_id).await?;

        let mut updates = posts;
        updates.extend(comments);
        updates.extend(latest);
        self.reconciler.reconcile(updates).await;

        // Sources that saw nothing new keep their previous cursor.
        let next = PollCursor {
            reddit_id: newest_post.or(cursor.reddit_id),
            reddit_comment_id: newest_comment.or(cursor.reddit_comment_id),
            discourse_id: newest_discourse.or(cursor.discourse_id),
        };
        store.put_json(POLL_CURSOR_KEY, &next).await?;

        debug!("done update");
        Ok(())
    }
}
