pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod fetcher;
pub mod pipeline;
pub mod publish;
pub mod reconcile;
pub mod render;
pub mod sources;
pub mod store;
pub mod types;

pub use auth::AuthCache;
pub use config::{Cli, RelayConfig};
pub use dispatcher::{load_proxy_routes, DispatcherPool, Route};
pub use fetcher::FetchExecutor;
pub use pipeline::PollLoop;
pub use publish::{DiscordForum, ForumSink};
pub use reconcile::Reconciler;
pub use sources::{DiscourseSource, RedditSource};
pub use store::{KvStore, MemoryStore, SqliteStore};
pub use types::*;
