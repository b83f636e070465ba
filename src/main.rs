use clap::Parser;
use forum_relay::{
    load_proxy_routes, AuthCache, Cli, DiscordForum, DiscourseSource, DispatcherPool,
    FetchExecutor, ForumSink, KvStore, PollLoop, Reconciler, RedditSource, RelayConfig, Route,
    SqliteStore,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = RelayConfig::from_env()?;
    if let Some(secs) = cli.poll_interval_secs {
        config.poll_interval = Duration::from_secs(secs);
    }

    info!("starting forum relay");

    let mut routes = vec![Route::direct(&config.user_agent)?];
    if let Some(path) = &cli.proxies {
        routes.extend(load_proxy_routes(path, &config.user_agent).await?);
    }
    info!(routes = routes.len(), "dispatcher pool ready");

    let pool = DispatcherPool::new(routes);
    let executor = Arc::new(FetchExecutor::new(pool));

    let store: Arc<dyn KvStore> = Arc::new(SqliteStore::open(&cli.database).await?);

    let auth = Arc::new(AuthCache::new(
        Arc::clone(&executor),
        config.reddit.clone(),
        config.reddit_token_url()?,
    ));
    let reddit = Arc::new(RedditSource::new(
        Arc::clone(&executor),
        auth,
        Arc::clone(&store),
        config.reddit_base.clone(),
        config.reddit_oauth_base.clone(),
    ));
    let discourse = Arc::new(DiscourseSource::new(
        Arc::clone(&executor),
        config.discourse_base.clone(),
    ));

    let sink: Arc<dyn ForumSink> = Arc::new(DiscordForum::new(
        Arc::clone(&executor),
        config.discord_api_base.clone(),
        config.discord_token.clone(),
        config.forum_channel.clone(),
        config.forum_reddit_tag.clone(),
        config.forum_discourse_tag.clone(),
    ));
    let reconciler = Arc::new(Reconciler::new(Arc::clone(&store), sink));

    let poll = PollLoop::new(reddit, discourse, reconciler, store, config.poll_interval);
    poll.run().await;

    Ok(())
}
