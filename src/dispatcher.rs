use crate::types::{RelayError, Result};
use rand::seq::SliceRandom;
use reqwest::{Client, Proxy};
use serde::Deserialize;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Delay before a healthy route goes back into rotation after a release.
pub const IDLE_RELEASE_DELAY: Duration = Duration::from_millis(1_000);
/// Backoff applied to a route on its first consecutive failure.
pub const BASE_ERROR_WAIT: Duration = Duration::from_millis(30_000);
/// Ceiling for a route's backoff regardless of failure count.
pub const MAX_ERROR_WAIT: Duration = Duration::from_millis(300_000);
const ERROR_WAIT_MULTIPLIER: u32 = 2;

/// One network egress path with its own health state. Built once at
/// startup; exclusively owned by the pool and moved out on checkout.
pub struct Route {
    name: String,
    client: Client,
    backoff: Option<Duration>,
}

impl Route {
    /// The route that uses the host's own address.
    pub fn direct(user_agent: &str) -> Result<Self> {
        Ok(Self {
            name: "direct".to_string(),
            client: base_client(user_agent).build()?,
            backoff: None,
        })
    }

    /// A route through an HTTP proxy given as `host:port` or
    /// `host:port:user:pass`. Any other shape is a configuration error.
    pub fn proxied(index: usize, entry: &str, user_agent: &str) -> Result<Self> {
        let parts: Vec<&str> = entry.split(':').collect();
        if parts.len() != 2 && parts.len() != 4 {
            return Err(RelayError::InvalidProxy(format!(
                "expected 2 (host,port) or 4 parts (host,port,user,pass) for proxy {entry}"
            )));
        }

        let mut proxy = Proxy::all(format!("http://{}:{}", parts[0], parts[1]))?;
        if parts.len() == 4 {
            proxy = proxy.basic_auth(parts[2], parts[3]);
        }

        Ok(Self {
            name: format!("proxy #{} ({}:{})", index, parts[0], parts[1]),
            client: base_client(user_agent).proxy(proxy).build()?,
            backoff: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Current backoff, absent while the route is healthy.
    pub fn backoff(&self) -> Option<Duration> {
        self.backoff
    }
}

fn base_client(user_agent: &str) -> reqwest::ClientBuilder {
    Client::builder()
        .user_agent(user_agent)
        .gzip(true)
        .deflate(true)
        .brotli(true)
}

/// On-disk proxy configuration: either the list itself or a URL serving a
/// newline-separated list.
#[derive(Deserialize)]
#[serde(untagged)]
enum ProxyFile {
    List(Vec<String>),
    Remote {
        #[serde(rename = "proxyFetchUrl")]
        proxy_fetch_url: String,
    },
}

/// Load proxy routes from a JSON file, resolving a remote list if the file
/// points at one. The result is shuffled so startup order does not always
/// favor the same proxies.
pub async fn load_proxy_routes(path: &Path, user_agent: &str) -> Result<Vec<Route>> {
    let raw = tokio::fs::read_to_string(path).await?;
    let entries = match serde_json::from_str::<ProxyFile>(&raw)? {
        ProxyFile::List(entries) => entries,
        ProxyFile::Remote { proxy_fetch_url } => {
            info!(url = %proxy_fetch_url, "fetching proxy list");
            let body = reqwest::get(&proxy_fetch_url).await?.text().await?;
            body.trim().lines().map(str::to_string).collect()
        }
    };

    info!("adding {} proxies", entries.len());

    let mut routes = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        routes.push(Route::proxied(i + 1, entry, user_agent)?);
    }
    routes.shuffle(&mut rand::thread_rng());
    Ok(routes)
}

struct PoolState {
    ready: VecDeque<Route>,
    waiters: VecDeque<oneshot::Sender<Route>>,
}

/// Owns every egress route and hands them out one caller at a time.
///
/// Checkout favors the most recently released route (released routes go to
/// the front of the ready queue). Callers that find the pool empty suspend
/// and are resumed in FIFO order as routes come back.
pub struct DispatcherPool {
    state: Mutex<PoolState>,
    route_count: usize,
}

impl DispatcherPool {
    pub fn new(routes: Vec<Route>) -> Arc<Self> {
        let route_count = routes.len();
        Arc::new(Self {
            state: Mutex::new(PoolState {
                ready: routes.into(),
                waiters: VecDeque::new(),
            }),
            route_count,
        })
    }

    /// Take exclusive ownership of a route, waiting if none is available.
    pub async fn checkout(&self) -> Result<Route> {
        let rx = {
            let mut state = self.lock();
            if let Some(route) = state.ready.pop_front() {
                return Ok(route);
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };
        rx.await
            .map_err(|_| RelayError::General("dispatcher pool shut down".to_string()))
    }

    /// Return a route after one request. On error the route's backoff
    /// doubles (seeded at the base wait), is raised to at least
    /// `min_wait` when a rate-limit hint was seen, and is capped at the
    /// maximum; on success it clears. The route re-enters rotation only
    /// after that delay elapses.
    pub fn release(self: &Arc<Self>, mut route: Route, had_error: bool, min_wait: Option<Duration>) {
        if had_error {
            let doubled = route
                .backoff
                .map(|b| b * ERROR_WAIT_MULTIPLIER)
                .unwrap_or(BASE_ERROR_WAIT);
            let next = doubled
                .max(min_wait.unwrap_or(Duration::ZERO))
                .min(MAX_ERROR_WAIT);
            route.backoff = Some(next);
            warn!(
                route = %route.name,
                wait_secs = next.as_secs(),
                "error with dispatcher route, backing off"
            );
        } else if route.backoff.take().is_some() {
            info!(route = %route.name, "route recovered");
        }

        let delay = route.backoff.unwrap_or(IDLE_RELEASE_DELAY);
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            pool.make_ready(route);
        });
    }

    /// Routes ready for immediate checkout.
    pub fn ready_len(&self) -> usize {
        self.lock().ready.len()
    }

    /// Callers currently suspended waiting for a route.
    pub fn waiting_len(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Total routes owned by the pool, wherever they currently are.
    pub fn route_count(&self) -> usize {
        self.route_count
    }

    fn make_ready(&self, mut route: Route) {
        let mut state = self.lock();
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(route) {
                Ok(()) => return,
                // Waiter gave up before a route arrived; try the next one.
                Err(returned) => route = returned,
            }
        }
        debug!(route = %route.name, "route available");
        state.ready.push_front(route);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_route(name: &str) -> Route {
        Route {
            name: name.to_string(),
            client: Client::new(),
            backoff: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_and_caps() {
        let pool = DispatcherPool::new(vec![plain_route("r")]);

        let mut expected = BASE_ERROR_WAIT;
        for _ in 0..6 {
            let route = pool.checkout().await.unwrap();
            pool.release(route, true, None);
            let route = pool.checkout().await.unwrap();
            assert_eq!(route.backoff(), Some(expected));
            // Put it back untouched for the next round of failures.
            pool.make_ready(route);
            expected = (expected * 2).min(MAX_ERROR_WAIT);
        }

        // A single success clears the backoff entirely.
        let route = pool.checkout().await.unwrap();
        pool.release(route, false, None);
        let route = pool.checkout().await.unwrap();
        assert_eq!(route.backoff(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_hint_raises_backoff_floor() {
        let pool = DispatcherPool::new(Vec::new());
        let mut route = plain_route("r");
        route.backoff = Some(Duration::from_millis(5_000));

        // Doubled to 10s, and the Retry-After floor of 10s does not push
        // it past the cap.
        pool.release(route, true, Some(Duration::from_secs(10)));
        let route = pool.checkout().await.unwrap();
        assert_eq!(route.backoff(), Some(Duration::from_secs(10)));

        // A hint above the cap is clamped down to it.
        pool.release(route, true, Some(MAX_ERROR_WAIT * 3));
        let route = pool.checkout().await.unwrap();
        assert_eq!(route.backoff(), Some(MAX_ERROR_WAIT));
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_resume_in_fifo_order() {
        let pool = DispatcherPool::new(vec![plain_route("only")]);

        let held = pool.checkout().await.unwrap();

        let first = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.checkout().await.unwrap().name().to_string() }
        });
        tokio::task::yield_now().await;
        let second = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.checkout().await.unwrap().name().to_string() }
        });
        tokio::task::yield_now().await;
        assert_eq!(pool.waiting_len(), 2);

        pool.release(held, false, None);
        let name = first.await.unwrap();
        assert_eq!(name, "only");
        assert_eq!(pool.waiting_len(), 1);

        // Hand the route back so the second waiter gets its turn.
        let mut route = plain_route("only");
        route.name = name;
        pool.make_ready(route);
        assert_eq!(second.await.unwrap(), "only");
    }
}
