use crate::dispatcher::DispatcherPool;
use crate::types::{RelayError, Result};
use reqwest::header::RETRY_AFTER;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Per-attempt timeout; an attempt that exceeds it is aborted and retried.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(120);
/// Attempts per logical request before giving up.
pub const MAX_ATTEMPTS: usize = 5;

/// Classifier verdicts that end a request early instead of counting the
/// response as a hard failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortCircuit {
    /// Credentials were rejected; the caller should refresh and retry once.
    Reauth,
    /// The target resource no longer exists.
    Gone,
}

/// Inspects an error status and decides whether to short-circuit.
pub type ErrorClassifier = dyn Fn(StatusCode) -> Option<ShortCircuit> + Send + Sync;

/// Classifier for endpoints with no short-circuit conditions.
pub fn no_short_circuit(_: StatusCode) -> Option<ShortCircuit> {
    None
}

/// Outcome of one logical fetch: either the decoded payload or a verdict
/// from the caller's error classifier.
#[derive(Debug)]
pub enum Fetched<T> {
    Payload(T),
    ShortCircuit(ShortCircuit),
}

impl<T> Fetched<T> {
    /// Unwrap the payload, treating any short-circuit as an error. For
    /// endpoints where the classifier never fires.
    pub fn into_payload(self) -> Result<T> {
        match self {
            Fetched::Payload(payload) => Ok(payload),
            Fetched::ShortCircuit(ShortCircuit::Reauth) => Err(RelayError::Unauthorized),
            Fetched::ShortCircuit(ShortCircuit::Gone) => {
                Err(RelayError::General("resource gone".to_string()))
            }
        }
    }
}

/// One logical HTTP request, independent of which route carries it.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: Url,
    pub method: Method,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub bearer: Option<String>,
    pub basic_auth: Option<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl FetchRequest {
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: Url) -> Self {
        Self::new(Method::POST, url)
    }

    fn new(method: Method, url: Url) -> Self {
        Self {
            url,
            method,
            query: Vec::new(),
            headers: Vec::new(),
            bearer: None,
            basic_auth: None,
            body: None,
        }
    }

    /// Append a query parameter; `None` values are skipped.
    pub fn query(mut self, key: &str, value: Option<impl Into<String>>) -> Self {
        if let Some(value) = value {
            self.query.push((key.to_string(), value.into()));
        }
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.push((key.to_string(), value.into()));
        self
    }

    pub fn bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    pub fn basic_auth(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.basic_auth = Some((user.into(), pass.into()));
        self
    }

    pub fn json_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Executes logical requests over the route pool: checkout, attempt with a
/// timeout, classify, release with failure/success semantics, retry across
/// routes up to the attempt budget.
pub struct FetchExecutor {
    pool: Arc<DispatcherPool>,
}

impl FetchExecutor {
    pub fn new(pool: Arc<DispatcherPool>) -> Self {
        Self { pool }
    }

    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        request: &FetchRequest,
        classify: &ErrorClassifier,
    ) -> Result<Fetched<T>> {
        debug!(url = %request.url, "fetching");

        let mut last_error: Option<RelayError> = None;
        for attempt in 0..MAX_ATTEMPTS {
            let route = self.pool.checkout().await?;
            let mut rate_limit_floor = None;

            match self.attempt(&route, request, classify, &mut rate_limit_floor).await {
                Ok(fetched) => {
                    self.pool.release(route, false, None);
                    return Ok(fetched);
                }
                Err(err) => {
                    warn!(
                        route = route.name(),
                        attempt = attempt + 1,
                        error = %err,
                        "fetch attempt failed"
                    );
                    last_error = Some(err);
                    self.pool.release(route, true, rate_limit_floor);
                }
            }
        }

        Err(RelayError::RetriesExhausted(
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempts made".to_string()),
        ))
    }

    async fn attempt<T: DeserializeOwned>(
        &self,
        route: &crate::dispatcher::Route,
        request: &FetchRequest,
        classify: &ErrorClassifier,
        rate_limit_floor: &mut Option<Duration>,
    ) -> Result<Fetched<T>> {
        let mut builder = route
            .client()
            .request(request.method.clone(), request.url.clone())
            .timeout(FETCH_TIMEOUT)
            .header(reqwest::header::ACCEPT, "application/json");

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some((user, pass)) = &request.basic_auth {
            builder = builder.basic_auth(user, Some(pass));
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();

        if !status.is_success() {
            if let Some(verdict) = classify(status) {
                return Ok(Fetched::ShortCircuit(verdict));
            }
            if status == StatusCode::TOO_MANY_REQUESTS {
                *rate_limit_floor = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_retry_after);
            }
            return Err(RelayError::Status(status));
        }

        Ok(Fetched::Payload(response.json::<T>().await?))
    }
}

/// Parse a `Retry-After` value given in (possibly fractional) seconds.
/// Values a `Duration` cannot hold (negative, non-finite, absurdly large)
/// are ignored rather than trusted.
fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs: f64 = value.trim().parse().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_parses_seconds() {
        assert_eq!(parse_retry_after("10"), Some(Duration::from_secs(10)));
        assert_eq!(
            parse_retry_after("1.5"),
            Some(Duration::from_secs_f64(1.5))
        );
        assert_eq!(parse_retry_after("soon"), None);
        assert_eq!(parse_retry_after("-3"), None);
        assert_eq!(parse_retry_after("nan"), None);
        // A server-controlled header must not be able to overflow Duration.
        assert_eq!(parse_retry_after("1e300"), None);
    }

    #[test]
    fn short_circuit_maps_to_domain_errors() {
        let gone: Fetched<()> = Fetched::ShortCircuit(ShortCircuit::Gone);
        assert!(gone.into_payload().is_err());

        let reauth: Fetched<()> = Fetched::ShortCircuit(ShortCircuit::Reauth);
        assert!(matches!(
            reauth.into_payload(),
            Err(RelayError::Unauthorized)
        ));
    }
}
