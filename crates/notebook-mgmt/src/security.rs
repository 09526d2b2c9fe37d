use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

const MAX_FAILURES: u32 = 5;
const FAILURE_WINDOW: Duration = Duration::from_secs(60);
const LOCKOUT: Duration = Duration::from_secs(60);

pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes()
        .iter()
        .zip(b.as_bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Pull the secret out of an `Authorization: Bearer <secret>` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    header.strip_prefix("Bearer ").map(str::trim)
}

struct FailureEntry {
    failures: u32,
    first_failure: Instant,
    locked_until: Option<Instant>,
}

/// Locks a client out after repeated bad secrets.
pub struct AuthRateLimiter {
    inner: Mutex<HashMap<String, FailureEntry>>,
}

impl AuthRateLimiter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, FailureEntry>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns true once the client is locked out.
    pub fn record_failure(&self, client: &str) -> bool {
        let now = Instant::now();
        let mut inner = self.lock();
        let entry = inner.entry(client.to_string()).or_insert(FailureEntry {
            failures: 0,
            first_failure: now,
            locked_until: None,
        });
        if entry.first_failure + FAILURE_WINDOW < now {
            entry.failures = 0;
            entry.first_failure = now;
        }
        entry.failures += 1;
        if entry.failures >= MAX_FAILURES {
            entry.locked_until = Some(now + LOCKOUT);
            tracing::warn!(
                "Client {} locked out after {} failed auth attempts",
                client,
                entry.failures
            );
        }
        entry.locked_until.is_some()
    }

    pub fn is_rate_limited(&self, client: &str) -> bool {
        self.lock()
            .get(client)
            .and_then(|entry| entry.locked_until)
            .map(|until| until > Instant::now())
            .unwrap_or(false)
    }

    pub fn prune(&self) {
        let now = Instant::now();
        self.lock().retain(|_, entry| {
            let window_open = entry.first_failure + FAILURE_WINDOW * 2 > now;
            let locked = entry.locked_until.map(|until| until > now).unwrap_or(false);
            window_open || locked
        });
    }
}

impl Default for AuthRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn security_headers_middleware(
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    use axum::http::header::{
        CACHE_CONTROL, REFERRER_POLICY, X_CONTENT_TYPE_OPTIONS, X_FRAME_OPTIONS,
    };
    use axum::http::HeaderValue;

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(REFERRER_POLICY, HeaderValue::from_static("no-referrer"));
    response
}
