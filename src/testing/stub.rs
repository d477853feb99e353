//! In-process stand-in for identity provider endpoints

use crate::oauth::transport::{ProviderRequest, ProviderResponse, ProviderTransport, TransportError};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Canned responses keyed by URL (query string ignored)
///
/// A response set with [`respond`](Self::respond) is returned for every
/// request to that URL until replaced. Failures queued with
/// [`fail_next`](Self::fail_next) take precedence and are used once each.
/// Unknown URLs answer 404. Every request is logged.
#[derive(Default)]
pub struct StubTransport {
    responses: Mutex<HashMap<String, ProviderResponse>>,
    failures: Mutex<HashMap<String, VecDeque<TransportError>>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

fn route(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

impl StubTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Panics
    ///
    /// Panics if the stub's lock is poisoned
    pub fn respond(&self, url: &str, status: u16, body: &str) {
        self.responses.lock().unwrap().insert(
            route(url).to_string(),
            ProviderResponse {
                status,
                body: body.to_string(),
            },
        );
    }

    /// # Panics
    ///
    /// Panics if the stub's lock is poisoned
    pub fn fail_next(&self, url: &str, error: TransportError) {
        self.failures
            .lock()
            .unwrap()
            .entry(route(url).to_string())
            .or_default()
            .push_back(error);
    }

    /// # Panics
    ///
    /// Panics if the stub's lock is poisoned
    #[must_use]
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }

    #[must_use]
    pub fn request_count(&self, url: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| route(&r.url) == route(url))
            .count()
    }

    #[must_use]
    pub fn last_request(&self, url: &str) -> Option<ProviderRequest> {
        self.requests()
            .into_iter()
            .rev()
            .find(|r| route(&r.url) == route(url))
    }
}

#[async_trait]
impl ProviderTransport for StubTransport {
    async fn send(&self, request: ProviderRequest) -> Result<ProviderResponse, TransportError> {
        let key = route(&request.url).to_string();
        self.requests.lock().unwrap().push(request);

        if let Some(error) = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }

        Ok(self
            .responses
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or(ProviderResponse {
                status: 404,
                body: String::new(),
            }))
    }
}
