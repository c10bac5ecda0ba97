//! Scripted [`Fetch`] double for deterministic worker tests.
//!
//! Unknown URLs fail as if the network were unreachable.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderValue, StatusCode};

use crate::{Fetch, FetchRequest, FetchResponse, NetError};

#[derive(Debug, Clone)]
enum Scripted {
    Respond {
        status: StatusCode,
        body: Bytes,
        content_type: Option<&'static str>,
    },
    Fail,
}

#[derive(Debug, Default)]
struct MockState {
    routes: HashMap<String, Scripted>,
    calls: HashMap<String, usize>,
    offline: bool,
    delay: Option<Duration>,
}

/// A network whose answers are set up ahead of time.
#[derive(Debug, Default)]
pub struct MockFetcher {
    state: Mutex<MockState>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answer `url` with a 200 and `body`.
    pub fn respond(&self, url: &str, body: impl Into<Bytes>) {
        self.respond_with(url, StatusCode::OK, body);
    }

    /// Answer `url` with an arbitrary status.
    pub fn respond_with(&self, url: &str, status: StatusCode, body: impl Into<Bytes>) {
        self.state().routes.insert(
            url.to_string(),
            Scripted::Respond {
                status,
                body: body.into(),
                content_type: None,
            },
        );
    }

    /// Answer `url` with a 200, `body` and a content type header.
    pub fn respond_typed(&self, url: &str, content_type: &'static str, body: impl Into<Bytes>) {
        self.state().routes.insert(
            url.to_string(),
            Scripted::Respond {
                status: StatusCode::OK,
                body: body.into(),
                content_type: Some(content_type),
            },
        );
    }

    /// Make `url` fail with a transport error.
    pub fn fail(&self, url: &str) {
        self.state().routes.insert(url.to_string(), Scripted::Fail);
    }

    /// Fail every request while set.
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Delay every answer.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state().delay = delay;
    }

    /// Number of fetches issued for `url`.
    pub fn calls(&self, url: &str) -> usize {
        self.state().calls.get(url).copied().unwrap_or(0)
    }

    /// Number of fetches issued overall.
    pub fn total_calls(&self) -> usize {
        self.state().calls.values().sum()
    }
}

#[async_trait]
impl Fetch for MockFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, NetError> {
        let key = request.url.to_string();
        let (scripted, offline, delay) = {
            let mut state = self.state();
            *state.calls.entry(key.clone()).or_default() += 1;
            (state.routes.get(&key).cloned(), state.offline, state.delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if offline {
            return Err(NetError::Offline);
        }

        match scripted {
            Some(Scripted::Respond {
                status,
                body,
                content_type,
            }) => {
                let mut response = FetchResponse::new(request.url.clone(), status, body);
                if let Some(content_type) = content_type {
                    response
                        .headers
                        .insert(http::header::CONTENT_TYPE, HeaderValue::from_static(content_type));
                }
                Ok(response)
            }
            Some(Scripted::Fail) | None => {
                Err(NetError::RequestFailed(format!("no route to {key}")))
            }
        }
    }
}
