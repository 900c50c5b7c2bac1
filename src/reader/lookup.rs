// ABOUTME: Discovery polling against a lookup service - pluggable HTTP client via LookupClient
// ABOUTME: Default implementation uses reqwest + serde_json; trait uses native async fn, no macro

use rand::seq::SliceRandom;
use serde::Deserialize;
use std::future::Future;
use tracing::{debug, warn};

/// A broker endpoint as reported by the lookup service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    producers: Vec<Producer>,
}

#[derive(Debug, Deserialize)]
struct Producer {
    broadcast_address: String,
    tcp_port: u16,
}

/// The HTTP seam the Reader's discovery polling goes through, so
/// application code can supply its own transport (§4.5). Uses a native
/// async fn in the trait rather than pulling in `async_trait`; `Reader` is
/// generic over this trait rather than storing a trait object.
pub trait LookupClient: Send + Sync {
    fn lookup(
        &self,
        endpoint: &str,
        topic: &str,
    ) -> impl Future<Output = Vec<BrokerAddress>> + Send;
}

/// Default `LookupClient`: `GET {endpoint}/lookup?topic=T`, deserialized
/// with `serde_json`. Network errors are logged and treated as "no
/// producers found" rather than propagated, matching §4.5 ("never fatal to
/// the Reader").
#[derive(Debug, Default, Clone)]
pub struct HttpLookupClient {
    http: reqwest::Client,
}

impl HttpLookupClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl LookupClient for HttpLookupClient {
    async fn lookup(&self, endpoint: &str, topic: &str) -> Vec<BrokerAddress> {
        let url = format!("{}/lookup?topic={}", endpoint.trim_end_matches('/'), topic);
        let response = match self.http.get(&url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(endpoint, error = %e, "lookup request failed");
                return Vec::new();
            }
        };

        let parsed: LookupResponse = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                warn!(endpoint, error = %e, "lookup response was not valid JSON");
                return Vec::new();
            }
        };

        parsed
            .producers
            .into_iter()
            .map(|p| BrokerAddress {
                host: p.broadcast_address,
                port: p.tcp_port,
            })
            .collect()
    }
}

/// Polls one randomly-chosen lookup endpoint from `endpoints` rather than
/// querying all of them, spreading load across a lookupd cluster over time.
pub async fn poll<C: LookupClient>(
    client: &C,
    endpoints: &[String],
    topic: &str,
) -> Vec<BrokerAddress> {
    let Some(endpoint) = endpoints.choose(&mut rand::thread_rng()) else {
        return Vec::new();
    };
    debug!(endpoint, topic, "polling lookup service");
    client.lookup(endpoint, topic).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeClient {
        calls: Arc<AtomicUsize>,
        result: Vec<BrokerAddress>,
    }

    impl LookupClient for FakeClient {
        async fn lookup(&self, _endpoint: &str, _topic: &str) -> Vec<BrokerAddress> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    #[tokio::test]
    async fn poll_with_no_endpoints_returns_empty_without_calling_client() {
        let calls = Arc::new(AtomicUsize::new(0));
        let client = FakeClient {
            calls: calls.clone(),
            result: vec![BrokerAddress {
                host: "127.0.0.1".into(),
                port: 4150,
            }],
        };

        let result = poll(&client, &[], "topic").await;
        assert!(result.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn poll_queries_one_configured_endpoint() {
        let calls = Arc::new(AtomicUsize::new(0));
        let client = FakeClient {
            calls: calls.clone(),
            result: vec![BrokerAddress {
                host: "10.0.0.1".into(),
                port: 4150,
            }],
        };

        let result = poll(&client, &["http://lookupd:4161".into()], "topic").await;
        assert_eq!(result.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
