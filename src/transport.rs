use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, Response};

/// The collaborator providing request/response plumbing and a shared cookie
/// jar, injected rather than reached for as a process-wide singleton (spec.md
/// §9's "static singleton HTTP client factory" redesign flag). An
/// `#[async_trait]` so tests can substitute a mock transport and
/// `ReplicationCore` can hold it as `Arc<dyn HttpTransport>` the same way it
/// holds `Arc<dyn LocalStore>`.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, url: &str) -> Result<Response, reqwest::Error>;

    async fn put_json(&self, url: &str, body: &serde_json::Value) -> Result<Response, reqwest::Error>;

    async fn post_json(&self, url: &str, body: &serde_json::Value) -> Result<Response, reqwest::Error>;

    /// Escape hatch for call sites that need header/method control the
    /// convenience methods above don't expose (multipart uploads, custom
    /// `Accept` headers).
    fn client(&self) -> &Client;

    fn cookie_jar(&self) -> &Arc<reqwest::cookie::Jar>;
}

/// The default [`HttpTransport`]: a thin wrapper around [`reqwest::Client`] —
/// the same client type the teacher crate stores directly on `Nano`/
/// `DBInUse` — held behind `Arc` so a `ReplicationCore` can share one
/// instance across its change feed, checkpoint, and inbox-processing tasks.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    cookie_jar: Arc<reqwest::cookie::Jar>,
}

impl ReqwestTransport {
    /// Builds a transport with its own cookie jar, enabling cookie-based
    /// session login (spec.md §4.7 step 3).
    pub fn new() -> Self {
        let jar = Arc::new(reqwest::cookie::Jar::default());
        let client = Client::builder()
            .cookie_provider(jar.clone())
            .build()
            .expect("reqwest client builder");
        ReqwestTransport {
            client,
            cookie_jar: jar,
        }
    }

    /// Wraps an already-constructed client, e.g. one configured for mTLS by
    /// a custom `Authorizer::http_client_factory`.
    pub fn from_client(client: Client) -> Self {
        ReqwestTransport {
            client,
            cookie_jar: Arc::new(reqwest::cookie::Jar::default()),
        }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &str) -> Result<Response, reqwest::Error> {
        self.client.get(url).send().await
    }

    async fn put_json(&self, url: &str, body: &serde_json::Value) -> Result<Response, reqwest::Error> {
        self.client.put(url).json(body).send().await
    }

    async fn post_json(&self, url: &str, body: &serde_json::Value) -> Result<Response, reqwest::Error> {
        self.client.post(url).json(body).send().await
    }

    fn client(&self) -> &Client {
        &self.client
    }

    fn cookie_jar(&self) -> &Arc<reqwest::cookie::Jar> {
        &self.cookie_jar
    }
}
