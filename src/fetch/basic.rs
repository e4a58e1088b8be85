use super::client::HttpClient;
use async_trait::async_trait;
use std::time::Duration;

const USER_AGENT: &str = concat!("vp_trajectories/", env!("CARGO_PKG_VERSION"));

pub struct BasicClient(reqwest::Client);

impl BasicClient {
    /// Builds a client whose every request is bounded by `timeout`.
    ///
    /// `tls_verify = false` accepts invalid certificates; some agency feeds
    /// are served with broken chains.
    pub fn new(timeout: Duration, tls_verify: bool) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .connect_timeout(timeout)
            .danger_accept_invalid_certs(!tls_verify)
            .build()?;
        Ok(Self(client))
    }
}

#[async_trait]
impl HttpClient for BasicClient {
    async fn execute(&self, req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        self.0.execute(req).await
    }
}
