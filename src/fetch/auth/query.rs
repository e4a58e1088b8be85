use crate::fetch::client::HttpClient;
use async_trait::async_trait;

/// An [`HttpClient`] wrapper that appends fixed query parameters, e.g. an API
/// key passed as `?api_key=<key>`.
pub struct QueryParams<C> {
    pub inner: C,
    pub params: Vec<(String, String)>,
}

#[async_trait]
impl<C: HttpClient> HttpClient for QueryParams<C> {
    async fn execute(&self, mut req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        if !self.params.is_empty() {
            let mut pairs = req.url_mut().query_pairs_mut();
            for (name, value) in &self.params {
                pairs.append_pair(name, value);
            }
        }
        self.inner.execute(req).await
    }
}
