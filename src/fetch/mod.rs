//! Feed retrieval: HTTP transport, credential decorators, and the
//! [`FeedSource`] seam the reconciler polls.

mod basic;
mod client;
pub mod auth;

pub use basic::BasicClient;
pub use client::HttpClient;

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::FeedConfig;
use crate::error::FetchError;
use crate::parser::{parse_feed, vehicle_records};
use crate::record::VehicleUpdateRecord;
use auth::{QueryParams, StaticHeaders};

/// Fetches slower than this are logged.
const SLOW_FETCH: Duration = Duration::from_secs(15);

/// Issues a GET for `url` and returns the body of a successful response.
pub async fn fetch_bytes<C: HttpClient>(client: &C, url: &str) -> Result<Bytes, FetchError> {
    let url = reqwest::Url::parse(url)
        .map_err(|e| FetchError::Unrecoverable(format!("invalid url: {e}")))?;
    let req = reqwest::Request::new(reqwest::Method::GET, url);

    let resp = client
        .execute(req)
        .await
        .map_err(|e| FetchError::from_reqwest(&e))?;
    let resp = resp
        .error_for_status()
        .map_err(|e| FetchError::from_reqwest(&e))?;
    resp.bytes().await.map_err(|e| FetchError::from_reqwest(&e))
}

/// Anything that can produce one snapshot of vehicle records per call.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch_snapshot(&self) -> Result<Vec<VehicleUpdateRecord>, FetchError>;
}

/// Client stack used for live feeds: query parameters over static headers
/// over a timeout-bounded `reqwest` client.
pub type FeedClient = QueryParams<StaticHeaders<BasicClient>>;

/// [`FeedSource`] that polls a GTFS-RT vehicle-positions URL.
pub struct HttpFeedSource<C = FeedClient> {
    url: String,
    client: C,
}

impl HttpFeedSource<FeedClient> {
    /// Builds the client stack for `feed` with a per-request `timeout`.
    pub fn from_config(feed: &FeedConfig, timeout: Duration) -> anyhow::Result<Self> {
        let basic = BasicClient::new(timeout, feed.https_verify)?;
        let headers = StaticHeaders::new(
            basic,
            feed.headers.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        )?;
        let client = QueryParams {
            inner: headers,
            params: feed
                .query_params
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        Ok(Self::with_client(feed.url.clone(), client))
    }
}

impl<C: HttpClient> HttpFeedSource<C> {
    pub fn with_client(url: impl Into<String>, client: C) -> Self {
        Self {
            url: url.into(),
            client,
        }
    }
}

#[async_trait]
impl<C: HttpClient> FeedSource for HttpFeedSource<C> {
    #[tracing::instrument(skip(self), fields(url = %self.url))]
    async fn fetch_snapshot(&self) -> Result<Vec<VehicleUpdateRecord>, FetchError> {
        let fetch_start = std::time::Instant::now();
        let bytes = fetch_bytes(&self.client, &self.url).await?;

        let elapsed = fetch_start.elapsed();
        if elapsed > SLOW_FETCH {
            warn!(elapsed_secs = elapsed.as_secs(), "Feed fetch was slow");
        }
        debug!(bytes = bytes.len(), "Feed bytes received, parsing");

        let feed = parse_feed(&bytes)?;
        let records = vehicle_records(&feed);
        debug!(vehicles = records.len(), "Extracted vehicle records from feed");
        Ok(records)
    }
}
