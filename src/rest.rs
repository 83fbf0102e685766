//! The non-realtime channel.
//!
//! Full-state snapshots and historical samples come over plain HTTP, distinct
//! from the socket. The contract here is deliberately small: "returns an array
//! of entity records" and "accepts a time range plus entity id, returns an
//! array of historical samples".

use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{
    Client as ReqwestClient, Method,
    header::{HeaderMap, HeaderValue},
};
use secrecy::{ExposeSecret as _, SecretString};
use url::Url;

use crate::Result;
use crate::types::EntityRecord;

/// HTTP client for the controller's REST API.
#[derive(Clone, Debug)]
pub struct RestClient {
    host: Url,
    client: ReqwestClient,
}

impl RestClient {
    /// Creates a REST client for the given base URL, authenticating every
    /// request with the bearer token.
    pub fn new(host: &str, token: &SecretString) -> Result<Self> {
        let mut headers = HeaderMap::new();

        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))?;
        bearer.set_sensitive(true);
        headers.insert("Authorization", bearer);
        headers.insert("User-Agent", HeaderValue::from_static("homehub_client_sdk"));
        headers.insert("Accept", HeaderValue::from_static("application/json"));
        headers.insert("Content-Type", HeaderValue::from_static("application/json"));
        let client = ReqwestClient::builder().default_headers(headers).build()?;

        Ok(Self {
            host: Url::parse(host)?,
            client,
        })
    }

    /// Returns the base URL of the API.
    #[must_use]
    pub fn host(&self) -> &Url {
        &self.host
    }

    /// Fetch the full entity snapshot.
    pub async fn states(&self) -> Result<Vec<EntityRecord>> {
        let request = self
            .client
            .request(Method::GET, format!("{}api/states", self.host))
            .build()?;
        crate::request(&self.client, request).await
    }

    /// Fetch historical samples for one entity over a time range.
    pub async fn history(
        &self,
        entity_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<EntityRecord>> {
        let start = start.to_rfc3339_opts(SecondsFormat::Secs, true);
        let end = end.to_rfc3339_opts(SecondsFormat::Secs, true);
        let request = self
            .client
            .request(
                Method::GET,
                format!(
                    "{}api/history/period/{start}?filter_entity_id={entity_id}&end_time={end}",
                    self.host
                ),
            )
            .build()?;

        // The controller groups samples per requested entity; with a single
        // filter there is at most one group.
        let grouped: Vec<Vec<EntityRecord>> = crate::request(&self.client, request).await?;
        Ok(grouped.into_iter().flatten().collect())
    }
}
