#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod config;
pub mod error;
pub mod guard;
pub mod manager;
pub mod protocol;
pub mod rest;
pub mod store;
pub mod transport;
pub mod types;

use reqwest::Request;
use serde::de::DeserializeOwned;

use crate::error::Error;

pub use crate::config::Config;
pub use crate::manager::ConnectionManager;
pub use crate::protocol::{ConnectionState, LifecycleEvent, ProtocolClient};
pub use crate::store::{EntityStore, EntityView, WatchHandle};
pub use crate::types::{EntityRecord, StateChange, StateValue};

pub type Result<T> = std::result::Result<T, Error>;

#[tracing::instrument(
    level = "debug",
    skip(client, request),
    fields(
        method = %request.method(),
        path = request.url().path(),
        status_code
    )
)]
pub(crate) async fn request<Response: DeserializeOwned>(
    client: &reqwest::Client,
    request: Request,
) -> Result<Response> {
    let method = request.method().clone();
    let path = request.url().path().to_owned();

    let response = client.execute(request).await?;
    let status_code = response.status();

    tracing::Span::current().record("status_code", status_code.as_u16());

    if !status_code.is_success() {
        let message = response.text().await.unwrap_or_default();

        tracing::warn!(
            status = %status_code,
            method = %method,
            path = %path,
            message = %message,
            "API request failed"
        );

        return Err(Error::status(status_code, method, path, message));
    }

    Ok(response.json::<Response>().await?)
}
