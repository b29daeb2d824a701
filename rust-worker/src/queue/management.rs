//! RabbitMQ management HTTP API client.
//!
//! AMQP has no way to read unacked counts or declared queue arguments, so
//! queue discovery and introspection go through the management API instead.

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;
use url::Url;

use super::error::ManagementError;
use super::types::QueueInfo;

/// Read-only view of the queues in one virtual host.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ManagementApi: Send + Sync {
    /// All queues in the bound virtual host.
    async fn list_queues(&self) -> Result<Vec<QueueInfo>, ManagementError>;

    /// A single queue by name.
    async fn queue_info(&self, queue: &str) -> Result<QueueInfo, ManagementError>;
}

/// Basic-auth client for `GET {base}/{vhost}` and `GET {base}/{vhost}/{queue}`.
#[derive(Clone)]
pub struct ManagementClient {
    client: Client,
    vhost_url: Url,
    username: String,
    password: String,
}

impl ManagementClient {
    /// `base_url` is the queues endpoint, e.g. `https://rabbit.example.com/api/queues`.
    pub fn new(
        client: Client,
        base_url: &str,
        vhost: &str,
        username: String,
        password: String,
    ) -> Result<Self, ManagementError> {
        let vhost_url = join_segment(base_url, vhost)?;
        Ok(Self {
            client,
            vhost_url,
            username,
            password,
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T, ManagementError> {
        debug!(url = %url, "management_api_request");

        let body = self
            .client
            .get(url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?
            .error_for_status()?
            .json::<T>()
            .await?;

        Ok(body)
    }
}

#[async_trait]
impl ManagementApi for ManagementClient {
    async fn list_queues(&self) -> Result<Vec<QueueInfo>, ManagementError> {
        self.get(self.vhost_url.clone()).await
    }

    async fn queue_info(&self, queue: &str) -> Result<QueueInfo, ManagementError> {
        let url = join_segment(self.vhost_url.as_str(), queue)?;
        self.get(url).await
    }
}

/// Append one percent-encoded path segment, so a vhost of `/` becomes `%2F`.
fn join_segment(base: &str, segment: &str) -> Result<Url, ManagementError> {
    let mut url = Url::parse(base).map_err(|e| ManagementError::InvalidUrl(format!("{base}: {e}")))?;
    url.path_segments_mut()
        .map_err(|_| ManagementError::InvalidUrl(format!("{base}: cannot be a base")))?
        .pop_if_empty()
        .push(segment);
    Ok(url)
}
