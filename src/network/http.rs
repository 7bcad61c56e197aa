//! HTTP channel
//!
//! Packets travel as JSON bodies to `POST /v1/cluster/packets` of the peer.
//! The sender identifies itself with the [`NODE_HEADER`] header; the peer only
//! accepts packets from nodes it has authorized.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;
use uuid::Uuid;

use super::{
    AuthorizeRequest, AuthorizeResponse, ChannelError, NetworkChannel, Packet, Reply, NODE_HEADER,
};
use crate::cluster::HostAndPort;

pub const AUTHORIZE_PATH: &str = "/v1/cluster/authorize";
pub const PACKETS_PATH: &str = "/v1/cluster/packets";

pub struct HttpChannel {
    id: Uuid,
    local_node: String,
    base_url: String,
    client: Client,
    open: AtomicBool,
}

impl HttpChannel {
    pub fn new(
        local_node: impl Into<String>,
        peer: &HostAndPort,
        timeout: Duration,
    ) -> Result<Self, ChannelError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            id: Uuid::new_v4(),
            local_node: local_node.into(),
            base_url: peer.http_url(),
            client,
            open: AtomicBool::new(true),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Ask the peer to admit this node
    pub async fn authorize(
        &self,
        request: &AuthorizeRequest,
    ) -> Result<AuthorizeResponse, ChannelError> {
        let url = format!("{}{}", self.base_url, AUTHORIZE_PATH);
        let response = self.client.post(&url).json(request).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(ChannelError::Status { status, message });
        }

        Ok(response.json().await?)
    }

    async fn post(&self, packet: &Packet) -> Result<Reply, ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed(self.id));
        }

        let url = format!("{}{}", self.base_url, PACKETS_PATH);
        debug!("Sending {} to {}", packet.kind(), url);

        let response = self
            .client
            .post(&url)
            .header(NODE_HEADER, &self.local_node)
            .json(packet)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(ChannelError::Status { status, message });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl NetworkChannel for HttpChannel {
    fn channel_id(&self) -> Uuid {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn send_packet(&self, packet: Packet) -> Result<(), ChannelError> {
        self.post(&packet).await.map(|_| ())
    }

    async fn send_query(&self, packet: Packet) -> Result<Reply, ChannelError> {
        self.post(&packet).await
    }

    async fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}
