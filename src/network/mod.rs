//! Node-to-node transport contract
//!
//! The cluster core only needs "send a packet to a channel" and "send a query
//! and wait for its reply". Two channel implementations ship with the crate:
//! [`InProcessChannel`] links nodes living in the same process and
//! [`HttpChannel`] carries JSON packets over HTTP.

pub mod http;
pub mod local;
pub mod packet;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

pub use http::HttpChannel;
pub use local::InProcessChannel;
pub use packet::{AuthorizeRequest, AuthorizeResponse, Packet, Reply};

/// Header carrying the unique id of the sending node
pub const NODE_HEADER: &str = "x-fleetnet-node";

/// Errors raised by a channel
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel {0} is closed")]
    Closed(Uuid),

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Peer answered {status}: {message}")]
    Status { status: u16, message: String },
}

/// Receiver side of a channel: executes packets sent by another node
#[async_trait]
pub trait PacketHandler: Send + Sync {
    async fn handle_packet(&self, sender: &str, packet: Packet) -> Reply;
}

/// An authorized connection to exactly one remote node
#[async_trait]
pub trait NetworkChannel: Send + Sync {
    /// Identity of this connection; a reconnect yields a new id
    fn channel_id(&self) -> Uuid;

    fn is_open(&self) -> bool;

    /// Fire a packet, ignoring any reply
    async fn send_packet(&self, packet: Packet) -> Result<(), ChannelError>;

    /// Send a packet and wait for the single reply
    async fn send_query(&self, packet: Packet) -> Result<Reply, ChannelError>;

    async fn close(&self);
}

impl std::fmt::Debug for dyn NetworkChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkChannel")
            .field("channel_id", &self.channel_id())
            .field("open", &self.is_open())
            .finish()
    }
}
