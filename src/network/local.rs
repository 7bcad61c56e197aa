//! In-process channel
//!
//! Links two nodes living in the same process. Packets are handed straight to
//! the receiving node's [`PacketHandler`], without serialization.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use uuid::Uuid;

use super::{ChannelError, NetworkChannel, Packet, PacketHandler, Reply};

pub struct InProcessChannel {
    id: Uuid,
    /// Node id the receiver sees as sender
    sender: String,
    target: Weak<dyn PacketHandler>,
    open: AtomicBool,
}

impl InProcessChannel {
    /// Create a channel from node `sender` to `target`
    pub fn new(sender: impl Into<String>, target: &Arc<dyn PacketHandler>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: sender.into(),
            target: Arc::downgrade(target),
            open: AtomicBool::new(true),
        }
    }

    fn target(&self) -> Result<Arc<dyn PacketHandler>, ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed(self.id));
        }
        self.target.upgrade().ok_or(ChannelError::Closed(self.id))
    }
}

#[async_trait]
impl NetworkChannel for InProcessChannel {
    fn channel_id(&self) -> Uuid {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn send_packet(&self, packet: Packet) -> Result<(), ChannelError> {
        let target = self.target()?;
        target.handle_packet(&self.sender, packet).await;
        Ok(())
    }

    async fn send_query(&self, packet: Packet) -> Result<Reply, ChannelError> {
        let target = self.target()?;
        Ok(target.handle_packet(&self.sender, packet).await)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl PacketHandler for Echo {
        async fn handle_packet(&self, sender: &str, packet: Packet) -> Reply {
            Reply::Lines(vec![sender.to_string(), packet.kind().to_string()])
        }
    }

    #[tokio::test]
    async fn test_query_reaches_handler() {
        let handler: Arc<dyn PacketHandler> = Arc::new(Echo);
        let channel = InProcessChannel::new("Node-1", &handler);

        let reply = channel.send_query(Packet::NodeShutdown).await.unwrap();
        match reply {
            Reply::Lines(lines) => assert_eq!(lines, vec!["Node-1", "node_shutdown"]),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_closed_channel() {
        let handler: Arc<dyn PacketHandler> = Arc::new(Echo);
        let channel = InProcessChannel::new("Node-1", &handler);

        channel.close().await;

        assert!(!channel.is_open());
        assert!(matches!(
            channel.send_packet(Packet::NodeShutdown).await,
            Err(ChannelError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_dropped_target() {
        let handler: Arc<dyn PacketHandler> = Arc::new(Echo);
        let channel = InProcessChannel::new("Node-1", &handler);
        drop(handler);

        assert!(channel.send_query(Packet::NodeShutdown).await.is_err());
    }
}
