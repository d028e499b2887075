use tokio::sync::{mpsc, oneshot};

use crate::daemon::error::DaemonError;

pub mod daemon_controller;
pub mod overlay;
pub mod packet_logger;
pub mod peer;
pub mod peer_collection;
pub mod tunnel;

#[derive(Debug)]
pub struct Addr<Message> {
    sender: mpsc::Sender<Message>,
}

// Derived `Clone` would require `Message: Clone`.
impl<Message> Clone for Addr<Message> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<Message> Addr<Message> {
    pub fn new(sender: mpsc::Sender<Message>) -> Self {
        Self { sender }
    }
    pub async fn send_message(&self, message: Message) {
        let _ = self.sender.send(message).await;
    }
    /// Sends a message carrying a reply channel and waits for the actor's answer.
    pub async fn request<Reply>(
        &self,
        message: impl FnOnce(oneshot::Sender<Reply>) -> Message,
    ) -> Result<Reply, DaemonError> {
        let (reply_sender, reply_receiver) = oneshot::channel();
        self.sender
            .send(message(reply_sender))
            .await
            .map_err(|_| DaemonError::ChannelClosed)?;
        reply_receiver.await.map_err(|_| DaemonError::ChannelClosed)
    }
}

pub trait Actor<Message>: Send
where
    Message: Send,
{
    fn get_addr(&self) -> Addr<Message>;
}
