//! Message endpoint a launch client (or a test controller) exposes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use noded_common::{Connection, Envelope, Message, ReturnCode, Signer};

/// Accepts signed messages on a local port and queues them in arrival order.
/// Each message is acknowledged with `Ok` in case the sender waits for it.
pub struct MessageListener {
    addr: SocketAddr,
    inbox: Mutex<mpsc::UnboundedReceiver<Envelope>>,
    seen: Mutex<Vec<Envelope>>,
    task: JoinHandle<()>,
}

impl MessageListener {
    pub async fn bind(key: impl Into<Vec<u8>>) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let signer = Arc::new(Signer::new(key, 0, 0));
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = listener.accept().await else {
                    continue;
                };
                let signer = signer.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut conn = Connection::new(stream);
                    match conn.recv(signer.key()).await {
                        Ok(Some(envelope)) => {
                            debug!(%peer, kind = envelope.message.kind(), "message received");
                            let _ = tx.send(envelope);
                            if let Ok(ack) = signer.seal(Message::response(ReturnCode::Ok)) {
                                let _ = conn.send(&ack).await;
                            }
                        }
                        Ok(None) => {}
                        Err(err) => warn!(%peer, %err, "rejected message"),
                    }
                });
            }
        });
        Ok(Self {
            addr,
            inbox: Mutex::new(rx),
            seen: Mutex::new(Vec::new()),
            task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    /// First message, received so far or within `limit`, for which `pred`
    /// holds. Matching messages are consumed; others stay available.
    pub async fn wait_for(
        &self,
        limit: Duration,
        mut pred: impl FnMut(&Message) -> bool,
    ) -> Option<Envelope> {
        {
            let mut seen = self.seen.lock().await;
            if let Some(index) = seen.iter().position(|env| pred(&env.message)) {
                return Some(seen.remove(index));
            }
        }
        let deadline = tokio::time::Instant::now() + limit;
        let mut inbox = self.inbox.lock().await;
        loop {
            let envelope = tokio::time::timeout_at(deadline, inbox.recv())
                .await
                .ok()
                .flatten()?;
            if pred(&envelope.message) {
                return Some(envelope);
            }
            self.seen.lock().await.push(envelope);
        }
    }

    /// Every message received so far that no `wait_for` consumed.
    pub async fn drain(&self) -> Vec<Envelope> {
        let mut seen = std::mem::take(&mut *self.seen.lock().await);
        let mut inbox = self.inbox.lock().await;
        while let Ok(envelope) = inbox.try_recv() {
            seen.push(envelope);
        }
        seen
    }
}

impl Drop for MessageListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use noded_common::protocol::JobRequest;
    use noded_common::{TcpTransport, Transport};

    #[tokio::test]
    async fn unmatched_messages_stay_queued() {
        let listener = MessageListener::bind(b"key".to_vec()).await.unwrap();
        let transport = TcpTransport::new(Signer::new(b"key".to_vec(), 0, 0));
        transport
            .send(&listener.endpoint(), Message::Ping)
            .await
            .unwrap();
        transport
            .send(&listener.endpoint(), Message::KillJob(JobRequest { job_id: 3 }))
            .await
            .unwrap();

        let kill = listener
            .wait_for(Duration::from_secs(5), |m| matches!(m, Message::KillJob(_)))
            .await;
        assert!(kill.is_some());
        let ping = listener
            .wait_for(Duration::from_secs(5), |m| matches!(m, Message::Ping))
            .await;
        assert!(ping.is_some());
        assert!(listener
            .wait_for(Duration::from_millis(100), |_| true)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn wrong_key_is_dropped() {
        let listener = MessageListener::bind(b"key".to_vec()).await.unwrap();
        let transport = TcpTransport::new(Signer::new(b"other".to_vec(), 0, 0));
        let _ = transport.send(&listener.endpoint(), Message::Ping).await;
        assert!(listener
            .wait_for(Duration::from_millis(300), |_| true)
            .await
            .is_none());
    }
}
