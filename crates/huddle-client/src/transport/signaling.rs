//! Websocket client for the signaling relay
//!
//! The relay registers one identity per socket and forwards offers,
//! answers and candidates between identities. We only need it to set up
//! links; established calls survive losing it.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use huddle_protocol::SignalMessage;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use uuid::Uuid;

use crate::config::SignalingSettings;
use crate::error::TransportError;

/// Fresh identities tried when the relay reports a collision
const MAX_ID_ATTEMPTS: usize = 3;

pub struct SignalingClient {
    id: String,
    sender: mpsc::Sender<SignalMessage>,
    tasks: Vec<JoinHandle<()>>,
}

/// Relay endpoint for identity `id`
pub fn endpoint(settings: &SignalingSettings, id: &str) -> String {
    let separator = if settings.url.contains('?') { '&' } else { '?' };
    format!(
        "{}{}key={}&id={}&token={}",
        settings.url,
        separator,
        settings.key,
        id,
        Uuid::new_v4().simple()
    )
}

impl SignalingClient {
    /// Register with the relay.
    ///
    /// With a requested id a collision is an error; without one we retry
    /// with fresh ids. Inbound relay messages arrive on the returned
    /// receiver, which closes when the socket does.
    pub async fn connect(
        settings: &SignalingSettings,
        requested_id: Option<&str>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalMessage>), TransportError> {
        let attempts = if requested_id.is_some() { 1 } else { MAX_ID_ATTEMPTS };

        for attempt in 1..=attempts {
            let id = requested_id
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string());

            match Self::register(settings, &id).await {
                Err(TransportError::IdTaken(_)) if requested_id.is_none() && attempt < attempts => {
                    tracing::warn!("Identity {} taken, trying another", id);
                }
                result => return result,
            }
        }
        Err(TransportError::Signaling("could not register an identity".to_string()))
    }

    async fn register(
        settings: &SignalingSettings,
        id: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalMessage>), TransportError> {
        let (ws_stream, _) = connect_async(endpoint(settings, id)).await?;
        let (mut write, mut read) = ws_stream.split();

        // Wait for the relay to accept the identity
        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<SignalMessage>(&text)? {
                    SignalMessage::Open => {
                        tracing::info!("Signaling open as {}", id);
                        break;
                    }
                    SignalMessage::IdTaken => return Err(TransportError::IdTaken(id.to_string())),
                    SignalMessage::Error { payload } => return Err(TransportError::Signaling(payload.msg)),
                    other => tracing::debug!("Ignoring {:?} before open", other),
                },
                Some(Ok(Message::Close(_))) | None => {
                    return Err(TransportError::Signaling("connection closed during registration".to_string()));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        }

        let (tx, mut rx) = mpsc::channel::<SignalMessage>(100);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        // Outgoing messages
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(j) => j,
                    Err(e) => {
                        tracing::error!("Failed to serialize signal: {}", e);
                        continue;
                    }
                };

                if write.send(Message::Text(json.into())).await.is_err() {
                    tracing::error!("Failed to send signaling message");
                    break;
                }
            }
            let _ = write.close().await;
        });

        // Incoming messages
        let reader = tokio::spawn(async move {
            while let Some(result) = read.next().await {
                match result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<SignalMessage>(&text) {
                        Ok(msg) => {
                            if inbound_tx.send(msg).is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!("Unreadable signaling message: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("Signaling closed by relay");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("Signaling error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        });

        let heartbeat = spawn_heartbeat(tx.clone(), settings.heartbeat_interval());

        Ok((
            Self {
                id: id.to_string(),
                sender: tx,
                tasks: vec![writer, reader, heartbeat],
            },
            inbound_rx,
        ))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn send(&self, message: SignalMessage) -> Result<(), TransportError> {
        self.sender
            .send(message)
            .await
            .map_err(|_| TransportError::Signaling("signaling connection closed".to_string()))
    }

    pub fn close(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_heartbeat(tx: mpsc::Sender<SignalMessage>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            if tx.send(SignalMessage::Heartbeat).await.is_err() {
                break;
            }
        }
    })
}
