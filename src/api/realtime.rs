use crate::api::events::{self, Frame, IncomingEvent};
use crate::api::models::{MessageRow, Session};
use crate::app::AppState;
use crate::chat::listener::ChangeFeed;
use crate::error::{ChatError, Result};
use crate::utils::realtime_url;
use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use log::{debug, info, warn};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use url::Url;

const FEED_CAPACITY: usize = 64;
const JOIN_REF: &str = "1";

/// Websocket change feed against the hosted realtime service.
/// Every subscription gets its own socket.
pub struct RealtimeClient {
    url: Url,
    access_token: String,
    heartbeat: Duration,
    join_timeout: Duration,
}

impl RealtimeClient {
    pub fn new(state: &AppState, session: &Session) -> Result<Self> {
        Ok(Self {
            url: realtime_url(&state.base_url, &state.api_key)?,
            access_token: session.access_token.clone(),
            heartbeat: state.heartbeat_interval(),
            join_timeout: state.join_timeout(),
        })
    }
}

#[async_trait]
impl ChangeFeed for RealtimeClient {
    async fn subscribe(&self, channel: &str, conversation_id: &str) -> Result<mpsc::Receiver<MessageRow>> {
        let (mut ws, _) = connect_async(self.url.as_str()).await?;
        debug!("Realtime socket open for {}", channel);

        let join = Frame::join(channel, conversation_id, &self.access_token, JOIN_REF);
        ws.send(WsMessage::Text(join.encode()?)).await?;
        tokio::time::timeout(self.join_timeout, await_join(&mut ws, JOIN_REF))
            .await
            .map_err(|_| ChatError::Realtime(format!("join {} timed out", channel)))??;
        info!("Joined {}", events::topic(channel));

        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        tokio::spawn(pump(ws, tx, channel.to_string(), self.heartbeat));
        Ok(rx)
    }
}

/// Reads frames until the reply to `join_ref` arrives.
async fn await_join<S>(ws: &mut S, join_ref: &str) -> Result<()>
where
    S: Stream<Item = std::result::Result<WsMessage, WsError>> + Unpin,
{
    while let Some(msg) = ws.next().await {
        let WsMessage::Text(text) = msg? else { continue };
        match events::decode(&text) {
            Ok(IncomingEvent::Reply { reference, ok, detail }) if reference == join_ref => {
                return if ok {
                    Ok(())
                } else {
                    Err(ChatError::Realtime(format!("join rejected: {}", detail)))
                };
            }
            Ok(_) => {}
            Err(e) => debug!("Skipping frame before join reply: {}", e),
        }
    }
    Err(ChatError::Realtime("socket closed before join reply".into()))
}

/// Forwards inserts until the receiver goes away or the socket drops.
/// Dropping `rows` on return is what signals the drop to the listener.
async fn pump<S>(mut ws: S, rows: mpsc::Sender<MessageRow>, channel: String, every: Duration)
where
    S: Stream<Item = std::result::Result<WsMessage, WsError>> + Sink<WsMessage, Error = WsError> + Unpin,
{
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    let mut next_ref: u64 = 2;

    loop {
        tokio::select! {
            _ = rows.closed() => {
                let leave = Frame::leave(&channel, &next_ref.to_string());
                if let Ok(text) = leave.encode() {
                    let _ = ws.send(WsMessage::Text(text)).await;
                }
                let _ = ws.close().await;
                debug!("Left {}", channel);
                return;
            }
            _ = heartbeat.tick() => {
                let beat = Frame::heartbeat(&next_ref.to_string());
                next_ref += 1;
                let sent = match beat.encode() {
                    Ok(text) => ws.send(WsMessage::Text(text)).await.map_err(ChatError::from),
                    Err(e) => Err(e),
                };
                if let Err(e) = sent {
                    warn!("Heartbeat on {} failed: {}", channel, e);
                    return;
                }
            }
            incoming = ws.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => match events::decode(&text) {
                    Ok(IncomingEvent::Insert(row)) => {
                        if rows.send(row).await.is_err() {
                            return;
                        }
                    }
                    Ok(IncomingEvent::ChannelClosed(why)) => {
                        warn!("Channel {} closed by server ({})", channel, why);
                        return;
                    }
                    Ok(IncomingEvent::Reply { ok: false, detail, .. }) => {
                        warn!("Server rejected frame on {}: {}", channel, detail);
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Undecodable frame on {}: {}", channel, e),
                },
                Some(Ok(WsMessage::Close(_))) | None => {
                    info!("Realtime socket for {} closed", channel);
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Realtime socket for {} failed: {}", channel, e);
                    return;
                }
            }
        }
    }
}
