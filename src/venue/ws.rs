//! Streaming order-book subscription over the venue's market channel.
//!
//! One connection covers the whole asset set; replacing the set tears the
//! connection down and reopens with the new subscription. Decoded price
//! ticks are forwarded to a handler; the engine routes them through the
//! single ledger mutation path.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::ticks::{clamp_signed, to_tick, Tick};
use crate::venue::types::RawBook;

const MARKET_WSS_URL: &str = "wss://ws-subscriptions-clob.polymarket.com/ws/market";

/// One decoded price observation from the stream.
#[derive(Debug, Clone)]
pub struct BookTick {
    pub token_id: String,
    pub tick: Tick,
}

pub type UpdateHandler = Arc<dyn Fn(BookTick) + Send + Sync>;

#[derive(Debug)]
enum WsCommand {
    SetAssets(Vec<String>),
}

/// Handle to the streaming worker.
pub struct MarketWsFeed {
    cmd_tx: mpsc::Sender<WsCommand>,
}

impl MarketWsFeed {
    /// Spawn the worker; it idles until the first non-empty asset set.
    pub fn spawn(handler: UpdateHandler) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel::<WsCommand>(64);
        let feed = Arc::new(Self { cmd_tx });

        tokio::spawn(async move {
            if let Err(e) = run(cmd_rx, handler).await {
                warn!(error = %e, "market ws worker exited");
            }
        });

        feed
    }

    /// Replace the subscribed asset set. Non-blocking; an unchanged set is
    /// left alone by the worker.
    pub fn set_assets(&self, token_ids: Vec<String>) {
        let _ = self.cmd_tx.try_send(WsCommand::SetAssets(token_ids));
    }
}

async fn run(mut cmd_rx: mpsc::Receiver<WsCommand>, handler: UpdateHandler) -> Result<()> {
    let mut assets: Vec<String> = Vec::new();
    let mut reconnect_delay = Duration::from_secs(1);
    let max_reconnect_delay = Duration::from_secs(30);

    loop {
        while assets.is_empty() {
            match cmd_rx.recv().await {
                Some(WsCommand::SetAssets(next)) => assets = next,
                None => return Ok(()),
            }
        }

        match connect_and_stream(&mut cmd_rx, &mut assets, &handler).await {
            Ok(StreamExit::Resubscribe) => {
                reconnect_delay = Duration::from_secs(1);
            }
            Ok(StreamExit::ChannelClosed) => return Ok(()),
            Err(e) => {
                warn!(error = %e, "market ws disconnected; reconnecting");
                sleep(reconnect_delay).await;
                reconnect_delay = (reconnect_delay * 2).min(max_reconnect_delay);
            }
        }
    }
}

enum StreamExit {
    /// The asset set changed; reconnect with the new subscription.
    Resubscribe,
    ChannelClosed,
}

async fn connect_and_stream(
    cmd_rx: &mut mpsc::Receiver<WsCommand>,
    assets: &mut Vec<String>,
    handler: &UpdateHandler,
) -> Result<StreamExit> {
    info!(assets = assets.len(), "connecting market ws");
    let (ws_stream, resp) = connect_async(MARKET_WSS_URL)
        .await
        .context("connect market ws")?;
    debug!(status = %resp.status(), "market ws connected");

    let (mut write, mut read) = ws_stream.split();

    let sub_msg = serde_json::json!({
        "type": "market",
        "assets_ids": assets.clone(),
        "channel": "book",
    });
    write
        .send(Message::Text(sub_msg.to_string()))
        .await
        .context("send market subscription")?;

    let mut ping = interval(Duration::from_secs(5));
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ping.tick() => {
                let _ = write.send(Message::Text("PING".to_string())).await;
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(WsCommand::SetAssets(next)) => {
                        if next != *assets {
                            *assets = next;
                            return Ok(StreamExit::Resubscribe);
                        }
                    }
                    None => return Ok(StreamExit::ChannelClosed),
                }
            }
            ws_msg = read.next() => {
                let Some(ws_msg) = ws_msg else {
                    anyhow::bail!("market ws stream ended");
                };
                match ws_msg {
                    Ok(Message::Text(text)) => {
                        for update in decode_updates(&text) {
                            handler(update);
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "market ws close frame");
                        anyhow::bail!("market ws closed by venue");
                    }
                    Ok(_) => {}
                    Err(e) => anyhow::bail!("market ws error: {e}"),
                }
            }
        }
    }
}

/// Decode one text frame into price ticks.
///
/// The venue sends three shapes: a flat list of updates, `{"data": [...]}`,
/// and `{"price_changes": [...]}`. Entries carry `asset_id` or `token_id`
/// and either a full book (mid of the touch) or a ticker `price`.
pub fn decode_updates(text: &str) -> Vec<BookTick> {
    if text.eq_ignore_ascii_case("PONG") {
        return Vec::new();
    }
    let Ok(json) = serde_json::from_str::<Value>(text) else {
        return Vec::new();
    };

    let entries: Vec<Value> = match json {
        Value::Array(arr) => arr,
        Value::Object(obj) => {
            if let Some(Value::Array(arr)) = obj.get("data") {
                arr.clone()
            } else if let Some(Value::Array(arr)) = obj.get("price_changes") {
                arr.clone()
            } else {
                vec![Value::Object(obj)]
            }
        }
        _ => return Vec::new(),
    };

    entries.iter().filter_map(decode_entry).collect()
}

fn decode_entry(entry: &Value) -> Option<BookTick> {
    let token_id = entry
        .get("asset_id")
        .or_else(|| entry.get("token_id"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())?
        .to_string();

    // Full-book shape first; ticker price as the fallback.
    if entry.get("bids").is_some() || entry.get("asks").is_some() {
        if let Ok(book) = serde_json::from_value::<RawBook>(entry.clone()) {
            let normalized = book.normalize();
            if let (Some(bid), Some(ask)) = (normalized.best_bid(), normalized.best_ask()) {
                return Some(BookTick {
                    token_id,
                    tick: clamp_signed((bid as i32 + ask as i32) / 2),
                });
            }
        }
    }

    let price = entry.get("price")?;
    let p = match price {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.parse::<f64>().ok()?,
        _ => return None,
    };
    Some(BookTick {
        token_id,
        tick: to_tick(p),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_flat_list() {
        let text = r#"[{"asset_id":"t1","price":"0.44"},{"asset_id":"t2","price":0.6}]"#;
        let out = decode_updates(text);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].tick, 440);
        assert_eq!(out[1].tick, 600);
    }

    #[test]
    fn decodes_data_wrapper() {
        let text = r#"{"data":[{"token_id":"t1","price":"0.25"}]}"#;
        let out = decode_updates(text);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].token_id, "t1");
        assert_eq!(out[0].tick, 250);
    }

    #[test]
    fn decodes_price_changes_wrapper() {
        let text = r#"{"price_changes":[{"asset_id":"t9","side":"BUY","price":"0.515"}]}"#;
        let out = decode_updates(text);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].tick, 515);
    }

    #[test]
    fn full_book_uses_mid() {
        let text = r#"[{"asset_id":"t1",
            "bids":[{"price":"0.42","size":"100"}],
            "asks":[{"price":"0.44","size":"100"}],
            "price":"0.99"}]"#;
        let out = decode_updates(text);
        assert_eq!(out.len(), 1);
        // Mid of 420/440, not the stray ticker price.
        assert_eq!(out[0].tick, 430);
    }

    #[test]
    fn single_object_message_accepted() {
        let text = r#"{"asset_id":"t1","price":"0.5"}"#;
        let out = decode_updates(text);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn garbage_and_pong_ignored() {
        assert!(decode_updates("PONG").is_empty());
        assert!(decode_updates("not json").is_empty());
        assert!(decode_updates(r#"[{"price":"0.5"}]"#).is_empty());
    }
}
