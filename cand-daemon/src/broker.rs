//! TCP front-end to the local message bus
//!
//! Clients exchange newline-delimited JSON:
//!
//! ```text
//! -> {"op":"subscribe","topic":"can.rx.*"}
//! <- {"ok":true}
//! -> {"op":"publish","topic":"can.tx","payload":{"signals":{"Speed":55.5}}}
//! <- {"ok":true}
//! <- {"topic":"can.rx.VehicleSpeed","payload":{...}}
//! ```
//!
//! Payloads on the bus use the bridge's payload format; the broker converts
//! them to and from the JSON seen by its clients.

use anyhow::Result;
use cand_core::{BusMessage, MessageBus, PayloadFormat};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Lines queued for one client before deliveries are dropped
const CLIENT_QUEUE: usize = 256;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum ClientRequest {
    Subscribe {
        topic: String,
    },
    Publish {
        topic: String,
        payload: serde_json::Value,
    },
}

#[derive(Debug, Serialize)]
struct Ack {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Ack {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn error(message: impl ToString) -> Self {
        Self {
            ok: false,
            error: Some(message.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct Delivery<'a> {
    topic: &'a str,
    payload: serde_json::Value,
}

/// Accept clients until `cancel` fires
pub async fn serve(
    listener: TcpListener,
    bus: Arc<dyn MessageBus>,
    format: PayloadFormat,
    cancel: CancellationToken,
) {
    match listener.local_addr() {
        Ok(addr) => log::info!("Message bus broker listening on {}", addr),
        Err(e) => log::warn!("Broker address unavailable: {}", e),
    }

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                log::info!("Client connected: {}", addr);
                let bus = Arc::clone(&bus);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, bus, format, cancel).await {
                        log::warn!("Client {} error: {}", addr, e);
                    }
                    log::info!("Client disconnected: {}", addr);
                });
            }
            Err(e) => {
                log::error!("Failed to accept connection: {}", e);
            }
        }
    }

    log::debug!("Broker stopped");
}

async fn handle_client(
    stream: TcpStream,
    bus: Arc<dyn MessageBus>,
    format: PayloadFormat,
    cancel: CancellationToken,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    // Everything sent to the client goes through this queue
    let (out_tx, mut out_rx) = mpsc::channel::<String>(CLIENT_QUEUE);
    let writer_task = tokio::spawn(async move {
        while let Some(line) = out_rx.recv().await {
            if writer.write_all(line.as_bytes()).await.is_err()
                || writer.write_all(b"\n").await.is_err()
            {
                break;
            }
        }
    });

    let mut forwarders: Vec<JoinHandle<()>> = Vec::new();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let ack = match serde_json::from_str::<ClientRequest>(trimmed) {
            Ok(ClientRequest::Subscribe { topic }) => match bus.subscribe(&topic).await {
                Ok(subscription) => {
                    log::debug!("Client subscribed to {}", topic);
                    forwarders.push(tokio::spawn(forward(subscription, format, out_tx.clone())));
                    Ack::ok()
                }
                Err(e) => Ack::error(e),
            },
            Ok(ClientRequest::Publish { topic, payload }) => {
                match format.encode(&payload) {
                    Ok(bytes) => match bus.publish(&topic, bytes).await {
                        Ok(()) => Ack::ok(),
                        Err(e) => Ack::error(e),
                    },
                    Err(e) => Ack::error(e),
                }
            }
            Err(e) => {
                log::warn!("Invalid client request: {}", e);
                Ack::error(format!("Invalid request: {}", e))
            }
        };

        if out_tx.send(serde_json::to_string(&ack)?).await.is_err() {
            break;
        }
    }

    for forwarder in forwarders {
        forwarder.abort();
    }
    drop(out_tx);
    let _ = writer_task.await;

    Ok(())
}

/// Push every message of a subscription to the client queue
async fn forward(
    mut subscription: cand_core::Subscription,
    format: PayloadFormat,
    out: mpsc::Sender<String>,
) {
    while let Some(message) = subscription.recv().await {
        let line = match delivery_line(&message, format) {
            Ok(line) => line,
            Err(e) => {
                log::warn!("Cannot forward message on {}: {}", message.topic, e);
                continue;
            }
        };
        if out.send(line).await.is_err() {
            break;
        }
    }
}

fn delivery_line(message: &BusMessage, format: PayloadFormat) -> serde_json::Result<String> {
    let payload = format.decode(&message.payload).unwrap_or_else(|_| {
        serde_json::Value::String(String::from_utf8_lossy(&message.payload).into_owned())
    });

    serde_json::to_string(&Delivery {
        topic: &message.topic,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cand_core::LocalBus;
    use serde_json::{json, Value};
    use tokio::io::Lines;
    use tokio::net::tcp::OwnedReadHalf;

    async fn start() -> (Arc<LocalBus>, TcpStream, CancellationToken) {
        start_with_format(PayloadFormat::Json).await
    }

    async fn start_with_format(
        format: PayloadFormat,
    ) -> (Arc<LocalBus>, TcpStream, CancellationToken) {
        let bus = Arc::new(LocalBus::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();

        tokio::spawn(serve(
            listener,
            Arc::clone(&bus) as Arc<dyn MessageBus>,
            format,
            cancel.clone(),
        ));

        let stream = TcpStream::connect(addr).await.unwrap();
        (bus, stream, cancel)
    }

    async fn read_json(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> Value {
        let line = lines.next_line().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn test_subscribe_receives_deliveries() {
        let (bus, stream, cancel) = start().await;
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        writer
            .write_all(b"{\"op\":\"subscribe\",\"topic\":\"can.rx.*\"}\n")
            .await
            .unwrap();
        assert_eq!(read_json(&mut lines).await, json!({"ok": true}));

        bus.publish("can.rx.VehicleSpeed", br#"{"signals":{"Speed":55.5}}"#.to_vec())
            .await
            .unwrap();

        let delivery = read_json(&mut lines).await;
        assert_eq!(delivery["topic"], "can.rx.VehicleSpeed");
        assert_eq!(delivery["payload"]["signals"]["Speed"], 55.5);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_publish_reaches_bus() {
        let (bus, stream, cancel) = start().await;
        let mut requests = bus.subscribe("can.tx").await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        let request = json!({"op": "publish", "topic": "can.tx", "payload": {"signals": {"Speed": 1.5}}});
        writer
            .write_all(format!("{}\n", request).as_bytes())
            .await
            .unwrap();
        assert_eq!(read_json(&mut lines).await, json!({"ok": true}));

        let message = requests.recv().await.unwrap();
        let payload: Value = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(payload["signals"]["Speed"], 1.5);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_invalid_requests_answered() {
        let (_bus, stream, cancel) = start().await;
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        writer.write_all(b"not json\n").await.unwrap();
        let ack = read_json(&mut lines).await;
        assert_eq!(ack["ok"], false);

        writer
            .write_all(b"{\"op\":\"publish\",\"topic\":\"can.*\",\"payload\":{}}\n")
            .await
            .unwrap();
        let ack = read_json(&mut lines).await;
        assert_eq!(ack["ok"], false);
        assert!(ack["error"].as_str().unwrap().contains("Invalid topic"));

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_msgpack_bus_seen_as_json() {
        let format = PayloadFormat::Msgpack;
        let (bus, stream, cancel) = start_with_format(format).await;
        let mut requests = bus.subscribe("can.tx").await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        writer
            .write_all(b"{\"op\":\"subscribe\",\"topic\":\"can.rx.*\"}\n")
            .await
            .unwrap();
        assert_eq!(read_json(&mut lines).await, json!({"ok": true}));

        let request = json!({"op": "publish", "topic": "can.tx", "payload": {"signals": {"Speed": 2.5}}});
        writer
            .write_all(format!("{}\n", request).as_bytes())
            .await
            .unwrap();
        assert_eq!(read_json(&mut lines).await, json!({"ok": true}));

        // Requests reach the bus as MessagePack
        let message = requests.recv().await.unwrap();
        let payload: Value = format.decode(&message.payload).unwrap();
        assert_eq!(payload["signals"]["Speed"], 2.5);
        assert!(serde_json::from_slice::<Value>(&message.payload).is_err());

        // Updates from the bus reach the client as JSON
        let update = format.encode(&json!({"signals": {"Speed": 7.5}})).unwrap();
        bus.publish("can.rx.VehicleSpeed", update).await.unwrap();
        let delivery = read_json(&mut lines).await;
        assert_eq!(delivery["payload"]["signals"]["Speed"], 7.5);

        cancel.cancel();
    }

    #[test]
    fn test_delivery_line_falls_back_to_text() {
        let message = BusMessage {
            topic: "t".to_string(),
            payload: b"plain".to_vec(),
        };
        assert_eq!(
            delivery_line(&message, PayloadFormat::Json).unwrap(),
            r#"{"topic":"t","payload":"plain"}"#
        );
    }
}
