use std::borrow::Cow;
use std::fmt::Display;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::SplitSink;
use futures::{Sink, SinkExt};

use super::dto::EventMessage;
use crate::domain::models::types::OrderEvent;
use crate::domain::services::delivery::{EventSink, SinkError};
use crate::domain::services::registry::CloseReason;

/// Write half of a subscriber's WebSocket.
///
/// Events go out as JSON text frames, heartbeats as pings, and the close
/// reason as the close frame's code and text. Any sink of WebSocket messages
/// works as the write half.
pub struct WebSocketSink<S = SplitSink<WebSocket, Message>> {
    sender: S,
}

impl<S> WebSocketSink<S> {
    pub fn new(sender: S) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl<S> EventSink for WebSocketSink<S>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display + Send,
{
    async fn send_event(&mut self, event: &OrderEvent) -> Result<(), SinkError> {
        let text = serde_json::to_string(&EventMessage::from(event))
            .map_err(|e| SinkError::Write(e.to_string()))?;
        self.sender
            .send(Message::Text(text))
            .await
            .map_err(|e| SinkError::Write(e.to_string()))
    }

    async fn heartbeat(&mut self) -> Result<(), SinkError> {
        self.sender
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| SinkError::Write(e.to_string()))
    }

    async fn close(&mut self, reason: &CloseReason) -> Result<(), SinkError> {
        let frame = CloseFrame {
            code: reason.code(),
            reason: Cow::Borrowed(reason.description()),
        };
        self.sender
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|_| SinkError::Closed)?;
        self.sender.close().await.map_err(|_| SinkError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use futures::StreamExt;
    use futures::channel::mpsc;
    use serde_json::{Value, json};

    use crate::domain::models::types::{OperationKind, RestaurantId};

    fn order_event() -> OrderEvent {
        OrderEvent {
            event_id: 42,
            order_id: "order-42".to_string(),
            operation_kind: OperationKind::Created,
            restaurant_id: RestaurantId::new("r-1"),
            payload_snapshot: json!({ "status": "pending" }),
            occurred_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_event_goes_out_as_json_text() {
        let (tx, mut rx) = mpsc::unbounded();
        let mut sink = WebSocketSink::new(tx);

        sink.send_event(&order_event()).await.unwrap();

        match rx.next().await {
            Some(Message::Text(text)) => {
                let value: Value = serde_json::from_str(&text).unwrap();
                assert_eq!(value["eventId"], 42);
                assert_eq!(value["orderId"], "order-42");
                assert_eq!(value["operationKind"], "created");
                assert_eq!(value["payloadSnapshot"]["status"], "pending");
            }
            other => panic!("expected a text frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_heartbeat_is_an_empty_ping() {
        let (tx, mut rx) = mpsc::unbounded();
        let mut sink = WebSocketSink::new(tx);

        sink.heartbeat().await.unwrap();

        assert!(matches!(rx.next().await, Some(Message::Ping(payload)) if payload.is_empty()));
    }

    #[tokio::test]
    async fn test_close_sends_coded_frame_then_ends_stream() {
        let (tx, mut rx) = mpsc::unbounded();
        let mut sink = WebSocketSink::new(tx);

        sink.close(&CloseReason::ResyncRequired("gap".to_string())).await.unwrap();

        match rx.next().await {
            Some(Message::Close(Some(frame))) => {
                assert_eq!(frame.code, 4409);
                assert_eq!(frame.reason, "resync_required");
            }
            other => panic!("expected a close frame, got {:?}", other),
        }
        assert!(rx.next().await.is_none());
    }

    #[tokio::test]
    async fn test_write_to_gone_peer_is_an_error() {
        let (tx, rx) = mpsc::unbounded();
        let mut sink = WebSocketSink::new(tx);
        drop(rx);

        let result = sink.send_event(&order_event()).await;
        assert!(matches!(result, Err(SinkError::Write(_))));
        assert!(matches!(sink.close(&CloseReason::Shutdown).await, Err(SinkError::Closed)));
    }
}
