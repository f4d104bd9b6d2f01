//! WebSocket transport to the Live API

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use secrecy::ExposeSecret;
use tokio::sync::oneshot;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};

use super::protocol::{decode_server_message, encode_frame, encode_setup};
use super::{
    Connection, EventSink, FailureKind, OpenRequest, Transport, TransportEvent, TransportFailure,
};
use crate::config::LiveConfig;

/// Opens Live API sessions over `tokio-tungstenite`
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    config: Arc<LiveConfig>,
}

impl WebSocketTransport {
    /// Create a transport for the given service configuration
    #[must_use]
    pub const fn new(config: Arc<LiveConfig>) -> Self {
        Self { config }
    }
}

impl Transport for WebSocketTransport {
    fn open(&self, request: OpenRequest) -> Box<dyn Connection> {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let config = Arc::clone(&self.config);

        tokio::spawn(run_connection(config, request, shutdown_rx));

        Box::new(WebSocketConnection {
            shutdown: Some(shutdown_tx),
        })
    }
}

struct WebSocketConnection {
    shutdown: Option<oneshot::Sender<()>>,
}

impl Connection for WebSocketConnection {
    fn close(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            // The task may already have exited
            let _ = tx.send(());
        }
    }
}

impl Drop for WebSocketConnection {
    fn drop(&mut self) {
        self.close();
    }
}

fn endpoint(config: &LiveConfig, key: &str) -> String {
    let separator = if config.url.contains('?') { '&' } else { '?' };
    format!("{}{separator}key={key}", config.url)
}

async fn run_connection(
    config: Arc<LiveConfig>,
    request: OpenRequest,
    mut shutdown: oneshot::Receiver<()>,
) {
    let OpenRequest {
        mut frames, events, ..
    } = request;

    let Some(key) = config.api_key.as_ref() else {
        events.emit(TransportEvent::Errored(TransportFailure::new(
            FailureKind::Unauthorized,
            "no API key configured",
        )));
        return;
    };
    let url = endpoint(&config, key.expose_secret());

    let connected = tokio::select! {
        _ = &mut shutdown => {
            tracing::debug!("connection cancelled during handshake");
            return;
        }
        result = connect_async(url) => result,
    };

    let stream = match connected {
        Ok((stream, _)) => stream,
        Err(e) => {
            events.emit(TransportEvent::Errored(handshake_failure(e)));
            return;
        }
    };
    let (mut sink, mut source) = stream.split();

    let setup = match encode_setup(&config) {
        Ok(setup) => setup,
        Err(e) => {
            events.emit(TransportEvent::Errored(TransportFailure::new(
                FailureKind::InvalidRequest,
                e.to_string(),
            )));
            return;
        }
    };
    if let Err(e) = sink.send(Message::Text(setup.into())).await {
        events.emit(TransportEvent::Errored(TransportFailure::new(
            FailureKind::Network,
            e.to_string(),
        )));
        return;
    }
    tracing::debug!(model = %config.model, "setup sent");

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                let _ = sink.send(Message::Close(None)).await;
                tracing::debug!("connection closed locally");
                break;
            }
            Some(frame) = frames.recv() => {
                let Ok(text) = encode_frame(&frame) else {
                    continue;
                };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    events.emit(TransportEvent::Errored(TransportFailure::new(
                        FailureKind::Network,
                        e.to_string(),
                    )));
                    break;
                }
            }
            message = source.next() => {
                if !handle_message(message, &events) {
                    break;
                }
            }
        }
    }
}

/// Forward one inbound message, returning `false` once the stream is done
fn handle_message(
    message: Option<std::result::Result<Message, tungstenite::Error>>,
    events: &EventSink,
) -> bool {
    let raw = match message {
        Some(Ok(Message::Text(text))) => text.as_str().as_bytes().to_vec(),
        Some(Ok(Message::Binary(data))) => data.to_vec(),
        Some(Ok(Message::Close(frame))) => {
            let failure = frame.and_then(|f| {
                TransportFailure::from_close_code(u16::from(f.code), f.reason.as_str())
            });
            match failure {
                Some(failure) => {
                    tracing::warn!(%failure, "connection closed by remote");
                    events.emit(TransportEvent::Errored(failure));
                }
                None => {
                    tracing::info!("connection closed by remote");
                    events.emit(TransportEvent::Closed);
                }
            }
            return false;
        }
        Some(Ok(_)) => return true,
        Some(Err(e)) => {
            events.emit(TransportEvent::Errored(TransportFailure::new(
                FailureKind::Network,
                e.to_string(),
            )));
            return false;
        }
        None => {
            events.emit(TransportEvent::Errored(TransportFailure::new(
                FailureKind::Network,
                "connection dropped",
            )));
            return false;
        }
    };

    match decode_server_message(&raw) {
        Ok(decoded) => {
            for event in decoded {
                events.emit(event);
            }
            true
        }
        Err(e) => {
            events.emit(TransportEvent::Errored(TransportFailure::new(
                FailureKind::Protocol,
                e.to_string(),
            )));
            false
        }
    }
}

fn handshake_failure(error: tungstenite::Error) -> TransportFailure {
    match error {
        tungstenite::Error::Http(response) => {
            let status = response.status().as_u16();
            let body = response
                .body()
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).trim().to_string())
                .unwrap_or_default();
            let message = if body.is_empty() {
                format!("handshake rejected with status {status}")
            } else {
                body
            };
            TransportFailure::from_status(status, message)
        }
        other => TransportFailure::new(FailureKind::Network, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::transport::frame_channel;
    use crate::voice::WireFormat;

    fn recording_sink() -> (EventSink, Arc<Mutex<Vec<TransportEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink = EventSink::new(move |event| sink_seen.lock().unwrap().push(event));
        (sink, seen)
    }

    #[test]
    fn key_is_appended_to_endpoint() {
        let config = LiveConfig {
            url: "wss://example.test/live".to_string(),
            ..LiveConfig::default()
        };
        assert_eq!(endpoint(&config, "abc"), "wss://example.test/live?key=abc");

        let config = LiveConfig {
            url: "wss://example.test/live?alt=json".to_string(),
            ..LiveConfig::default()
        };
        assert_eq!(endpoint(&config, "abc"), "wss://example.test/live?alt=json&key=abc");
    }

    #[tokio::test]
    async fn missing_key_is_unauthorized() {
        let transport = WebSocketTransport::new(Arc::new(LiveConfig::default()));
        let (sink, seen) = recording_sink();
        let (_sender, frames) = frame_channel(1);

        let _connection = transport.open(OpenRequest {
            input: WireFormat::mono(16_000),
            output: WireFormat::mono(24_000),
            frames,
            events: sink,
        });

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let seen = seen.lock().unwrap();
        match &seen[..] {
            [TransportEvent::Errored(failure)] => {
                assert_eq!(failure.kind, FailureKind::Unauthorized);
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn clean_close_is_not_a_failure() {
        let (sink, seen) = recording_sink();
        let frame = tungstenite::protocol::CloseFrame {
            code: tungstenite::protocol::frame::coding::CloseCode::Normal,
            reason: "bye".into(),
        };

        assert!(!handle_message(Some(Ok(Message::Close(Some(frame)))), &sink));
        assert_eq!(*seen.lock().unwrap(), vec![TransportEvent::Closed]);
    }

    #[test]
    fn policy_close_is_unauthorized() {
        let (sink, seen) = recording_sink();
        let frame = tungstenite::protocol::CloseFrame {
            code: tungstenite::protocol::frame::coding::CloseCode::Policy,
            reason: "API key not valid".into(),
        };

        assert!(!handle_message(Some(Ok(Message::Close(Some(frame)))), &sink));
        let seen = seen.lock().unwrap();
        assert!(matches!(
            &seen[..],
            [TransportEvent::Errored(TransportFailure { kind: FailureKind::Unauthorized, .. })]
        ));
    }

    #[test]
    fn binary_messages_are_decoded() {
        let (sink, seen) = recording_sink();
        let message = Message::Binary(br#"{"setupComplete":{}}"#.to_vec().into());

        assert!(handle_message(Some(Ok(message)), &sink));
        assert_eq!(*seen.lock().unwrap(), vec![TransportEvent::Opened]);
    }

    #[test]
    fn end_of_stream_is_a_network_failure() {
        let (sink, seen) = recording_sink();

        assert!(!handle_message(None, &sink));
        assert!(matches!(
            &seen.lock().unwrap()[..],
            [TransportEvent::Errored(TransportFailure { kind: FailureKind::Network, .. })]
        ));
    }
}
