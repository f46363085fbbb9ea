use std::{fmt, net::SocketAddr};

use tokio::sync::mpsc;
use tracing::info;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// One lifecycle record produced by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Connected {
        client_id: u64,
        peer: SocketAddr,
    },
    Message {
        seq: u64,
        client_id: u64,
        payload: Vec<u8>,
    },
    Disconnected {
        client_id: u64,
        reason: DisconnectReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed its side of the stream.
    Closed,
    /// A read failed; treated the same as a close.
    ReadError,
    /// The dispatcher asked the handler to stop.
    Shutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DisconnectReason::Closed => "closed",
            DisconnectReason::ReadError => "read error",
            DisconnectReason::Shutdown => "shutdown",
        };
        f.write_str(text)
    }
}

/// Renders a received chunk for humans: lossy UTF-8, trailing line endings dropped.
pub fn payload_text(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload)
        .trim_end_matches(LINE_ENDINGS)
        .to_string()
}

/// Sink for [`ServerEvent`]s.
///
/// Every event is written to `tracing`. When built with [`EventLog::with_tap`],
/// the same events are also forwarded to an unbounded channel so tests and
/// embedding code can observe exactly what the server logged.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    tap: Option<mpsc::UnboundedSender<ServerEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tap() -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tap: Some(tx) }, rx)
    }

    pub fn emit(&self, event: ServerEvent) {
        log_event(&event);
        if let Some(tap) = &self.tap {
            // A dropped receiver just means nobody is watching any more.
            let _ = tap.send(event);
        }
    }
}

fn log_event(event: &ServerEvent) {
    match event {
        ServerEvent::Connected { client_id, peer } => {
            info!(client_id, %peer, "client connected");
        }
        ServerEvent::Message {
            seq,
            client_id,
            payload,
        } => {
            info!(
                seq,
                client_id,
                payload = %payload_text(payload),
                "message received"
            );
        }
        ServerEvent::Disconnected { client_id, reason } => {
            info!(client_id, %reason, "client disconnected");
        }
    }
}
