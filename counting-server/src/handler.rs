use std::sync::Arc;

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    select,
    sync::broadcast,
};
use tracing::debug;

use crate::{
    counters::CounterKind,
    event::{DisconnectReason, ServerEvent},
    server::ServerState,
};

/// An accepted connection together with the id it was assigned at accept time.
///
/// The handler owns the stream from spawn until it terminates; dropping the
/// connection closes it.
#[derive(Debug)]
pub struct ClientConnection<S> {
    pub stream: S,
    pub client_id: u64,
}

/// What a finished handler reports back to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub client_id: u64,
    pub messages: u64,
    pub bytes: u64,
    pub reason: DisconnectReason,
}

/// Reads chunks from one connection until it closes, fails, or the dispatcher
/// signals shutdown.
///
/// Every non-empty read claims the next global sequence number and is logged
/// as one message, whatever its size or content. A zero-length read and a
/// read error both end the connection.
pub(crate) async fn handle_connection<S>(
    connection: ClientConnection<S>,
    state: Arc<ServerState>,
    mut stop: broadcast::Receiver<()>,
) -> ConnectionSummary
where
    S: AsyncRead + Unpin,
{
    let ClientConnection {
        mut stream,
        client_id,
    } = connection;
    let mut buf = vec![0u8; state.chunk_size.get()];
    let mut messages = 0u64;
    let mut bytes = 0u64;

    let reason = loop {
        select! {
            read = stream.read(&mut buf) => match read {
                Ok(0) => break DisconnectReason::Closed,
                Ok(len) => {
                    record_message(&state, client_id, &buf[..len]);
                    messages += 1;
                    bytes += len as u64;
                }
                Err(err) => {
                    debug!(client_id, error = ?err, "read failed");
                    break DisconnectReason::ReadError;
                }
            },
            _ = stop.recv() => break DisconnectReason::Shutdown,
        }
    };

    drop(stream);
    state
        .events
        .emit(ServerEvent::Disconnected { client_id, reason });

    ConnectionSummary {
        client_id,
        messages,
        bytes,
        reason,
    }
}

fn record_message(state: &ServerState, client_id: u64, chunk: &[u8]) {
    let seq = state.counters.next_value(CounterKind::Messages);
    state.events.emit(ServerEvent::Message {
        seq,
        client_id,
        payload: chunk.to_vec(),
    });
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        num::NonZeroUsize,
        pin::Pin,
        task::{Context, Poll},
        time::Duration,
    };

    use tokio::{
        io::{AsyncWriteExt, ReadBuf},
        sync::mpsc,
        time::timeout,
    };

    use super::*;
    use crate::{
        counters::{CounterStore, SharedCounters},
        event::EventLog,
    };

    fn test_state(chunk_size: usize) -> (Arc<ServerState>, mpsc::UnboundedReceiver<ServerEvent>) {
        let (events, rx) = EventLog::with_tap();
        let state = ServerState {
            counters: Arc::new(SharedCounters::new()),
            events,
            chunk_size: NonZeroUsize::new(chunk_size).expect("non-zero chunk size"),
        };
        (Arc::new(state), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    struct FailingReader;

    impl AsyncRead for FailingReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "peer reset",
            )))
        }
    }

    #[tokio::test]
    async fn silent_connection_logs_only_termination() {
        let (state, mut rx) = test_state(64);
        let (stop_tx, stop_rx) = broadcast::channel(1);
        let (client, server) = tokio::io::duplex(1024);
        drop(client);

        let summary = handle_connection(
            ClientConnection {
                stream: server,
                client_id: 1,
            },
            state,
            stop_rx,
        )
        .await;

        assert_eq!(summary.messages, 0);
        assert_eq!(summary.reason, DisconnectReason::Closed);
        assert_eq!(
            drain(&mut rx),
            vec![ServerEvent::Disconnected {
                client_id: 1,
                reason: DisconnectReason::Closed
            }]
        );
        drop(stop_tx);
    }

    #[tokio::test]
    async fn oversized_write_is_split_into_chunks() {
        let (state, mut rx) = test_state(64);
        let (_stop_tx, stop_rx) = broadcast::channel(1);
        let (mut client, server) = tokio::io::duplex(1024);

        let payload: Vec<u8> = (0..150u8).map(|i| b'a' + i % 26).collect();
        client.write_all(&payload).await.expect("write payload");
        drop(client);

        let summary = handle_connection(
            ClientConnection {
                stream: server,
                client_id: 4,
            },
            Arc::clone(&state),
            stop_rx,
        )
        .await;

        assert_eq!(summary.messages, 3);
        assert_eq!(summary.bytes, 150);

        let events = drain(&mut rx);
        let mut reassembled = Vec::new();
        let mut seqs = Vec::new();
        for event in &events[..3] {
            match event {
                ServerEvent::Message {
                    seq,
                    client_id,
                    payload,
                } => {
                    assert_eq!(*client_id, 4);
                    assert!(payload.len() <= 64);
                    seqs.push(*seq);
                    reassembled.extend_from_slice(payload);
                }
                other => panic!("expected a message record, got {other:?}"),
            }
        }
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(reassembled, payload);
        assert!(matches!(
            events[3],
            ServerEvent::Disconnected {
                client_id: 4,
                reason: DisconnectReason::Closed
            }
        ));
        assert_eq!(state.counters.issued(CounterKind::Messages), 3);
    }

    #[tokio::test]
    async fn read_error_ends_the_connection() {
        let (state, mut rx) = test_state(64);
        let (_stop_tx, stop_rx) = broadcast::channel(1);

        let summary = handle_connection(
            ClientConnection {
                stream: FailingReader,
                client_id: 9,
            },
            state,
            stop_rx,
        )
        .await;

        assert_eq!(summary.reason, DisconnectReason::ReadError);
        assert_eq!(
            drain(&mut rx),
            vec![ServerEvent::Disconnected {
                client_id: 9,
                reason: DisconnectReason::ReadError
            }]
        );
    }

    #[tokio::test]
    async fn stop_signal_interrupts_a_blocked_read() {
        let (state, mut rx) = test_state(64);
        let (stop_tx, stop_rx) = broadcast::channel(1);
        let (mut client, server) = tokio::io::duplex(1024);

        let handler = tokio::spawn(handle_connection(
            ClientConnection {
                stream: server,
                client_id: 2,
            },
            state,
            stop_rx,
        ));

        client.write_all(b"first\n").await.expect("write");
        let first = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("message record in time")
            .expect("tap open");
        assert!(matches!(first, ServerEvent::Message { seq: 1, .. }));

        stop_tx.send(()).expect("handler is subscribed");
        let summary = timeout(Duration::from_secs(1), handler)
            .await
            .expect("handler stops in time")
            .expect("handler task");

        assert_eq!(summary.reason, DisconnectReason::Shutdown);
        assert_eq!(summary.messages, 1);

        // The handler dropped its end, so the peer observes the close.
        let mut rest = Vec::new();
        let read = client.read_to_end(&mut rest).await.expect("read after close");
        assert_eq!(read, 0);
    }

    #[tokio::test]
    async fn messages_on_one_connection_keep_read_order() {
        let (state, mut rx) = test_state(8);
        let (_stop_tx, stop_rx) = broadcast::channel(1);
        let (mut client, server) = tokio::io::duplex(8);

        let handler = tokio::spawn(handle_connection(
            ClientConnection {
                stream: server,
                client_id: 3,
            },
            state,
            stop_rx,
        ));

        let mut seqs = Vec::new();
        for word in ["one", "two", "three"] {
            client.write_all(word.as_bytes()).await.expect("write");
            let event = timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("record in time")
                .expect("tap open");
            match event {
                ServerEvent::Message { seq, payload, .. } => {
                    assert_eq!(payload, word.as_bytes());
                    seqs.push(seq);
                }
                other => panic!("expected a message record, got {other:?}"),
            }
        }
        drop(client);
        let summary = handler.await.expect("handler task");

        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(summary.messages, 3);
        assert_eq!(summary.reason, DisconnectReason::Closed);
        assert_eq!(
            drain(&mut rx),
            vec![ServerEvent::Disconnected {
                client_id: 3,
                reason: DisconnectReason::Closed
            }]
        );
    }
}
