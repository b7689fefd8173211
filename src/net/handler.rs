//! Connection handler module
//!
//! Handles the lifecycle of one client socket:
//! - Registering a session with the dispatcher
//! - Reading newline-delimited JSON messages with a size cap
//! - Writing queued server messages from a separate task
//! - Disconnecting the session when the socket closes or the server
//!   closes the session

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

use crate::error::{NetworkError, ProtocolError, Result};
use crate::net::dispatcher::SessionDispatcher;
use crate::net::session::{Session, SessionId};
use crate::protocol::{decode_line, encode_line, ServerMessage, MAX_MESSAGE_SIZE};

/// Outbound messages queued per session before new ones are dropped
const OUTBOUND_QUEUE_SIZE: usize = 256;

/// Time the writer gets to flush after the reader stops
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Connection handler for processing client connections
pub struct ConnectionHandler {
    dispatcher: Arc<SessionDispatcher>,
}

impl ConnectionHandler {
    /// Create a new connection handler
    pub fn new(dispatcher: Arc<SessionDispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Handle a TCP connection until either side closes it
    pub async fn handle_tcp(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        debug!(address = %addr, "Handling TCP connection");
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        let session = self.dispatcher.connect(addr, Some(tx));
        let session_id = session.id;

        let writer = tokio::spawn(write_loop(write_half, rx, session_id));
        let result = self.read_loop(read_half, &session).await;

        debug!(session_id = session_id, "Connection handler ending");
        self.dispatcher.disconnect(session_id, "Connection closed");

        // The writer stops once the last sender, held by the session, is gone
        drop(session);
        match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(session_id = session_id, error = %e, "Writer task failed"),
            Err(_) => debug!(session_id = session_id, "Writer did not drain in time"),
        }

        result
    }

    async fn read_loop(&self, read_half: OwnedReadHalf, session: &Arc<Session>) -> Result<()> {
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        // Room for the terminator on a maximum-size message
        let read_limit = (MAX_MESSAGE_SIZE + 2) as u64;

        loop {
            line.clear();
            let mut limited = (&mut reader).take(read_limit);
            let read = tokio::select! {
                read = limited.read_line(&mut line) => read,
                _ = session.closed() => {
                    debug!(session_id = session.id, "Session closed by server");
                    return Ok(());
                }
            };

            let n = read.map_err(|e| NetworkError::ReadError(e.to_string()))?;
            if n == 0 {
                debug!(session_id = session.id, "Connection closed by peer");
                return Ok(());
            }

            if !line.ends_with('\n') && n as u64 >= read_limit {
                session.send(ServerMessage::system("Message too large"));
                return Err(ProtocolError::MessageTooLarge {
                    size: n,
                    max: MAX_MESSAGE_SIZE,
                }
                .into());
            }

            if line.trim().is_empty() {
                continue;
            }

            match decode_line(&line) {
                Ok(message) => {
                    trace!(session_id = session.id, message = message.kind(), "Message received");
                    self.dispatcher.handle_message(session, message);
                }
                Err(e) => {
                    debug!(session_id = session.id, error = %e, "Undecodable message");
                    session.send(ServerMessage::system(format!("Bad message: {}", e)));
                }
            }

            if !session.is_active() {
                return Ok(());
            }
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<ServerMessage>,
    session_id: SessionId,
) {
    while let Some(message) = rx.recv().await {
        let bytes = match encode_line(&message) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(session_id = session_id, error = %e, "Failed to encode message");
                continue;
            }
        };

        if let Err(e) = writer.write_all(&bytes).await {
            debug!(session_id = session_id, error = %e, "Write failed");
            break;
        }
    }

    if let Err(e) = writer.shutdown().await {
        trace!(session_id = session_id, error = %e, "Error during socket shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AccountService;
    use crate::game::persistence::MemoryStore;
    use crate::game::template::TemplateRegistry;
    use crate::game::world::{GameWorld, WorldSettings};
    use crate::net::dispatcher::DispatcherSettings;
    use tokio::io::Lines;
    use tokio::net::TcpListener;

    fn dispatcher() -> Arc<SessionDispatcher> {
        let store = Arc::new(MemoryStore::new());
        let world = Arc::new(GameWorld::new(
            WorldSettings::default(),
            Arc::new(TemplateRegistry::default()),
            store.clone(),
        ));
        Arc::new(SessionDispatcher::new(
            DispatcherSettings::default(),
            world,
            AccountService::new(store, true),
        ))
    }

    async fn next_message(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> ServerMessage {
        let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn test_tcp_login_bad_message_and_logout() {
        let dispatcher = dispatcher();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_dispatcher = Arc::clone(&dispatcher);
        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            ConnectionHandler::new(server_dispatcher)
                .handle_tcp(stream, peer)
                .await
        });

        let client = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = client.into_split();
        let mut lines = BufReader::new(read_half).lines();

        write_half
            .write_all(b"{\"type\":\"login\",\"name\":\"tester\",\"password\":\"secret1\"}\n")
            .await
            .unwrap();
        match next_message(&mut lines).await {
            ServerMessage::LoginAccepted { name, .. } => assert_eq!(name, "tester"),
            other => panic!("unexpected message: {:?}", other),
        }
        assert_eq!(dispatcher.sessions().login_count(), 1);

        write_half.write_all(b"not json\n").await.unwrap();
        assert!(matches!(
            next_message(&mut lines).await,
            ServerMessage::SystemMessage { .. }
        ));

        write_half.write_all(b"{\"type\":\"logout\"}\n").await.unwrap();
        assert!(matches!(
            next_message(&mut lines).await,
            ServerMessage::Disconnected { .. }
        ));

        let end = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(end, None);

        server.await.unwrap().unwrap();
        assert_eq!(dispatcher.sessions().count(), 0);
        assert_eq!(dispatcher.sessions().login_count(), 0);
    }

    #[tokio::test]
    async fn test_peer_close_disconnects_session() {
        let dispatcher = dispatcher();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_dispatcher = Arc::clone(&dispatcher);
        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            ConnectionHandler::new(server_dispatcher)
                .handle_tcp(stream, peer)
                .await
        });

        let client = TcpStream::connect(addr).await.unwrap();
        drop(client);

        server.await.unwrap().unwrap();
        assert_eq!(dispatcher.sessions().count(), 0);
    }
}
