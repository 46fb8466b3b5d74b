//! One accepted connection, end to end.
//!
//! A handler moves through `AwaitingName -> Active -> Closed`. It reads the
//! requested display name, registers it, relays every inbound message to the
//! other clients, and on EOF, error, `/exit` or a close request removes its
//! session and shuts the socket down exactly once.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf};

use crate::command::Command;
use crate::framing::{trim_line_ending, MessageReader};
use crate::registry::RegistryError;
use crate::session::{BoxedWriter, Session};
use crate::state::ChatState;

pub const INVALID_NAME_NOTICE: &str = "Invalid Username.\n";
pub const NAME_TAKEN_NOTICE: &str = "Username already taken.\n";
pub const SERVER_FULL_NOTICE: &str = "Server is full.\n";

/// `[name]: message\n`
pub fn chat_line(name: &str, message: &[u8]) -> Vec<u8> {
    let mut line = Vec::with_capacity(name.len() + message.len() + 4);
    line.push(b'[');
    line.extend_from_slice(name.as_bytes());
    line.extend_from_slice(b"]: ");
    line.extend_from_slice(message);
    line.push(b'\n');
    line
}

pub fn departure_notice(name: &str) -> String {
    format!("Client {name} has disconnected.\n")
}

pub fn unsupported_notice(keyword: &str) -> String {
    format!("Unsupported command: {keyword}\n")
}

fn rejection_notice(err: &RegistryError) -> Option<&'static str> {
    match err {
        RegistryError::InvalidName(_) => Some(INVALID_NAME_NOTICE),
        RegistryError::NameExists(_) => Some(NAME_TAKEN_NOTICE),
        RegistryError::RegistryFull { .. } => Some(SERVER_FULL_NOTICE),
        RegistryError::SessionUnavailable => None,
    }
}

enum Phase {
    AwaitingName,
    Active(Session),
    /// Terminal. Carries the session if one was registered.
    Closed(Option<Session>),
}

struct Connection<S> {
    reader: MessageReader<ReadHalf<S>>,
    /// Owned here until registration moves it into the session.
    writer: Option<BoxedWriter>,
    peer: Option<SocketAddr>,
    state: ChatState,
}

/// Drive one client connection until it ends.
///
/// Transport errors end the session; they are logged, never returned.
pub async fn handle_connection<S>(stream: S, peer: Option<SocketAddr>, state: ChatState)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut conn = Connection {
        reader: MessageReader::new(read_half, state.config.framing),
        writer: Some(Box::new(write_half)),
        peer,
        state,
    };

    let mut phase = Phase::AwaitingName;
    loop {
        phase = match phase {
            Phase::AwaitingName => conn.await_name().await,
            Phase::Active(session) => conn.relay(session).await,
            Phase::Closed(session) => {
                conn.close(session).await;
                return;
            }
        };
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn await_name(&mut self) -> Phase {
        let peer = self.peer;
        let read = tokio::time::timeout(
            self.state.config.name_timeout,
            self.reader.next_message(),
        )
        .await;

        let raw = match read {
            Ok(Ok(Some(raw))) => raw,
            Ok(Ok(None)) => {
                tracing::debug!(?peer, "client left before registering");
                return Phase::Closed(None);
            }
            Ok(Err(e)) => {
                tracing::debug!(?peer, ?e, "read failed before registering");
                return Phase::Closed(None);
            }
            Err(_) => {
                tracing::debug!(?peer, "timed out waiting for display name");
                return Phase::Closed(None);
            }
        };

        let name = match std::str::from_utf8(trim_line_ending(&raw)) {
            Ok(name) => name.to_string(),
            Err(_) => {
                tracing::info!(?peer, "rejected non-UTF-8 display name");
                self.reject(INVALID_NAME_NOTICE).await;
                return Phase::Closed(None);
            }
        };

        let Some(writer) = self.writer.take() else {
            return Phase::Closed(None);
        };
        let session = Session::new(name, peer, writer);

        match self.state.registry.register(&session) {
            Ok(()) => {
                tracing::info!(
                    name = session.name(),
                    ?peer,
                    online = self.state.registry.len(),
                    "client registered"
                );
                Phase::Active(session)
            }
            Err(err) => {
                tracing::info!(name = session.name(), ?peer, %err, "registration rejected");
                if let Some(notice) = rejection_notice(&err) {
                    if let Err(e) = session.send(notice.as_bytes()) {
                        tracing::debug!(?peer, ?e, "failed to send rejection notice");
                    }
                }
                session.close(&self.state.registry).await;
                Phase::Closed(None)
            }
        }
    }

    async fn relay(&mut self, session: Session) -> Phase {
        let Connection { reader, state, .. } = self;

        loop {
            let message = tokio::select! {
                _ = session.close_requested() => {
                    tracing::debug!(name = session.name(), "close requested");
                    break;
                }
                _ = state.disconnect_all.cancelled() => {
                    tracing::debug!(name = session.name(), "server is disconnecting everyone");
                    // Forced: do not wait for the outbox to drain
                    session.request_close();
                    break;
                }
                read = reader.next_message() => match read {
                    Ok(Some(message)) => message,
                    Ok(None) => {
                        tracing::debug!(name = session.name(), "client closed the connection");
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(name = session.name(), ?e, "read failed");
                        break;
                    }
                },
            };

            let text = trim_line_ending(&message);
            if text.is_empty() {
                continue;
            }

            if let Ok(s) = std::str::from_utf8(text) {
                match Command::parse(s) {
                    Some(Ok(Command::Exit)) => {
                        tracing::debug!(name = session.name(), "client sent /exit");
                        break;
                    }
                    Some(Ok(command)) => {
                        reply_unsupported(state, &session, command.keyword());
                        continue;
                    }
                    Some(Err(err)) => {
                        if let Some(keyword) = err.keyword() {
                            reply_unsupported(state, &session, keyword);
                            continue;
                        }
                    }
                    None => {}
                }
            }

            tracing::info!(
                target: "chatd::chat",
                from = session.name(),
                "{}",
                String::from_utf8_lossy(text)
            );
            let line = chat_line(session.name(), text);
            state.broadcaster.broadcast(session.id(), &line);
        }

        Phase::Closed(Some(session))
    }

    async fn close(&mut self, session: Option<Session>) {
        let Some(session) = session else {
            if let Some(mut writer) = self.writer.take() {
                let _ = writer.shutdown().await;
            }
            return;
        };

        if !session.close(&self.state.registry).await {
            return;
        }
        tracing::info!(
            name = session.name(),
            peer = ?session.peer(),
            online = self.state.registry.len(),
            "client disconnected"
        );
        if self.state.config.announce_departures {
            let notice = departure_notice(session.name());
            tracing::info!(target: "chatd::chat", "{}", notice.trim_end());
            self.state
                .broadcaster
                .broadcast(session.id(), notice.as_bytes());
        }
    }

    /// Send a notice on a connection that never got a session.
    async fn reject(&mut self, notice: &str) {
        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.write_all(notice.as_bytes()).await {
                tracing::debug!(peer = ?self.peer, ?e, "failed to send rejection notice");
            }
        }
    }
}

fn reply_unsupported(state: &ChatState, session: &Session, keyword: &str) {
    tracing::debug!(name = session.name(), keyword, "unsupported command");
    if let Err(e) = state.broadcaster.send_to(session, unsupported_notice(keyword)) {
        tracing::debug!(name = session.name(), ?e, "failed to reply to command");
    }
}
