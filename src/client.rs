//! Line-mode chat client.
//!
//! Connects to the server, sends the display name, then relays stdin lines
//! to the server and everything the server sends to stdout. Slash commands
//! are validated locally and sent in their wire form; `/exit` closes the
//! connection without waiting for the server.

use std::io;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::command::Command;
use crate::framing::MAX_MESSAGE_LEN;
use crate::session::validate_display_name;

/// A registered-or-registering connection to a chat server.
pub struct Client {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

impl Client {
    /// Connect and send `name` as the registration request.
    ///
    /// The server accepts silently, so success here only means the name was
    /// sent. A rejection arrives as the first [`Client::recv`] result
    /// followed by end of stream.
    pub async fn connect(addr: impl ToSocketAddrs, name: &str) -> io::Result<Self> {
        validate_display_name(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let mut client = Self { reader, writer };
        client.write_line(name).await?;
        Ok(client)
    }

    /// Send one chat message.
    pub async fn send(&mut self, message: &str) -> io::Result<()> {
        if message.len() >= MAX_MESSAGE_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("message too long ({} bytes, max {})", message.len(), MAX_MESSAGE_LEN - 1),
            ));
        }
        self.write_line(message).await
    }

    pub async fn send_command(&mut self, command: &Command) -> io::Result<()> {
        self.write_line(&command.to_wire()).await
    }

    /// Next chunk of server output, or `None` once the server has closed
    /// the connection.
    pub async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        let mut buf = vec![0u8; MAX_MESSAGE_LEN * 2];
        let n = self.reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(Bytes::from(buf)))
    }

    /// Close the sending side.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }

    /// Relay `input` lines to the server and server output to `output` until
    /// either side finishes or the user types `/exit`.
    pub async fn run<I, O>(mut self, input: I, mut output: O) -> io::Result<()>
    where
        I: AsyncRead + Unpin,
        O: AsyncWrite + Unpin,
    {
        let mut lines = BufReader::new(input).lines();
        let mut buf = vec![0u8; MAX_MESSAGE_LEN * 2];

        loop {
            tokio::select! {
                read = self.reader.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        tracing::debug!("server closed the connection");
                        break;
                    }
                    output.write_all(&buf[..n]).await?;
                    output.flush().await?;
                }
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        tracing::debug!("input closed");
                        break;
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match Command::parse(&line) {
                        Some(Ok(Command::Exit)) => {
                            self.send_command(&Command::Exit).await?;
                            break;
                        }
                        Some(Ok(command)) => self.send_command(&command).await?,
                        Some(Err(err)) if err.keyword().is_some() => {
                            output.write_all(format!("{err}\n").as_bytes()).await?;
                            output.flush().await?;
                        }
                        _ => {
                            if let Err(e) = self.send(&line).await {
                                if e.kind() != io::ErrorKind::InvalidInput {
                                    return Err(e);
                                }
                                output.write_all(format!("{e}\n").as_bytes()).await?;
                                output.flush().await?;
                            }
                        }
                    }
                }
            }
        }

        let _ = self.shutdown().await;
        Ok(())
    }

    async fn write_line(&mut self, text: &str) -> io::Result<()> {
        let mut payload = Vec::with_capacity(text.len() + 1);
        payload.extend_from_slice(text.as_bytes());
        payload.push(b'\n');
        self.writer.write_all(&payload).await
    }
}
