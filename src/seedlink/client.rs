//! TCP transport for SeedLink.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::protocol::{self, Frame, SessionRequest};
use super::{SeedLinkError, Upstream};
use crate::model::ServerAddress;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// A SeedLink session over a plain TCP socket.
pub struct TcpUpstream {
    stream: Option<BufReader<TcpStream>>,
    server: Option<ServerAddress>,
    /// Set once `END` has been sent; the server then only streams.
    streaming: bool,
    connect_timeout: Duration,
    reply_timeout: Duration,
}

impl Default for TcpUpstream {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpUpstream {
    pub fn new() -> Self {
        Self {
            stream: None,
            server: None,
            streaming: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }

    async fn send(&mut self, line: &str) -> Result<(), SeedLinkError> {
        let stream = self.stream.as_mut().ok_or(SeedLinkError::NotConnected)?;
        debug!(command = line, "-> seedlink");
        let socket = stream.get_mut();
        socket.write_all(line.as_bytes()).await?;
        socket.write_all(b"\r\n").await?;
        socket.flush().await?;
        Ok(())
    }

    async fn reply(&mut self) -> Result<String, SeedLinkError> {
        let stream = self.stream.as_mut().ok_or(SeedLinkError::NotConnected)?;
        let mut line = String::new();
        let read = tokio::time::timeout(self.reply_timeout, stream.read_line(&mut line))
            .await
            .map_err(|_| SeedLinkError::Timeout("waiting for a command reply"))??;
        if read == 0 {
            return Err(SeedLinkError::Closed);
        }
        Ok(line.trim_end().to_string())
    }

    /// Send `command` and require an `OK` answer.
    async fn command(&mut self, command: &str) -> Result<(), SeedLinkError> {
        self.send(command).await?;
        let reply = self.reply().await?;
        if reply == "OK" {
            Ok(())
        } else {
            Err(SeedLinkError::Rejected {
                command: command.to_string(),
                reply,
            })
        }
    }
}

impl Upstream for TcpUpstream {
    async fn open(&mut self, server: &ServerAddress) -> Result<(), SeedLinkError> {
        self.close().await;

        let addr = (server.host.as_str(), server.port);
        let socket = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| SeedLinkError::Timeout("connecting"))??;
        self.stream = Some(BufReader::new(socket));
        self.server = Some(server.clone());

        self.send("HELLO").await?;
        let software = self.reply().await?;
        let organization = self.reply().await?;
        info!(server = %server, software = %software, organization = %organization, "Connected to SeedLink server");
        Ok(())
    }

    async fn negotiate(&mut self, request: &SessionRequest) -> Result<usize, SeedLinkError> {
        // A session cannot be reselected after END; start over on the same server.
        if self.streaming {
            let server = self.server.clone().ok_or(SeedLinkError::NotConnected)?;
            self.open(&server).await?;
        }
        if self.stream.is_none() {
            return Err(SeedLinkError::NotConnected);
        }

        let mut accepted = 0;
        'stations: for station in &request.stations {
            for line in request.commands_for(station) {
                match self.command(&line).await {
                    Ok(()) => {}
                    Err(SeedLinkError::Rejected { command, reply }) => {
                        warn!(
                            network = %station.network,
                            station = %station.station,
                            command = %command,
                            reply = %reply,
                            "Station selection rejected"
                        );
                        continue 'stations;
                    }
                    Err(e) => return Err(e),
                }
            }
            accepted += 1;
        }

        self.send("END").await?;
        self.streaming = true;
        info!(stations = accepted, requested = request.stations.len(), "SeedLink selection negotiated");
        Ok(accepted)
    }

    async fn collect(&mut self) -> Result<Frame, SeedLinkError> {
        let stream = self.stream.as_mut().ok_or(SeedLinkError::NotConnected)?;
        protocol::read_frame(stream).await
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.get_mut().write_all(b"BYE\r\n").await;
            let _ = stream.get_mut().shutdown().await;
            debug!(server = ?self.server.as_ref().map(ToString::to_string), "SeedLink session closed");
        }
        self.streaming = false;
    }
}
