//! Out-of-band payload transfer
//!
//! Packets that carry bulk data announce it with `payloadSize` and a
//! `payloadTransferInfo` holding a TCP port. The bytes themselves travel on
//! a separate connection so the control channel is never blocked behind a
//! large transfer.
//!
//! ## Protocol
//!
//! 1. Sender binds a TCP listener on an available port (1739-1764)
//! 2. Sender sends the packet with `payloadSize` and the port
//! 3. Receiver connects to sender's address on that port
//! 4. Raw payload bytes are streamed
//! 5. Connection closes when all bytes are transferred
//!
//! A transfer that delivers fewer bytes than announced fails with
//! [`ProtocolError::PayloadTransferFailed`] and any partial data is
//! discarded.

use crate::{ProtocolError, Result};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

/// Default timeout for TCP connections (30 seconds)
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for read/write operations (60 seconds)
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(60);

/// Buffer size for streaming (64KB)
const BUFFER_SIZE: usize = 65536;

/// Port range for payload servers
pub const PORT_RANGE_START: u16 = 1739;
pub const PORT_RANGE_END: u16 = 1764;

/// Progress callback for payload transfers
///
/// Reports transferred bytes and total expected size.
/// Return `false` to cancel the transfer.
pub type ProgressCallback = Box<dyn Fn(u64, u64) -> bool + Send + Sync>;

/// TCP server for sending payloads
///
/// Listens on an available port in the payload range and accepts a single
/// connection to transfer the data.
pub struct PayloadServer {
    listener: TcpListener,
    port: u16,
    progress_callback: Option<ProgressCallback>,
}

impl PayloadServer {
    /// Create a new payload server on an available port
    ///
    /// # Errors
    ///
    /// Returns `PayloadTransferFailed` if every port in 1739-1764 is in use.
    pub async fn new() -> Result<Self> {
        for port in PORT_RANGE_START..=PORT_RANGE_END {
            let addr = format!("0.0.0.0:{}", port);
            if let Ok(listener) = TcpListener::bind(&addr).await {
                info!("Payload server listening on port {}", port);
                return Ok(Self {
                    listener,
                    port,
                    progress_callback: None,
                });
            }
        }

        Err(ProtocolError::PayloadTransferFailed(format!(
            "All ports in range {}-{} are in use",
            PORT_RANGE_START, PORT_RANGE_END
        )))
    }

    /// Set a progress callback for transfer updates
    ///
    /// The callback receives (bytes_transferred, total_bytes) and returns
    /// `true` to continue or `false` to cancel the transfer.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    /// Get the port this server is listening on
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get the socket address this server is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept a connection and stream a file's contents
    ///
    /// Waits for exactly one connection, then streams the file. The
    /// connection is closed after the data is fully sent.
    pub async fn send_file(self, file_path: impl AsRef<Path>) -> Result<()> {
        let file_path = file_path.as_ref();
        info!("Waiting for connection to send payload: {:?}", file_path);

        let file_size = tokio::fs::metadata(file_path).await?.len();

        let (mut stream, remote_addr) = timeout(CONNECTION_TIMEOUT, self.listener.accept())
            .await
            .map_err(|_| {
                ProtocolError::PayloadTransferFailed(
                    "Timed out waiting for the receiver to connect".to_string(),
                )
            })??;

        debug!("Accepted payload connection from {}", remote_addr);

        let mut file = File::open(file_path).await?;

        let mut buffer = vec![0u8; BUFFER_SIZE];
        let mut total_bytes = 0u64;

        loop {
            let bytes_read = timeout(TRANSFER_TIMEOUT, file.read(&mut buffer))
                .await
                .map_err(|_| {
                    ProtocolError::PayloadTransferFailed("File read timeout".to_string())
                })??;

            if bytes_read == 0 {
                break; // EOF
            }

            timeout(TRANSFER_TIMEOUT, stream.write_all(&buffer[..bytes_read]))
                .await
                .map_err(|_| {
                    ProtocolError::PayloadTransferFailed("Stream write timeout".to_string())
                })??;

            total_bytes += bytes_read as u64;

            if let Some(ref callback) = self.progress_callback {
                if !callback(total_bytes, file_size) {
                    info!("Transfer cancelled by progress callback");
                    return Err(ProtocolError::PayloadTransferFailed(
                        "Transfer cancelled".to_string(),
                    ));
                }
            }
        }

        stream.flush().await?;

        info!(
            "Payload transfer complete: {} bytes sent to {}",
            total_bytes, remote_addr
        );

        Ok(())
    }

    /// Accept a connection and stream bytes from memory
    ///
    /// Used for packet payloads that are already in memory; file transfers
    /// go through [`PayloadServer::send_file`].
    pub async fn send_bytes(self, data: &[u8]) -> Result<()> {
        let (mut stream, remote_addr) = timeout(CONNECTION_TIMEOUT, self.listener.accept())
            .await
            .map_err(|_| {
                ProtocolError::PayloadTransferFailed(
                    "Timed out waiting for the receiver to connect".to_string(),
                )
            })??;

        debug!("Accepted payload connection from {}", remote_addr);

        timeout(TRANSFER_TIMEOUT, stream.write_all(data))
            .await
            .map_err(|_| {
                ProtocolError::PayloadTransferFailed("Stream write timeout".to_string())
            })??;
        stream.flush().await?;

        info!(
            "Payload transfer complete: {} bytes sent to {}",
            data.len(),
            remote_addr
        );

        Ok(())
    }
}

/// TCP client for receiving payloads
///
/// Connects to a remote payload server and downloads the announced bytes.
pub struct PayloadClient {
    stream: TcpStream,
    progress_callback: Option<ProgressCallback>,
}

impl PayloadClient {
    /// Connect to a remote payload server
    pub async fn new(host: &str, port: u16) -> Result<Self> {
        let addr = (host, port).to_socket_addrs()?.next().ok_or_else(|| {
            ProtocolError::PayloadTransferFailed("No addresses resolved for host".to_string())
        })?;
        debug!("Connecting to payload server at {}", addr);

        let stream = timeout(CONNECTION_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                ProtocolError::PayloadTransferFailed(format!(
                    "Timed out connecting to payload server at {}",
                    addr
                ))
            })??;

        Ok(Self {
            stream,
            progress_callback: None,
        })
    }

    /// Set a progress callback for transfer updates
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    /// Receive the announced number of bytes into a file
    ///
    /// On any failure the partial file is deleted before the error is
    /// returned; consumers never observe half a payload.
    pub async fn receive_file(
        mut self,
        save_path: impl AsRef<Path>,
        expected_size: u64,
    ) -> Result<()> {
        let save_path = save_path.as_ref();
        info!(
            "Receiving payload to {:?} ({} bytes expected)",
            save_path, expected_size
        );

        let mut file = File::create(save_path).await?;

        let mut buffer = vec![0u8; BUFFER_SIZE];
        let mut total_bytes = 0u64;

        let result = async {
            while total_bytes < expected_size {
                let remaining = expected_size - total_bytes;
                let to_read = std::cmp::min(remaining, BUFFER_SIZE as u64) as usize;

                let bytes_read =
                    timeout(TRANSFER_TIMEOUT, self.stream.read(&mut buffer[..to_read]))
                        .await
                        .map_err(|_| {
                            ProtocolError::PayloadTransferFailed(
                                "Stream read timeout during transfer".to_string(),
                            )
                        })??;

                if bytes_read == 0 {
                    return Err(ProtocolError::PayloadTransferFailed(format!(
                        "Connection closed prematurely: received {} bytes, expected {}",
                        total_bytes, expected_size
                    )));
                }

                file.write_all(&buffer[..bytes_read]).await?;

                total_bytes += bytes_read as u64;

                if let Some(ref callback) = self.progress_callback {
                    if !callback(total_bytes, expected_size) {
                        info!("Transfer cancelled by progress callback");
                        return Err(ProtocolError::PayloadTransferFailed(
                            "Transfer cancelled".to_string(),
                        ));
                    }
                }
            }

            file.flush().await?;

            info!(
                "Payload transfer complete: {} bytes received to {:?}",
                total_bytes, save_path
            );

            Ok(())
        }
        .await;

        if result.is_err() {
            warn!("Transfer failed, discarding partial file: {:?}", save_path);
            if let Err(e) = tokio::fs::remove_file(save_path).await {
                debug!("Failed to remove partial file {:?}: {}", save_path, e);
            }
        }

        result
    }

    /// Receive the announced number of bytes into memory
    pub async fn receive_bytes(mut self, expected_size: u64) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(expected_size as usize);
        let mut buffer = vec![0u8; BUFFER_SIZE];

        while (data.len() as u64) < expected_size {
            let remaining = expected_size - data.len() as u64;
            let to_read = std::cmp::min(remaining, BUFFER_SIZE as u64) as usize;

            let bytes_read = timeout(TRANSFER_TIMEOUT, self.stream.read(&mut buffer[..to_read]))
                .await
                .map_err(|_| {
                    ProtocolError::PayloadTransferFailed(
                        "Stream read timeout during transfer".to_string(),
                    )
                })??;

            if bytes_read == 0 {
                return Err(ProtocolError::PayloadTransferFailed(format!(
                    "Connection closed prematurely: received {} bytes, expected {}",
                    data.len(),
                    expected_size
                )));
            }

            data.extend_from_slice(&buffer[..bytes_read]);

            if let Some(ref callback) = self.progress_callback {
                if !callback(data.len() as u64, expected_size) {
                    info!("Transfer cancelled by progress callback");
                    return Err(ProtocolError::PayloadTransferFailed(
                        "Transfer cancelled".to_string(),
                    ));
                }
            }
        }

        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_payload_server_creation() {
        let server = PayloadServer::new().await.unwrap();
        let port = server.port();

        assert!(port >= PORT_RANGE_START);
        assert!(port <= PORT_RANGE_END);
    }

    #[tokio::test]
    async fn test_payload_round_trip() {
        let mut source_file = NamedTempFile::new().unwrap();
        let test_data = b"Hello, this is a test payload!";
        source_file.write_all(test_data).unwrap();
        source_file.flush().unwrap();
        let source_path = source_file.path().to_owned();

        let dest_dir = tempfile::TempDir::new().unwrap();
        let dest_path = dest_dir.path().join("received.bin");

        let server = PayloadServer::new().await.unwrap();
        let port = server.port();

        let server_task = tokio::spawn(async move { server.send_file(source_path).await });

        tokio::time::sleep(Duration::from_millis(100)).await;

        let client = PayloadClient::new("127.0.0.1", port).await.unwrap();
        client
            .receive_file(&dest_path, test_data.len() as u64)
            .await
            .unwrap();

        server_task.await.unwrap().unwrap();

        let received_data = tokio::fs::read(&dest_path).await.unwrap();
        assert_eq!(&received_data[..], test_data);
    }

    #[tokio::test]
    async fn test_bytes_round_trip() {
        let server = PayloadServer::new().await.unwrap();
        let port = server.port();

        let server_task =
            tokio::spawn(async move { server.send_bytes(b"payload in memory").await });

        let client = PayloadClient::new("127.0.0.1", port).await.unwrap();
        let data = client.receive_bytes(17).await.unwrap();
        assert_eq!(&data, b"payload in memory");

        server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_short_transfer_discards_partial_file() {
        let mut source_file = NamedTempFile::new().unwrap();
        source_file.write_all(b"short").unwrap();
        source_file.flush().unwrap();
        let source_path = source_file.path().to_owned();

        let dest_dir = tempfile::TempDir::new().unwrap();
        let dest_path = dest_dir.path().join("received.bin");

        let server = PayloadServer::new().await.unwrap();
        let port = server.port();

        let server_task = tokio::spawn(async move { server.send_file(source_path).await });

        tokio::time::sleep(Duration::from_millis(100)).await;

        // Expect more bytes than the sender will deliver
        let client = PayloadClient::new("127.0.0.1", port).await.unwrap();
        let result = client.receive_file(&dest_path, 1024).await;

        assert!(matches!(
            result,
            Err(ProtocolError::PayloadTransferFailed(_))
        ));
        // Partial data must not survive
        assert!(!dest_path.exists());

        let _ = server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_timeout() {
        let server = PayloadServer::new().await.unwrap();

        // Nobody connects
        let result =
            tokio::time::timeout(Duration::from_secs(2), server.send_file("/dev/null")).await;

        assert!(result.is_err() || result.unwrap().is_err());
    }
}
