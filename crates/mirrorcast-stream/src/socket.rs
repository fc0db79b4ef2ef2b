//! Video data socket.
//!
//! Realizes the data channel for a negotiated tunnel: in reverse mode the
//! host listens and the device connects out; in forward mode the host
//! connects in to the device-exposed socket. Either way exactly one byte
//! stream is produced once live, delivered as [`SocketEvent`]s.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use crossbeam_channel::{Receiver, Sender};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, instrument, warn};

use mirrorcast_ipc::TunnelMode;

use crate::error::StreamError;
use crate::{StreamResult, DATA_CHANNEL_CAPACITY};

const READ_BUFFER_CAPACITY: usize = 64 * 1024;

/// Delay between forward connect attempts while the device socket comes up.
const FORWARD_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Events delivered to the registered data consumer.
#[derive(Debug)]
pub enum SocketEvent {
    /// A chunk of raw stream bytes.
    Data(Bytes),

    /// The stream ended: remote close or read failure.
    Closed,
}

/// The video data socket.
///
/// `start()` resolves only once the first connection is live (or the
/// timeout elapses); data then flows on the socket's own I/O runtime into
/// the returned channel.
pub struct VideoSocket {
    runtime: Option<Runtime>,
    should_stop: Arc<AtomicBool>,
    bytes_received: Arc<AtomicU64>,
}

impl VideoSocket {
    /// Create an unstarted socket.
    pub fn new() -> Self {
        Self {
            runtime: None,
            should_stop: Arc::new(AtomicBool::new(false)),
            bytes_received: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Establish the data connection and start delivering bytes.
    ///
    /// Blocks until the first connection is established, or fails with
    /// [`StreamError::ConnectionTimeout`].
    #[instrument(name = "video_socket_start", skip(self))]
    pub fn start(
        &mut self,
        mode: TunnelMode,
        port: u16,
        first_connection_timeout: Duration,
    ) -> StreamResult<Receiver<SocketEvent>> {
        if self.runtime.is_some() {
            return Err(StreamError::AlreadyStarted);
        }

        info!(%mode, port, "Opening video socket");
        let runtime = Runtime::new().map_err(StreamError::Io)?;
        let stream = runtime.block_on(establish(mode, port, first_connection_timeout))?;
        let _ = stream.set_nodelay(true);

        let (tx, rx) = crossbeam_channel::bounded(DATA_CHANNEL_CAPACITY);

        let should_stop = Arc::clone(&self.should_stop);
        should_stop.store(false, Ordering::SeqCst);
        let bytes_received = Arc::clone(&self.bytes_received);

        runtime.spawn(read_loop(stream, tx, should_stop, bytes_received));
        self.runtime = Some(runtime);

        Ok(rx)
    }

    /// Stop the socket. Idempotent.
    #[instrument(name = "video_socket_stop", skip(self))]
    pub fn stop(&mut self) {
        self.should_stop.store(true, Ordering::SeqCst);
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_secs(1));
            info!("Video socket stopped");
        }
    }

    /// Total bytes received since start.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Shared counter handle for the statistics collector.
    pub fn bytes_received_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.bytes_received)
    }
}

impl Default for VideoSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for VideoSocket {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn establish(
    mode: TunnelMode,
    port: u16,
    wait: Duration,
) -> StreamResult<TcpStream> {
    match mode {
        TunnelMode::Reverse => {
            let listener = TcpListener::bind(("127.0.0.1", port)).await?;
            debug!(port, "Listening for device connection");
            let (stream, peer) = timeout(wait, listener.accept())
                .await
                .map_err(|_| StreamError::ConnectionTimeout(wait))??;
            debug!(%peer, "Device connected");
            Ok(stream)
        }
        TunnelMode::Forward => {
            // The forwarded socket appears a beat after the companion
            // starts; retry until the first-connection timeout elapses.
            let deadline = Instant::now() + wait;
            loop {
                match TcpStream::connect(("127.0.0.1", port)).await {
                    Ok(stream) => {
                        debug!(port, "Connected to forwarded socket");
                        return Ok(stream);
                    }
                    Err(e) => {
                        if Instant::now() + FORWARD_RETRY_DELAY >= deadline {
                            warn!(error = %e, "Forward connect attempts exhausted");
                            return Err(StreamError::ConnectionTimeout(wait));
                        }
                        sleep(FORWARD_RETRY_DELAY).await;
                    }
                }
            }
        }
    }
}

async fn read_loop(
    mut stream: TcpStream,
    tx: Sender<SocketEvent>,
    should_stop: Arc<AtomicBool>,
    bytes_received: Arc<AtomicU64>,
) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_CAPACITY);

    loop {
        if should_stop.load(Ordering::SeqCst) {
            break;
        }

        match stream.read_buf(&mut buf).await {
            Ok(0) => {
                debug!("Video socket closed by remote");
                let _ = tx.send(SocketEvent::Closed);
                break;
            }
            Ok(n) => {
                bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                // A full channel blocks the read here, letting TCP flow
                // control push back on the device instead of buffering
                // unboundedly on the host.
                if tx.send(SocketEvent::Data(buf.split().freeze())).is_err() {
                    debug!("Data consumer gone, stopping read loop");
                    break;
                }
                buf.reserve(READ_BUFFER_CAPACITY);
            }
            Err(e) => {
                if !should_stop.load(Ordering::SeqCst) {
                    warn!(error = %e, "Video socket read failed");
                }
                let _ = tx.send(SocketEvent::Closed);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener as StdListener, TcpStream as StdStream};
    use std::thread;

    fn connect_retrying(port: u16) -> StdStream {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            match StdStream::connect(("127.0.0.1", port)) {
                Ok(s) => return s,
                Err(e) if std::time::Instant::now() > deadline => {
                    panic!("could not connect to test socket: {e}")
                }
                Err(_) => thread::sleep(Duration::from_millis(10)),
            }
        }
    }

    #[test]
    fn reverse_mode_delivers_data_then_closed() {
        let port = 36731;
        let client = thread::spawn(move || {
            let mut stream = connect_retrying(port);
            stream.write_all(b"hello").unwrap();
            stream.write_all(b" world").unwrap();
            // Dropping the stream closes it.
        });

        let mut socket = VideoSocket::new();
        let rx = socket
            .start(TunnelMode::Reverse, port, Duration::from_secs(2))
            .unwrap();

        let mut received = Vec::new();
        loop {
            match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
                SocketEvent::Data(chunk) => received.extend_from_slice(&chunk),
                SocketEvent::Closed => break,
            }
        }

        assert_eq!(received, b"hello world");
        assert_eq!(socket.bytes_received(), 11);
        client.join().unwrap();
        socket.stop();
    }

    #[test]
    fn forward_mode_connects_to_listener() {
        let port = 36732;
        let listener = StdListener::bind(("127.0.0.1", port)).unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"data").unwrap();
        });

        let mut socket = VideoSocket::new();
        let rx = socket
            .start(TunnelMode::Forward, port, Duration::from_secs(2))
            .unwrap();

        match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
            SocketEvent::Data(chunk) => assert_eq!(chunk.as_ref(), b"data"),
            other => panic!("unexpected event: {other:?}"),
        }
        server.join().unwrap();
        socket.stop();
        // A second stop is a no-op.
        socket.stop();
    }

    #[test]
    fn reverse_mode_times_out_without_connection() {
        let mut socket = VideoSocket::new();
        let err = socket
            .start(TunnelMode::Reverse, 36733, Duration::from_millis(200))
            .unwrap_err();
        assert!(matches!(err, StreamError::ConnectionTimeout(_)));
    }

    #[test]
    fn forward_mode_times_out_without_listener() {
        let mut socket = VideoSocket::new();
        let err = socket
            .start(TunnelMode::Forward, 36734, Duration::from_millis(300))
            .unwrap_err();
        assert!(matches!(err, StreamError::ConnectionTimeout(_)));
    }
}
