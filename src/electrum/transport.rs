//! Socket factory and per-connection reader/writer tasks.
//!
//! ```text
//! driver ──mpsc<String>──▶ writer task ──▶ WriteHalf
//! driver ◀──mpsc<Inbound>── reader task ◀── ReadHalf (LineBuffer)
//! ```
//!
//! Every event carries the slot index and the connection generation so the
//! driver can ignore stragglers from a connection it already tore down.

use super::config::Endpoint;
use super::wire::LineBuffer;
use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub trait ElectrumStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> ElectrumStream for T {}

pub type BoxedStream = Box<dyn ElectrumStream>;

/// Opens byte streams to servers. Tests substitute in-memory pipes.
#[async_trait]
pub trait SocketFactory: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> io::Result<BoxedStream>;
}

/// Plain TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpSocketFactory;

#[async_trait]
impl SocketFactory for TcpSocketFactory {
    async fn connect(&self, endpoint: &Endpoint) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

pub(crate) enum ConnectionEvent {
    Connected(BoxedStream),
    ConnectFailed(String),
    Line(String),
    Closed(String),
}

pub(crate) struct Inbound {
    pub slot: usize,
    pub generation: u64,
    pub event: ConnectionEvent,
}

/// Writer sender plus the two task handles; dropping the sender and
/// aborting the tasks closes the socket.
pub(crate) struct ConnectionTasks {
    pub writer: mpsc::UnboundedSender<String>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl ConnectionTasks {
    pub fn abort(self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

pub(crate) fn spawn_connection(
    stream: BoxedStream,
    slot: usize,
    generation: u64,
    max_line: usize,
    inbound: mpsc::UnboundedSender<Inbound>,
) -> ConnectionTasks {
    let (mut read, mut write) = tokio::io::split(stream);
    let (writer, mut outgoing) = mpsc::unbounded_channel::<String>();

    let inbound_w = inbound.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(line) = outgoing.recv().await {
            if let Err(e) = write.write_all(line.as_bytes()).await {
                let _ = inbound_w.send(Inbound { slot, generation, event: ConnectionEvent::Closed(e.to_string()) });
                return;
            }
            if let Err(e) = write.flush().await {
                let _ = inbound_w.send(Inbound { slot, generation, event: ConnectionEvent::Closed(e.to_string()) });
                return;
            }
        }
        let _ = write.shutdown().await;
    });

    let reader_task = tokio::spawn(async move {
        let mut lines = LineBuffer::with_limit(max_line);
        let mut buf = vec![0u8; 8192];
        let reason = loop {
            match read.read(&mut buf).await {
                Ok(0) => break "connection closed by server".to_string(),
                Ok(n) => match lines.push(&buf[..n]) {
                    Ok(complete) => {
                        for line in complete {
                            if inbound.send(Inbound { slot, generation, event: ConnectionEvent::Line(line) }).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => break e.to_string(),
                },
                Err(e) => break e.to_string(),
            }
        };
        let _ = inbound.send(Inbound { slot, generation, event: ConnectionEvent::Closed(reason) });
    });

    ConnectionTasks { writer, reader_task, writer_task }
}
