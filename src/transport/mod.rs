use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::error::Result;

// One delivered vote event
#[derive(Debug, Clone)]
pub struct Message {
    pub id: Uuid,
    pub body: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl Message {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            body: body.into(),
            received_at: Utc::now(),
        }
    }
}

/// Called once per delivered message, possibly from many tasks at once.
/// `Ok` acknowledges the message, `Err` rejects it.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle_message(&self, message: &Message) -> Result<()>;
}

/// Lifecycle of a message source.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Asks the transport to stop delivering messages. Returns immediately.
    fn stop(&self);

    /// Resolves once delivery has ended and every in-flight handler call
    /// has returned. Also resolves if the transport stopped on its own.
    async fn stopped(&self);
}

/// TCP message source: each newline-terminated line is one message.
///
/// Every connection is served by its own task, so handlers run
/// concurrently. Each message gets a reply line: `+OK` once the handler
/// accepted it, `-ERR <reason>` otherwise.
pub struct LineConsumer {
    local_addr: SocketAddr,
    stop_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl LineConsumer {
    pub async fn bind(addr: &str, handler: Arc<dyn MessageHandler>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (stop_tx, stop_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);

        tokio::spawn(accept_loop(listener, handler, stop_rx, done_tx));
        info!("Waiting for votes on {}...", local_addr);

        Ok(Self { local_addr, stop_tx, done_rx })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Transport for LineConsumer {
    fn stop(&self) {
        info!("Stopping vote consumer on {}", self.local_addr);
        self.stop_tx.send_replace(true);
    }

    async fn stopped(&self) {
        let mut done = self.done_rx.clone();
        // A dropped sender means the accept loop is gone as well
        let _ = done.wait_for(|done| *done).await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<dyn MessageHandler>,
    mut stop_rx: watch::Receiver<bool>,
    done_tx: watch::Sender<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted connection from {}", peer);
                    connections.spawn(serve_connection(stream, peer, Arc::clone(&handler), stop_rx.clone()));
                }
                Err(e) => warn!("Failed to accept connection: {}", e),
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    error!("Connection task failed: {}", e);
                }
            }
        }
    }

    drop(listener);
    while let Some(joined) = connections.join_next().await {
        if let Err(e) = joined {
            error!("Connection task failed: {}", e);
        }
    }

    info!("Vote consumer stopped");
    done_tx.send_replace(true);
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn MessageHandler>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    loop {
        let read = tokio::select! {
            _ = stop_rx.changed() => break,
            read = reader.read_until(b'\n', &mut line) => read,
        };

        match read {
            Ok(0) => break,
            Ok(_) => {
                let reply = deliver(handler.as_ref(), strip_line_ending(&line));
                line.clear();
                // A peer that stops reading replies must not hold up a stop
                let written = tokio::select! {
                    biased;
                    written = writer.write_all(reply.as_bytes()) => written,
                    _ = stop_rx.changed() => {
                        debug!("Dropping unsent acknowledgement to {} on stop", peer);
                        break;
                    }
                };
                if let Err(e) = written {
                    warn!("Failed to acknowledge message from {}: {}", peer, e);
                    break;
                }
            }
            Err(e) => {
                warn!("Failed to read from {}: {}", peer, e);
                break;
            }
        }
    }

    debug!("Closed connection from {}", peer);
}

fn strip_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn deliver(handler: &dyn MessageHandler, body: &[u8]) -> String {
    if body.is_empty() {
        return "-ERR empty message\n".to_string();
    }

    let message = Message::new(body);
    match handler.handle_message(&message) {
        Ok(()) => "+OK\n".to_string(),
        Err(e) => {
            warn!("Message {} rejected: {}", message.id, e);
            format!("-ERR {}\n", e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::time::timeout;

    #[derive(Default)]
    struct Recorder {
        bodies: Mutex<Vec<Vec<u8>>>,
    }

    impl MessageHandler for Recorder {
        fn handle_message(&self, message: &Message) -> Result<()> {
            if message.body == b"bad" {
                return Err(Error::Handler("refused".into()));
            }
            self.bodies.lock().unwrap().push(message.body.clone());
            Ok(())
        }
    }

    async fn read_replies(stream: &mut TcpStream, count: usize) -> Vec<String> {
        let mut reader = BufReader::new(stream);
        let mut replies = Vec::new();
        for _ in 0..count {
            let mut reply = String::new();
            reader.read_line(&mut reply).await.unwrap();
            replies.push(reply.trim_end().to_string());
        }
        replies
    }

    #[test]
    fn strips_unix_and_windows_line_endings() {
        assert_eq!(strip_line_ending(b"yes\n"), b"yes");
        assert_eq!(strip_line_ending(b"yes\r\n"), b"yes");
        assert_eq!(strip_line_ending(b"yes"), b"yes");
    }

    #[tokio::test]
    async fn acknowledges_each_line() {
        let recorder = Arc::new(Recorder::default());
        let consumer = LineConsumer::bind("127.0.0.1:0", recorder.clone()).await.unwrap();

        let mut stream = TcpStream::connect(consumer.local_addr()).await.unwrap();
        stream.write_all(b"yes\r\n\nbad\nno\n").await.unwrap();

        let replies = read_replies(&mut stream, 4).await;
        assert_eq!(replies, vec!["+OK", "-ERR empty message", "-ERR handler error: refused", "+OK"]);
        assert_eq!(*recorder.bodies.lock().unwrap(), vec![b"yes".to_vec(), b"no".to_vec()]);

        consumer.stop();
        timeout(Duration::from_secs(5), consumer.stopped()).await.unwrap();
    }

    #[tokio::test]
    async fn stop_closes_open_connections() {
        let consumer = LineConsumer::bind("127.0.0.1:0", Arc::new(Recorder::default())).await.unwrap();
        let mut stream = TcpStream::connect(consumer.local_addr()).await.unwrap();
        stream.write_all(b"yes\n").await.unwrap();
        assert_eq!(read_replies(&mut stream, 1).await, vec!["+OK"]);

        consumer.stop();
        timeout(Duration::from_secs(5), consumer.stopped()).await.unwrap();

        let mut rest = Vec::new();
        let read = timeout(Duration::from_secs(5), stream.read_to_end(&mut rest)).await.unwrap();
        assert!(matches!(read, Ok(0)) || read.is_err());
    }

    #[tokio::test]
    async fn unfinished_line_is_discarded_on_stop() {
        let recorder = Arc::new(Recorder::default());
        let consumer = LineConsumer::bind("127.0.0.1:0", recorder.clone()).await.unwrap();
        let mut stream = TcpStream::connect(consumer.local_addr()).await.unwrap();
        stream.write_all(b"yes\nno").await.unwrap();
        assert_eq!(read_replies(&mut stream, 1).await, vec!["+OK"]);

        consumer.stop();
        timeout(Duration::from_secs(5), consumer.stopped()).await.unwrap();

        let mut rest = Vec::new();
        let _ = timeout(Duration::from_secs(5), stream.read_to_end(&mut rest)).await.unwrap();
        assert!(rest.is_empty());
        assert_eq!(*recorder.bodies.lock().unwrap(), vec![b"yes".to_vec()]);
    }

    #[tokio::test]
    async fn peer_that_never_reads_replies_does_not_block_stop() {
        let consumer = LineConsumer::bind("127.0.0.1:0", Arc::new(Recorder::default())).await.unwrap();
        let stream = TcpStream::connect(consumer.local_addr()).await.unwrap();
        // Keep the read half open but never read from it, so replies back up
        let (_unread, mut write_half) = stream.into_split();

        let flood = tokio::spawn(async move {
            let chunk = b"y\n".repeat(32 * 1024);
            while write_half.write_all(&chunk).await.is_ok() {}
        });
        tokio::time::sleep(Duration::from_secs(2)).await;

        consumer.stop();
        timeout(Duration::from_secs(5), consumer.stopped())
            .await
            .expect("consumer did not stop while a peer ignored its replies");
        flood.abort();
    }
}
