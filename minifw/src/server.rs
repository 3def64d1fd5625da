use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::control::{ControlError, ControlHandler, Reply, Status};
use crate::wire::{put_rule, CONTROL_MESSAGE_LEN, RULE_RECORD_LEN};

/// How long a client may take to deliver its message and half-close.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on trailing bytes discarded after an oversized message.
const MAX_DRAIN: u64 = 64 * 1024;

/// Serves the control protocol on a Unix stream socket.
///
/// One connection carries one request: the client writes the whole message
/// and shuts down its write side.  The reply is a status byte, followed for
/// View by one record per rule, then EOF.
pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
    handler: Arc<ControlHandler>,
}

impl ControlServer {
    /// Binds `path`, replacing a stale socket file left by a previous run.
    pub fn bind(path: impl AsRef<Path>, handler: Arc<ControlHandler>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        match std::fs::remove_file(&path) {
            Ok(()) => debug!("removed stale control socket {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let listener = UnixListener::bind(&path)?;
        info!("control socket listening on {}", path.display());
        Ok(Self {
            listener,
            path,
            handler,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accepts connections until `shutdown` resolves, then waits for the
    /// requests already accepted to finish.  The socket file is removed when
    /// the server is dropped.
    pub async fn serve_until<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut connections = JoinSet::new();
        let result = tokio::select! {
            res = self.accept_loop(&mut connections) => res,
            _ = shutdown => Ok(()),
        };

        if !connections.is_empty() {
            debug!("waiting for {} control connections", connections.len());
        }
        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                warn!("control connection task failed: {}", e);
            }
        }
        result
    }

    pub async fn serve(self) -> io::Result<()> {
        self.serve_until(std::future::pending()).await
    }

    async fn accept_loop(&self, connections: &mut JoinSet<()>) -> io::Result<()> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, _) = accepted?;
                    let handler = self.handler.clone();
                    connections.spawn(async move {
                        if let Err(e) = serve_connection(stream, handler).await {
                            warn!("control connection failed: {}", e);
                        }
                    });
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        warn!("control connection task failed: {}", e);
                    }
                }
            }
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("failed to remove control socket {}: {}", self.path.display(), e);
            }
        }
    }
}

async fn serve_connection(mut stream: UnixStream, handler: Arc<ControlHandler>) -> io::Result<()> {
    // One byte past the message size is enough to tell an oversized write.
    let mut request = Vec::with_capacity(CONTROL_MESSAGE_LEN + 1);
    let mut limited = (&mut stream).take(CONTROL_MESSAGE_LEN as u64 + 1);
    let read = limited.read_to_end(&mut request);

    let result = match timeout(REQUEST_TIMEOUT, read).await {
        Ok(Ok(_)) => handler.handle_bytes(&request),
        Ok(Err(e)) => return Err(e),
        Err(_) => Err(ControlError::MalformedMessage(format!(
            "no complete message within {:?}",
            REQUEST_TIMEOUT
        ))),
    };

    // Closing with unread input resets the peer before it sees the reply.
    if request.len() > CONTROL_MESSAGE_LEN {
        let mut rest = (&mut stream).take(MAX_DRAIN);
        let _ = timeout(REQUEST_TIMEOUT, tokio::io::copy(&mut rest, &mut tokio::io::sink())).await;
    }

    match result {
        Ok(Reply::Done) => stream.write_u8(Status::Ok as u8).await?,
        Ok(Reply::Rules(rules)) => {
            let mut out = BytesMut::with_capacity(1 + rules.len() * RULE_RECORD_LEN);
            out.put_u8(Status::Ok as u8);
            for rule in rules {
                put_rule(&mut out, &rule);
            }
            stream.write_all(&out).await?;
        }
        Err(err) => stream.write_u8(err.status() as u8).await?,
    }
    stream.shutdown().await
}
