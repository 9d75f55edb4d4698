use std::fmt::{Debug, Formatter};
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::trace;
use uuid::Uuid;

use crate::channel::channel::{InChannel, OutChannel};
use crate::channel::stream_guard::{BoxReader, BoxWriter, StreamGuard};

type FailureCallback = Box<dyn FnOnce() + Send>;

struct ConnectionShared {
    failed: CancellationToken,
    on_failure: Mutex<Vec<FailureCallback>>,
}

/// One end of a bidirectional connection, composed of an in-channel and an out-channel.
///
/// Clones share the same underlying streams and failure state.
#[derive(Clone)]
pub struct Connection {
    connection_id: Uuid,
    is_server_side: bool,
    in_stream: StreamGuard<BoxReader>,
    out_stream: StreamGuard<BoxWriter>,
    shared: Arc<ConnectionShared>,
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection{{{}, {}}}", self.connection_id.simple(), if self.is_server_side { "server" } else { "client" })
    }
}

impl Connection {
    pub(crate) fn new(connection_id: Uuid, is_server_side: bool, in_channel: &InChannel, out_channel: &OutChannel) -> Connection {
        Connection {
            connection_id,
            is_server_side,
            in_stream: in_channel.stream(),
            out_stream: out_channel.stream(),
            shared: Arc::new(ConnectionShared {
                failed: CancellationToken::new(),
                on_failure: Default::default(),
            }),
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// true on the end that called accept, false on the end that called connect
    pub fn is_server_side(&self) -> bool {
        self.is_server_side
    }

    pub fn in_stream(&self) -> StreamGuard<BoxReader> {
        self.in_stream.clone()
    }

    pub fn out_stream(&self) -> StreamGuard<BoxWriter> {
        self.out_stream.clone()
    }

    pub fn into_streams(self) -> (StreamGuard<BoxReader>, StreamGuard<BoxWriter>) {
        (self.in_stream, self.out_stream)
    }

    /// Register a callback for when the connection is torn down by the dispatcher, e.g. because
    ///  one of its streams failed or the remote end closed it. The callback is run on a separate
    ///  task. If the connection already failed, it is run right away.
    pub fn on_failure(&self, callback: impl FnOnce() + Send + 'static) {
        let mut callbacks = self.shared.on_failure.lock()
            .unwrap_or_else(PoisonError::into_inner);

        if self.shared.failed.is_cancelled() {
            drop(callbacks);
            tokio::spawn(async move { callback() });
        }
        else {
            callbacks.push(Box::new(callback));
        }
    }

    pub fn is_failed(&self) -> bool {
        self.shared.failed.is_cancelled()
    }

    /// completes when the connection is torn down
    pub async fn failed(&self) {
        self.shared.failed.cancelled().await
    }

    /// Gracefully end the outgoing stream. The dispatcher then tears down the connection on both
    ///  ends, which also triggers failure notification.
    pub async fn close(&self) -> io::Result<()> {
        self.out_stream.clone().shutdown().await
    }

    pub(crate) fn notify_failure(&self) {
        let callbacks = {
            let mut callbacks = self.shared.on_failure.lock()
                .unwrap_or_else(PoisonError::into_inner);
            if self.shared.failed.is_cancelled() {
                return;
            }
            self.shared.failed.cancel();
            std::mem::take(&mut *callbacks)
        };

        trace!(connection_id = %self.connection_id, "notifying {} failure callbacks", callbacks.len());
        for callback in callbacks {
            tokio::spawn(async move { callback() });
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::io::{duplex, AsyncReadExt, DuplexStream};
    use tokio::time::timeout;

    use super::*;
    use crate::channel::channel::Channel;

    pub fn test_connection(is_server_side: bool) -> (Connection, InChannel, OutChannel, DuplexStream, DuplexStream) {
        let (in_remote, in_local) = duplex(1024);
        let (out_local, out_remote) = duplex(1024);

        let in_id = Uuid::new_v4();
        let out_id = Uuid::new_v4();
        let in_channel = Channel::new(in_id, "r 0000000000001".to_string(), StreamGuard::new(Box::pin(in_local) as BoxReader, in_id, |_| {}));
        let out_channel = Channel::new(out_id, "r 0000000000001".to_string(), StreamGuard::new(Box::pin(out_local) as BoxWriter, out_id, |_| {}));

        let connection = Connection::new(Uuid::new_v4(), is_server_side, &in_channel, &out_channel);
        (connection, in_channel, out_channel, in_remote, out_remote)
    }

    #[tokio::test]
    async fn test_streams() {
        let (connection, _in_channel, _out_channel, mut in_remote, mut out_remote) = test_connection(true);
        assert!(connection.is_server_side());

        let (mut in_stream, mut out_stream) = connection.into_streams();

        out_stream.write_all(&[0, 1, 2, 3]).await.unwrap();
        let mut buf = [0u8; 4];
        out_remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0, 1, 2, 3]);

        in_remote.write_all(&[4, 5]).await.unwrap();
        let mut buf = [0u8; 2];
        in_stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [4, 5]);
    }

    #[tokio::test]
    async fn test_failure_callbacks_run_once() {
        let (connection, _in_channel, _out_channel, _, _) = test_connection(false);

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = counter.clone();
            connection.on_failure(move || { counter.fetch_add(1, Ordering::AcqRel); });
        }

        assert!(!connection.is_failed());
        connection.notify_failure();
        connection.clone().notify_failure();

        timeout(Duration::from_secs(1), connection.failed()).await.unwrap();
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(connection.is_failed());
        assert_eq!(counter.load(Ordering::Acquire), 3);
    }

    #[tokio::test]
    async fn test_late_failure_callback_runs_immediately() {
        let (connection, _in_channel, _out_channel, _, _) = test_connection(false);
        connection.notify_failure();

        let (tx, rx) = tokio::sync::oneshot::channel();
        connection.on_failure(move || { let _ = tx.send(()); });
        timeout(Duration::from_secs(1), rx).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_close_ends_out_stream() {
        let (connection, _in_channel, _out_channel, _, mut out_remote) = test_connection(false);
        connection.close().await.unwrap();

        let mut buf = Vec::new();
        assert_eq!(out_remote.read_to_end(&mut buf).await.unwrap(), 0);
    }
}
