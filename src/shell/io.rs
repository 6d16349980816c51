use super::*;

/// Writer handed to a running segment.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Chunks flowing into a segment's stdin. The stream ends when every
/// sender is dropped.
pub type InputReceiver = mpsc::UnboundedReceiver<Vec<u8>>;
pub type InputSender = mpsc::UnboundedSender<Vec<u8>>;

/// Plumbing of one remote command on one host.
pub struct RemoteIo {
    pub stdin: InputReceiver,
    pub stdout: BoxedWriter,
    pub stderr: BoxedWriter,
    /// Fired on interrupt; the host must stop the command and return.
    pub cancel: CancellationToken,
}

/// A host able to run one command per call.
///
/// [`Connection`](crate::session::Connection) implements this over an SSH
/// session channel.
#[async_trait]
pub trait RemoteHost: Send + Sync {
    fn name(&self) -> &str;

    /// Runs `command` to completion, returning its exit status if the
    /// host reported one.
    async fn run(&self, command: &str, io: RemoteIo) -> Result<Option<u32>, ConnectError>;

    /// Releases the host at shell exit.
    async fn close(&self) -> Result<(), ConnectError> {
        Ok(())
    }
}

/// Write side of an in-process pipe.
///
/// Every clone feeds the same reader; the reader sees end of stream once
/// all clones are gone.
#[derive(Clone)]
pub(crate) struct PipeWriter {
    tx: InputSender,
}

impl PipeWriter {
    pub(crate) fn new(tx: InputSender) -> Self {
        Self { tx }
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.tx.send(buf.to_vec()) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Creates `count` input streams that each receive a copy of every chunk
/// pushed to the returned senders.
pub(crate) fn input_streams(count: usize) -> (Vec<InputSender>, Vec<InputReceiver>) {
    (0..count).map(|_| mpsc::unbounded_channel()).unzip()
}

/// Copies every chunk of `source` to each of `sinks` until `source` ends.
pub(crate) async fn fan_out(mut source: InputReceiver, mut sinks: Vec<InputSender>) {
    while let Some(chunk) = source.recv().await {
        sinks.retain(|sink| sink.send(chunk.clone()).is_ok());
        if sinks.is_empty() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn pipe_ends_when_all_writers_drop() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut first = PipeWriter::new(tx);
        let mut second = first.clone();
        first.write_all(b"a").await.expect("write");
        second.write_all(b"b").await.expect("write");
        drop(first);
        drop(second);

        assert_eq!(rx.recv().await, Some(b"a".to_vec()));
        assert_eq!(rx.recv().await, Some(b"b".to_vec()));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn closed_pipe_is_broken() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut writer = PipeWriter::new(tx);
        let err = writer.write_all(b"x").await.expect_err("closed");
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn fan_out_copies_every_chunk() {
        let (source_tx, source_rx) = mpsc::unbounded_channel();
        let (sinks, mut streams) = input_streams(3);
        let task = tokio::spawn(fan_out(source_rx, sinks));

        source_tx.send(b"line\n".to_vec()).expect("send");
        drop(source_tx);
        task.await.expect("fan out");

        for stream in &mut streams {
            assert_eq!(stream.recv().await, Some(b"line\n".to_vec()));
            assert_eq!(stream.recv().await, None);
        }
    }
}
