use std::sync::Arc;

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    sync::oneshot,
};
use tracing::{debug, trace, warn};

use crate::{
    codec,
    table::{CorrelationTable, Delivery, Resolution},
};

/// Demultiplexes the child's output into the correlation table.
///
/// Runs until the stream ends, a read fails, or `shutdown` fires (or its sender is
/// dropped). Every still-pending waiter is then resolved as disconnected. The table
/// lock is only taken per delivered line, never while reading.
pub(crate) async fn reader_task<R>(
    output: R,
    table: Arc<CorrelationTable>,
    mut shutdown: oneshot::Receiver<()>,
) where
    R: AsyncRead + Unpin,
{
    let mut output = BufReader::new(output);
    let mut buffer = Vec::new();

    loop {
        buffer.clear();
        let read = tokio::select! {
            biased;
            _ = &mut shutdown => {
                debug!("reader task received shutdown signal");
                break;
            }
            read = output.read_until(b'\n', &mut buffer) => read,
        };

        match read {
            Ok(0) => {
                debug!("child output reached end of stream");
                break;
            }
            Ok(_) => handle_line(&buffer, &table),
            Err(err) => {
                warn!("failed to read child output: {err}");
                break;
            }
        }
    }

    let woken = table.resolve_all();
    if woken > 0 {
        debug!(woken, "resolved pending requests as disconnected");
    }
}

fn handle_line(raw: &[u8], table: &CorrelationTable) {
    let Ok(line) = std::str::from_utf8(raw) else {
        debug!(len = raw.len(), "discarding non UTF-8 output line");
        return;
    };
    trace!("child stdout: {}", line.trim_end());

    let Some(reply) = codec::decode_reply(line) else {
        debug!("discarding non-protocol output line");
        return;
    };

    let tag = reply.tag;
    match table.resolve(tag, Resolution::Reply(reply.extension)) {
        Delivery::Delivered => {}
        Delivery::AlreadyResolved => debug!(tag, "ignoring duplicate reply"),
        Delivery::Unknown => debug!(tag, "discarding reply with no waiting request"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::{
        io::AsyncWriteExt,
        time::{self, Instant},
    };

    use super::*;
    use crate::Outcome;

    fn soon() -> Option<Instant> {
        Some(Instant::now() + Duration::from_secs(2))
    }

    #[tokio::test]
    async fn routes_replies_by_tag_and_skips_noise() {
        let table = Arc::new(CorrelationTable::new());
        let (mut child_side, reader_side) = tokio::io::duplex(1024);
        let (_shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(reader_task(reader_side, table.clone(), shutdown_rx));

        let mut first = table.register();
        let mut second = table.register();

        child_side
            .write_all(b"booting child\n{\"tag\":1,\"ext\":{\"who\":\"second\"}}\n")
            .await
            .expect("write");
        child_side
            .write_all(b"\xff\xfe garbage\n{\"tag\":0}\n{\"tag\":0,\"ext\":{\"who\":\"first\"}}\n")
            .await
            .expect("write");

        assert_eq!(second.wait(soon()).await, Outcome::Reply(json!({"who": "second"})));
        assert_eq!(first.wait(soon()).await, Outcome::Reply(json!({"who": "first"})));
        assert!(!handle.is_finished());

        drop(child_side);
        time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("reader exits on eof")
            .expect("join");
    }

    #[tokio::test]
    async fn end_of_stream_disconnects_all_pending_waiters() {
        let table = Arc::new(CorrelationTable::new());
        let (child_side, reader_side) = tokio::io::duplex(64);
        let (_shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(reader_task(reader_side, table.clone(), shutdown_rx));

        let mut pending: Vec<_> = (0..4).map(|_| table.register()).collect();
        drop(child_side);

        for registration in &mut pending {
            assert_eq!(registration.wait(soon()).await, Outcome::Disconnected);
        }
        handle.await.expect("join");
        assert!(table.is_disconnected());
    }

    #[tokio::test]
    async fn shutdown_signal_stops_reader_while_stream_is_open() {
        let table = Arc::new(CorrelationTable::new());
        let (_child_side, reader_side) = tokio::io::duplex(64);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(reader_task(reader_side, table.clone(), shutdown_rx));

        let mut registration = table.register();
        shutdown_tx.send(()).expect("reader alive");

        assert_eq!(registration.wait(soon()).await, Outcome::Disconnected);
        time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("reader stops")
            .expect("join");
    }

    #[tokio::test]
    async fn partial_line_at_end_of_stream_is_still_decoded() {
        let table = Arc::new(CorrelationTable::new());
        let (mut child_side, reader_side) = tokio::io::duplex(256);
        let (_shutdown_tx, shutdown_rx) = oneshot::channel();

        let mut registration = table.register();
        child_side
            .write_all(b"{\"tag\":0,\"ext\":{\"last\":true}}")
            .await
            .expect("write");
        drop(child_side);

        reader_task(reader_side, table.clone(), shutdown_rx).await;
        assert_eq!(
            registration.wait(Some(Instant::now())).await,
            Outcome::Reply(json!({"last": true}))
        );
    }
}
