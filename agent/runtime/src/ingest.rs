//! Line-delimited JSON flow ingest over a Unix socket.

use crate::{core::flow::Event, enricher::Enricher};
use anyhow::{bail, Context, Result};
use std::{io, os::unix::fs::FileTypeExt, path::Path, sync::Arc};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader},
    net::UnixListener,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// Lines longer than this are discarded without being buffered.
const MAX_LINE_LEN: usize = 64 * 1024;

/// Accepts producer connections on `path` until `token` is cancelled.
///
/// A stale socket left at `path` is replaced. Any other file there is an error.
pub(crate) async fn serve(
    path: &Path,
    enricher: Arc<Enricher>,
    token: CancellationToken,
) -> Result<()> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.file_type().is_socket() => tokio::fs::remove_file(path)
            .await
            .with_context(|| format!("failed to remove stale socket {}", path.display()))?,
        Ok(_) => bail!("{} exists and is not a socket", path.display()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => {
            return Err(error).with_context(|| format!("failed to inspect {}", path.display()))
        }
    }
    let listener = UnixListener::bind(path)
        .with_context(|| format!("failed to bind {}", path.display()))?;
    info!(path = %path.display(), "Accepting flows");

    loop {
        let stream = tokio::select! {
            _ = token.cancelled() => break,
            res = listener.accept() => match res {
                Ok((stream, _)) => stream,
                Err(error) => {
                    warn!(%error, "Failed to accept connection");
                    continue;
                }
            },
        };

        let enricher = enricher.clone();
        let token = token.clone();
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    res = read_events(BufReader::new(stream), &enricher) => {
                        if let Err(error) = res {
                            debug!(%error, "Connection failed");
                        }
                    }
                }
            }
            .instrument(info_span!("conn")),
        );
    }

    let _ = tokio::fs::remove_file(path).await;
    Ok(())
}

/// Writes each JSON line read from `io` to the enricher, returning the number of events accepted.
///
/// Malformed or oversized lines and events the enricher rejects are logged and skipped. Only I/O
/// errors end the stream.
pub(crate) async fn read_events<R>(mut io: R, enricher: &Enricher) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut accepted = 0;
    loop {
        buf.clear();
        let read = (&mut io)
            .take(MAX_LINE_LEN as u64)
            .read_until(b'\n', &mut buf)
            .await?;
        if read == 0 {
            break;
        }
        if read == MAX_LINE_LEN && buf.last() != Some(&b'\n') {
            warn!(max = MAX_LINE_LEN, "Skipping oversized line");
            discard_line(&mut io).await?;
            continue;
        }
        if buf.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let ev = match serde_json::from_slice::<Event>(&buf) {
            Ok(ev) => ev,
            Err(error) => {
                warn!(%error, "Skipping malformed event");
                continue;
            }
        };
        match enricher.write(ev) {
            Ok(()) => accepted += 1,
            Err(error) => debug!(%error, "Event not accepted"),
        }
    }
    Ok(accepted)
}

/// Consumes input through the next newline.
async fn discard_line<R>(io: &mut R) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let buf = io.fill_buf().await?;
        if buf.is_empty() {
            return Ok(());
        }
        match buf.iter().position(|b| *b == b'\n') {
            Some(i) => {
                io.consume(i + 1);
                return Ok(());
            }
            None => {
                let n = buf.len();
                io.consume(n);
            }
        }
    }
}
