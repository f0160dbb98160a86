use crate::enricher::ExportReader;
use anyhow::Result;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Writes every enriched event to `out` as a JSON line until the enricher stops.
pub(crate) async fn json_lines<W>(mut reader: ExportReader, mut out: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(ev) = reader.next().await {
        let mut line = serde_json::to_vec(&*ev)?;
        line.push(b'\n');
        out.write_all(&line).await?;
        out.flush().await?;
    }
    debug!("Export finished");
    Ok(())
}
