use futures_util::StreamExt;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::peer::RemoteFile;
use crate::store::{DestinationWriter, StoreError};

/// Custom errors for download operations.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("destination error: {0}")]
    Store(#[from] StoreError),
}

/// How a single transfer ended.
#[derive(Debug)]
pub enum TransferOutcome {
    /// The whole body was written. Carries the byte count.
    Completed(u64),
    /// The session was torn down mid-transfer; the partial file stays behind.
    Aborted,
    Failed(DownloadError),
}

/// Streams one remote file into one destination.
#[derive(Debug, Clone)]
pub struct FileDownloader {
    /// Bytes between two progress reports.
    granularity: u64,
}

impl FileDownloader {
    pub fn new(granularity: u64) -> Self {
        Self {
            granularity: granularity.max(1),
        }
    }

    /// Copies `source` into `writer`, calling `on_progress` with the running
    /// byte count each time another `granularity` bytes have been written.
    /// `exiting` is checked before every chunk and raced against waiting for it.
    pub async fn run<P>(
        &self,
        source: RemoteFile,
        writer: DestinationWriter,
        exiting: &CancellationToken,
        mut on_progress: P,
    ) -> TransferOutcome
    where
        P: FnMut(u64),
    {
        match self.copy(source, writer, exiting, &mut on_progress).await {
            Ok(Some(bytes)) => {
                info!(bytes, "transfer completed");
                TransferOutcome::Completed(bytes)
            }
            Ok(None) => {
                info!("transfer aborted");
                TransferOutcome::Aborted
            }
            Err(e) => TransferOutcome::Failed(e),
        }
    }

    async fn copy<P>(
        &self,
        source: RemoteFile,
        writer: DestinationWriter,
        exiting: &CancellationToken,
        on_progress: &mut P,
    ) -> Result<Option<u64>, DownloadError>
    where
        P: FnMut(u64),
    {
        let mut body = source.body;
        let mut out = BufWriter::new(writer);
        let mut written: u64 = 0;

        loop {
            if exiting.is_cancelled() {
                return Ok(None);
            }
            let chunk = tokio::select! {
                biased;
                _ = exiting.cancelled() => return Ok(None),
                chunk = body.next() => chunk,
            };
            let bytes = match chunk {
                Some(bytes) => bytes?,
                None => break,
            };
            out.write_all(&bytes).await?;

            let before = written;
            written += bytes.len() as u64;
            if written / self.granularity > before / self.granularity {
                debug!(written, "progress");
                on_progress(written);
            }
        }

        out.flush().await?;
        out.shutdown().await?;
        Ok(Some(written))
    }
}
