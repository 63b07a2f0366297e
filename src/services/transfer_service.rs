//! src/services/transfer_service.rs
//!
//! Streaming transfer of an exported image into a destination volume.
//!
//! The source stream is wrapped in a [`CountingReader`] that tallies bytes
//! (and an MD5 digest) as they pass through. A reporter task publishes the
//! running total on a fixed interval while a single bulk copy moves the
//! data; once the copy ends the reporter is stopped and publishes the final
//! count before the transfer returns.

use crate::{client::CloudClient, errors::TransferError, metrics::ProgressSink};
use md5::Context;
use std::{
    io,
    path::Path,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    task::{Poll, ready},
    time::Duration,
};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf},
    sync::oneshot,
    time::MissedTickBehavior,
};
use tracing::{debug, info};

/// How often the reporter publishes progress by default.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(3);

/// Destination files whose name ends with this are fresh disk images and
/// may be created. Anything else (e.g. a block device) must already exist.
pub const FRESH_DISK_IMAGE_SUFFIX: &str = "disk.img";

/// Result of a completed transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub bytes: u64,
    /// Lowercase hex MD5 of everything read from the source.
    pub md5: String,
}

/// Read decorator that counts bytes and digests them without altering the
/// data. The counter is shared with the progress reporter.
pub struct CountingReader<R> {
    inner: R,
    count: Arc<AtomicU64>,
    digest: Context,
}

impl<R> CountingReader<R> {
    pub fn new(inner: R, count: Arc<AtomicU64>) -> Self {
        Self {
            inner,
            count,
            digest: Context::new(),
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Hex MD5 of the bytes read so far.
    pub fn finish(self) -> String {
        format!("{:x}", self.digest.compute())
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let fresh = &buf.filled()[before..];
        if !fresh.is_empty() {
            this.digest.consume(fresh);
            this.count.fetch_add(fresh.len() as u64, Ordering::Relaxed);
        }
        Poll::Ready(Ok(()))
    }
}

/// Copy `source` into `sink`, publishing progress under `transfer_id` every
/// `interval`. The final published value equals the bytes copied, also when
/// the copy fails part way.
pub async fn transfer<R, W>(
    source: R,
    sink: &mut W,
    transfer_id: &str,
    progress: Arc<dyn ProgressSink>,
    interval: Duration,
) -> Result<TransferReport, TransferError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let counter = Arc::new(AtomicU64::new(0));
    let mut reader = CountingReader::new(source, counter.clone());

    let (stop_tx, stop_rx) = oneshot::channel();
    let reporter = tokio::spawn(report_progress(
        transfer_id.to_string(),
        counter,
        progress,
        interval,
        stop_rx,
    ));

    let copied = async {
        let n = tokio::io::copy(&mut reader, sink).await?;
        sink.flush().await?;
        Ok::<u64, io::Error>(n)
    }
    .await;

    // The sender is consumed here, so the reporter is stopped exactly once.
    let _ = stop_tx.send(());
    let published = reporter
        .await
        .map_err(|err| TransferError::Reporter(err.to_string()))?;

    match copied {
        Ok(n) => {
            debug!(transfer = %transfer_id, copied = n, published, "copy complete");
            Ok(TransferReport {
                bytes: published,
                md5: reader.finish(),
            })
        }
        Err(source) => Err(TransferError::Copy {
            transferred: published,
            source,
        }),
    }
}

/// Publish the counter on every tick until stopped, then publish once more
/// and return the final count.
async fn report_progress(
    transfer_id: String,
    counter: Arc<AtomicU64>,
    progress: Arc<dyn ProgressSink>,
    interval: Duration,
    mut stop: oneshot::Receiver<()>,
) -> u64 {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            _ = ticker.tick() => {
                let bytes = counter.load(Ordering::Relaxed);
                progress.publish(&transfer_id, bytes);
                info!(transfer = %transfer_id, bytes, "transferred");
            }
        }
    }
    let total = counter.load(Ordering::Relaxed);
    progress.publish(&transfer_id, total);
    info!(transfer = %transfer_id, bytes = total, "transfer finished");
    total
}

/// Open the destination volume for writing without truncating it.
pub async fn open_destination(path: &Path) -> Result<File, TransferError> {
    let fresh_image = path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(FRESH_DISK_IMAGE_SUFFIX));
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(fresh_image)
        .open(path)
        .await
        .map_err(|source| TransferError::Destination {
            path: path.display().to_string(),
            source,
        })
}

/// Compare the transferred digest with the one the object store reported.
/// Objects without a stored MD5 (composite uploads) pass unchecked.
pub fn verify_md5(expected: Option<&str>, report: &TransferReport) -> Result<(), TransferError> {
    match expected {
        Some(expected) if !expected.eq_ignore_ascii_case(&report.md5) => {
            Err(TransferError::Checksum {
                expected: expected.to_string(),
                actual: report.md5.clone(),
            })
        }
        _ => Ok(()),
    }
}

/// Stream `bucket/object` into the volume at `volume_path`, publishing
/// progress under the object name and checking the stored MD5 at the end.
pub async fn populate(
    client: &CloudClient,
    bucket: &str,
    object: &str,
    volume_path: &Path,
    progress: Arc<dyn ProgressSink>,
    interval: Duration,
) -> Result<TransferReport, TransferError> {
    let metadata = client.object_metadata(bucket, object).await?;
    info!(%bucket, %object, size = metadata.size, volume = %volume_path.display(), "starting transfer");

    let mut sink = open_destination(volume_path).await?;
    let source = client.download_object(bucket, object).await?;
    let report = transfer(source, &mut sink, object, progress, interval).await?;
    sink.sync_all()
        .await
        .map_err(|source| TransferError::Destination {
            path: volume_path.display().to_string(),
            source,
        })?;

    verify_md5(metadata.md5_hex().as_deref(), &report)?;
    info!(%object, bytes = report.bytes, md5 = %report.md5, "transfer verified");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::stream;
    use parking_lot::Mutex;
    use tokio::io::AsyncReadExt;
    use tokio_util::io::StreamReader;

    #[derive(Default)]
    struct Recorder {
        samples: Mutex<Vec<(String, u64)>>,
    }

    impl ProgressSink for Recorder {
        fn publish(&self, transfer_id: &str, bytes: u64) {
            self.samples.lock().push((transfer_id.to_string(), bytes));
        }
    }

    impl Recorder {
        fn values(&self) -> Vec<u64> {
            self.samples.lock().iter().map(|(_, v)| *v).collect()
        }
    }

    /// `count` chunks of `size` bytes, two seconds apart.
    fn slow_source(count: u8, size: usize) -> impl AsyncRead + Unpin {
        let chunks = stream::unfold(0u8, move |i| async move {
            if i == count {
                return None;
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
            Some((Ok::<_, io::Error>(Bytes::from(vec![i; size])), i + 1))
        });
        StreamReader::new(Box::pin(chunks))
    }

    #[tokio::test]
    async fn counting_reader_passes_data_through() {
        let counter = Arc::new(AtomicU64::new(0));
        let mut reader = CountingReader::new(&b"hello world"[..], counter.clone());
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
        assert_eq!(reader.count(), 11);
        assert_eq!(reader.finish(), "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[tokio::test(start_paused = true)]
    async fn progress_is_monotonic_and_ends_at_total() {
        let recorder = Arc::new(Recorder::default());
        let mut sink = Vec::new();
        let report = transfer(
            slow_source(5, 1000),
            &mut sink,
            "img",
            recorder.clone(),
            Duration::from_secs(3),
        )
        .await
        .unwrap();

        assert_eq!(report.bytes, 5000);
        assert_eq!(sink.len(), 5000);
        let values = recorder.values();
        assert!(values.len() >= 3, "expected periodic samples, got {:?}", values);
        assert!(values.windows(2).all(|w| w[0] <= w[1]), "{:?}", values);
        assert_eq!(values.last().copied(), Some(5000));
        assert!(recorder.samples.lock().iter().all(|(id, _)| id == "img"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_copy_still_flushes_partial_count() {
        let chunks = stream::iter(vec![
            Ok(Bytes::from(vec![1u8; 700])),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ]);
        let recorder = Arc::new(Recorder::default());
        let mut sink = Vec::new();
        let err = transfer(
            StreamReader::new(chunks),
            &mut sink,
            "img",
            recorder.clone(),
            Duration::from_secs(3),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, TransferError::Copy { transferred: 700, .. }));
        assert_eq!(recorder.values().last().copied(), Some(700));
    }

    #[tokio::test]
    async fn fresh_disk_image_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let file = open_destination(&path).await.unwrap();
        drop(file);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn other_destinations_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let err = open_destination(&dir.path().join("block-device"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Destination { .. }));
    }

    #[tokio::test]
    async fn existing_destination_is_not_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volume");
        tokio::fs::write(&path, vec![9u8; 4096]).await.unwrap();

        let mut file = open_destination(&path).await.unwrap();
        let recorder: Arc<dyn ProgressSink> = Arc::new(Recorder::default());
        transfer(&b"abcd"[..], &mut file, "v", recorder, DEFAULT_REPORT_INTERVAL)
            .await
            .unwrap();
        drop(file);

        let written = tokio::fs::read(&path).await.unwrap();
        assert_eq!(written.len(), 4096);
        assert_eq!(&written[..4], b"abcd");
        assert_eq!(written[4], 9);
    }

    #[tokio::test]
    async fn populate_reports_missing_object() {
        let cloud = crate::client::memory::MemoryCloud::new();
        cloud.add_bucket("b");
        let client = CloudClient::new(Arc::new(cloud), "proj", Some("b".into()));
        let dir = tempfile::tempdir().unwrap();
        let err = populate(
            &client,
            "b",
            "missing.qcow2",
            &dir.path().join("disk.img"),
            Arc::new(Recorder::default()),
            DEFAULT_REPORT_INTERVAL,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransferError::Source(ref e) if e.is_not_found()));
        assert!(!dir.path().join("disk.img").exists());
    }

    #[test]
    fn md5_mismatch_is_reported() {
        let report = TransferReport {
            bytes: 1,
            md5: "00".into(),
        };
        assert!(verify_md5(None, &report).is_ok());
        assert!(verify_md5(Some("00"), &report).is_ok());
        assert!(matches!(
            verify_md5(Some("ff"), &report),
            Err(TransferError::Checksum { .. })
        ));
    }
}
