//! Chunked blob transport over pre-signed URIs.
//!
//! A [`Blob`] is an ordered list of chunks, each with its own URI and size.
//! [`BlobStore::get`] and [`BlobStore::put`] map a logical byte range onto
//! the chunks it touches and transfer every chunk as its own tokio task. All
//! clones of a store share one semaphore of I/O permits. A call holds at most
//! one pending permit request at a time, so concurrent calls take turns chunk
//! by chunk. A call returns once all of its chunks are done, or with the
//! first error. There is no retry here; callers layer their own.

pub mod error;
mod http;
mod layout;
mod local;

use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::anyhow;
use bytes::Bytes;
pub use error::{BlobError, BlobResult};
pub use layout::{
    blob_size,
    file_blob,
    plan_chunk_layout,
    MAX_CHUNKS,
    MAX_CHUNK_SIZE,
    MIN_CHUNK_SIZE,
    OPTIMAL_CHUNK_SIZE,
};
use proto_api::function_executor_pb::{Blob, BlobChunk};
use tokio::{
    sync::Semaphore,
    task::{JoinError, JoinSet},
};
use tracing::debug;
use url::Url;

/// Upper bound of concurrent chunk transfers regardless of CPU count.
pub const MAX_IO_WORKERS: usize = 7;
const IO_WORKERS_PER_CPU: usize = 3;

/// Default number of concurrent chunk transfers for a machine with
/// `available_cpus` CPUs.
pub fn default_worker_count(available_cpus: usize) -> usize {
    (available_cpus * IO_WORKERS_PER_CPU).clamp(1, MAX_IO_WORKERS)
}

#[derive(Debug, Clone)]
pub struct BlobStoreOptions {
    pub worker_count: usize,
    pub request_timeout: Duration,
}

impl BlobStoreOptions {
    pub fn for_cpus(available_cpus: usize) -> Self {
        Self {
            worker_count: default_worker_count(available_cpus),
            request_timeout: Duration::from_secs(300),
        }
    }
}

enum Backend {
    File,
    Http,
}

fn parse_chunk_uri(uri: &str) -> BlobResult<(Backend, Url)> {
    let url = Url::parse(uri).map_err(|e| BlobError::InvalidUri {
        uri: uri.to_string(),
        reason: e.to_string(),
    })?;
    let backend = match url.scheme() {
        "file" => Backend::File,
        "http" | "https" => Backend::Http,
        scheme => {
            return Err(BlobError::UnsupportedBackend {
                scheme: scheme.to_string(),
            })
        }
    };
    Ok((backend, url))
}

fn buffer_error(blob: &Blob, size: u64) -> BlobError {
    BlobError::Other {
        source: anyhow!(
            "can't buffer {} bytes of blob {}",
            size,
            blob.id.as_deref().unwrap_or_default()
        ),
    }
}

fn joined<T>(joined: Result<BlobResult<T>, JoinError>) -> BlobResult<T> {
    joined.map_err(|e| BlobError::Other {
        source: anyhow!("blob I/O task failed: {}", e),
    })?
}

/// Cheap to clone; all clones share the I/O permits and the HTTP client.
#[derive(Clone)]
pub struct BlobStore {
    io_permits: Arc<Semaphore>,
    http_client: reqwest::Client,
}

impl BlobStore {
    pub fn new(options: BlobStoreOptions) -> BlobResult<Self> {
        let worker_count = options.worker_count.max(1);
        debug!(worker_count, "Creating blob store");
        Ok(Self {
            io_permits: Arc::new(Semaphore::new(worker_count)),
            http_client: http::new_client(options.request_timeout)?,
        })
    }

    /// Reads `size` bytes starting at `offset` of the blob.
    pub async fn get(&self, blob: &Blob, offset: u64, size: u64) -> BlobResult<Vec<u8>> {
        let start = Instant::now();
        let reads = layout::plan_read(blob, offset, size)?;
        for chunk_read in reads.iter() {
            parse_chunk_uri(&chunk_read.uri)?;
        }

        let len = usize::try_from(size).map_err(|_| buffer_error(blob, size))?;
        let mut dest = Vec::new();
        dest.try_reserve_exact(len)
            .map_err(|_| buffer_error(blob, size))?;
        dest.resize(len, 0);

        let results = self
            .run(reads.iter().cloned().map(|chunk_read| {
                let client = self.http_client.clone();
                async move {
                    let (backend, url) = parse_chunk_uri(&chunk_read.uri)?;
                    let data = match backend {
                        Backend::File => {
                            local::read(&url, chunk_read.blob_offset, chunk_read.len).await?
                        }
                        Backend::Http => {
                            http::read(&client, &url, chunk_read.blob_offset, chunk_read.len)
                                .await?
                                .to_vec()
                        }
                    };
                    Ok::<_, BlobError>((chunk_read.dest_offset, data))
                }
            }))
            .await?;

        for (dest_offset, data) in results {
            let from = dest_offset as usize;
            dest[from..from + data.len()].copy_from_slice(&data);
        }

        debug!(
            blob_id = blob.id.as_deref().unwrap_or_default(),
            offset,
            size,
            chunks = reads.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Blob get completed"
        );
        Ok(dest)
    }

    /// Writes `data` from the start of the blob.
    ///
    /// Returns the uploaded blob: only the chunks that received data, each
    /// with its written size and the ETag reported by the backend.
    pub async fn put(&self, blob: &Blob, data: &[Bytes]) -> BlobResult<Blob> {
        let start = Instant::now();
        let writes = layout::plan_write(blob, data)?;
        for chunk_write in writes.iter() {
            parse_chunk_uri(&chunk_write.uri)?;
        }

        let mut results = self
            .run(writes.iter().cloned().map(|chunk_write| {
                let client = self.http_client.clone();
                async move {
                    let (backend, url) = parse_chunk_uri(&chunk_write.uri)?;
                    let size = chunk_write.data.len() as u64;
                    let etag = match backend {
                        Backend::File => {
                            local::write(&url, chunk_write.chunk_start, &chunk_write.data).await?
                        }
                        Backend::Http => http::write(&client, &url, chunk_write.data).await?,
                    };
                    Ok::<_, BlobError>((chunk_write.chunk_index, size, etag))
                }
            }))
            .await?;
        results.sort_by_key(|(chunk_index, _, _)| *chunk_index);

        let uploaded = Blob {
            id: blob.id.clone(),
            chunks: results
                .into_iter()
                .map(|(chunk_index, size, etag)| BlobChunk {
                    uri: blob.chunks[chunk_index].uri.clone(),
                    size: Some(size),
                    etag: Some(etag),
                })
                .collect(),
        };

        debug!(
            blob_id = blob.id.as_deref().unwrap_or_default(),
            size = data.iter().map(|b| b.len()).sum::<usize>(),
            chunks = uploaded.chunks.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Blob put completed"
        );
        Ok(uploaded)
    }

    /// Spawns one task per chunk job and collects their outputs.
    ///
    /// The next job waits for a permit only after the previous one got
    /// spawned. Returns on the first failure; dropping the join set aborts
    /// the jobs still in flight.
    async fn run<T, F>(&self, jobs: impl Iterator<Item = F>) -> BlobResult<Vec<T>>
    where
        T: Send + 'static,
        F: Future<Output = BlobResult<T>> + Send + 'static,
    {
        let mut tasks = JoinSet::new();
        let mut outputs = Vec::new();
        for job in jobs {
            let permit = self
                .io_permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| BlobError::Other {
                    source: anyhow!("blob I/O permits are closed: {}", e),
                })?;
            tasks.spawn(async move {
                let output = job.await;
                drop(permit);
                output
            });
            while let Some(done) = tasks.try_join_next() {
                outputs.push(joined(done)?);
            }
        }
        while let Some(done) = tasks.join_next().await {
            outputs.push(joined(done)?);
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::Path,
        sync::{Arc, Mutex},
    };

    use super::*;

    fn store() -> BlobStore {
        BlobStore::new(BlobStoreOptions::for_cpus(2)).unwrap()
    }

    fn write_file(path: &Path, data: &[u8]) {
        std::fs::write(path, data).unwrap();
    }

    #[test]
    fn test_default_worker_count() {
        assert_eq!(default_worker_count(1), 3);
        assert_eq!(default_worker_count(2), 6);
        assert_eq!(default_worker_count(64), MAX_IO_WORKERS);
        assert_eq!(default_worker_count(0), 1);
    }

    #[tokio::test]
    async fn test_chunk_boundaries_are_invisible() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let single_path = dir.path().join("single");
        let multi_path = dir.path().join("multi");
        write_file(&single_path, &data);
        write_file(&multi_path, &data);

        let single = file_blob("single", &single_path, &[1000]).unwrap();
        let multi = file_blob("multi", &multi_path, &[300, 300, 300, 100]).unwrap();

        let store = store();
        let a = store.get(&single, 250, 400).await.unwrap();
        let b = store.get(&multi, 250, 400).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a, &data[250..650]);
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let blob = file_blob("out", &dir.path().join("out"), &[4, 4, 4, 4]).unwrap();

        let store = store();
        let uploaded = store
            .put(
                &blob,
                &[Bytes::from_static(b"hello "), Bytes::from_static(b"world")],
            )
            .await
            .unwrap();

        assert_eq!(uploaded.chunks.len(), 3);
        let sizes: Vec<u64> = uploaded.chunks.iter().map(|c| c.size.unwrap()).collect();
        assert_eq!(sizes, vec![4, 4, 3]);
        assert!(uploaded.chunks.iter().all(|c| c.etag.is_some()));
        assert_eq!(store.get(&uploaded, 0, 11).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_get_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        write_file(&path, b"abc");
        let blob = file_blob("b", &path, &[3]).unwrap();

        let err = store().get(&blob, 2, 5).await.unwrap_err();
        assert!(matches!(err, BlobError::OutOfRange { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_get_larger_than_blob_is_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        write_file(&path, b"abc");
        let blob = file_blob("b", &path, &[3]).unwrap();

        let err = store().get(&blob, 0, u64::MAX).await.unwrap_err();
        assert!(matches!(
            err,
            BlobError::OutOfRange {
                blob_size: 3,
                ..
            }
        ));
        assert!(err.to_string().contains("outside of blob b"));
    }

    #[tokio::test]
    async fn test_missing_chunk_fails_whole_call() {
        let dir = tempfile::tempdir().unwrap();
        let blob = file_blob("b", &dir.path().join("missing"), &[10, 10]).unwrap();
        assert!(matches!(
            store().get(&blob, 0, 20).await,
            Err(BlobError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_unsupported_scheme() {
        let blob = Blob {
            id: Some("b".to_string()),
            chunks: vec![BlobChunk {
                uri: Some("s3://bucket/key".to_string()),
                size: Some(10),
                etag: None,
            }],
        };
        assert!(matches!(
            store().get(&blob, 0, 10).await,
            Err(BlobError::UnsupportedBackend { .. })
        ));
    }

    #[tokio::test]
    async fn test_malformed_uri() {
        let blob = Blob {
            id: Some("b".to_string()),
            chunks: vec![BlobChunk {
                uri: Some("not a uri".to_string()),
                size: Some(10),
                etag: None,
            }],
        };
        assert!(matches!(
            store().put(&blob, &[Bytes::from_static(b"x")]).await,
            Err(BlobError::InvalidUri { .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_calls_take_turns() {
        let store = BlobStore::new(BlobStoreOptions {
            worker_count: 1,
            request_timeout: Duration::from_secs(5),
        })
        .unwrap();
        let finished = Arc::new(Mutex::new(Vec::new()));

        let jobs = |call: &'static str, count: usize| {
            let finished = finished.clone();
            (0..count).map(move |i| {
                let finished = finished.clone();
                async move {
                    tokio::task::yield_now().await;
                    finished.lock().unwrap().push(format!("{}{}", call, i));
                    BlobResult::Ok(i)
                }
            })
        };

        let (large, small) = tokio::join!(store.run(jobs("a", 10)), store.run(jobs("b", 2)));
        assert_eq!(large.unwrap().len(), 10);
        assert_eq!(small.unwrap().len(), 2);

        let finished = finished.lock().unwrap();
        let small_done = finished.iter().position(|job| job == "b1").unwrap();
        let large_done = finished.iter().position(|job| job == "a9").unwrap();
        assert!(
            small_done < 6,
            "the small call waited behind the large one: {:?}",
            finished
        );
        assert!(small_done < large_done);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_calls_share_permits() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(BlobStoreOptions {
            worker_count: 2,
            request_timeout: Duration::from_secs(5),
        })
        .unwrap();

        let mut tasks = JoinSet::new();
        for i in 0..4u8 {
            let store = store.clone();
            let path = dir.path().join(format!("blob-{}", i));
            tasks.spawn(async move {
                let blob = file_blob("b", &path, &[8; 16]).unwrap();
                let data = Bytes::from(vec![i; 128]);
                let uploaded = store.put(&blob, &[data.clone()]).await.unwrap();
                assert_eq!(store.get(&uploaded, 0, 128).await.unwrap(), data.to_vec());
            });
        }
        while let Some(done) = tasks.join_next().await {
            done.unwrap();
        }
        assert_eq!(store.io_permits.available_permits(), 2);
    }
}
