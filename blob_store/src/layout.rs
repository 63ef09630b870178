//! Mapping of logical byte ranges onto blob chunks, and chunk layout planning
//! within the limits of S3-compatible multipart uploads.

use std::path::Path;

use bytes::{Bytes, BytesMut};
use proto_api::function_executor_pb::{Blob, BlobChunk};

use crate::{
    error::{BlobError, BlobResult},
    local,
};

pub const MIN_CHUNK_SIZE: u64 = 5 * 1024 * 1024;
pub const MAX_CHUNK_SIZE: u64 = 5 * 1024 * 1024 * 1024;
pub const MAX_CHUNKS: u64 = 10_000;
pub const OPTIMAL_CHUNK_SIZE: u64 = 100 * 1024 * 1024;

/// Sum of all chunk sizes.
pub fn blob_size(blob: &Blob) -> u64 {
    blob.chunks
        .iter()
        .fold(0u64, |total, c| total.saturating_add(c.size.unwrap_or(0)))
}

/// One chunk's share of a logical read.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ChunkRead {
    pub chunk_index: usize,
    pub uri: String,
    /// Absolute offset inside the blob.
    pub blob_offset: u64,
    pub len: u64,
    /// Where the bytes land in the caller's buffer.
    pub dest_offset: u64,
}

/// One chunk's share of a logical write.
#[derive(Debug, Clone)]
pub(crate) struct ChunkWrite {
    pub chunk_index: usize,
    pub uri: String,
    pub chunk_start: u64,
    pub data: Bytes,
}

pub(crate) fn plan_read(blob: &Blob, offset: u64, size: u64) -> BlobResult<Vec<ChunkRead>> {
    let total = blob_size(blob);
    let in_range = offset.checked_add(size).is_some_and(|end| end <= total);
    if !in_range {
        return Err(BlobError::OutOfRange {
            blob_id: blob.id.clone().unwrap_or_default(),
            offset,
            size,
            blob_size: total,
        });
    }

    let end = offset + size;
    let mut reads = Vec::new();
    let mut chunk_start = 0u64;
    for (chunk_index, chunk) in blob.chunks.iter().enumerate() {
        let chunk_end = chunk_start.saturating_add(chunk.size.unwrap_or(0));
        let read_start = offset.max(chunk_start);
        let read_end = end.min(chunk_end);
        if read_start < read_end {
            reads.push(ChunkRead {
                chunk_index,
                uri: chunk.uri.clone().unwrap_or_default(),
                blob_offset: read_start,
                len: read_end - read_start,
                dest_offset: read_start - offset,
            });
        }
        if chunk_end >= end {
            break;
        }
        chunk_start = chunk_end;
    }
    Ok(reads)
}

pub(crate) fn plan_write(blob: &Blob, data: &[Bytes]) -> BlobResult<Vec<ChunkWrite>> {
    let total = blob_size(blob);
    let data_len: u64 = data.iter().map(|b| b.len() as u64).sum();
    if data_len > total {
        return Err(BlobError::OutOfRange {
            blob_id: blob.id.clone().unwrap_or_default(),
            offset: 0,
            size: data_len,
            blob_size: total,
        });
    }

    let mut writes = Vec::new();
    let mut chunk_start = 0u64;
    for (chunk_index, chunk) in blob.chunks.iter().enumerate() {
        if chunk_start >= data_len {
            break;
        }
        let chunk_end = chunk_start
            .saturating_add(chunk.size.unwrap_or(0))
            .min(data_len);
        if chunk_end > chunk_start {
            writes.push(ChunkWrite {
                chunk_index,
                uri: chunk.uri.clone().unwrap_or_default(),
                chunk_start,
                data: gather(data, chunk_start, chunk_end - chunk_start),
            });
        }
        chunk_start = chunk_end;
    }
    Ok(writes)
}

/// Returns `len` bytes starting at logical `start` across the buffers,
/// without copying when the range falls within one buffer.
fn gather(buffers: &[Bytes], start: u64, len: u64) -> Bytes {
    let end = start + len;
    let mut out: Option<BytesMut> = None;
    let mut buf_start = 0u64;
    for buf in buffers {
        let buf_end = buf_start + buf.len() as u64;
        let from = start.max(buf_start);
        let to = end.min(buf_end);
        if from < to {
            let piece = buf.slice((from - buf_start) as usize..(to - buf_start) as usize);
            if out.is_none() && to - from == len {
                return piece;
            }
            out.get_or_insert_with(|| BytesMut::with_capacity(len as usize))
                .extend_from_slice(&piece);
        }
        if buf_end >= end {
            break;
        }
        buf_start = buf_end;
    }
    out.map(BytesMut::freeze).unwrap_or_default()
}

/// Chunk sizes for a blob of `total_size` bytes.
///
/// The preferred size is clamped to the object store bounds and grown when
/// the blob would otherwise need more than [`MAX_CHUNKS`] chunks. Only the
/// last chunk may be smaller than [`MIN_CHUNK_SIZE`].
pub fn plan_chunk_layout(total_size: u64, preferred_chunk_size: u64) -> BlobResult<Vec<u64>> {
    if total_size == 0 {
        return Ok(Vec::new());
    }
    if total_size > MAX_CHUNK_SIZE * MAX_CHUNKS {
        return Err(BlobError::InvalidLayout {
            reason: format!(
                "blob size {} exceeds the maximum of {} bytes",
                total_size,
                MAX_CHUNK_SIZE * MAX_CHUNKS
            ),
        });
    }

    let mut chunk_size = preferred_chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
    if total_size.div_ceil(chunk_size) > MAX_CHUNKS {
        chunk_size = total_size.div_ceil(MAX_CHUNKS);
    }

    let mut sizes = Vec::with_capacity(total_size.div_ceil(chunk_size) as usize);
    let mut remaining = total_size;
    while remaining > 0 {
        let size = remaining.min(chunk_size);
        sizes.push(size);
        remaining -= size;
    }
    Ok(sizes)
}

/// Builds a blob backed by one local file, one `file://` chunk per size.
/// Every chunk URI points at the start of the file.
pub fn file_blob(id: &str, path: &Path, chunk_sizes: &[u64]) -> BlobResult<Blob> {
    let uri = local::path_to_file_uri(path)?;
    Ok(Blob {
        id: Some(id.to_string()),
        chunks: chunk_sizes
            .iter()
            .map(|size| BlobChunk {
                uri: Some(uri.clone()),
                size: Some(*size),
                etag: None,
            })
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(sizes: &[u64]) -> Blob {
        Blob {
            id: Some("b".to_string()),
            chunks: sizes
                .iter()
                .enumerate()
                .map(|(i, s)| BlobChunk {
                    uri: Some(format!("https://store/part-{}", i)),
                    size: Some(*s),
                    etag: None,
                })
                .collect(),
        }
    }

    #[test]
    fn test_plan_read_crossing_two_boundaries() {
        let reads = plan_read(&blob(&[4, 4, 4, 4]), 2, 9).unwrap();
        let spans: Vec<_> = reads
            .iter()
            .map(|r| (r.chunk_index, r.blob_offset, r.len, r.dest_offset))
            .collect();
        assert_eq!(spans, vec![(0, 2, 2, 0), (1, 4, 4, 2), (2, 8, 3, 6)]);
    }

    #[test]
    fn test_plan_read_out_of_range() {
        let err = plan_read(&blob(&[4, 4]), 6, 3).unwrap_err();
        assert!(matches!(err, BlobError::OutOfRange { blob_size: 8, .. }));
    }

    #[test]
    fn test_plan_read_past_end_of_tiny_blob() {
        let err = plan_read(&blob(&[3]), 0, u64::MAX).unwrap_err();
        assert!(matches!(
            err,
            BlobError::OutOfRange {
                size: u64::MAX,
                blob_size: 3,
                ..
            }
        ));
        assert!(plan_read(&blob(&[u64::MAX, u64::MAX]), u64::MAX, 1).is_err());
    }

    #[test]
    fn test_plan_write_uses_only_needed_chunks() {
        let data = vec![Bytes::from_static(b"abc"), Bytes::from_static(b"defgh")];
        let writes = plan_write(&blob(&[4, 4, 4]), &data).unwrap();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].data, Bytes::from_static(b"abcd"));
        assert_eq!(writes[1].chunk_start, 4);
        assert_eq!(writes[1].data, Bytes::from_static(b"efgh"));
    }

    #[test]
    fn test_plan_write_too_large() {
        let data = vec![Bytes::from(vec![0u8; 9])];
        assert!(plan_write(&blob(&[4, 4]), &data).is_err());
    }

    #[test]
    fn test_chunk_layout_respects_minimum() {
        let sizes = plan_chunk_layout(12 * 1024 * 1024, 1024).unwrap();
        assert_eq!(
            sizes,
            vec![MIN_CHUNK_SIZE, MIN_CHUNK_SIZE, 2 * 1024 * 1024]
        );
    }

    #[test]
    fn test_chunk_layout_caps_chunk_count() {
        let total = 2 * MAX_CHUNKS * MIN_CHUNK_SIZE;
        let sizes = plan_chunk_layout(total, MIN_CHUNK_SIZE).unwrap();
        assert!(sizes.len() as u64 <= MAX_CHUNKS);
        assert_eq!(sizes.iter().sum::<u64>(), total);
        assert!(sizes.iter().all(|s| *s <= MAX_CHUNK_SIZE));
    }

    #[test]
    fn test_chunk_layout_rejects_oversized_blob() {
        assert!(plan_chunk_layout(MAX_CHUNK_SIZE * MAX_CHUNKS + 1, OPTIMAL_CHUNK_SIZE).is_err());
    }
}
