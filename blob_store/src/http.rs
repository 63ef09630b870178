//! Pre-signed HTTP(S) backend.
//!
//! Reads use a ranged GET against the chunk URI with absolute blob offsets.
//! Writes PUT the chunk body to its (multipart part) URI and return the
//! `ETag` response header.

use std::time::Duration;

use anyhow::anyhow;
use bytes::Bytes;
use reqwest::{header, Client, StatusCode};
use url::Url;

use crate::error::{BlobError, BlobResult};

pub(crate) fn new_client(timeout: Duration) -> BlobResult<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| BlobError::Other {
            source: anyhow!("failed to build HTTP client: {}", e),
        })
}

fn network_error(uri: &Url, e: reqwest::Error) -> BlobError {
    BlobError::NetworkError {
        uri: uri.to_string(),
        source: anyhow::Error::from(e),
    }
}

fn check_status(uri: &Url, status: StatusCode) -> BlobResult<()> {
    if status == StatusCode::NOT_FOUND {
        return Err(BlobError::NotFound {
            uri: uri.to_string(),
        });
    }
    if !status.is_success() {
        return Err(BlobError::HttpStatus {
            uri: uri.to_string(),
            status: status.as_u16(),
        });
    }
    Ok(())
}

pub(crate) async fn read(client: &Client, uri: &Url, offset: u64, len: u64) -> BlobResult<Bytes> {
    let range = format!("bytes={}-{}", offset, offset + len - 1);
    let response = client
        .get(uri.clone())
        .header(header::RANGE, range)
        .send()
        .await
        .map_err(|e| network_error(uri, e))?;

    let status = response.status();
    check_status(uri, status)?;

    let body = response.bytes().await.map_err(|e| network_error(uri, e))?;
    // A server that ignores Range returns the whole object with 200.
    let data = if status == StatusCode::OK && body.len() as u64 > len {
        let end = offset + len;
        if (body.len() as u64) < end {
            return Err(short_read(uri, len, body.len()));
        }
        body.slice(offset as usize..end as usize)
    } else {
        body
    };
    if data.len() as u64 != len {
        return Err(short_read(uri, len, data.len()));
    }
    Ok(data)
}

fn short_read(uri: &Url, expected: u64, got: usize) -> BlobError {
    BlobError::NetworkError {
        uri: uri.to_string(),
        source: anyhow!("expected {} bytes, got {}", expected, got),
    }
}

pub(crate) async fn write(client: &Client, uri: &Url, data: Bytes) -> BlobResult<String> {
    let response = client
        .put(uri.clone())
        .body(data)
        .send()
        .await
        .map_err(|e| network_error(uri, e))?;
    check_status(uri, response.status())?;

    response
        .headers()
        .get(header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .ok_or_else(|| BlobError::NetworkError {
            uri: uri.to_string(),
            source: anyhow!("response has no ETag header"),
        })
}
