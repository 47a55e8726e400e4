// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! HTTP(S) adapter: plain range-request driver with no provider-specific logic.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client as HttpClient, StatusCode};

use super::{Adapter, ByteStream, Head, Want};
use crate::error::FetchError;
use crate::storage::range::Range;

/// Parses `X-Goog-Hash: crc32c=<base64>` and `x-amz-meta-crc32c: <base64|hex>` style
/// metadata headers into a normalized crc32c string. Shared with `S3Adapter`.
pub(super) fn parse_crc32c_header(headers: &reqwest::header::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("x-goog-hash") {
        let value = value.to_str().ok()?;
        for part in value.split(',') {
            let part = part.trim();
            if let Some(rest) = part.strip_prefix("crc32c=") {
                return Some(rest.to_string());
            }
        }
    }
    if let Some(value) = headers.get("x-amz-meta-crc32c") {
        return value.to_str().ok().map(|s| s.to_string());
    }
    None
}

fn classify_status(status: StatusCode, url: &str) -> FetchError {
    if status == StatusCode::NOT_FOUND {
        FetchError::NotFound { url: url.to_string() }
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        FetchError::Transient {
            url: url.to_string(),
            message: format!("http {}", status.as_u16()),
        }
    } else {
        FetchError::Permanent {
            url: url.to_string(),
            message: format!("http {}", status.as_u16()),
        }
    }
}

/// Plain HTTP(S) adapter using raw `reqwest` range requests.
pub struct HTTPAdapter {
    client: HttpClient,
}

impl HTTPAdapter {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }
}

impl Default for HTTPAdapter {
    fn default() -> Self {
        Self::new(HttpClient::new())
    }
}

#[async_trait]
impl Adapter for HTTPAdapter {
    fn match_url(&self, url: &str) -> bool {
        url.starts_with("http://") || url.starts_with("https://")
    }

    async fn head(&self, url: &str) -> crate::error::FetchResult<Head> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| FetchError::Transient {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(classify_status(response.status(), url));
        }

        let content_length = response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| FetchError::Permanent {
                url: url.to_string(),
                message: "missing Content-Length on HEAD response".into(),
            })?;

        let accept_ranges = response
            .headers()
            .get(reqwest::header::ACCEPT_RANGES)
            .map(|v| v == "bytes")
            .unwrap_or(false);

        let crc32c = parse_crc32c_header(response.headers());
        let date = response
            .headers()
            .get(reqwest::header::DATE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        Ok(Head {
            url: url.to_string(),
            content_length,
            document_length: content_length,
            served_range: None,
            crc32c,
            accept_ranges,
            date,
        })
    }

    async fn get(&self, url: &str, want: Want, chunk_size: usize) -> crate::error::FetchResult<(Head, ByteStream)> {
        let mut request = self.client.get(url);
        if let Some(range) = want.range {
            request = request.header(
                reqwest::header::RANGE,
                format!("bytes={}-{}", range.start, range.end - 1),
            );
        }

        let response = request.send().await.map_err(|e| FetchError::Transient {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Err(FetchError::Permanent {
                url: url.to_string(),
                message: "requested range not satisfiable".into(),
            });
        }
        if !status.is_success() {
            return Err(classify_status(status, url));
        }

        let crc32c = parse_crc32c_header(response.headers());
        let (document_length, served_range) = if status == StatusCode::PARTIAL_CONTENT {
            parse_content_range(response.headers(), url)?
        } else {
            let len = response
                .headers()
                .get(reqwest::header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| FetchError::Permanent {
                    url: url.to_string(),
                    message: "missing Content-Length on GET response".into(),
                })?;
            if let Some(requested) = want.range {
                if requested.start != 0 || requested.end != len {
                    return Err(FetchError::Permanent {
                        url: url.to_string(),
                        message: "server returned 200 for a request that was not [0, document_length)".into(),
                    });
                }
            }
            (len, None)
        };

        let content_length = response
            .content_length()
            .unwrap_or_else(|| served_range.map(|r| r.size()).unwrap_or(document_length));

        let head = Head {
            url: url.to_string(),
            content_length,
            document_length,
            served_range,
            crc32c,
            accept_ranges: true,
            date: None,
        };

        let url_owned = url.to_string();
        let stream = response
            .bytes_stream()
            .map(move |chunk| {
                chunk.map_err(|e| FetchError::Transient {
                    url: url_owned.clone(),
                    message: e.to_string(),
                })
            })
            .flat_map(move |result| {
                futures::stream::iter(match result {
                    Ok(bytes) => split_into_chunks(bytes, chunk_size).into_iter().map(Ok).collect::<Vec<_>>(),
                    Err(e) => vec![Err(e)],
                })
            })
            .boxed();

        Ok((head, stream))
    }
}

fn parse_content_range(
    headers: &reqwest::header::HeaderMap,
    url: &str,
) -> crate::error::FetchResult<(u64, Option<Range>)> {
    let raw = headers
        .get(reqwest::header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| FetchError::Permanent {
            url: url.to_string(),
            message: "206 response missing Content-Range".into(),
        })?;

    // Format: "bytes start-end/total"
    let rest = raw.strip_prefix("bytes ").ok_or_else(|| FetchError::Permanent {
        url: url.to_string(),
        message: format!("unparseable Content-Range: {raw}"),
    })?;
    let (range_part, total_part) = rest.split_once('/').ok_or_else(|| FetchError::Permanent {
        url: url.to_string(),
        message: format!("unparseable Content-Range: {raw}"),
    })?;
    let (start_str, end_str) = range_part.split_once('-').ok_or_else(|| FetchError::Permanent {
        url: url.to_string(),
        message: format!("unparseable Content-Range: {raw}"),
    })?;

    let start: u64 = start_str.parse().map_err(|_| FetchError::Permanent {
        url: url.to_string(),
        message: format!("unparseable Content-Range: {raw}"),
    })?;
    let end_inclusive: u64 = end_str.parse().map_err(|_| FetchError::Permanent {
        url: url.to_string(),
        message: format!("unparseable Content-Range: {raw}"),
    })?;
    let total: u64 = total_part.parse().map_err(|_| FetchError::Permanent {
        url: url.to_string(),
        message: format!("unparseable Content-Range: {raw}"),
    })?;

    Ok((total, Some(Range::new(start, end_inclusive + 1))))
}

fn split_into_chunks(bytes: bytes::Bytes, chunk_size: usize) -> Vec<bytes::Bytes> {
    if bytes.len() <= chunk_size || chunk_size == 0 {
        return vec![bytes];
    }
    let mut chunks = Vec::new();
    let mut remaining = bytes;
    while remaining.len() > chunk_size {
        chunks.push(remaining.split_to(chunk_size));
    }
    chunks.push(remaining);
    chunks
}
