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

//! S3-style adapter: an HTTP adapter that additionally recognizes `s3://` URLs
//! and rewrites them to virtual-hosted-style HTTPS. No AWS SDK dependency.

use async_trait::async_trait;
use reqwest::Client as HttpClient;

use super::{Adapter, ByteStream, Head, HTTPAdapter, Want};
use crate::error::{FetchError, FetchResult};

/// HTTP-compatible adapter for `s3://bucket/key` logical URLs.
pub struct S3Adapter {
    inner: HTTPAdapter,
    region: String,
}

impl S3Adapter {
    pub fn new(client: HttpClient, region: impl Into<String>) -> Self {
        Self {
            inner: HTTPAdapter::new(client),
            region: region.into(),
        }
    }

    /// Rewrite `s3://bucket/key` to `https://bucket.s3.<region>.amazonaws.com/key`.
    /// Non-`s3://` URLs pass through unchanged.
    fn resolve(&self, url: &str) -> FetchResult<String> {
        let Some(rest) = url.strip_prefix("s3://") else {
            return Ok(url.to_string());
        };
        let (bucket, key) = rest.split_once('/').ok_or_else(|| FetchError::Permanent {
            url: url.to_string(),
            message: "s3 url missing object key".into(),
        })?;
        if bucket.is_empty() {
            return Err(FetchError::Permanent {
                url: url.to_string(),
                message: "s3 url missing bucket".into(),
            });
        }
        Ok(format!("https://{bucket}.s3.{}.amazonaws.com/{key}", self.region))
    }
}

#[async_trait]
impl Adapter for S3Adapter {
    fn match_url(&self, url: &str) -> bool {
        url.starts_with("s3://")
    }

    async fn head(&self, url: &str) -> FetchResult<Head> {
        let physical = self.resolve(url)?;
        let mut head = self.inner.head(&physical).await?;
        head.url = url.to_string();
        Ok(head)
    }

    async fn get(&self, url: &str, want: Want, chunk_size: usize) -> FetchResult<(Head, ByteStream)> {
        let physical = self.resolve(url)?;
        let (mut head, stream) = self.inner.get(&physical, want, chunk_size).await?;
        head.url = url.to_string();
        Ok((head, stream))
    }
}
