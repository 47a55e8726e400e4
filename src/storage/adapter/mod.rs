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

//! Per-scheme drivers issuing HEAD/GET requests against a physical URL.

mod http;
mod s3;

pub use http::HTTPAdapter;
pub use s3::S3Adapter;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::FetchResult;
use crate::storage::range::Range;

/// Response metadata common to HEAD and GET.
#[derive(Debug, Clone, Default)]
pub struct Head {
    pub url: String,
    /// Size of this response body (may be a sub-range).
    pub content_length: u64,
    /// Total artifact size, which may differ from `content_length` for range responses.
    pub document_length: u64,
    /// The range the server actually served, if this was a range request.
    pub served_range: Option<Range>,
    pub crc32c: Option<String>,
    pub accept_ranges: bool,
    pub date: Option<String>,
}

pub type ByteStream = BoxStream<'static, FetchResult<Bytes>>;

/// A requested range for `Adapter::get`. Multi-range requests are out of scope.
#[derive(Debug, Clone, Copy)]
pub struct Want {
    pub range: Option<Range>,
}

impl Want {
    pub fn full() -> Self {
        Self { range: None }
    }

    pub fn range(range: Range) -> Self {
        Self { range: Some(range) }
    }
}

/// Common contract for a per-scheme download driver.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Whether this adapter can handle `url`. The Client picks the first match.
    fn match_url(&self, url: &str) -> bool;

    /// Cheap metadata probe. Populates `document_length` when disclosed, and
    /// `crc32c` when present in provider metadata headers.
    async fn head(&self, url: &str) -> FetchResult<Head>;

    /// Issue a ranged GET if `want.range` is set, otherwise a full GET. Returns
    /// the response head (including the range actually served, which the caller
    /// must validate) and a lazy byte stream of chunks of at most `chunk_size`.
    async fn get(&self, url: &str, want: Want, chunk_size: usize) -> FetchResult<(Head, ByteStream)>;
}
