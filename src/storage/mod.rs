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

//! Resumable, multi-mirror, segmented transfer manager.

pub mod adapter;
pub mod client;
pub mod mirror;
pub mod range;
pub mod supervisor;
pub mod transfer;
pub mod worker;

pub use client::Client;
pub use range::{Range, RangeSet};
pub use supervisor::{CancelRequest, GetRequest, Supervisor, SupervisorHandle};
pub use transfer::{Transfer, TransferStatus};
