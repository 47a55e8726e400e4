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

//! Mirror registry: maps a logical URL to equivalent physical URLs, with
//! per-mirror health and cooldown.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

const BASE_COOLDOWN: Duration = Duration::from_secs(1);
const MAX_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct MirrorHealth {
    success_count: u64,
    failure_count: u32,
    cooldown_until: Option<Instant>,
}

impl Default for MirrorHealth {
    fn default() -> Self {
        Self {
            success_count: 0,
            failure_count: 0,
            cooldown_until: None,
        }
    }
}

impl MirrorHealth {
    fn is_cooling(&self, now: Instant) -> bool {
        self.cooldown_until.map(|until| now < until).unwrap_or(false)
    }

    fn record_success(&mut self) {
        self.success_count += 1;
        self.failure_count = 0;
        self.cooldown_until = None;
    }

    fn record_failure(&mut self, now: Instant) {
        self.failure_count += 1;
        let backoff = BASE_COOLDOWN
            .checked_mul(1 << self.failure_count.min(6))
            .unwrap_or(MAX_COOLDOWN)
            .min(MAX_COOLDOWN);
        self.cooldown_until = Some(now + backoff);
    }
}

/// A registry of physical mirrors for logical URLs, with cooldown-aware selection.
pub struct MirrorRegistry {
    /// logical_url -> physical urls (always includes the logical url itself).
    mirrors: HashMap<String, Vec<String>>,
    health: HashMap<String, MirrorHealth>,
    rng: StdRng,
}

impl MirrorRegistry {
    /// Build an empty registry with an optional deterministic seed.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self {
            mirrors: HashMap::new(),
            health: HashMap::new(),
            rng,
        }
    }

    /// Load one or more mirror map files (`{ logical_url: [physical_url, ...] }`).
    /// Missing files are ignored; entries with empty arrays are ignored.
    pub fn load_files(&mut self, paths: &[impl AsRef<Path>]) {
        for path in paths {
            let path = path.as_ref();
            let Ok(content) = std::fs::read_to_string(path) else {
                continue;
            };
            let Ok(map) = serde_json::from_str::<HashMap<String, Vec<String>>>(&content) else {
                tracing::warn!(path = %path.display(), "ignoring malformed mirror file");
                continue;
            };
            for (logical, physicals) in map {
                if physicals.is_empty() {
                    continue;
                }
                self.mirrors.entry(logical).or_default().extend(physicals);
            }
        }
    }

    /// Candidate physical URLs for a logical URL: known mirrors plus the logical
    /// URL itself, which is always a candidate.
    pub fn candidates(&self, logical_url: &str) -> Vec<String> {
        let mut candidates = self
            .mirrors
            .get(logical_url)
            .cloned()
            .unwrap_or_default();
        if !candidates.iter().any(|c| c == logical_url) {
            candidates.push(logical_url.to_string());
        }
        candidates
    }

    /// Pick one physical URL not currently in cooldown, uniformly at random.
    /// Falls back to the least-recently-cooled candidate if all are cooling.
    pub fn choose(&mut self, logical_url: &str) -> String {
        let candidates = self.candidates(logical_url);
        let now = Instant::now();
        let available: Vec<&String> = candidates
            .iter()
            .filter(|url| !self.health.get(*url).map(|h| h.is_cooling(now)).unwrap_or(false))
            .collect();

        if available.is_empty() {
            return candidates
                .into_iter()
                .min_by_key(|url| {
                    self.health
                        .get(url)
                        .and_then(|h| h.cooldown_until)
                        .unwrap_or(now)
                })
                .unwrap_or_else(|| logical_url.to_string());
        }

        let idx = self.rng.gen_range(0..available.len());
        available[idx].clone()
    }

    /// Exclude one or more already-tried URLs and choose among the rest, falling
    /// back to `choose` if nothing remains.
    pub fn choose_excluding(&mut self, logical_url: &str, exclude: &[String]) -> Option<String> {
        let candidates = self.candidates(logical_url);
        let now = Instant::now();
        let available: Vec<&String> = candidates
            .iter()
            .filter(|url| !exclude.contains(url))
            .filter(|url| !self.health.get(*url).map(|h| h.is_cooling(now)).unwrap_or(false))
            .collect();
        if available.is_empty() {
            return None;
        }
        let idx = self.rng.gen_range(0..available.len());
        Some(available[idx].clone())
    }

    pub fn record_success(&mut self, physical_url: &str) {
        self.health.entry(physical_url.to_string()).or_default().record_success();
    }

    pub fn record_failure(&mut self, physical_url: &str) {
        let now = Instant::now();
        self.health
            .entry(physical_url.to_string())
            .or_default()
            .record_failure(now);
    }

    /// Drop cooldown bookkeeping for entries whose cooldown has long expired,
    /// invoked from `Client::monitor()`.
    pub fn reap_expired_cooldowns(&mut self) {
        let now = Instant::now();
        self.health.retain(|_, h| h.is_cooling(now) || h.failure_count > 0);
    }
}
