//! Component A — Mirror Selector.
//!
//! Two modes, chosen at boot (spec section 4.A):
//! - `predefined`: rotates the configured list by a round-robin index that
//!   advances by one per `get_all()` call.
//! - `auto`: periodically scores candidates by availability/latency, filters
//!   by `https_required`/`ipv4`/`ipv6`/`max_score`, returns survivors in
//!   ascending score order.
//!
//! Grounded on flexo's `rated_providers`/`mirror_cache` split
//! (`other_examples/.../flexo/src/main.rs`): fetch or score candidates once,
//! persist the ranking, fall back to the persisted ranking if a fresh
//! measurement pass fails.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::{AutoMirrorConfig, Config, MirrorSelectionMethod};
use crate::store::{Store, TREE_MIRRORS_STATUS};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScoredMirror {
    url: String,
    score: f64,
}

pub struct MirrorSelector {
    method: MirrorSelectionMethod,
    predefined: Vec<String>,
    round_robin: AtomicUsize,
    auto_cfg: AutoMirrorConfig,
    tree: sled::Tree,
    client: Client,
}

impl MirrorSelector {
    pub fn new(config: &Config, store: &Store) -> anyhow::Result<Self> {
        let tree = store.tree(TREE_MIRRORS_STATUS)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.mirrors_auto.timeout_secs))
            .build()?;

        let mut predefined = config.mirrors_predefined.clone();
        predefined.retain(|m| !config.mirrors_blacklist.contains(m));

        Ok(Self {
            method: config.mirror_selection_method,
            predefined,
            round_robin: AtomicUsize::new(0),
            auto_cfg: config.mirrors_auto.clone(),
            tree,
            client,
        })
    }

    /// Returns an ordered list of upstream base URLs, ranked best-first.
    pub fn get_all(&self) -> Vec<String> {
        match self.method {
            MirrorSelectionMethod::Predefined => self.get_all_predefined(),
            MirrorSelectionMethod::Auto => self.get_all_auto(),
        }
    }

    fn get_all_predefined(&self) -> Vec<String> {
        if self.predefined.is_empty() {
            return Vec::new();
        }
        let index = self.round_robin.fetch_add(1, Ordering::SeqCst) % self.predefined.len();
        self.predefined
            .iter()
            .cycle()
            .skip(index)
            .take(self.predefined.len())
            .cloned()
            .collect()
    }

    fn get_all_auto(&self) -> Vec<String> {
        match self.load_ranking() {
            Some(ranked) if !ranked.is_empty() => ranked,
            _ => self.predefined.clone(),
        }
    }

    fn load_ranking(&self) -> Option<Vec<String>> {
        let bytes = self.tree.get("ranking").ok().flatten()?;
        let scored: Vec<ScoredMirror> = serde_json::from_slice(&bytes).ok()?;
        Some(scored.into_iter().map(|s| s.url).collect())
    }

    /// Measures every predefined candidate and persists the survivors in
    /// ascending score order. Intended to be called once at boot and then
    /// every `test_interval` from a background task (see `spawn_rescorer`).
    pub async fn rescore(&self) {
        let mut scored = Vec::new();
        for url in &self.predefined {
            if self.auto_cfg.https_required && !url.starts_with("https://") {
                continue;
            }
            match self.measure(url).await {
                Some(score) if score <= self.auto_cfg.max_score => {
                    scored.push(ScoredMirror {
                        url: url.clone(),
                        score,
                    });
                }
                _ => {}
            }
        }
        scored.sort_by(|a, b| a.score.partial_cmp(&b.score).unwrap());

        match serde_json::to_vec(&scored) {
            Ok(bytes) => {
                if let Err(e) = self.tree.insert("ranking", bytes) {
                    log::warn!("failed to persist mirror ranking: {}", e);
                }
            }
            Err(e) => log::warn!("failed to serialize mirror ranking: {}", e),
        }
    }

    /// Round-trip latency in milliseconds for a HEAD request, used as the
    /// mirror's score (lower is better). `None` if the mirror is unreachable.
    async fn measure(&self, url: &str) -> Option<f64> {
        let start = std::time::Instant::now();
        match self.client.head(url).send().await {
            Ok(resp) if resp.status().is_success() || resp.status().is_redirection() => {
                Some(start.elapsed().as_secs_f64() * 1000.0)
            }
            _ => None,
        }
    }

    /// Spawns the periodic re-scoring task for `auto` mode. No-op under
    /// `predefined`.
    pub fn spawn_rescorer(selector: std::sync::Arc<Self>) {
        if selector.method != MirrorSelectionMethod::Auto {
            return;
        }
        let interval_secs = selector.auto_cfg.test_interval_secs.max(1);
        tokio::spawn(async move {
            selector.rescore().await;
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                selector.rescore().await;
            }
        });
    }
}
