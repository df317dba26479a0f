//! Per-worker page registry.
//!
//! Owns pages exclusively: a page leaves the registry either eagerly on
//! disconnect or through the idle sweeper, and its outbound queue is
//! closed on the way out. Map mutations sit behind a single lock; no
//! suspension point ever holds it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::page::{OverflowPolicy, Page, PageId};

struct Index {
    by_id: HashMap<String, Arc<Page>>,
    by_user: HashMap<String, HashSet<String>>,
}

pub struct PageRegistry {
    worker: usize,
    index: Mutex<Index>,
    idle_ttl: Duration,
    queue_depth: usize,
    policy: OverflowPolicy,
}

impl PageRegistry {
    pub fn new(
        worker: usize,
        idle_ttl: Duration,
        queue_depth: usize,
        policy: OverflowPolicy,
    ) -> PageRegistry {
        PageRegistry {
            worker,
            index: Mutex::new(Index {
                by_id: HashMap::new(),
                by_user: HashMap::new(),
            }),
            idle_ttl,
            queue_depth,
            policy,
        }
    }

    /// Index of the worker this registry belongs to.
    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Mint and register a new page for a user.
    pub fn open(&self, user_id: &str) -> Arc<Page> {
        let page = Arc::new(Page::new(
            PageId::mint(self.worker),
            user_id,
            self.queue_depth,
            self.policy,
        ));
        self.register(page.clone());
        page
    }

    pub fn register(&self, page: Arc<Page>) {
        let mut index = self.index.lock().unwrap();
        index
            .by_user
            .entry(page.user_id().to_string())
            .or_default()
            .insert(page.id().as_str().to_string());
        index.by_id.insert(page.id().as_str().to_string(), page);
    }

    /// Remove a page, closing its outbound queue. Idempotent.
    pub fn unregister(&self, page_id: &str) -> Option<Arc<Page>> {
        let page = {
            let mut index = self.index.lock().unwrap();
            let page = index.by_id.remove(page_id)?;
            if let Some(ids) = index.by_user.get_mut(page.user_id()) {
                ids.remove(page_id);
                if ids.is_empty() {
                    index.by_user.remove(page.user_id());
                }
            }
            page
        };
        page.close();
        Some(page)
    }

    pub fn get(&self, page_id: &str) -> Option<Arc<Page>> {
        self.index.lock().unwrap().by_id.get(page_id).cloned()
    }

    /// Every live page of a user.
    pub fn pages_of(&self, user_id: &str) -> Vec<Arc<Page>> {
        let index = self.index.lock().unwrap();
        index
            .by_user
            .get(user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| index.by_id.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Refresh a page's last-activity stamp.
    pub fn touch(&self, page_id: &str) {
        if let Some(page) = self.get(page_id) {
            page.touch();
        }
    }

    pub fn len(&self) -> usize {
        self.index.lock().unwrap().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.lock().unwrap().by_id.is_empty()
    }

    /// Remove pages idle past the TTL; returns how many were evicted.
    pub fn sweep(&self) -> usize {
        let idle: Vec<String> = {
            let index = self.index.lock().unwrap();
            index
                .by_id
                .values()
                .filter(|page| page.idle_for() > self.idle_ttl)
                .map(|page| page.id().as_str().to_string())
                .collect()
        };
        let evicted = idle.len();
        for page_id in idle {
            tracing::debug!(%page_id, "evicting idle page");
            self.unregister(&page_id);
        }
        evicted
    }

    /// Periodic sweeper task; stops when the token is cancelled.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.sweep();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(ttl: Duration) -> Arc<PageRegistry> {
        Arc::new(PageRegistry::new(0, ttl, 16, OverflowPolicy::DropOldest))
    }

    #[test]
    fn register_get_pages_of_unregister() {
        let registry = registry(Duration::from_secs(60));
        let a = registry.open("user-A");
        let b = registry.open("user-A");
        let c = registry.open("user-B");

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.pages_of("user-A").len(), 2);
        assert!(registry.get(a.id().as_str()).is_some());

        registry.unregister(a.id().as_str());
        assert_eq!(registry.pages_of("user-A").len(), 1);
        // Closing is part of removal.
        assert_eq!(
            a.enqueue(crate::protocol::RpcMessage::Pong { id: "x".into() }, true),
            crate::page::Enqueued::Closed
        );

        registry.unregister(b.id().as_str());
        registry.unregister(c.id().as_str());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn sweep_evicts_only_idle_pages() {
        let registry = registry(Duration::from_millis(30));
        let stale = registry.open("user-A");
        let fresh = registry.open("user-B");

        tokio::time::sleep(Duration::from_millis(50)).await;
        fresh.touch();
        assert_eq!(registry.sweep(), 1);
        assert!(registry.get(stale.id().as_str()).is_none());
        assert!(registry.get(fresh.id().as_str()).is_some());
    }

    #[tokio::test]
    async fn sweeper_task_runs_until_cancelled() {
        let registry = registry(Duration::from_millis(10));
        let cancel = CancellationToken::new();
        let handle = registry.spawn_sweeper(Duration::from_millis(20), cancel.clone());

        registry.open("user-A");
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(registry.is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }
}
