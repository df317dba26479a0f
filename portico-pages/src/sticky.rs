//! Sticky routing: deterministic assignment of users to workers.
//!
//! A worker here is a logical shard with its own [`PageRegistry`]; the
//! same `hash(identity) mod N` rule holds whether shards live in one
//! process or several. When the indicated worker is down, the page is
//! rehydrated on a healthy worker at the next round-trip: the id is
//! reissued with the new suffix and the caller surfaces a one-time
//! "session relocated" signal to the client.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use portico_core::ServerError;

use crate::page::{OverflowPolicy, Page, PageId};
use crate::registry::PageRegistry;

/// FNV-1a: stable across processes and releases, which the affinity rule
/// requires (the std hasher guarantees neither).
fn stable_hash(identity: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in identity.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// One logical worker: a registry plus a health flag.
pub struct Shard {
    registry: Arc<PageRegistry>,
    healthy: AtomicBool,
}

impl Shard {
    pub fn registry(&self) -> &Arc<PageRegistry> {
        &self.registry
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }
}

/// Outcome of steering a user to a page.
pub struct Placement {
    pub page: Arc<Page>,
    /// True when the page had to be rehydrated on a different worker; the
    /// connection layer sends the one-time relocation signal.
    pub relocated: bool,
}

pub struct StickyRouter {
    shards: Vec<Arc<Shard>>,
}

impl StickyRouter {
    /// Build `workers` shards sharing the page configuration.
    pub fn new(
        workers: usize,
        idle_ttl: Duration,
        queue_depth: usize,
        policy: OverflowPolicy,
    ) -> StickyRouter {
        let shards = (0..workers.max(1))
            .map(|index| {
                Arc::new(Shard {
                    registry: Arc::new(PageRegistry::new(
                        index, idle_ttl, queue_depth, policy,
                    )),
                    healthy: AtomicBool::new(true),
                })
            })
            .collect();
        StickyRouter { shards }
    }

    pub fn worker_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard(&self, index: usize) -> Option<&Arc<Shard>> {
        self.shards.get(index)
    }

    /// The worker a user is steered to: `hash(identity) mod N`.
    pub fn worker_for(&self, identity: &str) -> usize {
        (stable_hash(identity) % self.shards.len() as u64) as usize
    }

    /// Mark a worker unhealthy (its pages become unreachable).
    pub fn mark_down(&self, index: usize) {
        if let Some(shard) = self.shards.get(index) {
            shard.healthy.store(false, Ordering::Release);
        }
    }

    pub fn mark_up(&self, index: usize) {
        if let Some(shard) = self.shards.get(index) {
            shard.healthy.store(true, Ordering::Release);
        }
    }

    /// The healthy shard for a user: the sticky one, or the next healthy
    /// neighbour when it is down.
    fn healthy_shard_for(&self, identity: &str) -> Result<(usize, &Arc<Shard>), ServerError> {
        let start = self.worker_for(identity);
        for offset in 0..self.shards.len() {
            let index = (start + offset) % self.shards.len();
            if self.shards[index].is_healthy() {
                return Ok((index, &self.shards[index]));
            }
        }
        Err(ServerError::NotAvailable(
            "no healthy worker available".to_string(),
        ))
    }

    /// Steer a user to a page.
    ///
    /// A presented id is validated first (malformed → protocol error).
    /// If its owner is healthy and still holds the page, the page is
    /// reused; otherwise a fresh page is minted on a healthy worker and
    /// the placement is flagged as relocated. No state is restored across
    /// relocation.
    pub fn place(
        &self,
        identity: &str,
        presented: Option<&str>,
    ) -> Result<Placement, ServerError> {
        if let Some(raw) = presented {
            let page_id = PageId::parse(raw)?;
            if let Some(shard) = self.shards.get(page_id.worker()) {
                if shard.is_healthy() {
                    if let Some(page) = shard.registry.get(page_id.as_str()) {
                        page.touch();
                        return Ok(Placement {
                            page,
                            relocated: false,
                        });
                    }
                }
            }
            // Owner down or page gone: rehydrate below.
            let (_, shard) = self.healthy_shard_for(identity)?;
            return Ok(Placement {
                page: shard.registry.open(identity),
                relocated: true,
            });
        }

        let (index, shard) = self.healthy_shard_for(identity)?;
        Ok(Placement {
            page: shard.registry.open(identity),
            relocated: index != self.worker_for(identity),
        })
    }

    /// Remove a page from whichever shard owns it.
    pub fn evict(&self, page_id: &PageId) {
        if let Some(shard) = self.shards.get(page_id.worker()) {
            shard.registry.unregister(page_id.as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router(workers: usize) -> StickyRouter {
        StickyRouter::new(
            workers,
            Duration::from_secs(60),
            16,
            OverflowPolicy::DropOldest,
        )
    }

    #[test]
    fn assignment_is_deterministic() {
        let router = router(4);
        let first = router.worker_for("user-A");
        for _ in 0..10 {
            assert_eq!(router.worker_for("user-A"), first);
        }
    }

    #[test]
    fn consecutive_placements_reuse_the_page() {
        let router = router(4);
        let first = router.place("user-A", None).unwrap();
        assert!(!first.relocated);
        let owner = first.page.id().worker();
        assert_eq!(owner, router.worker_for("user-A"));

        let again = router
            .place("user-A", Some(first.page.id().as_str()))
            .unwrap();
        assert!(!again.relocated);
        assert_eq!(again.page.id(), first.page.id());
    }

    #[test]
    fn dead_worker_relocates_with_fresh_suffix() {
        let router = router(4);
        let first = router.place("user-A", None).unwrap();
        let owner = first.page.id().worker();

        router.mark_down(owner);
        let moved = router
            .place("user-A", Some(first.page.id().as_str()))
            .unwrap();
        assert!(moved.relocated);
        assert_ne!(moved.page.id().worker(), owner);
        assert_ne!(moved.page.id(), first.page.id());
    }

    #[test]
    fn malformed_presented_id_is_protocol_error() {
        let router = router(2);
        assert!(matches!(
            router.place("user-A", Some("not-a-page-id")),
            Err(ServerError::Protocol(_))
        ));
    }

    #[test]
    fn unknown_presented_id_rehydrates() {
        let router = router(2);
        let ghost = PageId::mint(1);
        let placement = router.place("user-A", Some(ghost.as_str())).unwrap();
        assert!(placement.relocated);
    }

    #[test]
    fn all_workers_down_is_not_available() {
        let router = router(2);
        router.mark_down(0);
        router.mark_down(1);
        assert!(matches!(
            router.place("user-A", None),
            Err(ServerError::NotAvailable(_))
        ));
    }
}
