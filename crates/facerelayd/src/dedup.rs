//! Bounded dedup gate for inbound request ids.
//!
//! Remembers ids claimed by this process for at most `ttl` and at most
//! `capacity` entries. A claim is in flight until it is settled or released.
//! Capacity pressure evicts the oldest settled claim and never one still in
//! flight, so the set may briefly hold more than `capacity` ids when that
//! many requests are being processed at once. Memory is lost on restart;
//! after that, or after eviction, a redelivery is processed again.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

struct Claim {
    seq: u64,
    at: Instant,
    settled: bool,
}

#[derive(Default)]
struct Inner {
    live: HashMap<String, Claim>,
    /// Claims in arrival order; entries whose sequence no longer matches `live` are stale.
    order: VecDeque<(u64, String)>,
    next_seq: u64,
}

impl Inner {
    fn expire(&mut self, now: Instant, ttl: Option<Duration>) {
        while let Some((seq, id)) = self.order.front() {
            let Some(claim) = self.live.get(id) else {
                self.order.pop_front();
                continue;
            };
            let at = claim.at;
            if claim.seq != *seq {
                self.order.pop_front();
                continue;
            }
            match ttl {
                Some(ttl) if now.saturating_duration_since(at) >= ttl => {
                    let id = id.clone();
                    self.live.remove(&id);
                    self.order.pop_front();
                }
                _ => break,
            }
        }
    }

    /// Drop the oldest settled claim. `false` when every live claim is in flight.
    fn evict_oldest_settled(&mut self) -> bool {
        let live = &self.live;
        let Some(pos) = self
            .order
            .iter()
            .position(|(seq, id)| live.get(id).is_some_and(|c| c.seq == *seq && c.settled))
        else {
            return false;
        };
        if let Some((_, id)) = self.order.remove(pos) {
            self.live.remove(&id);
        }
        true
    }

    fn compact(&mut self) {
        let live = &self.live;
        self.order
            .retain(|(seq, id)| live.get(id).is_some_and(|c| c.seq == *seq));
    }
}

/// Thread-safe set of request ids already taken by this stage instance.
pub struct SeenSet {
    inner: Mutex<Inner>,
    capacity: usize,
    ttl: Option<Duration>,
}

impl SeenSet {
    /// `ttl = None` keeps ids until capacity forces them out.
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Atomically insert `id` if absent. `false` means it was already claimed.
    pub fn claim(&self, id: &str) -> bool {
        self.claim_at(id, Instant::now())
    }

    fn claim_at(&self, id: &str, now: Instant) -> bool {
        let mut inner = self.lock();
        inner.expire(now, self.ttl);
        if inner.live.contains_key(id) {
            return false;
        }
        while inner.live.len() >= self.capacity {
            if !inner.evict_oldest_settled() {
                break;
            }
        }
        if inner.order.len() > self.capacity.saturating_mul(2) {
            inner.compact();
        }

        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.live.insert(
            id.to_string(),
            Claim {
                seq,
                at: now,
                settled: false,
            },
        );
        inner.order.push_back((seq, id.to_string()));
        true
    }

    /// Mark the claim on `id` as finished. Only settled claims can be
    /// evicted to make room.
    pub fn settle(&self, id: &str) {
        if let Some(claim) = self.lock().live.get_mut(id) {
            claim.settled = true;
        }
    }

    /// Forget a claim so a redelivery of `id` is processed.
    pub fn release(&self, id: &str) -> bool {
        self.lock().live.remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        let mut inner = self.lock();
        inner.expire(Instant::now(), self.ttl);
        inner.live.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_second_claim_rejected() {
        let seen = SeenSet::new(10, None);
        assert!(seen.claim("r1"));
        assert!(!seen.claim("r1"));
        assert!(seen.claim("r2"));
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_release_allows_reclaim() {
        let seen = SeenSet::new(10, None);
        assert!(seen.claim("r1"));
        assert!(seen.release("r1"));
        assert!(!seen.release("r1"));
        assert!(seen.claim("r1"));
        assert!(seen.contains("r1"));
    }

    fn claim_settled(seen: &SeenSet, id: &str, now: Instant) -> bool {
        let claimed = seen.claim_at(id, now);
        seen.settle(id);
        claimed
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let seen = SeenSet::new(2, None);
        let t0 = Instant::now();
        assert!(claim_settled(&seen, "a", t0));
        assert!(claim_settled(&seen, "b", t0));
        assert!(claim_settled(&seen, "c", t0));
        assert_eq!(seen.len(), 2);
        assert!(!seen.contains("a"));
        assert!(seen.contains("b") && seen.contains("c"));
    }

    #[test]
    fn test_released_entry_does_not_shield_newer_claim_from_eviction_order() {
        let seen = SeenSet::new(2, None);
        let t0 = Instant::now();
        assert!(claim_settled(&seen, "a", t0));
        assert!(claim_settled(&seen, "b", t0));
        seen.release("a");
        assert!(claim_settled(&seen, "a", t0)); // now newest
        assert!(claim_settled(&seen, "c", t0)); // evicts b, the oldest live claim
        assert!(!seen.contains("b"));
        assert!(seen.contains("a") && seen.contains("c"));
    }

    #[test]
    fn test_in_flight_claims_survive_capacity_pressure() {
        let seen = SeenSet::new(2, None);
        let t0 = Instant::now();
        assert!(seen.claim_at("slow", t0));
        assert!(claim_settled(&seen, "done", t0));
        assert!(seen.claim_at("next", t0)); // evicts "done", not "slow"
        assert!(!seen.contains("done"));
        assert!(!seen.claim_at("slow", t0));

        // Nothing settled: grow past capacity rather than drop a claim.
        assert!(seen.claim_at("burst", t0));
        assert_eq!(seen.len(), 3);
        assert!(seen.contains("slow") && seen.contains("next") && seen.contains("burst"));

        seen.settle("slow");
        assert!(seen.claim_at("later", t0));
        assert!(!seen.contains("slow"));
        assert!(!seen.claim_at("next", t0));
    }

    #[test]
    fn test_ttl_expiry() {
        let seen = SeenSet::new(10, Some(Duration::from_secs(60)));
        let t0 = Instant::now();
        assert!(seen.claim_at("r1", t0));
        assert!(!seen.claim_at("r1", t0 + Duration::from_secs(59)));
        assert!(seen.claim_at("r1", t0 + Duration::from_secs(60)));
    }

    #[test]
    fn test_concurrent_claims_single_winner() {
        let seen = Arc::new(SeenSet::new(1000, None));
        let winners: usize = (0..8)
            .map(|_| {
                let seen = Arc::clone(&seen);
                std::thread::spawn(move || seen.claim("same-id") as usize)
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .sum();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_order_queue_stays_bounded_under_churn() {
        let seen = SeenSet::new(4, None);
        for i in 0..100 {
            let id = format!("r{i}");
            assert!(seen.claim(&id));
            seen.release(&id);
        }
        assert!(seen.is_empty());
        assert!(seen.lock().order.len() <= 2 * 4 + 1);
    }
}
