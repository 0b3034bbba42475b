//! Digest bookkeeping on both ends of a session.
//!
//! The publisher keeps the digest of every sent record until the subscriber
//! reports its own ([`DigestTable`]). The subscriber queues computed digests
//! and ships them in batches ([`PendingDigests`]); a batch moves to an
//! in-flight map in one step so the flush path and the receive path never
//! see half of it.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::warn;

use jalop_core::{CoreError, DigestPair, DigestStatus, DigestValue, Nonce};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Publisher-side digests awaiting the subscriber's report.
#[derive(Debug, Default)]
pub struct DigestTable {
    digests: Mutex<HashMap<Nonce, DigestValue>>,
}

impl DigestTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the digest of a sent record.
    ///
    /// Fails with [`CoreError::DuplicateNonce`] if a digest for `nonce` is
    /// still unacknowledged.
    pub fn add_digest(&self, nonce: Nonce, digest: DigestValue) -> Result<(), CoreError> {
        let mut digests = lock(&self.digests);
        if digests.contains_key(&nonce) {
            return Err(CoreError::DuplicateNonce(nonce.to_string()));
        }
        digests.insert(nonce, digest);
        Ok(())
    }

    pub fn fetch_and_remove_digest(&self, nonce: &str) -> Option<DigestValue> {
        lock(&self.digests).remove(nonce)
    }

    /// Reconcile one reported digest, consuming the local entry.
    pub fn reconcile(&self, nonce: Nonce, peer: DigestValue) -> DigestPair {
        let local = self.fetch_and_remove_digest(nonce.as_str());
        DigestPair::reconcile(nonce, local, peer)
    }

    pub fn len(&self) -> usize {
        lock(&self.digests).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
struct Queues {
    pending: HashMap<Nonce, DigestValue>,
    /// Sent batches, oldest first. Each digest-response answers the front.
    in_flight: VecDeque<HashMap<Nonce, DigestValue>>,
}

impl Queues {
    fn in_flight_contains(&self, nonce: &Nonce) -> bool {
        self.in_flight.iter().any(|b| b.contains_key(nonce))
    }

    fn take_in_flight(&mut self, nonce: &Nonce) -> Option<DigestValue> {
        let found = self.in_flight.iter_mut().find_map(|b| b.remove(nonce));
        self.in_flight.retain(|b| !b.is_empty());
        found
    }
}

/// Subscriber-side digest queue with a size trigger.
#[derive(Debug)]
pub struct PendingDigests {
    max: usize,
    queues: Mutex<Queues>,
    wake: Notify,
}

impl PendingDigests {
    /// `max` is the batch size that wakes the flush loop early.
    pub fn new(max: usize) -> Result<Self, CoreError> {
        if max == 0 {
            return Err(CoreError::InvalidArgument("pending digest max must be positive".into()));
        }
        Ok(Self {
            max,
            queues: Mutex::new(Queues::default()),
            wake: Notify::new(),
        })
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Queue one digest.
    ///
    /// Fails with [`CoreError::DuplicateNonce`] if the nonce is already
    /// queued or awaiting a response.
    pub fn add_digest(&self, nonce: Nonce, digest: DigestValue) -> Result<(), CoreError> {
        self.add_all_digests([(nonce, digest)])
    }

    /// Queue several digests. Either all are queued or none are.
    pub fn add_all_digests(
        &self,
        digests: impl IntoIterator<Item = (Nonce, DigestValue)>,
    ) -> Result<(), CoreError> {
        let digests: Vec<_> = digests.into_iter().collect();
        let full = {
            let mut q = lock(&self.queues);
            {
                let mut seen = HashSet::new();
                for (nonce, _) in &digests {
                    if q.pending.contains_key(nonce) || q.in_flight_contains(nonce) || !seen.insert(nonce) {
                        return Err(CoreError::DuplicateNonce(nonce.to_string()));
                    }
                }
            }
            q.pending.extend(digests);
            q.pending.len() >= self.max
        };
        if full {
            self.wake.notify_one();
        }
        Ok(())
    }

    /// Number of digests waiting to be sent.
    pub fn pending_len(&self) -> usize {
        lock(&self.queues).pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        lock(&self.queues).in_flight.iter().map(HashMap::len).sum()
    }

    /// True when nothing is queued and nothing awaits a response.
    pub fn is_idle(&self) -> bool {
        let q = lock(&self.queues);
        q.pending.is_empty() && q.in_flight.is_empty()
    }

    /// Swap the pending map for an empty one and move the batch in flight.
    pub fn take_batch(&self) -> Option<BTreeMap<Nonce, DigestValue>> {
        let mut q = lock(&self.queues);
        if q.pending.is_empty() {
            return None;
        }
        let batch = std::mem::take(&mut q.pending);
        let sent = batch.iter().map(|(n, d)| (n.clone(), d.clone())).collect();
        q.in_flight.push_back(batch);
        Some(sent)
    }

    /// Put a batch that could not be sent back in the queue.
    pub fn restore_batch(&self, batch: BTreeMap<Nonce, DigestValue>) {
        let mut q = lock(&self.queues);
        for (nonce, digest) in batch {
            q.take_in_flight(&nonce);
            q.pending.insert(nonce, digest);
        }
    }

    /// Pair the publisher's verdicts with the digests we sent.
    ///
    /// Statuses are passed through unmodified. Nonces we never sent get a
    /// pair with no local digest. The response settles the oldest batch in
    /// flight: any of its nonces the publisher left out come back as
    /// [`DigestStatus::Unknown`] so nothing waits on an answer that will
    /// not arrive.
    pub fn reconcile(&self, statuses: &BTreeMap<Nonce, DigestStatus>) -> Vec<DigestPair> {
        let mut q = lock(&self.queues);
        let mut oldest = q.in_flight.pop_front().unwrap_or_default();
        let mut pairs: Vec<DigestPair> = statuses
            .iter()
            .map(|(nonce, status)| DigestPair {
                nonce: nonce.clone(),
                local_digest: oldest.remove(nonce).or_else(|| q.take_in_flight(nonce)),
                peer_digest: None,
                status: *status,
            })
            .collect();
        let mut unanswered: Vec<_> = oldest.into_iter().collect();
        unanswered.sort_by(|a, b| a.0.cmp(&b.0));
        for (nonce, digest) in unanswered {
            warn!(nonce = %nonce, "digest response left a nonce unanswered");
            pairs.push(DigestPair {
                nonce,
                local_digest: Some(digest),
                peer_digest: None,
                status: DigestStatus::Unknown,
            });
        }
        pairs
    }

    /// Wake the flush loop now regardless of size.
    pub fn flush_now(&self) {
        self.wake.notify_one();
    }

    /// Wait for a size trigger or [`PendingDigests::flush_now`].
    pub async fn notified(&self) {
        self.wake.notified().await;
    }
}
