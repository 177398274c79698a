//! Weighted upstream registry
//!
//! Entries are kept in insertion order with a running cumulative threshold.
//! A message goes to the first entry whose half-open range
//! `[previous threshold, threshold)` contains a value drawn uniformly from
//! `[0, total weight)`, so each entry is picked with probability
//! `weight / total weight`.
//!
//! The lock only covers insertion and the pick itself. It is released before
//! the chosen forwarder runs, so deliveries never wait on each other.

use std::fmt;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Forward, ForwardContext, Forwarder};
use crate::envelope::Envelope;
use crate::error::{ProxyError, Result};

/// Source of randomness for selection and entry uids
pub trait RandomSource: Send + Sync {
    /// Uniform value in `[0, bound)`; `bound` is never zero
    fn below(&self, bound: u64) -> u64;

    fn next_u32(&self) -> u32;
}

/// Operating system CSPRNG
#[derive(Debug, Clone, Copy, Default)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn below(&self, bound: u64) -> u64 {
        OsRng.gen_range(0..bound)
    }

    fn next_u32(&self) -> u32 {
        OsRng.next_u32()
    }
}

struct Entry<F> {
    weight: NonZeroU32,
    threshold: u64,
    uid: String,
    forwarder: Arc<F>,
}

struct Inner<F> {
    entries: Vec<Entry<F>>,
    total_weight: u64,
}

pub struct Registry<F = Forwarder> {
    inner: Mutex<Inner<F>>,
    random: Box<dyn RandomSource>,
}

impl<F> Default for Registry<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F> Registry<F> {
    /// Empty registry drawing from the OS CSPRNG
    pub fn new() -> Self {
        Self::with_random_source(OsRandom)
    }

    pub fn with_random_source(random: impl RandomSource + 'static) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: Vec::new(),
                total_weight: 0,
            }),
            random: Box::new(random),
        }
    }

    // The guarded data is only ever appended to, so a poisoned lock still
    // holds consistent entries.
    fn lock(&self) -> MutexGuard<'_, Inner<F>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a forwarder. Returns the uid assigned to the new entry.
    pub fn add_forwarder(&self, forwarder: F, weight: NonZeroU32) -> String {
        let uid = format!("uid:{:04x}", self.random.next_u32());

        let mut inner = self.lock();
        let threshold = inner.total_weight + u64::from(weight.get());
        inner.entries.push(Entry {
            weight,
            threshold,
            uid: uid.clone(),
            forwarder: Arc::new(forwarder),
        });
        inner.total_weight = threshold;

        debug!(uid = %uid, weight = weight.get(), threshold, "forwarder added");
        uid
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of all entry weights
    pub fn total_weight(&self) -> u64 {
        self.lock().total_weight
    }

    /// Choose one entry; returns its uid and forwarder
    pub(crate) fn pick(&self) -> Result<(String, Arc<F>)> {
        let inner = self.lock();
        if inner.total_weight == 0 {
            return Err(ProxyError::EmptyRegistry);
        }

        let chance = self.random.below(inner.total_weight);
        let mut acc = 0;
        for entry in &inner.entries {
            if acc <= chance && chance < entry.threshold {
                return Ok((entry.uid.clone(), Arc::clone(&entry.forwarder)));
            }
            acc = entry.threshold;
        }

        unreachable!(
            "selection value {} outside total weight {}",
            chance, inner.total_weight
        )
    }
}

impl<F: Forward> Registry<F> {
    /// Deliver one message through a randomly selected forwarder.
    ///
    /// The result of that single attempt is returned as-is; nothing is
    /// retried or sent elsewhere.
    pub async fn forward(&self, cancellation: &CancellationToken, envelope: &Envelope) -> Result<()> {
        let (uid, forwarder) = self.pick()?;
        let ctx = ForwardContext::new(uid, cancellation.clone());

        debug!(uid = %ctx.uid(), "forwarding message");
        if let Err(e) = forwarder.forward(&ctx, envelope).await {
            warn!(uid = %ctx.uid(), error = %e, "failed to forward message");
            return Err(e.into());
        }
        Ok(())
    }
}

impl<F> fmt::Debug for Registry<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Registry")
            .field(
                "entries",
                &inner
                    .entries
                    .iter()
                    .map(|e| (e.uid.as_str(), e.weight.get()))
                    .collect::<Vec<_>>(),
            )
            .field("total_weight", &inner.total_weight)
            .finish()
    }
}
