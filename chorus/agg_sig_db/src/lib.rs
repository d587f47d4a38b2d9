//! Storage of aggregated (group) signatures with blocking reads.
//!
//! Once an aggregated signature for `(duty, pubkey)` is stored it is
//! immutable: an equal re-store is a no-op and a conflicting store is fatal.
//! The fetcher blocks here for randao reveals, selection proofs and sync
//! message roots; the broadcaster subscribes to new entries.

use std::collections::HashMap;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use dv_types::{Duty, PubKey, SignedData};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Invoked sequentially for each newly stored entry with its own copy of the
/// data. Registration is not thread safe and must complete before duty flow
/// starts.
pub type Subscriber =
    Box<dyn Fn(Duty, PubKey, SignedData) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AggSigDbError {
    Cancelled,
    Expired,
    DataMismatch { duty: Duty, pubkey: PubKey },
    SubscriberFailed(String),
}

impl std::fmt::Display for AggSigDbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AggSigDbError::Cancelled => write!(f, "aggregate database await cancelled"),
            AggSigDbError::Expired => write!(f, "duty expired before aggregate was stored"),
            AggSigDbError::DataMismatch { duty, pubkey } => write!(
                f,
                "conflicting aggregate stored for duty {duty} validator {pubkey}"
            ),
            AggSigDbError::SubscriberFailed(err) => {
                write!(f, "aggregate subscriber failed: {err}")
            }
        }
    }
}

impl std::error::Error for AggSigDbError {}

type Key = (Duty, PubKey);
type WaiterId = u64;

#[derive(Default)]
struct Inner {
    next_waiter_id: WaiterId,
    values: HashMap<Key, SignedData>,
    waiters: Vec<(WaiterId, Key, oneshot::Sender<SignedData>)>,
}

pub struct AggSigDb {
    inner: Mutex<Inner>,
    subscribers: Vec<Subscriber>,
    shutdown: CancellationToken,
}

impl AggSigDb {
    pub fn new(shutdown: CancellationToken) -> Self {
        AggSigDb {
            inner: Mutex::new(Inner::default()),
            subscribers: Vec::new(),
            shutdown,
        }
    }

    /// Registers a callback for newly stored aggregates. Must be called
    /// before the first store.
    pub fn subscribe(&mut self, subscriber: Subscriber) {
        self.subscribers.push(subscriber);
    }

    /// Stores an aggregated signature. Equal re-stores are no-ops and do not
    /// re-notify subscribers; unequal stores are fatal.
    pub async fn store(
        &self,
        duty: Duty,
        pubkey: PubKey,
        data: SignedData,
    ) -> Result<(), AggSigDbError> {
        {
            let mut inner = self.inner.lock();
            if let Some(existing) = inner.values.get(&(duty, pubkey)) {
                if *existing != data {
                    error!(%duty, %pubkey, "Conflicting aggregate signature stored");
                    return Err(AggSigDbError::DataMismatch { duty, pubkey });
                }
                return Ok(());
            }

            // Notify under the same lock as the insert so late waiters
            // always see the value.
            let mut kept = Vec::with_capacity(inner.waiters.len());
            for (id, key, tx) in inner.waiters.drain(..) {
                if key == (duty, pubkey) {
                    let _ = tx.send(data.clone());
                } else {
                    kept.push((id, key, tx));
                }
            }
            inner.waiters = kept;
            inner.values.insert((duty, pubkey), data.clone());
        }

        debug!(%duty, %pubkey, kind = data.kind_label(), "Stored aggregate signature");

        for subscriber in &self.subscribers {
            subscriber(duty, pubkey, data.clone()).await.map_err(|err| {
                error!(%duty, %pubkey, %err, "Aggregate subscriber failed");
                AggSigDbError::SubscriberFailed(err.to_string())
            })?;
        }

        Ok(())
    }

    /// Blocks until an aggregate for `(duty, pubkey)` is stored.
    pub async fn await_signed(
        &self,
        duty: Duty,
        pubkey: PubKey,
    ) -> Result<SignedData, AggSigDbError> {
        let (id, rx) = {
            let mut inner = self.inner.lock();
            if let Some(data) = inner.values.get(&(duty, pubkey)) {
                return Ok(data.clone());
            }
            inner.next_waiter_id += 1;
            let id = inner.next_waiter_id;
            let (tx, rx) = oneshot::channel();
            inner.waiters.push((id, (duty, pubkey), tx));
            (id, rx)
        };

        tokio::select! {
            result = rx => result.map_err(|_| AggSigDbError::Expired),
            _ = self.shutdown.cancelled() => {
                self.inner.lock().waiters.retain(|(waiter_id, _, _)| *waiter_id != id);
                Err(AggSigDbError::Cancelled)
            }
        }
    }

    /// Drops all state for duties with slots before `before_slot`.
    pub fn prune(&self, before_slot: u64) {
        let mut inner = self.inner.lock();
        inner.values.retain(|(duty, _), _| duty.slot >= before_slot);
        inner
            .waiters
            .retain(|(_, (duty, _), _)| duty.slot >= before_slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dv_types::eth::{SignedEpoch, SignedVoluntaryExit, VoluntaryExit};
    use dv_types::Signature;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn randao(epoch: u64) -> SignedData {
        SignedData::Randao(SignedEpoch {
            epoch,
            signature: Signature([epoch as u8; 96]),
        })
    }

    fn pubkey() -> PubKey {
        PubKey([1; 48])
    }

    #[tokio::test]
    async fn store_then_await_and_idempotence() {
        let db = AggSigDb::new(CancellationToken::new());
        let duty = Duty::randao(8);
        db.store(duty, pubkey(), randao(0)).await.unwrap();
        db.store(duty, pubkey(), randao(0)).await.unwrap();

        assert_eq!(db.await_signed(duty, pubkey()).await.unwrap(), randao(0));

        let err = db.store(duty, pubkey(), randao(1)).await.unwrap_err();
        assert!(matches!(err, AggSigDbError::DataMismatch { .. }));

        // The stored value is never superseded.
        assert_eq!(db.await_signed(duty, pubkey()).await.unwrap(), randao(0));
    }

    #[tokio::test]
    async fn await_blocks_until_store() {
        let db = Arc::new(AggSigDb::new(CancellationToken::new()));
        let duty = Duty::randao(8);
        let reader = db.clone();
        let handle = tokio::spawn(async move { reader.await_signed(duty, pubkey()).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        db.store(duty, pubkey(), randao(0)).await.unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), randao(0));
    }

    #[tokio::test]
    async fn subscribers_fire_once_per_new_entry() {
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();

        let mut db = AggSigDb::new(CancellationToken::new());
        db.subscribe(Box::new(move |_, _, _| {
            let counted = counted.clone();
            Box::pin(async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }));

        let duty = Duty::voluntary_exit(4);
        let exit = SignedData::VoluntaryExit(SignedVoluntaryExit {
            message: VoluntaryExit {
                epoch: 0,
                validator_index: 3,
            },
            signature: Signature::default(),
        });
        db.store(duty, pubkey(), exit.clone()).await.unwrap();
        db.store(duty, pubkey(), exit).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_and_prune() {
        let shutdown = CancellationToken::new();
        let db = Arc::new(AggSigDb::new(shutdown.clone()));
        let duty = Duty::randao(8);

        let reader = db.clone();
        let cancelled = tokio::spawn(async move { reader.await_signed(duty, pubkey()).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
        assert_eq!(cancelled.await.unwrap(), Err(AggSigDbError::Cancelled));

        let db = Arc::new(AggSigDb::new(CancellationToken::new()));
        db.store(duty, pubkey(), randao(0)).await.unwrap();
        db.prune(9);
        let reader = db.clone();
        let waiting = tokio::spawn(async move { reader.await_signed(duty, pubkey()).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        db.prune(9);
        assert_eq!(waiting.await.unwrap(), Err(AggSigDbError::Expired));
    }
}
