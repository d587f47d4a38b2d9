//! Cluster-wide exchange of partial-signature sets.
//!
//! Frames are bincode-encoded `(duty, set)` pairs published through a
//! [`Transport`] seam. The authenticated peer-to-peer channel between
//! operators is the transport's concern; honest-peer broadcasts are delivered
//! to all honest peers within bounded time and duplicate delivery is
//! deduplicated downstream by the partial-signature store. [`MemoryBus`]
//! implements the seam in-process for multi-node tests.

use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use dv_types::{Duty, ParSignedDataSet};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Publishes an opaque frame to every other operator in the cluster.
pub trait Transport: Send + Sync {
    fn publish(&self, frame: Vec<u8>) -> BoxFuture<'_, Result<(), BoxError>>;
}

/// Invoked for each received peer set.
pub type ExchangeSubscriber =
    Box<dyn Fn(Duty, ParSignedDataSet) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

#[derive(Serialize, Deserialize)]
struct Frame {
    duty: Duty,
    set: ParSignedDataSet,
}

pub struct ParSigEx {
    transport: Arc<dyn Transport>,
}

impl ParSigEx {
    /// Builds the exchange and spawns its receive loop over `inbound`. All
    /// subscribers must be passed at construction; the receive loop starts
    /// immediately.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        subscribers: Vec<ExchangeSubscriber>,
        mut inbound: mpsc::UnboundedReceiver<Vec<u8>>,
        shutdown: CancellationToken,
    ) -> Self {
        let receive_subs = subscribers;

        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    frame = inbound.recv() => frame,
                    _ = shutdown.cancelled() => return,
                };
                let Some(frame) = frame else { return };

                let decoded: Frame = match bincode::deserialize(&frame) {
                    Ok(decoded) => decoded,
                    Err(err) => {
                        warn!(%err, "Dropping undecodable peer frame");
                        continue;
                    }
                };

                debug!(duty = %decoded.duty, "Received peer partial signatures");
                for subscriber in receive_subs.iter() {
                    if let Err(err) = subscriber(decoded.duty, decoded.set.clone()).await {
                        warn!(duty = %decoded.duty, %err, "Peer set subscriber failed");
                    }
                }
            }
        });

        ParSigEx { transport }
    }

    /// Broadcasts a locally produced partial-signature set to all peers.
    pub async fn broadcast(&self, duty: Duty, set: ParSignedDataSet) -> Result<(), BoxError> {
        let frame = bincode::serialize(&Frame { duty, set })?;
        self.transport.publish(frame).await
    }
}

/// In-process broadcast fabric connecting the operators of a simulated
/// cluster. Frames published by one node are delivered to every other node.
#[derive(Default)]
pub struct MemoryBus {
    peers: Mutex<Vec<(usize, mpsc::UnboundedSender<Vec<u8>>)>>,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryBus::default())
    }

    /// Registers a node, returning its transport handle and inbound frames.
    pub fn register(self: &Arc<Self>) -> (Arc<dyn Transport>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut peers = self.peers.lock();
        let id = peers.len();
        peers.push((id, tx));
        (
            Arc::new(MemoryTransport {
                bus: Arc::clone(self),
                id,
            }),
            rx,
        )
    }
}

struct MemoryTransport {
    bus: Arc<MemoryBus>,
    id: usize,
}

impl Transport for MemoryTransport {
    fn publish(&self, frame: Vec<u8>) -> BoxFuture<'_, Result<(), BoxError>> {
        Box::pin(async move {
            for (peer_id, tx) in self.bus.peers.lock().iter() {
                if *peer_id != self.id {
                    let _ = tx.send(frame.clone());
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dv_types::eth::{SignedVoluntaryExit, VoluntaryExit};
    use dv_types::{ParSignedData, PubKey, Signature, SignedData};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn set(share_idx: u64) -> ParSignedDataSet {
        let mut set = BTreeMap::new();
        set.insert(
            PubKey([1; 48]),
            ParSignedData::new(
                SignedData::VoluntaryExit(SignedVoluntaryExit {
                    message: VoluntaryExit {
                        epoch: 1,
                        validator_index: 2,
                    },
                    signature: Signature([share_idx as u8; 96]),
                }),
                share_idx,
            ),
        );
        set
    }

    #[tokio::test]
    async fn frames_reach_all_other_peers() {
        let bus = MemoryBus::new();
        let shutdown = CancellationToken::new();

        let received: Arc<Mutex<Vec<(usize, Duty, ParSignedDataSet)>>> =
            Arc::new(Mutex::new(Vec::new()));

        let mut exchanges = Vec::new();
        for node in 0..3usize {
            let (transport, inbound) = bus.register();
            let sink = received.clone();
            let subscriber: ExchangeSubscriber = Box::new(move |duty, set| {
                let sink = sink.clone();
                Box::pin(async move {
                    sink.lock().push((node, duty, set));
                    Ok(())
                })
            });
            exchanges.push(ParSigEx::spawn(
                transport,
                vec![subscriber],
                inbound,
                shutdown.clone(),
            ));
        }

        let duty = Duty::voluntary_exit(5);
        exchanges[0].broadcast(duty, set(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let received = received.lock();
        // Nodes 1 and 2 receive, node 0 does not hear its own broadcast.
        assert_eq!(received.len(), 2);
        assert!(received.iter().all(|(node, d, s)| {
            *node != 0 && *d == duty && *s == set(1)
        }));
    }

    #[tokio::test]
    async fn undecodable_frames_are_dropped() {
        let bus = MemoryBus::new();
        let shutdown = CancellationToken::new();

        let (transport_a, _inbound_a) = bus.register();
        let (_transport_b, inbound_b) = bus.register();

        let received = Arc::new(Mutex::new(0usize));
        let sink = received.clone();
        let subscriber: ExchangeSubscriber = Box::new(move |_, _| {
            let sink = sink.clone();
            Box::pin(async move {
                *sink.lock() += 1;
                Ok(())
            })
        });
        let _exchange = ParSigEx::spawn(
            Arc::clone(&transport_a),
            Vec::new(),
            mpsc::unbounded_channel().1,
            shutdown.clone(),
        );
        let _receiver = ParSigEx::spawn(transport_a, vec![subscriber], inbound_b, shutdown);

        // Publish garbage directly through the bus.
        let (transport_raw, _) = bus.register();
        transport_raw.publish(b"not a frame".to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*received.lock(), 0);
    }
}
