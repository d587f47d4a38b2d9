//! Threshold aggregation of partial signatures.
//!
//! Given at least `threshold` partials over the same payload for one
//! `(duty, pubkey)`: verify each against its share's public key, recover the
//! group signature via Lagrange interpolation, verify it against the group
//! public key, and hand the fully signed payload to the subscribers.
//! Partials over different payloads are refused and the duty dropped.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, error};

use dv_types::signing::{signing_root_for, ForkInfo};
use dv_types::{Duty, ParSignedData, PubKey, SignedData};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Invoked sequentially per aggregated signature with its own copy.
pub type SignedSubscriber =
    Box<dyn Fn(Duty, PubKey, SignedData) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SigAggError {
    /// The partials disagree on the signing payload; combining them would be
    /// slashable.
    ConflictingSignatures { duty: Duty, pubkey: PubKey },
    InsufficientPartials { got: usize, need: usize },
    UnknownPubkey(PubKey),
    UnknownShare { pubkey: PubKey, share_idx: u64 },
    InvalidPartialSignature { share_idx: u64 },
    InvalidAggregateSignature,
    Crypto(String),
    SubscriberFailed(String),
}

impl std::fmt::Display for SigAggError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SigAggError::ConflictingSignatures { duty, pubkey } => write!(
                f,
                "refusing to combine partial signatures over conflicting payloads for {duty} {pubkey}"
            ),
            SigAggError::InsufficientPartials { got, need } => {
                write!(f, "insufficient partial signatures: got {got}, need {need}")
            }
            SigAggError::UnknownPubkey(pubkey) => write!(f, "unknown group pubkey {pubkey}"),
            SigAggError::UnknownShare { pubkey, share_idx } => {
                write!(f, "unknown share index {share_idx} for {pubkey}")
            }
            SigAggError::InvalidPartialSignature { share_idx } => {
                write!(f, "partial signature of share {share_idx} failed verification")
            }
            SigAggError::InvalidAggregateSignature => {
                write!(f, "aggregated signature failed group verification")
            }
            SigAggError::Crypto(err) => write!(f, "threshold aggregation failed: {err}"),
            SigAggError::SubscriberFailed(err) => write!(f, "aggregate subscriber failed: {err}"),
        }
    }
}

impl std::error::Error for SigAggError {}

/// The cluster's public-key material: every group key with its public shares
/// by 1-indexed share index.
#[derive(Clone, Debug, Default)]
pub struct ClusterPubkeys {
    pub shares_by_key: HashMap<PubKey, BTreeMap<u64, PubKey>>,
}

impl ClusterPubkeys {
    pub fn pubshare(&self, pubkey: &PubKey, share_idx: u64) -> Option<&PubKey> {
        self.shares_by_key.get(pubkey)?.get(&share_idx)
    }
}

pub struct SigAgg {
    threshold: usize,
    keys: Arc<ClusterPubkeys>,
    fork_info: ForkInfo,
    subscribers: Vec<SignedSubscriber>,
}

impl SigAgg {
    pub fn new(threshold: usize, keys: Arc<ClusterPubkeys>, fork_info: ForkInfo) -> Self {
        SigAgg {
            threshold,
            keys,
            fork_info,
            subscribers: Vec::new(),
        }
    }

    /// Registers a subscriber for aggregated signatures. Must be called
    /// before duty flow starts.
    pub fn subscribe(&mut self, subscriber: SignedSubscriber) {
        self.subscribers.push(subscriber);
    }

    /// Aggregates one `(duty, pubkey)` partial set and notifies subscribers.
    pub async fn aggregate(
        &self,
        duty: Duty,
        pubkey: PubKey,
        partials: Vec<ParSignedData>,
    ) -> Result<(), SigAggError> {
        if partials.len() < self.threshold {
            return Err(SigAggError::InsufficientPartials {
                got: partials.len(),
                need: self.threshold,
            });
        }

        // All partials must sign the same payload.
        let payload_root = partials[0].data.message_root();
        if partials
            .iter()
            .any(|partial| partial.data.message_root() != payload_root)
        {
            error!(%duty, %pubkey, "Conflicting payloads in partial signature set");
            return Err(SigAggError::ConflictingSignatures { duty, pubkey });
        }

        let signing_root = signing_root_for(&partials[0].data, &self.fork_info);

        // Verify each partial against its share's public key.
        let mut by_index = BTreeMap::new();
        for partial in &partials {
            let pubshare = self
                .keys
                .pubshare(&pubkey, partial.share_idx)
                .ok_or(SigAggError::UnknownShare {
                    pubkey,
                    share_idx: partial.share_idx,
                })?;
            let share_key = tbls::PublicKey::from_bytes(pubshare.as_bytes())
                .map_err(|e| SigAggError::Crypto(e.to_string()))?;
            let signature = tbls::Signature::from_bytes(partial.signature().as_bytes())
                .map_err(|e| SigAggError::Crypto(e.to_string()))?;
            if !tbls::verify(&share_key, signing_root.as_slice(), &signature) {
                return Err(SigAggError::InvalidPartialSignature {
                    share_idx: partial.share_idx,
                });
            }
            by_index.insert(partial.share_idx, signature);
        }

        // Recover and verify the group signature.
        let aggregate = tbls::threshold_aggregate(&by_index)
            .map_err(|e| SigAggError::Crypto(e.to_string()))?;

        let group_key = tbls::PublicKey::from_bytes(pubkey.as_bytes())
            .map_err(|_| SigAggError::UnknownPubkey(pubkey))?;
        if !tbls::verify(&group_key, signing_root.as_slice(), &aggregate) {
            return Err(SigAggError::InvalidAggregateSignature);
        }

        let aggregate_sig = dv_types::Signature(aggregate.to_bytes());
        let signed = partials[0].data.with_signature(aggregate_sig);

        debug!(%duty, %pubkey, kind = signed.kind_label(), "Aggregated group signature");

        for subscriber in &self.subscribers {
            subscriber(duty, pubkey, signed.clone())
                .await
                .map_err(|err| SigAggError::SubscriberFailed(err.to_string()))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dv_types::eth::{SignedVoluntaryExit, VoluntaryExit};
    use dv_types::signing::ForkInfo;
    use dv_types::{Root, Signature};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Mutex;

    struct Cluster {
        secret: tbls::SecretKey,
        shares: Vec<tbls::SecretKey>,
        group: PubKey,
        keys: Arc<ClusterPubkeys>,
        fork_info: ForkInfo,
    }

    fn cluster(n: u64, threshold: u64) -> Cluster {
        let mut rng = StdRng::seed_from_u64(7);
        let secret = tbls::SecretKey::generate(&mut rng);
        let shares = tbls::split(&secret, n, threshold, &mut rng).unwrap();
        let group = PubKey(secret.public_key().to_bytes());

        let mut by_idx = BTreeMap::new();
        for (i, share) in shares.iter().enumerate() {
            by_idx.insert(i as u64 + 1, PubKey(share.public_key().to_bytes()));
        }
        let mut shares_by_key = HashMap::new();
        shares_by_key.insert(group, by_idx);

        Cluster {
            secret,
            shares,
            group,
            keys: Arc::new(ClusterPubkeys { shares_by_key }),
            fork_info: ForkInfo::single([0, 0, 0, 0], Root::repeat_byte(0x42)),
        }
    }

    fn exit_data(epoch: u64) -> SignedData {
        SignedData::VoluntaryExit(SignedVoluntaryExit {
            message: VoluntaryExit {
                epoch,
                validator_index: 3,
            },
            signature: Signature::default(),
        })
    }

    fn partial(cluster: &Cluster, data: &SignedData, share_idx: u64) -> ParSignedData {
        let root = signing_root_for(data, &cluster.fork_info);
        let signature = cluster.shares[share_idx as usize - 1].sign(root.as_slice());
        ParSignedData::new(
            data.with_signature(Signature(signature.to_bytes())),
            share_idx,
        )
    }

    #[tokio::test]
    async fn aggregates_to_group_signature() {
        let cluster = cluster(4, 3);
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();

        let mut agg = SigAgg::new(3, cluster.keys.clone(), cluster.fork_info.clone());
        agg.subscribe(Box::new(move |duty, pubkey, signed| {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock().unwrap().push((duty, pubkey, signed));
                Ok(())
            })
        }));

        let data = exit_data(1);
        let duty = Duty::voluntary_exit(32);
        let partials = vec![
            partial(&cluster, &data, 1),
            partial(&cluster, &data, 2),
            partial(&cluster, &data, 4),
        ];

        agg.aggregate(duty, cluster.group, partials).await.unwrap();

        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        let (_, _, signed) = &results[0];

        // The recovered signature is exactly the unsplit key's signature.
        let root = signing_root_for(&data, &cluster.fork_info);
        let expected = cluster.secret.sign(root.as_slice());
        assert_eq!(signed.signature().as_bytes(), &expected.to_bytes());
    }

    #[tokio::test]
    async fn refuses_conflicting_payloads() {
        let cluster = cluster(4, 3);
        let agg = SigAgg::new(3, cluster.keys.clone(), cluster.fork_info.clone());

        let duty = Duty::voluntary_exit(32);
        let partials = vec![
            partial(&cluster, &exit_data(1), 1),
            partial(&cluster, &exit_data(1), 2),
            partial(&cluster, &exit_data(2), 3),
        ];

        let err = agg
            .aggregate(duty, cluster.group, partials)
            .await
            .unwrap_err();
        assert!(matches!(err, SigAggError::ConflictingSignatures { .. }));
    }

    #[tokio::test]
    async fn rejects_invalid_partial() {
        let cluster = cluster(4, 3);
        let agg = SigAgg::new(3, cluster.keys.clone(), cluster.fork_info.clone());

        let data = exit_data(1);
        let duty = Duty::voluntary_exit(32);
        let mut partials = vec![
            partial(&cluster, &data, 1),
            partial(&cluster, &data, 2),
        ];
        // Share 3 signs with share 4's key: valid curve point, wrong key.
        let root = signing_root_for(&data, &cluster.fork_info);
        let wrong = cluster.shares[3].sign(root.as_slice());
        partials.push(ParSignedData::new(
            data.with_signature(Signature(wrong.to_bytes())),
            3,
        ));

        let err = agg
            .aggregate(duty, cluster.group, partials)
            .await
            .unwrap_err();
        assert_eq!(err, SigAggError::InvalidPartialSignature { share_idx: 3 });
    }

    #[tokio::test]
    async fn requires_threshold() {
        let cluster = cluster(4, 3);
        let agg = SigAgg::new(3, cluster.keys.clone(), cluster.fork_info.clone());
        let data = exit_data(1);
        let err = agg
            .aggregate(
                Duty::voluntary_exit(32),
                cluster.group,
                vec![partial(&cluster, &data, 1), partial(&cluster, &data, 2)],
            )
            .await
            .unwrap_err();
        assert_eq!(err, SigAggError::InsufficientPartials { got: 2, need: 3 });
    }
}
