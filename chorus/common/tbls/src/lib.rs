//! Threshold BLS12-381 operations (min_pk variant).
//!
//! A validator key is Shamir-split into N shares with reconstruction
//! threshold T. Each operator signs with its share; any T distinct share
//! signatures over the same message recover the group signature via Lagrange
//! interpolation at zero. The recovered signature is indistinguishable from
//! one produced by the unsplit key.

use std::collections::BTreeMap;
use std::fmt;
use std::mem;

use blst::min_pk::{PublicKey as BlstPubKey, SecretKey as BlstSecKey, Signature as BlstSig};
use blst::{
    blst_bendian_from_scalar, blst_fr, blst_fr_add, blst_fr_eucl_inverse, blst_fr_from_scalar,
    blst_fr_from_uint64, blst_fr_mul, blst_fr_sub, blst_p2, blst_p2_add_or_double,
    blst_p2_affine, blst_p2_compress, blst_p2_from_affine, blst_p2_mult, blst_p2_uncompress,
    blst_scalar, blst_scalar_from_fr, BLST_ERROR,
};
use rand::RngCore;

/// Domain separation tag for beacon-chain signatures.
pub const DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_POP_";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TblsError {
    InvalidSecretKey,
    InvalidPublicKey,
    InvalidSignature,
    ZeroShareIndex,
    InsufficientShares { got: usize, need: usize },
    InvalidShareCount,
    AggregationFailed,
}

impl fmt::Display for TblsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TblsError::InvalidSecretKey => write!(f, "invalid secret key"),
            TblsError::InvalidPublicKey => write!(f, "invalid public key"),
            TblsError::InvalidSignature => write!(f, "invalid signature"),
            TblsError::ZeroShareIndex => write!(f, "share indices are 1-indexed"),
            TblsError::InsufficientShares { got, need } => {
                write!(f, "insufficient shares: got {got}, need {need}")
            }
            TblsError::InvalidShareCount => write!(f, "threshold exceeds share count"),
            TblsError::AggregationFailed => write!(f, "signature aggregation failed"),
        }
    }
}

impl std::error::Error for TblsError {}

/// A BLS secret key or key share.
#[derive(Clone)]
pub struct SecretKey(BlstSecKey);

impl SecretKey {
    pub fn generate<R: RngCore>(rng: &mut R) -> Self {
        let mut ikm = [0u8; 32];
        rng.fill_bytes(&mut ikm);
        SecretKey(BlstSecKey::key_gen(&ikm, &[]).expect("ikm is 32 bytes"))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TblsError> {
        BlstSecKey::from_bytes(bytes)
            .map(SecretKey)
            .map_err(|_| TblsError::InvalidSecretKey)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.sk_to_pk())
    }

    /// Signs a 32-byte signing root.
    pub fn sign(&self, root: &[u8]) -> Signature {
        Signature(self.0.sign(root, DST, &[]))
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey([REDACTED])")
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey(BlstPubKey);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TblsError> {
        BlstPubKey::from_bytes(bytes)
            .map(PublicKey)
            .map_err(|_| TblsError::InvalidPublicKey)
    }

    pub fn to_bytes(&self) -> [u8; 48] {
        self.0.to_bytes()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey(0x{})", hex::encode(&self.to_bytes()[..4]))
    }
}

#[derive(Clone)]
pub struct Signature(BlstSig);

impl Signature {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TblsError> {
        BlstSig::from_bytes(bytes)
            .map(Signature)
            .map_err(|_| TblsError::InvalidSignature)
    }

    pub fn to_bytes(&self) -> [u8; 96] {
        self.0.to_bytes()
    }
}

impl PartialEq for Signature {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for Signature {}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature(0x{})", hex::encode(&self.to_bytes()[..4]))
    }
}

/// Verifies a signature over a signing root.
pub fn verify(pubkey: &PublicKey, root: &[u8], signature: &Signature) -> bool {
    signature.0.verify(true, root, DST, &[], &pubkey.0, true) == BLST_ERROR::BLST_SUCCESS
}

/// Shamir-splits `secret` into `n` shares with reconstruction threshold
/// `threshold`. The returned vector is ordered by share index; share `i`
/// (1-indexed) is at position `i - 1`.
pub fn split<R: RngCore>(
    secret: &SecretKey,
    n: u64,
    threshold: u64,
    rng: &mut R,
) -> Result<Vec<SecretKey>, TblsError> {
    if threshold == 0 || threshold > n {
        return Err(TblsError::InvalidShareCount);
    }

    // Polynomial coefficients in fr: a0 is the secret, the rest are random.
    let mut coefficients = vec![fr_from_secret(secret)];
    for _ in 1..threshold {
        coefficients.push(fr_from_secret(&SecretKey::generate(rng)));
    }

    let mut shares = Vec::with_capacity(n as usize);
    for idx in 1..=n {
        let x = fr_from_u64(idx);
        // Horner evaluation, highest coefficient first.
        let mut acc = *coefficients.last().expect("threshold >= 1");
        for coefficient in coefficients.iter().rev().skip(1) {
            acc = fr_mul(&acc, &x);
            acc = fr_add(&acc, coefficient);
        }
        shares.push(secret_from_fr(&acc)?);
    }

    Ok(shares)
}

/// Recovers the group signature from at least `threshold` share signatures
/// over the same message, keyed by 1-indexed share index.
///
/// The caller is responsible for having verified each partial against its
/// share public key and for ensuring all partials sign the same root; this
/// function only performs the curve arithmetic.
pub fn threshold_aggregate(partials: &BTreeMap<u64, Signature>) -> Result<Signature, TblsError> {
    if partials.is_empty() {
        return Err(TblsError::InsufficientShares { got: 0, need: 1 });
    }
    if partials.contains_key(&0) {
        return Err(TblsError::ZeroShareIndex);
    }

    let indices: Vec<u64> = partials.keys().copied().collect();
    let coefficients = lagrange_at_zero(&indices);

    let mut acc: Option<blst_p2> = None;
    for (signature, coefficient) in partials.values().zip(coefficients.iter()) {
        let point = p2_from_signature(signature)?;
        let term = p2_mult(&point, coefficient);
        acc = Some(match acc {
            None => term,
            Some(current) => p2_add(&current, &term),
        });
    }

    let combined = acc.ok_or(TblsError::AggregationFailed)?;
    signature_from_p2(&combined)
}

// fr / p2 helpers over the raw blst bindings. All zero-initialization is of
// plain C structs.

fn fr_zeroed() -> blst_fr {
    unsafe { mem::zeroed() }
}

fn fr_from_u64(value: u64) -> blst_fr {
    let limbs = [value, 0, 0, 0];
    let mut out = fr_zeroed();
    unsafe { blst_fr_from_uint64(&mut out, limbs.as_ptr()) };
    out
}

fn fr_from_secret(secret: &SecretKey) -> blst_fr {
    let bytes = secret.to_bytes();
    let mut scalar: blst_scalar = unsafe { mem::zeroed() };
    let mut out = fr_zeroed();
    unsafe {
        blst::blst_scalar_from_bendian(&mut scalar, bytes.as_ptr());
        blst_fr_from_scalar(&mut out, &scalar);
    }
    out
}

fn secret_from_fr(fr: &blst_fr) -> Result<SecretKey, TblsError> {
    let mut scalar: blst_scalar = unsafe { mem::zeroed() };
    let mut bytes = [0u8; 32];
    unsafe {
        blst_scalar_from_fr(&mut scalar, fr);
        blst_bendian_from_scalar(bytes.as_mut_ptr(), &scalar);
    }
    SecretKey::from_bytes(&bytes)
}

fn fr_add(a: &blst_fr, b: &blst_fr) -> blst_fr {
    let mut out = fr_zeroed();
    unsafe { blst_fr_add(&mut out, a, b) };
    out
}

fn fr_sub(a: &blst_fr, b: &blst_fr) -> blst_fr {
    let mut out = fr_zeroed();
    unsafe { blst_fr_sub(&mut out, a, b) };
    out
}

fn fr_mul(a: &blst_fr, b: &blst_fr) -> blst_fr {
    let mut out = fr_zeroed();
    unsafe { blst_fr_mul(&mut out, a, b) };
    out
}

fn fr_inverse(a: &blst_fr) -> blst_fr {
    let mut out = fr_zeroed();
    unsafe { blst_fr_eucl_inverse(&mut out, a) };
    out
}

/// Lagrange basis values evaluated at zero for the given x-coordinates:
/// `l_i(0) = prod_{j != i} x_j / (x_j - x_i)`.
fn lagrange_at_zero(indices: &[u64]) -> Vec<blst_scalar> {
    indices
        .iter()
        .map(|&i| {
            let x_i = fr_from_u64(i);
            let mut numerator = fr_from_u64(1);
            let mut denominator = fr_from_u64(1);
            for &j in indices.iter().filter(|&&j| j != i) {
                let x_j = fr_from_u64(j);
                numerator = fr_mul(&numerator, &x_j);
                denominator = fr_mul(&denominator, &fr_sub(&x_j, &x_i));
            }
            let coefficient = fr_mul(&numerator, &fr_inverse(&denominator));
            let mut scalar: blst_scalar = unsafe { mem::zeroed() };
            unsafe { blst_scalar_from_fr(&mut scalar, &coefficient) };
            scalar
        })
        .collect()
}

fn p2_from_signature(signature: &Signature) -> Result<blst_p2, TblsError> {
    let bytes = signature.to_bytes();
    let mut affine: blst_p2_affine = unsafe { mem::zeroed() };
    let err = unsafe { blst_p2_uncompress(&mut affine, bytes.as_ptr()) };
    if err != BLST_ERROR::BLST_SUCCESS {
        return Err(TblsError::InvalidSignature);
    }
    let mut point: blst_p2 = unsafe { mem::zeroed() };
    unsafe { blst_p2_from_affine(&mut point, &affine) };
    Ok(point)
}

fn p2_mult(point: &blst_p2, scalar: &blst_scalar) -> blst_p2 {
    let mut out: blst_p2 = unsafe { mem::zeroed() };
    unsafe { blst_p2_mult(&mut out, point, scalar.b.as_ptr(), 255) };
    out
}

fn p2_add(a: &blst_p2, b: &blst_p2) -> blst_p2 {
    let mut out: blst_p2 = unsafe { mem::zeroed() };
    unsafe { blst_p2_add_or_double(&mut out, a, b) };
    out
}

fn signature_from_p2(point: &blst_p2) -> Result<Signature, TblsError> {
    let mut bytes = [0u8; 96];
    unsafe { blst_p2_compress(bytes.as_mut_ptr(), point) };
    Signature::from_bytes(&bytes).map_err(|_| TblsError::AggregationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(0x5eed)
    }

    #[test]
    fn sign_and_verify() {
        let secret = SecretKey::generate(&mut rng());
        let root = [7u8; 32];
        let signature = secret.sign(&root);
        assert!(verify(&secret.public_key(), &root, &signature));
        assert!(!verify(&secret.public_key(), &[8u8; 32], &signature));
    }

    #[test]
    fn recovered_signature_equals_group_signature() {
        let mut rng = rng();
        let secret = SecretKey::generate(&mut rng);
        let shares = split(&secret, 4, 3, &mut rng).unwrap();
        let root = [3u8; 32];

        let expected = secret.sign(&root);

        // Any 3 of the 4 shares recover the exact group signature.
        for skip in 0..4u64 {
            let partials: BTreeMap<u64, Signature> = shares
                .iter()
                .enumerate()
                .map(|(i, share)| (i as u64 + 1, share.sign(&root)))
                .filter(|(idx, _)| *idx != skip + 1)
                .collect();
            let recovered = threshold_aggregate(&partials).unwrap();
            assert_eq!(recovered, expected);
            assert!(verify(&secret.public_key(), &root, &recovered));
        }
    }

    #[test]
    fn below_threshold_does_not_recover() {
        let mut rng = rng();
        let secret = SecretKey::generate(&mut rng);
        let shares = split(&secret, 4, 3, &mut rng).unwrap();
        let root = [9u8; 32];

        let partials: BTreeMap<u64, Signature> = shares
            .iter()
            .take(2)
            .enumerate()
            .map(|(i, share)| (i as u64 + 1, share.sign(&root)))
            .collect();

        // The arithmetic succeeds but yields a signature that does not verify
        // under the group key.
        let recovered = threshold_aggregate(&partials).unwrap();
        assert!(!verify(&secret.public_key(), &root, &recovered));
    }

    #[test]
    fn share_signatures_verify_under_share_pubkeys() {
        let mut rng = rng();
        let secret = SecretKey::generate(&mut rng);
        let shares = split(&secret, 4, 3, &mut rng).unwrap();
        let root = [1u8; 32];

        for share in &shares {
            let signature = share.sign(&root);
            assert!(verify(&share.public_key(), &root, &signature));
            assert!(!verify(&secret.public_key(), &root, &signature));
        }
    }

    #[test]
    fn rejects_zero_share_index() {
        let secret = SecretKey::generate(&mut rng());
        let mut partials = BTreeMap::new();
        partials.insert(0u64, secret.sign(&[0u8; 32]));
        assert_eq!(
            threshold_aggregate(&partials),
            Err(TblsError::ZeroShareIndex)
        );
    }

    #[test]
    fn rejects_bad_split_parameters() {
        let secret = SecretKey::generate(&mut rng());
        assert!(split(&secret, 3, 4, &mut rng()).is_err());
        assert!(split(&secret, 3, 0, &mut rng()).is_err());
    }

    #[test]
    fn key_bytes_round_trip() {
        let secret = SecretKey::generate(&mut rng());
        let back = SecretKey::from_bytes(&secret.to_bytes()).unwrap();
        assert_eq!(secret.to_bytes(), back.to_bytes());
        let pubkey = PublicKey::from_bytes(&secret.public_key().to_bytes()).unwrap();
        assert_eq!(pubkey, secret.public_key());
    }
}
