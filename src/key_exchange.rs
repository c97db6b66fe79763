//! Finite-field Diffie-Hellman key agreement
//!
//! Each connection negotiates its own AES-128 session key:
//!
//! ```text
//! Sender                                   Receiver
//!   (p, g) <- generate_parameters()
//!   (a, A) <- generate_key_pair(p, g)
//!   |-- p, g, A ------------------------------>|
//!   |                                          | (b, B) <- generate_key_pair(p, g)
//!   |<----------------------------------- B ---|
//!   s = B^a mod p                              s = A^b mod p
//!   key = first 16 bytes of s                  key = first 16 bytes of s
//! ```
//!
//! Parameters follow the DSA-style construction: a 160-bit prime `q`, a
//! 1024-bit prime `p` with `q | p - 1`, and a generator `g` of the order-`q`
//! subgroup. Private exponents are drawn from the full 1024-bit range and
//! are not reduced mod `p`.
//!
//! Public values are exchanged unauthenticated; an active attacker who can
//! substitute `A` and `B` can sit in the middle of the session.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use num_bigint::{BigUint, RandBigInt};
use num_traits::One;
use rand::rngs::OsRng;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::cipher::KEY_LEN;
use crate::error::{CryptoError, ProtocolError, TransferError};
use crate::protocol::{calculate_hash, TextFramer};
use crate::session::{SessionProgress, SessionState};

/// Bit length of the generated prime modulus
pub const MODULUS_BITS: usize = 1024;

/// Bit length of the prime subgroup order
pub const SUBGROUP_BITS: usize = 160;

/// Bit length of private exponents
pub const PRIVATE_KEY_BITS: u64 = 1024;

/// Smallest modulus a receiver will accept
pub const MIN_MODULUS_BITS: u64 = 1024;

/// RFC 2409 Oakley Group 2, 1024-bit MODP prime
const OAKLEY_GROUP_2_PRIME: &str = "\
    FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
    29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
    EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
    E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
    EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381\
    FFFFFFFFFFFFFFFF";

/// Public domain parameters, sent in clear
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhParameters {
    p: BigUint,
    g: BigUint,
}

impl DhParameters {
    pub fn new(p: BigUint, g: BigUint) -> Self {
        Self { p, g }
    }

    /// The well-known 1024-bit group from RFC 2409 with `g = 2`
    pub fn oakley_group_2() -> Self {
        let p = BigUint::parse_bytes(OAKLEY_GROUP_2_PRIME.as_bytes(), 16)
            .expect("RFC 2409 prime is valid hex");
        Self {
            p,
            g: BigUint::from(2u32),
        }
    }

    pub fn p(&self) -> &BigUint {
        &self.p
    }

    pub fn g(&self) -> &BigUint {
        &self.g
    }

    /// Reject values that leak the secret or pin it to a trivial subgroup
    fn check_element(&self, value: &BigUint, field: &'static str) -> Result<(), ProtocolError> {
        let upper = &self.p - 1u32;
        if *value <= BigUint::one() || *value >= upper {
            return Err(ProtocolError::InvalidPublicValue { field });
        }
        Ok(())
    }
}

/// One side's DH key pair
pub struct KeyPair {
    private: BigUint,
    public: BigUint,
}

impl KeyPair {
    pub fn public(&self) -> &BigUint {
        &self.public
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("private", &"<redacted>")
            .field("public", &self.public)
            .finish()
    }
}

/// `g^(ab) mod p`; only lives long enough to derive the session key
#[derive(PartialEq, Eq)]
pub struct SharedSecret(BigUint);

impl SharedSecret {
    pub fn from_biguint(value: BigUint) -> Self {
        Self(value)
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

/// Raw AES-128 key material
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Short SHA-256 fingerprint, safe to log
    pub fn fingerprint(&self) -> String {
        calculate_hash(&self.0)[..16].to_string()
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey({})", self.fingerprint())
    }
}

/// Generate fresh 1024-bit parameters. CPU-bound; run it off the async
/// executor.
pub fn generate_parameters() -> Result<DhParameters, CryptoError> {
    generate_parameters_with_bits(MODULUS_BITS, SUBGROUP_BITS)
}

pub fn generate_parameters_with_bits(
    modulus_bits: usize,
    subgroup_bits: usize,
) -> Result<DhParameters, CryptoError> {
    if subgroup_bits < 2 || subgroup_bits + 2 > modulus_bits {
        return Err(CryptoError::ParameterGeneration(format!(
            "subgroup of {} bits does not fit a {}-bit modulus",
            subgroup_bits, modulus_bits
        )));
    }

    let q = glass_pumpkin::prime::new(subgroup_bits)
        .map_err(|e| CryptoError::ParameterGeneration(format!("{:?}", e)))?;
    let two_q: BigUint = &q << 1usize;
    let top_bit = BigUint::one() << (modulus_bits - 1);

    // Search p = k * 2q + 1 with the top bit set
    let p = loop {
        let x = OsRng.gen_biguint(modulus_bits as u64) | &top_bit;
        let candidate = &x - (&x % &two_q) + 1u32;
        if candidate.bits() != modulus_bits as u64 {
            continue;
        }
        if glass_pumpkin::prime::check(&candidate) {
            break candidate;
        }
    };

    let exponent = (&p - 1u32) / &q;
    let mut h = BigUint::from(2u32);
    let g = loop {
        let g = h.modpow(&exponent, &p);
        if !g.is_one() {
            break g;
        }
        h += 1u32;
    };

    Ok(DhParameters { p, g })
}

/// Draw a private exponent and compute `g^private mod p`
pub fn generate_key_pair(params: &DhParameters) -> KeyPair {
    let private = OsRng.gen_biguint(PRIVATE_KEY_BITS);
    let public = params.g.modpow(&private, &params.p);
    KeyPair { private, public }
}

/// `other_public^private mod p`
pub fn compute_shared_secret(
    other_public: &BigUint,
    key_pair: &KeyPair,
    p: &BigUint,
) -> SharedSecret {
    SharedSecret(other_public.modpow(&key_pair.private, p))
}

/// First 16 bytes of the secret's big-endian magnitude
pub fn derive_session_key(secret: &SharedSecret) -> Result<SessionKey, CryptoError> {
    let bytes = secret.0.to_bytes_be();
    let head = bytes
        .get(..KEY_LEN)
        .ok_or(CryptoError::InsufficientKeyMaterial { len: bytes.len() })?;

    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(head);
    Ok(SessionKey(key))
}

/// Where a sender session gets its domain parameters from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParameterMode {
    /// Generate fresh parameters for every connection
    #[default]
    PerConnection,
    /// Generate this many parameter sets at startup and hand them out
    /// round-robin. Cuts session startup latency at the cost of
    /// parameter diversity.
    Pool(usize),
}

#[derive(Debug)]
pub struct ParameterSource {
    pool: Vec<DhParameters>,
    cursor: AtomicUsize,
}

impl ParameterSource {
    pub fn per_connection() -> Self {
        Self::from_pool(Vec::new())
    }

    /// Hand out the given sets round-robin. An empty pool means fresh
    /// parameters per connection.
    pub fn from_pool(pool: Vec<DhParameters>) -> Self {
        Self {
            pool,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Always hand out the same set
    pub fn fixed(params: DhParameters) -> Self {
        Self::from_pool(vec![params])
    }

    pub async fn from_mode(mode: ParameterMode) -> Result<Self, CryptoError> {
        match mode {
            ParameterMode::PerConnection => Ok(Self::per_connection()),
            ParameterMode::Pool(0) => Ok(Self::per_connection()),
            ParameterMode::Pool(size) => {
                info!("Generating {} DH parameter set(s)...", size);
                Self::pregenerate(size, MODULUS_BITS, SUBGROUP_BITS).await
            }
        }
    }

    /// Generate `size` parameter sets in parallel on the blocking pool
    pub async fn pregenerate(
        size: usize,
        modulus_bits: usize,
        subgroup_bits: usize,
    ) -> Result<Self, CryptoError> {
        let tasks: Vec<_> = (0..size)
            .map(|_| {
                tokio::task::spawn_blocking(move || {
                    generate_parameters_with_bits(modulus_bits, subgroup_bits)
                })
            })
            .collect();

        let mut pool = Vec::with_capacity(size);
        for task in tasks {
            let params = task
                .await
                .map_err(|e| CryptoError::ParameterGeneration(e.to_string()))??;
            pool.push(params);
        }
        Ok(Self::from_pool(pool))
    }

    pub fn is_per_connection(&self) -> bool {
        self.pool.is_empty()
    }

    pub async fn next(&self) -> Result<DhParameters, CryptoError> {
        if self.pool.is_empty() {
            return tokio::task::spawn_blocking(generate_parameters)
                .await
                .map_err(|e| CryptoError::ParameterGeneration(e.to_string()))?;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        Ok(self.pool[index].clone())
    }
}

async fn read_number<R>(reader: &mut R, field: &'static str) -> Result<BigUint, TransferError>
where
    R: AsyncRead + Unpin,
{
    let text = TextFramer::read_text(reader).await?;
    text.parse::<BigUint>()
        .map_err(|_| ProtocolError::InvalidNumber { field }.into())
}

/// Sender half of the handshake. Leaves the session in `KeyDerived`.
pub async fn sender_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    source: &ParameterSource,
    progress: &mut SessionProgress,
) -> Result<SessionKey, TransferError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let params = source.next().await?;
    let key_pair = generate_key_pair(&params);
    progress.advance(SessionState::ParametersReady)?;

    TextFramer::write_text(writer, &params.p.to_string()).await?;
    TextFramer::write_text(writer, &params.g.to_string()).await?;
    TextFramer::write_text(writer, &key_pair.public.to_string()).await?;
    writer.flush().await?;

    let peer_public = read_number(reader, "B").await?;
    params.check_element(&peer_public, "B")?;
    progress.advance(SessionState::PublicKeysExchanged)?;

    let secret = compute_shared_secret(&peer_public, &key_pair, &params.p);
    let key = derive_session_key(&secret)?;
    progress.advance(SessionState::KeyDerived)?;

    debug!("[{} {}] session key {}", progress.role(), progress.peer(), key.fingerprint());
    Ok(key)
}

/// Receiver half of the handshake. Leaves the session in `KeyDerived`.
pub async fn receiver_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    progress: &mut SessionProgress,
) -> Result<SessionKey, TransferError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let p = read_number(reader, "p").await?;
    let g = read_number(reader, "g").await?;
    let peer_public = read_number(reader, "A").await?;

    if p.bits() < MIN_MODULUS_BITS {
        return Err(ProtocolError::WeakModulus {
            bits: p.bits(),
            min: MIN_MODULUS_BITS,
        }
        .into());
    }
    let params = DhParameters::new(p, g);
    params.check_element(&params.g, "g")?;
    params.check_element(&peer_public, "A")?;
    progress.advance(SessionState::ParametersReady)?;

    let key_pair = generate_key_pair(&params);
    TextFramer::write_text(writer, &key_pair.public.to_string()).await?;
    writer.flush().await?;
    progress.advance(SessionState::PublicKeysExchanged)?;

    let secret = compute_shared_secret(&peer_public, &key_pair, &params.p);
    let key = derive_session_key(&secret)?;
    progress.advance(SessionState::KeyDerived)?;

    debug!("[{} {}] session key {}", progress.role(), progress.peer(), key.fingerprint());
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Role;
    use std::net::SocketAddr;
    use tokio::io::{duplex, split};

    fn peer() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[test]
    fn test_oakley_group_is_1024_bits() {
        let params = DhParameters::oakley_group_2();
        assert_eq!(params.p().bits(), 1024);
        assert_eq!(params.g(), &BigUint::from(2u32));
    }

    #[test]
    fn test_shared_secret_agrees() {
        let params = DhParameters::oakley_group_2();
        for _ in 0..4 {
            let alice = generate_key_pair(&params);
            let bob = generate_key_pair(&params);
            let s1 = compute_shared_secret(bob.public(), &alice, params.p());
            let s2 = compute_shared_secret(alice.public(), &bob, params.p());
            assert_eq!(s1, s2);
            assert_eq!(
                derive_session_key(&s1).unwrap(),
                derive_session_key(&s2).unwrap()
            );
        }
    }

    #[test]
    fn test_private_key_uses_full_width() {
        let params = DhParameters::oakley_group_2();
        let full_width = (0..64)
            .map(|_| generate_key_pair(&params))
            .any(|kp| kp.private.bits() == PRIVATE_KEY_BITS);
        assert!(full_width);
    }

    #[test]
    fn test_generated_parameters_are_consistent() {
        // Small sizes keep the prime search quick
        let params = generate_parameters_with_bits(256, 64).unwrap();
        assert_eq!(params.p().bits(), 256);
        assert!(glass_pumpkin::prime::check(params.p()));
        assert!(!params.g().is_one());

        let alice = generate_key_pair(&params);
        let bob = generate_key_pair(&params);
        assert_eq!(
            compute_shared_secret(bob.public(), &alice, params.p()),
            compute_shared_secret(alice.public(), &bob, params.p())
        );
    }

    #[test]
    fn test_bad_subgroup_size_rejected() {
        assert!(generate_parameters_with_bits(64, 64).is_err());
    }

    #[test]
    fn test_derive_session_key_is_prefix() {
        let bytes: Vec<u8> = (1..=40).collect();
        let secret = SharedSecret::from_biguint(BigUint::from_bytes_be(&bytes));
        let key = derive_session_key(&secret).unwrap();
        assert_eq!(&key.as_bytes()[..], &bytes[..16]);
        // Deterministic
        assert_eq!(key, derive_session_key(&secret).unwrap());
    }

    #[test]
    fn test_derive_session_key_skips_sign_byte() {
        let mut bytes = vec![0x80u8];
        bytes.extend(1..=20u8);
        let secret = SharedSecret::from_biguint(BigUint::from_bytes_be(&bytes));
        let key = derive_session_key(&secret).unwrap();
        assert_eq!(key.as_bytes()[0], 0x80);
    }

    #[test]
    fn test_short_secret_is_insufficient() {
        let secret = SharedSecret::from_biguint(BigUint::from(0xFFFF_FFFFu32));
        assert!(matches!(
            derive_session_key(&secret),
            Err(CryptoError::InsufficientKeyMaterial { len: 4 })
        ));
    }

    #[test]
    fn test_debug_output_redacts_secrets() {
        let params = DhParameters::oakley_group_2();
        let kp = generate_key_pair(&params);
        assert!(format!("{:?}", kp).contains("<redacted>"));
        let secret = compute_shared_secret(kp.public(), &kp, params.p());
        assert_eq!(format!("{:?}", secret), "SharedSecret(<redacted>)");
    }

    #[tokio::test]
    async fn test_fixed_source_repeats() {
        let source = ParameterSource::fixed(DhParameters::oakley_group_2());
        assert!(!source.is_per_connection());
        assert_eq!(source.next().await.unwrap(), DhParameters::oakley_group_2());
        assert_eq!(source.next().await.unwrap(), DhParameters::oakley_group_2());
    }

    #[tokio::test]
    async fn test_pool_rotates() {
        let a = DhParameters::oakley_group_2();
        let b = DhParameters::new(a.p().clone(), BigUint::from(5u32));
        let source = ParameterSource::from_pool(vec![a.clone(), b.clone()]);
        assert_eq!(source.next().await.unwrap(), a);
        assert_eq!(source.next().await.unwrap(), b);
        assert_eq!(source.next().await.unwrap(), a);
    }

    #[tokio::test]
    async fn test_pregenerated_pool_rotates_through_every_set() {
        let source = ParameterSource::pregenerate(3, 256, 64).await.unwrap();
        assert!(!source.is_per_connection());

        let mut first = Vec::new();
        for _ in 0..3 {
            first.push(source.next().await.unwrap());
        }
        for params in &first {
            assert_eq!(params.p().bits(), 256);
            assert!(glass_pumpkin::prime::check(params.p()));
        }
        // Round-robin wraps back to the first set
        assert_eq!(source.next().await.unwrap(), first[0]);
    }

    #[tokio::test]
    async fn test_pregenerate_propagates_generation_failure() {
        assert!(ParameterSource::pregenerate(2, 64, 64).await.is_err());
    }

    #[tokio::test]
    async fn test_empty_pool_mode_generates_per_connection() {
        let source = ParameterSource::from_mode(ParameterMode::Pool(0)).await.unwrap();
        assert!(source.is_per_connection());
        let source = ParameterSource::from_mode(ParameterMode::PerConnection).await.unwrap();
        assert!(source.is_per_connection());
    }

    #[tokio::test]
    async fn test_halves_agree_over_stream() {
        let (sender_io, receiver_io) = duplex(16 * 1024);
        let (mut sr, mut sw) = split(sender_io);
        let (mut rr, mut rw) = split(receiver_io);
        let source = ParameterSource::fixed(DhParameters::oakley_group_2());

        let sender = async {
            let mut progress = SessionProgress::new(Role::Sender, peer());
            let key = sender_half(&mut sr, &mut sw, &source, &mut progress).await;
            (key, progress.state())
        };
        let receiver = async {
            let mut progress = SessionProgress::new(Role::Receiver, peer());
            let key = receiver_half(&mut rr, &mut rw, &mut progress).await;
            (key, progress.state())
        };

        let ((sk, s_state), (rk, r_state)) = tokio::join!(sender, receiver);
        assert_eq!(sk.unwrap(), rk.unwrap());
        assert_eq!(s_state, SessionState::KeyDerived);
        assert_eq!(r_state, SessionState::KeyDerived);
    }

    #[tokio::test]
    async fn test_receiver_rejects_small_modulus() {
        let (mut a, b) = duplex(4096);
        let (mut rr, mut rw) = split(b);
        for value in ["23", "5", "8"] {
            TextFramer::write_text(&mut a, value).await.unwrap();
        }
        let mut progress = SessionProgress::new(Role::Receiver, peer());
        let err = receiver_half(&mut rr, &mut rw, &mut progress).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::Protocol(ProtocolError::WeakModulus { bits: 5, .. })
        ));
    }

    #[tokio::test]
    async fn test_receiver_rejects_trivial_public_value() {
        let params = DhParameters::oakley_group_2();
        let (mut a, b) = duplex(4096);
        let (mut rr, mut rw) = split(b);
        TextFramer::write_text(&mut a, &params.p().to_string()).await.unwrap();
        TextFramer::write_text(&mut a, "2").await.unwrap();
        TextFramer::write_text(&mut a, "1").await.unwrap();
        let mut progress = SessionProgress::new(Role::Receiver, peer());
        let err = receiver_half(&mut rr, &mut rw, &mut progress).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::Protocol(ProtocolError::InvalidPublicValue { field: "A" })
        ));
    }

    #[tokio::test]
    async fn test_receiver_rejects_garbage_number() {
        let (mut a, b) = duplex(4096);
        let (mut rr, mut rw) = split(b);
        TextFramer::write_text(&mut a, "not-a-number").await.unwrap();
        let mut progress = SessionProgress::new(Role::Receiver, peer());
        let err = receiver_half(&mut rr, &mut rw, &mut progress).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::Protocol(ProtocolError::InvalidNumber { field: "p" })
        ));
    }
}
