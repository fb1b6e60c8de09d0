//! Message Stream Encryption (MSE/PE) Implementation
//!
//! This module implements BitTorrent protocol encryption as defined in the
//! de facto MSE specification. It provides:
//! - Diffie-Hellman key exchange with 768-bit prime
//! - RC4 stream cipher for message encryption (with 1024 byte discard)
//! - Initiator and responder sides of the obfuscated handshake
//! - `PeerStream`, a transparent plaintext/RC4 stream wrapper
//!
//! Neither side knows where the other's random padding ends, so each one
//! finds its synchronisation marker with a bounded streaming search
//! (`read_until`).

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Instant;

use bytes::{Buf, BytesMut};
use num_bigint::BigUint;
use rand::Rng;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::time::timeout;

use super::metainfo::Sha1Hash;
use super::peer::PROTOCOL_HEADER;
use crate::config::{EncryptionConfig, EncryptionPolicy};
use crate::error::HandshakeError;

// ============================================================================
// Constants
// ============================================================================

/// The 768-bit prime P used for Diffie-Hellman key exchange (96 bytes)
/// This is the same prime used by most BitTorrent clients
pub const DH_PRIME: [u8; 96] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xC9, 0x0F, 0xDA, 0xA2, 0x21, 0x68, 0xC2, 0x34,
    0xC4, 0xC6, 0x62, 0x8B, 0x80, 0xDC, 0x1C, 0xD1, 0x29, 0x02, 0x4E, 0x08, 0x8A, 0x67, 0xCC, 0x74,
    0x02, 0x0B, 0xBE, 0xA6, 0x3B, 0x13, 0x9B, 0x22, 0x51, 0x4A, 0x08, 0x79, 0x8E, 0x34, 0x04, 0xDD,
    0xEF, 0x95, 0x19, 0xB3, 0xCD, 0x3A, 0x43, 0x1B, 0x30, 0x2B, 0x0A, 0x6D, 0xF2, 0x5F, 0x14, 0x37,
    0x4F, 0xE1, 0x35, 0x6D, 0x6D, 0x51, 0xC2, 0x45, 0xE4, 0x85, 0xB5, 0x76, 0x62, 0x5E, 0x7E, 0xC6,
    0xF4, 0x4C, 0x42, 0xE9, 0xA6, 0x37, 0xED, 0x6B, 0x0B, 0xFF, 0x5C, 0xB6, 0xF4, 0x06, 0xB7, 0xED,
];

/// Generator G = 2
pub const DH_GENERATOR: u64 = 2;

/// Size of a DH public value on the wire
pub const DH_KEY_SIZE: usize = 96;

/// Verification constant: 8 zero bytes
pub const VC: [u8; 8] = [0u8; 8];

/// Maximum padding length
pub const MAX_PADDING: usize = 512;

/// RC4 discard count (first 1024 bytes discarded)
pub const RC4_DISCARD: usize = 1024;

/// Encryption method: plaintext
pub const CRYPTO_PLAINTEXT: u32 = 0x01;

/// Encryption method: RC4
pub const CRYPTO_RC4: u32 = 0x02;

// ============================================================================
// Crypto method negotiation
// ============================================================================

/// Methods this side is willing to use under `config`
pub fn allowed_methods(config: &EncryptionConfig) -> u32 {
    let mut methods = 0u32;
    if config.allow_rc4 {
        methods |= CRYPTO_RC4;
    }
    if config.allow_plaintext && config.policy != EncryptionPolicy::Required {
        methods |= CRYPTO_PLAINTEXT;
    }
    methods
}

/// Pick the best method both sides support, preferring RC4
pub fn select_method(offered: u32, allowed: u32) -> Result<u32, HandshakeError> {
    let common = offered & allowed;
    if common & CRYPTO_RC4 != 0 {
        Ok(CRYPTO_RC4)
    } else if common & CRYPTO_PLAINTEXT != 0 {
        Ok(CRYPTO_PLAINTEXT)
    } else {
        Err(HandshakeError::NoMutualCryptoMethod { offered, allowed })
    }
}

// ============================================================================
// RC4 Cipher
// ============================================================================

/// RC4 cipher state
#[derive(Clone)]
pub struct Rc4Cipher {
    state: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4Cipher {
    /// Create a new RC4 cipher with the given key, first 1024 bytes dropped
    pub fn new(key: &[u8]) -> Self {
        let mut cipher = Self::new_no_discard(key);
        let mut discard = [0u8; RC4_DISCARD];
        cipher.process(&mut discard);
        cipher
    }

    fn new_no_discard(key: &[u8]) -> Self {
        let mut state = [0u8; 256];
        for (i, byte) in state.iter_mut().enumerate() {
            *byte = i as u8;
        }

        let mut j: u8 = 0;
        for i in 0..256 {
            j = j.wrapping_add(state[i]).wrapping_add(key[i % key.len()]);
            state.swap(i, j as usize);
        }

        Self { state, i: 0, j: 0 }
    }

    /// Process data in-place (encrypt or decrypt - symmetric)
    pub fn process(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.state[self.i as usize]);
            self.state.swap(self.i as usize, self.j as usize);
            let k = self.state
                [(self.state[self.i as usize].wrapping_add(self.state[self.j as usize])) as usize];
            *byte ^= k;
        }
    }
}

/// The two directions of an RC4 session
#[derive(Clone)]
pub struct CipherPair {
    pub encrypt: Rc4Cipher,
    pub decrypt: Rc4Cipher,
}

// ============================================================================
// Diffie-Hellman Key Exchange
// ============================================================================

/// Diffie-Hellman key pair for MSE
pub struct DhKeyPair {
    /// Private key (160-bit random value)
    private: BigUint,
    /// Public key (768-bit value)
    public: [u8; DH_KEY_SIZE],
}

impl DhKeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let mut private_bytes = [0u8; 20];
        rand::rng().fill(&mut private_bytes);
        let private = BigUint::from_bytes_be(&private_bytes);

        let g = BigUint::from(DH_GENERATOR);
        let p = BigUint::from_bytes_be(&DH_PRIME);
        let public = to_fixed_bytes(&g.modpow(&private, &p));

        Self { private, public }
    }

    /// Compute shared secret: peer_public^private mod P
    pub fn compute_shared_secret(
        &self,
        peer_public: &[u8; DH_KEY_SIZE],
    ) -> Result<[u8; DH_KEY_SIZE], HandshakeError> {
        let p = BigUint::from_bytes_be(&DH_PRIME);
        let peer = BigUint::from_bytes_be(peer_public);

        // 0, 1 and P-1 collapse the secret to a value an observer can guess.
        let one = BigUint::from(1u8);
        if peer <= one || peer >= &p - &one {
            return Err(HandshakeError::MalformedKeyExchange(
                "public value out of range".to_string(),
            ));
        }

        Ok(to_fixed_bytes(&peer.modpow(&self.private, &p)))
    }

    /// Get the public key bytes
    pub fn public_bytes(&self) -> &[u8; DH_KEY_SIZE] {
        &self.public
    }
}

fn to_fixed_bytes(value: &BigUint) -> [u8; DH_KEY_SIZE] {
    let bytes = value.to_bytes_be();
    let len = bytes.len().min(DH_KEY_SIZE);
    let mut out = [0u8; DH_KEY_SIZE];
    out[DH_KEY_SIZE - len..].copy_from_slice(&bytes[bytes.len() - len..]);
    out
}

// ============================================================================
// Key Derivation
// ============================================================================

fn hash(parts: &[&[u8]]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Derive RC4 keys from shared secret and SKEY (info_hash)
pub fn derive_rc4_keys(shared_secret: &[u8], skey: &[u8], is_initiator: bool) -> CipherPair {
    let key_a = Rc4Cipher::new(&hash(&[b"keyA", shared_secret, skey]));
    let key_b = Rc4Cipher::new(&hash(&[b"keyB", shared_secret, skey]));

    // Initiator uses keyA for encrypt, keyB for decrypt
    if is_initiator {
        CipherPair {
            encrypt: key_a,
            decrypt: key_b,
        }
    } else {
        CipherPair {
            encrypt: key_b,
            decrypt: key_a,
        }
    }
}

/// HASH("req2" + SKEY) XOR HASH("req3" + S), identifies the torrent
fn obfuscated_skey(shared_secret: &[u8], skey: &[u8]) -> [u8; 20] {
    let req2 = hash(&[b"req2", skey]);
    let req3 = hash(&[b"req3", shared_secret]);
    let mut out = [0u8; 20];
    for (o, (a, b)) in out.iter_mut().zip(req2.iter().zip(req3.iter())) {
        *o = a ^ b;
    }
    out
}

// ============================================================================
// Synchronisation marker search
// ============================================================================

/// Length of the longest prefix of `b` that is also a suffix of `a`.
///
/// `b` is truncated to the length of `a` first.
pub fn suffix_match_len(a: &[u8], b: &[u8]) -> usize {
    let b = &b[..b.len().min(a.len())];
    (1..=b.len())
        .rev()
        .find(|&i| a.ends_with(&b[..i]))
        .unwrap_or(0)
}

/// Consume `reader` up to and including the first occurrence of `needle`.
///
/// Never reads past the end of the needle: each step reads only as many bytes
/// as are still missing from a full match. Fails with `MarkerNotFound` once
/// `window` bytes have been consumed without a match.
pub async fn read_until<R: AsyncRead + Unpin>(
    reader: &mut R,
    needle: &[u8],
    window: usize,
) -> Result<(), HandshakeError> {
    if needle.is_empty() {
        return Ok(());
    }

    let mut buf = vec![0u8; needle.len()];
    let mut matched = 0;
    let mut consumed = 0;

    loop {
        let want = needle.len() - matched;
        if consumed + want > window {
            return Err(HandshakeError::MarkerNotFound { window });
        }
        reader.read_exact(&mut buf[matched..]).await?;
        consumed += want;

        matched = suffix_match_len(&buf, needle);
        if matched == needle.len() {
            return Ok(());
        }
        let tail = buf.len() - matched;
        buf.copy_within(tail.., 0);
    }
}

// ============================================================================
// Handshake
// ============================================================================

/// Outcome of the key exchange, before it is bound to a stream
struct Negotiated {
    ciphers: Option<CipherPair>,
    method: u32,
    initial_payload: Vec<u8>,
}

fn random_padding(config: &EncryptionConfig) -> Vec<u8> {
    let max = config.max_padding.min(MAX_PADDING);
    let min = config.min_padding.min(max);
    let mut rng = rand::rng();
    let mut padding = vec![0u8; rng.random_range(min..=max)];
    rng.fill(&mut padding[..]);
    padding
}

async fn read_u16<R: AsyncRead + Unpin>(
    reader: &mut R,
    cipher: &mut Rc4Cipher,
) -> Result<u16, HandshakeError> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf).await?;
    cipher.process(&mut buf);
    Ok(u16::from_be_bytes(buf))
}

async fn read_padding<R: AsyncRead + Unpin>(
    reader: &mut R,
    cipher: &mut Rc4Cipher,
) -> Result<(), HandshakeError> {
    let len = read_u16(reader, cipher).await? as usize;
    if len > MAX_PADDING {
        return Err(HandshakeError::MalformedKeyExchange(format!(
            "padding length {} exceeds {}",
            len, MAX_PADDING
        )));
    }
    let mut padding = vec![0u8; len];
    reader.read_exact(&mut padding).await?;
    cipher.process(&mut padding);
    Ok(())
}

/// Run the initiator side of the handshake (outgoing connection).
///
/// `ia` rides along in the encrypted handshake and reaches the responder as
/// the first bytes of its stream.
pub async fn initiate_handshake<S>(
    mut stream: S,
    skey: &[u8],
    ia: &[u8],
    config: &EncryptionConfig,
) -> Result<PeerStream<S>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let started = Instant::now();
    let negotiated = timeout(
        config.handshake_timeout(),
        initiate_inner(&mut stream, skey, ia, config),
    )
    .await
    .map_err(|_| HandshakeError::Timeout)??;

    tracing::debug!(
        method = negotiated.method,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "MSE handshake complete (initiator)"
    );
    Ok(PeerStream::from_negotiated(stream, negotiated))
}

async fn initiate_inner<S>(
    stream: &mut S,
    skey: &[u8],
    ia: &[u8],
    config: &EncryptionConfig,
) -> Result<Negotiated, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ia_len = u16::try_from(ia.len()).map_err(|_| {
        HandshakeError::MalformedKeyExchange("initial payload too long".to_string())
    })?;
    let provide = allowed_methods(config);
    if provide == 0 {
        return Err(HandshakeError::NoMutualCryptoMethod {
            offered: 0,
            allowed: 0,
        });
    }

    // 1 A->B: Ya, PadA
    let key_pair = DhKeyPair::generate();
    let mut out = Vec::with_capacity(DH_KEY_SIZE + MAX_PADDING);
    out.extend_from_slice(key_pair.public_bytes());
    out.extend_from_slice(&random_padding(config));
    stream.write_all(&out).await?;
    stream.flush().await?;

    // 2 B->A: Yb, PadB
    let mut yb = [0u8; DH_KEY_SIZE];
    stream.read_exact(&mut yb).await?;
    let secret = key_pair.compute_shared_secret(&yb)?;

    // 3 A->B: HASH('req1', S), HASH('req2', SKEY) xor HASH('req3', S),
    //   ENCRYPT(VC, crypto_provide, len(PadC), PadC, len(IA)), ENCRYPT(IA)
    let mut ciphers = derive_rc4_keys(&secret, skey, true);
    let pad_c = random_padding(config);

    let mut encrypted = Vec::with_capacity(8 + 4 + 2 + pad_c.len() + 2 + ia.len());
    encrypted.extend_from_slice(&VC);
    encrypted.extend_from_slice(&provide.to_be_bytes());
    encrypted.extend_from_slice(&(pad_c.len() as u16).to_be_bytes());
    encrypted.extend_from_slice(&pad_c);
    encrypted.extend_from_slice(&ia_len.to_be_bytes());
    encrypted.extend_from_slice(ia);
    ciphers.encrypt.process(&mut encrypted);

    let mut out = Vec::with_capacity(40 + encrypted.len());
    out.extend_from_slice(&hash(&[b"req1", &secret]));
    out.extend_from_slice(&obfuscated_skey(&secret, skey));
    out.extend_from_slice(&encrypted);
    stream.write_all(&out).await?;
    stream.flush().await?;

    // 4 B->A: ENCRYPT(VC, crypto_select, len(PadD), PadD)
    // PadB is unknown, so sync on the encrypted VC. The decrypt cipher has
    // then consumed exactly the VC keystream.
    let mut encrypted_vc = VC;
    ciphers.decrypt.process(&mut encrypted_vc);
    read_until(stream, &encrypted_vc, MAX_PADDING + VC.len()).await?;

    let mut select_buf = [0u8; 4];
    stream.read_exact(&mut select_buf).await?;
    ciphers.decrypt.process(&mut select_buf);
    let method = u32::from_be_bytes(select_buf);
    if method.count_ones() != 1 || method & provide == 0 {
        return Err(HandshakeError::NoMutualCryptoMethod {
            offered: provide,
            allowed: method,
        });
    }
    read_padding(stream, &mut ciphers.decrypt).await?;

    Ok(Negotiated {
        ciphers: (method == CRYPTO_RC4).then_some(ciphers),
        method,
        initial_payload: Vec::new(),
    })
}

/// Run the responder side of the handshake (incoming connection).
///
/// `skeys` lists the info hashes served on this listener. Returns the stream
/// and the info hash the initiator asked for. The initiator's initial payload
/// is replayed as the first bytes read from the stream.
pub async fn receive_handshake<S>(
    stream: S,
    skeys: &[Sha1Hash],
    config: &EncryptionConfig,
) -> Result<(PeerStream<S>, Sha1Hash), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    receive_with_prefix(stream, &[], skeys, config).await
}

async fn receive_with_prefix<S>(
    mut stream: S,
    prefix: &[u8],
    skeys: &[Sha1Hash],
    config: &EncryptionConfig,
) -> Result<(PeerStream<S>, Sha1Hash), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let started = Instant::now();
    let (negotiated, skey) = timeout(
        config.handshake_timeout(),
        receive_inner(&mut stream, prefix, skeys, config),
    )
    .await
    .map_err(|_| HandshakeError::Timeout)??;

    tracing::debug!(
        method = negotiated.method,
        initial_payload = negotiated.initial_payload.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "MSE handshake complete (responder)"
    );
    Ok((PeerStream::from_negotiated(stream, negotiated), skey))
}

async fn receive_inner<S>(
    stream: &mut S,
    prefix: &[u8],
    skeys: &[Sha1Hash],
    config: &EncryptionConfig,
) -> Result<(Negotiated, Sha1Hash), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // 1 A->B: Ya, PadA
    let mut ya = [0u8; DH_KEY_SIZE];
    let replayed = prefix.len().min(DH_KEY_SIZE);
    ya[..replayed].copy_from_slice(&prefix[..replayed]);
    stream.read_exact(&mut ya[replayed..]).await?;

    let key_pair = DhKeyPair::generate();
    let secret = key_pair.compute_shared_secret(&ya)?;

    // 2 B->A: Yb, PadB
    let mut out = Vec::with_capacity(DH_KEY_SIZE + MAX_PADDING);
    out.extend_from_slice(key_pair.public_bytes());
    out.extend_from_slice(&random_padding(config));
    stream.write_all(&out).await?;
    stream.flush().await?;

    // 3 A->B: sync on HASH('req1', S) past the unknown PadA
    let req1 = hash(&[b"req1", &secret]);
    read_until(stream, &req1, MAX_PADDING + req1.len()).await?;

    let mut obfuscated = [0u8; 20];
    stream.read_exact(&mut obfuscated).await?;
    let req3 = hash(&[b"req3", &secret]);
    let skey = skeys
        .iter()
        .find(|skey| {
            let req2 = hash(&[b"req2", skey.as_slice()]);
            req2.iter()
                .zip(req3.iter())
                .zip(obfuscated.iter())
                .all(|((a, b), o)| a ^ b == *o)
        })
        .copied()
        .ok_or(HandshakeError::UnknownInfoHash)?;

    let mut ciphers = derive_rc4_keys(&secret, &skey, false);

    let mut head = [0u8; 12];
    stream.read_exact(&mut head).await?;
    ciphers.decrypt.process(&mut head);
    if head[..8] != VC {
        return Err(HandshakeError::MalformedKeyExchange(
            "verification constant mismatch".to_string(),
        ));
    }
    let provide = u32::from_be_bytes([head[8], head[9], head[10], head[11]]);
    read_padding(stream, &mut ciphers.decrypt).await?;

    let ia_len = read_u16(stream, &mut ciphers.decrypt).await? as usize;
    let mut ia = vec![0u8; ia_len];
    stream.read_exact(&mut ia).await?;
    ciphers.decrypt.process(&mut ia);

    let method = select_method(provide, allowed_methods(config))?;

    // 4 B->A: ENCRYPT(VC, crypto_select, len(PadD), PadD)
    let pad_d = random_padding(config);
    let mut reply = Vec::with_capacity(8 + 4 + 2 + pad_d.len());
    reply.extend_from_slice(&VC);
    reply.extend_from_slice(&method.to_be_bytes());
    reply.extend_from_slice(&(pad_d.len() as u16).to_be_bytes());
    reply.extend_from_slice(&pad_d);
    ciphers.encrypt.process(&mut reply);
    stream.write_all(&reply).await?;
    stream.flush().await?;

    Ok((
        Negotiated {
            ciphers: (method == CRYPTO_RC4).then_some(ciphers),
            method,
            initial_payload: ia,
        },
        skey,
    ))
}

// ============================================================================
// Policy entry points
// ============================================================================

/// Open an outgoing connection's stream according to the encryption policy.
///
/// With encryption attempted, `ia` is carried inside the handshake; on the
/// plaintext path it is simply written first.
pub async fn connect_stream<S>(
    mut stream: S,
    info_hash: &Sha1Hash,
    ia: &[u8],
    config: &EncryptionConfig,
) -> Result<PeerStream<S>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match config.policy {
        EncryptionPolicy::Disabled | EncryptionPolicy::Allowed => {
            stream.write_all(ia).await?;
            Ok(PeerStream::plaintext(stream))
        }
        EncryptionPolicy::Preferred | EncryptionPolicy::Required => {
            initiate_handshake(stream, info_hash, ia, config).await
        }
    }
}

/// Classify an incoming connection and complete whichever handshake it began.
///
/// A plaintext peer's first 20 bytes are the protocol header; they are
/// replayed so the protocol handshake can be read normally. Anything else is
/// taken to be the start of an MSE public key. The info hash is `None` on the
/// plaintext path, where it arrives later in the protocol handshake.
pub async fn accept_stream<S>(
    mut stream: S,
    skeys: &[Sha1Hash],
    config: &EncryptionConfig,
) -> Result<(PeerStream<S>, Option<Sha1Hash>), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut first = [0u8; 20];
    timeout(config.handshake_timeout(), stream.read_exact(&mut first))
        .await
        .map_err(|_| HandshakeError::Timeout)??;

    if &first == PROTOCOL_HEADER {
        if config.policy == EncryptionPolicy::Required {
            tracing::debug!("Rejecting plaintext peer: encryption required");
            return Err(HandshakeError::EncryptionRequired);
        }
        return Ok((PeerStream::with_prefix(stream, &first), None));
    }

    if config.policy == EncryptionPolicy::Disabled {
        return Err(HandshakeError::InvalidProtocol(
            "obfuscated handshake while encryption is disabled".to_string(),
        ));
    }

    let (stream, skey) = receive_with_prefix(stream, &first, skeys, config).await?;
    Ok((stream, Some(skey)))
}

// ============================================================================
// Peer Stream
// ============================================================================

/// Stream that can be either plaintext or RC4 encrypted.
///
/// Reads first drain any replayed bytes (already plaintext), then decrypt
/// what the transport returns. Encrypted writes are buffered so keystream is
/// only consumed for bytes that will reach the wire.
pub struct PeerStream<S> {
    inner: S,
    ciphers: Option<CipherPair>,
    replay: BytesMut,
    pending: Vec<u8>,
    pending_pos: usize,
}

impl<S> PeerStream<S> {
    /// Unencrypted passthrough
    pub fn plaintext(inner: S) -> Self {
        Self::with_prefix(inner, &[])
    }

    /// Unencrypted passthrough that yields `prefix` before reading `inner`
    pub fn with_prefix(inner: S, prefix: &[u8]) -> Self {
        Self {
            inner,
            ciphers: None,
            replay: BytesMut::from(prefix),
            pending: Vec::new(),
            pending_pos: 0,
        }
    }

    fn from_negotiated(inner: S, negotiated: Negotiated) -> Self {
        Self {
            inner,
            ciphers: negotiated.ciphers,
            replay: BytesMut::from(&negotiated.initial_payload[..]),
            pending: Vec::new(),
            pending_pos: 0,
        }
    }

    /// Check if stream is encrypted
    pub fn is_encrypted(&self) -> bool {
        self.ciphers.is_some()
    }

    /// Reference to the transport
    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncWrite + Unpin> PeerStream<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.pending_pos < self.pending.len() {
            let n = ready!(
                Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.pending_pos..])
            )?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending_pos += n;
        }
        self.pending.clear();
        self.pending_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeerStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.replay.is_empty() {
            let n = this.replay.len().min(buf.remaining());
            buf.put_slice(&this.replay[..n]);
            this.replay.advance(n);
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        if let Some(ciphers) = this.ciphers.as_mut() {
            ciphers.decrypt.process(&mut buf.filled_mut()[before..]);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeerStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.ciphers.is_none() {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }

        ready!(this.poll_drain(cx))?;

        this.pending.extend_from_slice(buf);
        if let Some(ciphers) = this.ciphers.as_mut() {
            ciphers.encrypt.process(&mut this.pending);
        }

        // Bytes are accepted once encrypted; a pending drain is finished by
        // the next write or flush.
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

// ============================================================================
// Tests
// ============================================================================
