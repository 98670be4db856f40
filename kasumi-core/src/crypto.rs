use std::num::NonZeroUsize;

use anyhow::{Context, Result, bail};
use chacha20poly1305::{
    Key, Tag, XChaCha20Poly1305, XNonce,
    aead::{AeadInPlace, KeyInit},
};
use lru::LruCache;
use rand_core::{OsRng, RngCore};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::wire::{EncryptedHeader, KEY_ID_LEN, MAC_LEN, NONCE_LEN, REPLY_CRYPTOBOX_SIZE};

/// A derived X25519 shared secret. The backing bytes are wiped when the
/// value is dropped.
#[derive(Clone)]
pub struct SharedSecret(Zeroizing<[u8; 32]>);

impl SharedSecret {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn expose(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// Local X25519 keypair used for key agreement with clients.
#[derive(Clone)]
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Parses a 64-char hex secret key, the format used in config files.
    pub fn from_secret_hex(input: &str) -> Result<Self> {
        let raw = hex::decode(input.trim()).context("keypair secret is not valid hex")?;
        let bytes: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("keypair secret must be exactly 32 bytes"))?;
        Ok(Self::from_secret_bytes(bytes))
    }

    pub fn public_bytes(&self) -> [u8; KEY_ID_LEN] {
        *self.public.as_bytes()
    }

    /// X25519 key agreement against a client ephemeral public key.
    pub fn derive_shared(&self, peer_public: &[u8; 32]) -> SharedSecret {
        let peer = PublicKey::from(*peer_public);
        let shared = self.secret.diffie_hellman(&peer);
        SharedSecret::from_bytes(*shared.as_bytes())
    }
}

/// Bounded cache of derived shared secrets, keyed by (local, remote) public
/// keys. Repeat clients skip the scalar multiplication.
pub struct SharedSecretCache {
    cache: LruCache<([u8; 32], [u8; 32]), SharedSecret>,
}

impl SharedSecretCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            cache: LruCache::new(capacity),
        }
    }

    pub fn derive(&mut self, keypair: &Keypair, peer_public: &[u8; 32]) -> SharedSecret {
        let cache_key = (keypair.public_bytes(), *peer_public);
        if let Some(shared) = self.cache.get(&cache_key) {
            return shared.clone();
        }
        let shared = keypair.derive_shared(peer_public);
        self.cache.put(cache_key, shared.clone());
        shared
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// Decrypts and authenticates the command payload in place using the shared
/// secret derived from the envelope's ephemeral key.
pub fn open_in_place(shared: &SharedSecret, header: &EncryptedHeader, payload: &mut [u8]) -> Result<()> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(shared.expose()));
    let nonce = XNonce::from_slice(&header.nonce);
    let tag = Tag::from_slice(&header.mac);

    if cipher
        .decrypt_in_place_detached(nonce, &[], payload, tag)
        .is_err()
    {
        bail!("mac verification failed");
    }
    Ok(())
}

/// Encrypts an outbound reply with a fresh nonce. Output layout:
/// `[nonce][mac][ciphertext]`.
pub fn seal_reply(shared: &SharedSecret, plaintext: &[u8]) -> Vec<u8> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(shared.expose()));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(nonce, &[], &mut buffer)
        .expect("xchacha20poly1305 encryption is infallible for in-memory buffers");

    let mut out = Vec::with_capacity(REPLY_CRYPTOBOX_SIZE + buffer.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(tag.as_slice());
    out.extend_from_slice(&buffer);
    out
}

/// Opens an encrypted reply produced by `seal_reply`. Client-side helper,
/// used by the integration tests.
pub fn open_reply(shared: &SharedSecret, wire: &[u8]) -> Result<Vec<u8>> {
    if wire.len() < NONCE_LEN + MAC_LEN {
        bail!("encrypted reply too short");
    }
    let cipher = XChaCha20Poly1305::new(Key::from_slice(shared.expose()));
    let nonce = XNonce::from_slice(&wire[..NONCE_LEN]);
    let tag = Tag::from_slice(&wire[NONCE_LEN..NONCE_LEN + MAC_LEN]);

    let mut buffer = wire[NONCE_LEN + MAC_LEN..].to_vec();
    if cipher
        .decrypt_in_place_detached(nonce, &[], &mut buffer, tag)
        .is_err()
    {
        bail!("mac verification failed");
    }
    Ok(buffer)
}

/// Builds a full encrypted datagram for a plaintext command. Client-side
/// helper: generates an ephemeral keypair, agrees with the server public
/// key and seals the command. Returns the wire bytes and the shared secret
/// needed to open the reply.
pub fn seal_command(server_public: &[u8; 32], command: &[u8]) -> (Vec<u8>, SharedSecret) {
    let ephemeral = Keypair::generate();
    let shared = ephemeral.derive_shared(server_public);

    let cipher = XChaCha20Poly1305::new(Key::from_slice(shared.expose()));
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let mut payload = command.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(XNonce::from_slice(&nonce), &[], &mut payload)
        .expect("xchacha20poly1305 encryption is infallible for in-memory buffers");

    let mut mac = [0u8; MAC_LEN];
    mac.copy_from_slice(tag.as_slice());

    let header = EncryptedHeader {
        key_id: *server_public,
        ephemeral_pk: ephemeral.public_bytes(),
        nonce,
        mac,
    };

    let mut wire = Vec::with_capacity(crate::wire::ENCRYPTED_HEADER_SIZE + payload.len());
    header.encode(&mut wire);
    wire.extend_from_slice(&payload);
    (wire, shared)
}
