use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use crate::crypto::Keypair;
use crate::stats::KeyStat;
use crate::wire::KEY_ID_LEN;

/// Flag lists up to this length are scanned linearly; longer lists are kept
/// sorted and binary-searched.
pub const FORBIDDEN_FLAGS_INLINE_MAX: usize = 16;

/// Alphabet used to print key ids (the zbase32 set, encoded LSB-first).
const BASE32_ALPHABET: &[u8; 32] = b"ybndrfg8ejkmcpqxot1uwisza345h769";

/// Encodes bytes with the key-id base32 alphabet, five bits at a time from
/// the least significant end.
pub fn encode_base32(input: &[u8]) -> String {
    let mut out = String::with_capacity(input.len() * 8 / 5 + 1);
    let mut acc: u16 = 0;
    let mut bits: u8 = 0;

    for &byte in input {
        acc |= (byte as u16) << bits;
        bits += 8;
        while bits >= 5 {
            out.push(BASE32_ALPHABET[(acc & 0x1f) as usize] as char);
            acc >>= 5;
            bits -= 5;
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[(acc & 0x1f) as usize] as char);
    }
    out
}

/// 32-byte public key identifier. Hashing reads only the first eight bytes
/// (the keys are uniformly random); equality compares all 32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyId([u8; KEY_ID_LEN]);

impl KeyId {
    pub fn from_bytes(bytes: [u8; KEY_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_ID_LEN] {
        &self.0
    }

    /// Short printable form used in logs and the stat document.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    pub fn to_base32(&self) -> String {
        encode_base32(&self.0)
    }
}

impl Hash for KeyId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&self.0[..8]);
        state.write_u64(u64::from_le_bytes(prefix));
    }
}

/// A locally configured keypair with its policy and statistics.
pub struct FuzzyKey {
    keypair: Keypair,
    forbidden_flags: Vec<u32>,
    pub stat: Mutex<KeyStat>,
}

impl FuzzyKey {
    pub fn new(keypair: Keypair, mut forbidden_flags: Vec<u32>) -> Self {
        if forbidden_flags.len() > FORBIDDEN_FLAGS_INLINE_MAX {
            forbidden_flags.sort_unstable();
            forbidden_flags.dedup();
        }
        Self {
            keypair,
            forbidden_flags,
            stat: Mutex::new(KeyStat::default()),
        }
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn id(&self) -> KeyId {
        KeyId::from_bytes(self.keypair.public_bytes())
    }

    /// Linear scan for short lists, binary search once the list has been
    /// sorted by the constructor.
    pub fn is_forbidden(&self, flag: u32) -> bool {
        if self.forbidden_flags.len() <= FORBIDDEN_FLAGS_INLINE_MAX {
            self.forbidden_flags.contains(&flag)
        } else {
            self.forbidden_flags.binary_search(&flag).is_ok()
        }
    }
}

/// All configured keys, indexed by public key. The most recently inserted
/// key doubles as the default for unknown key ids.
#[derive(Default)]
pub struct KeyRegistry {
    keys: HashMap<KeyId, Arc<FuzzyKey>>,
    default_key: Option<Arc<FuzzyKey>>,
}

impl KeyRegistry {
    pub fn insert(&mut self, key: FuzzyKey) -> Arc<FuzzyKey> {
        let key = Arc::new(key);
        self.keys.insert(key.id(), Arc::clone(&key));
        self.default_key = Some(Arc::clone(&key));
        key
    }

    /// Raw-id lookup; no full key needs to be constructed.
    pub fn lookup(&self, key_id: &[u8; KEY_ID_LEN]) -> Option<Arc<FuzzyKey>> {
        self.keys.get(&KeyId::from_bytes(*key_id)).cloned()
    }

    /// Envelope key selection: exact match first, then the default key.
    pub fn lookup_or_default(&self, key_id: &[u8; KEY_ID_LEN]) -> Option<Arc<FuzzyKey>> {
        self.lookup(key_id).or_else(|| self.default_key.clone())
    }

    pub fn default_key(&self) -> Option<Arc<FuzzyKey>> {
        self.default_key.clone()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&KeyId, &Arc<FuzzyKey>)> {
        self.keys.iter()
    }
}
