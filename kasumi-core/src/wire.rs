use std::net::{Ipv4Addr, Ipv6Addr};

use thiserror::Error;

/// Digest length carried by every command.
pub const DIGEST_LEN: usize = 64;
/// Public key / key id length used by the encrypted envelope.
pub const KEY_ID_LEN: usize = 32;
/// XChaCha20 nonce length on the wire.
pub const NONCE_LEN: usize = 24;
/// Poly1305 tag length on the wire.
pub const MAC_LEN: usize = 16;
/// Number of locality-sensitive hashes in a shingle block.
pub const SHINGLE_HASHES: usize = 32;

/// Fixed part of every command: version, cmd, shingles_count, reserved,
/// flag, tag, digest.
pub const COMMAND_SIZE: usize = 4 + 4 + 4 + DIGEST_LEN;
/// Shingle block: algorithm byte, seed, 32 hashes.
pub const SHINGLE_BLOCK_SIZE: usize = 1 + 8 + 8 * SHINGLE_HASHES;
/// Command with a trailing shingle block.
pub const SHINGLE_COMMAND_SIZE: usize = COMMAND_SIZE + SHINGLE_BLOCK_SIZE;

/// Magic prefix identifying an encrypted command.
pub const ENCRYPTED_MAGIC: [u8; 4] = *b"rscp";
/// Encrypted envelope: magic, key id, ephemeral public key, nonce, mac.
pub const ENCRYPTED_HEADER_SIZE: usize = 4 + KEY_ID_LEN + 32 + NONCE_LEN + MAC_LEN;
/// Minimum length of an encrypted datagram.
pub const ENCRYPTED_COMMAND_SIZE: usize = ENCRYPTED_HEADER_SIZE + COMMAND_SIZE;

/// v1 reply: value, prob, flag, tag.
pub const REPLY_V1_SIZE: usize = 16;
/// v2 reply appends the hash timestamp.
pub const REPLY_V2_SIZE: usize = REPLY_V1_SIZE + 8;
/// Nonce plus mac prefixed to an encrypted reply.
pub const REPLY_CRYPTOBOX_SIZE: usize = NONCE_LEN + MAC_LEN;

const EXT_SOURCE_DOMAIN: u8 = 1;
const EXT_SOURCE_IP4: u8 = 2;
const EXT_SOURCE_IP6: u8 = 3;

/// Protocol-level failure taxonomy. Decode failures are counted and produce
/// no reply; policy rejections map onto reply codes in the session layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("truncated datagram")]
    Truncated,
    #[error("unsupported protocol version")]
    InvalidVersion,
    #[error("unknown command")]
    InvalidCommand,
    #[error("malformed source extension")]
    InvalidExtension,
    #[error("decryption failed")]
    DecryptFailed,
    #[error("unknown destination key")]
    UnknownKey,
    #[error("encryption required")]
    Forbidden,
    #[error("rate limited")]
    RateLimited,
    #[error("source address blocked")]
    Blocked,
    #[error("hash in skip list")]
    SkipHash,
    #[error("backend unavailable")]
    BackendUnavailable,
    #[error("commit failed")]
    CommitFailed,
}

impl ProtocolError {
    /// Short machine-readable code used by structured logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Truncated => "TRUNCATED",
            Self::InvalidVersion => "INVALID_VERSION",
            Self::InvalidCommand => "INVALID_COMMAND",
            Self::InvalidExtension => "INVALID_EXTENSION",
            Self::DecryptFailed => "DECRYPT_FAILED",
            Self::UnknownKey => "UNKNOWN_KEY",
            Self::Forbidden => "FORBIDDEN",
            Self::RateLimited => "RATE_LIMITED",
            Self::Blocked => "BLOCKED",
            Self::SkipHash => "SKIP_HASH",
            Self::BackendUnavailable => "BACKEND_UNAVAILABLE",
            Self::CommitFailed => "COMMIT_FAILED",
        }
    }
}

/// Protocol generation, derived from the command version during validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Epoch {
    Epoch10,
    Epoch11,
}

/// Number of tracked epochs; sized for the per-epoch counter arrays.
pub const EPOCH_COUNT: usize = 2;

impl Epoch {
    pub fn index(self) -> usize {
        match self {
            Self::Epoch10 => 0,
            Self::Epoch11 => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Check,
    Write,
    Del,
    Stat,
    Refresh,
}

impl CommandKind {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Check),
            1 => Some(Self::Write),
            2 => Some(Self::Del),
            3 => Some(Self::Stat),
            4 => Some(Self::Refresh),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Self::Check => 0,
            Self::Write => 1,
            Self::Del => 2,
            Self::Stat => 3,
            Self::Refresh => 4,
        }
    }
}

/// Optional locality-sensitive vector attached to a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShingleBlock {
    pub alg: u8,
    pub seed: u64,
    pub hashes: [u64; SHINGLE_HASHES],
}

/// Source attribution extension trailing the fixed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceExtension {
    Domain(Vec<u8>),
    Ip4(Ipv4Addr),
    Ip6(Ipv6Addr),
}

/// A decoded client command. Handles both plain and shingle variants;
/// encryption is stripped before this layer sees the bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub version: u8,
    pub cmd: CommandKind,
    pub shingles_count: u8,
    pub flag: u32,
    pub tag: u32,
    pub digest: [u8; DIGEST_LEN],
    pub shingle: Option<ShingleBlock>,
    pub extensions: Vec<SourceExtension>,
}

impl Command {
    pub fn is_shingle(&self) -> bool {
        self.shingle.is_some()
    }
}

/// Encrypted envelope header, sent in the clear ahead of the ciphertext.
#[derive(Debug, Clone, Copy)]
pub struct EncryptedHeader {
    pub key_id: [u8; KEY_ID_LEN],
    pub ephemeral_pk: [u8; 32],
    pub nonce: [u8; NONCE_LEN],
    pub mac: [u8; MAC_LEN],
}

impl EncryptedHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < ENCRYPTED_HEADER_SIZE {
            return Err(ProtocolError::Truncated);
        }
        let mut key_id = [0u8; KEY_ID_LEN];
        let mut ephemeral_pk = [0u8; 32];
        let mut nonce = [0u8; NONCE_LEN];
        let mut mac = [0u8; MAC_LEN];
        key_id.copy_from_slice(&buf[4..36]);
        ephemeral_pk.copy_from_slice(&buf[36..68]);
        nonce.copy_from_slice(&buf[68..92]);
        mac.copy_from_slice(&buf[92..108]);
        Ok(Self {
            key_id,
            ephemeral_pk,
            nonce,
            mac,
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&ENCRYPTED_MAGIC);
        out.extend_from_slice(&self.key_id);
        out.extend_from_slice(&self.ephemeral_pk);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.mac);
    }
}

/// Returns true when the datagram carries the encrypted envelope.
pub fn is_encrypted(buf: &[u8]) -> bool {
    buf.len() >= ENCRYPTED_COMMAND_SIZE && buf[..4] == ENCRYPTED_MAGIC
}

fn parse_u32_le(bytes: &[u8]) -> u32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(out)
}

fn parse_u64_le(bytes: &[u8]) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(out)
}

/// Maps (version, shingles_count, length) onto a protocol epoch.
///
/// v4 accepts trailing bytes (extensions); v3 demands an exact size and so
/// can never carry extensions.
fn validate_command(version: u8, shingles_count: u8, len: usize) -> Result<Epoch, ProtocolError> {
    match version {
        4 => {
            let need = if shingles_count > 0 {
                SHINGLE_COMMAND_SIZE
            } else {
                COMMAND_SIZE
            };
            if len >= need {
                Ok(Epoch::Epoch11)
            } else {
                Err(ProtocolError::Truncated)
            }
        }
        3 => {
            let need = if shingles_count > 0 {
                SHINGLE_COMMAND_SIZE
            } else {
                COMMAND_SIZE
            };
            if len == need {
                Ok(Epoch::Epoch10)
            } else {
                Err(ProtocolError::InvalidVersion)
            }
        }
        _ => Err(ProtocolError::InvalidVersion),
    }
}

/// Parses the plaintext command (fixed part, optional shingle block,
/// optional extensions). Any truncation rejects the whole datagram.
pub fn parse_command(buf: &[u8]) -> Result<(Command, Epoch), ProtocolError> {
    if buf.len() < COMMAND_SIZE {
        return Err(ProtocolError::Truncated);
    }

    let version = buf[0];
    let cmd = CommandKind::from_wire(buf[1]).ok_or(ProtocolError::InvalidCommand)?;
    let shingles_count = buf[2];
    let epoch = validate_command(version, shingles_count, buf.len())?;
    let flag = parse_u32_le(&buf[4..8]);
    let tag = parse_u32_le(&buf[8..12]);
    let mut digest = [0u8; DIGEST_LEN];
    digest.copy_from_slice(&buf[12..12 + DIGEST_LEN]);

    let mut offset = COMMAND_SIZE;
    let shingle = if shingles_count > 0 {
        let block = &buf[offset..offset + SHINGLE_BLOCK_SIZE];
        let alg = block[0];
        let seed = parse_u64_le(&block[1..9]);
        let mut hashes = [0u64; SHINGLE_HASHES];
        for (i, hash) in hashes.iter_mut().enumerate() {
            *hash = parse_u64_le(&block[9 + i * 8..17 + i * 8]);
        }
        offset += SHINGLE_BLOCK_SIZE;
        Some(ShingleBlock { alg, seed, hashes })
    } else {
        None
    };

    let extensions = if offset < buf.len() {
        parse_extensions(&buf[offset..])?
    } else {
        Vec::new()
    };

    Ok((
        Command {
            version,
            cmd,
            shingles_count,
            flag,
            tag,
            digest,
            shingle,
            extensions,
        },
        epoch,
    ))
}

/// Parses the extension trailer. Every extension must be fully present.
fn parse_extensions(buf: &[u8]) -> Result<Vec<SourceExtension>, ProtocolError> {
    let mut out = Vec::new();
    let mut p = 0usize;

    while p < buf.len() {
        let kind = buf[p];
        p += 1;
        match kind {
            EXT_SOURCE_DOMAIN => {
                if p >= buf.len() {
                    return Err(ProtocolError::InvalidExtension);
                }
                let dom_len = buf[p] as usize;
                p += 1;
                if dom_len > buf.len() - p {
                    return Err(ProtocolError::InvalidExtension);
                }
                out.push(SourceExtension::Domain(buf[p..p + dom_len].to_vec()));
                p += dom_len;
            }
            EXT_SOURCE_IP4 => {
                if buf.len() - p < 4 {
                    return Err(ProtocolError::InvalidExtension);
                }
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&buf[p..p + 4]);
                out.push(SourceExtension::Ip4(Ipv4Addr::from(octets)));
                p += 4;
            }
            EXT_SOURCE_IP6 => {
                if buf.len() - p < 16 {
                    return Err(ProtocolError::InvalidExtension);
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[p..p + 16]);
                out.push(SourceExtension::Ip6(Ipv6Addr::from(octets)));
                p += 16;
            }
            _ => return Err(ProtocolError::InvalidExtension),
        }
    }

    Ok(out)
}

/// Serializes a command back to its wire form (fixed part, shingle block,
/// extensions). Used by clients, the peer pipe codec and the tests.
pub fn encode_command(cmd: &Command) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        COMMAND_SIZE + if cmd.shingle.is_some() { SHINGLE_BLOCK_SIZE } else { 0 },
    );
    out.push(cmd.version);
    out.push(cmd.cmd.to_wire());
    out.push(cmd.shingles_count);
    out.push(0); // reserved
    out.extend_from_slice(&cmd.flag.to_le_bytes());
    out.extend_from_slice(&cmd.tag.to_le_bytes());
    out.extend_from_slice(&cmd.digest);

    if let Some(shingle) = &cmd.shingle {
        out.push(shingle.alg);
        out.extend_from_slice(&shingle.seed.to_le_bytes());
        for hash in &shingle.hashes {
            out.extend_from_slice(&hash.to_le_bytes());
        }
    }

    for ext in &cmd.extensions {
        match ext {
            SourceExtension::Domain(name) => {
                out.push(EXT_SOURCE_DOMAIN);
                out.push(name.len().min(u8::MAX as usize) as u8);
                out.extend_from_slice(&name[..name.len().min(u8::MAX as usize)]);
            }
            SourceExtension::Ip4(addr) => {
                out.push(EXT_SOURCE_IP4);
                out.extend_from_slice(&addr.octets());
            }
            SourceExtension::Ip6(addr) => {
                out.push(EXT_SOURCE_IP6);
                out.extend_from_slice(&addr.octets());
            }
        }
    }

    out
}

/// Reply payload. v1 layout is value/prob/flag/tag; epochs past EPOCH10
/// append the hash timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Reply {
    pub value: i32,
    pub prob: f32,
    pub flag: u32,
    pub tag: u32,
    pub ts: u64,
}

impl Reply {
    /// Blanks the reply before encryption: used for delayed hashes and
    /// forbidden flags.
    pub fn blank(&mut self) {
        self.ts = 0;
        self.prob = 0.0;
        self.value = 0;
    }

    pub fn encoded_len(epoch: Epoch) -> usize {
        if epoch > Epoch::Epoch10 {
            REPLY_V2_SIZE
        } else {
            REPLY_V1_SIZE
        }
    }

    pub fn encode(&self, epoch: Epoch) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::encoded_len(epoch));
        out.extend_from_slice(&self.value.to_le_bytes());
        out.extend_from_slice(&self.prob.to_le_bytes());
        out.extend_from_slice(&self.flag.to_le_bytes());
        out.extend_from_slice(&self.tag.to_le_bytes());
        if epoch > Epoch::Epoch10 {
            out.extend_from_slice(&self.ts.to_le_bytes());
        }
        out
    }

    pub fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < REPLY_V1_SIZE {
            return Err(ProtocolError::Truncated);
        }
        let value = i32::from_le_bytes(buf[0..4].try_into().unwrap());
        let prob = f32::from_le_bytes(buf[4..8].try_into().unwrap());
        let flag = parse_u32_le(&buf[8..12]);
        let tag = parse_u32_le(&buf[12..16]);
        let ts = if buf.len() >= REPLY_V2_SIZE {
            parse_u64_le(&buf[16..24])
        } else {
            0
        };
        Ok(Self {
            value,
            prob,
            flag,
            tag,
            ts,
        })
    }
}
