use aes::Aes128;
use cipher::{BlockDecrypt, KeyInit};
use cmac::{Cmac, Mac};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

/// Session-vector prefix for the SUN MAC (NXP AN12196, SV2).
const SV2_PREFIX: [u8; 6] = [0x3c, 0xc3, 0x00, 0x01, 0x00, 0x80];

pub const ZERO_KEY: &str = "00000000000000000000000000000000";

#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("ciphertext must be 16 bytes")]
    BadCiphertextLength,
    #[error("AES key must be 16 bytes of hex")]
    BadKey,
    #[error("UID must be 7 bytes")]
    BadUidLength,
    #[error("counter must be 3 bytes")]
    BadCounterLength,
    #[error("invalid SUN plaintext format")]
    BadFormat,
    #[error("invalid hex: {0}")]
    BadHex(#[from] hex::FromHexError),
}

/// A 16-byte AES key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AesKey([u8; 16]);

impl AesKey {
    pub fn from_hex(s: &str) -> Result<Self, CodecError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 16] = bytes.try_into().map_err(|_| CodecError::BadKey)?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for AesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Serialize for AesKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for AesKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// A 7-byte card UID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardUid([u8; 7]);

impl CardUid {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let arr: [u8; 7] = bytes.try_into().map_err(|_| CodecError::BadUidLength)?;
        Ok(Self(arr))
    }

    pub fn from_hex(s: &str) -> Result<Self, CodecError> {
        let bytes = hex::decode(s)?;
        Self::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 7] {
        &self.0
    }

    /// Hex comparison tolerating case variance between card firmware and
    /// stored records.
    pub fn matches_hex(&self, other: &str) -> bool {
        self.to_string().eq_ignore_ascii_case(other)
    }
}

impl fmt::Display for CardUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Serialize for CardUid {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for CardUid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Tap counter for replay protection, 24-bit little-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Counter(u32);

impl Counter {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() != 3 {
            return Err(CodecError::BadCounterLength);
        }
        let value = u32::from(bytes[2]) << 16 | u32::from(bytes[1]) << 8 | u32::from(bytes[0]);
        Ok(Self(value))
    }

    pub fn to_bytes(&self) -> [u8; 3] {
        [
            (self.0 & 0xff) as u8,
            ((self.0 >> 8) & 0xff) as u8,
            ((self.0 >> 16) & 0xff) as u8,
        ]
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Decrypt a SUN message and extract the UID and tap counter.
///
/// The PICC data is a single 16-byte block encrypted CBC with an all-zero
/// IV, so decryption reduces to one raw block decrypt. Plaintext layout:
/// `C7 | uid[7] | counter[3] | pad[5]`.
pub fn decrypt_sun(key: &AesKey, ciphertext: &[u8]) -> Result<(CardUid, Counter), CodecError> {
    if ciphertext.len() != 16 {
        return Err(CodecError::BadCiphertextLength);
    }

    let cipher = Aes128::new(key.as_bytes().into());
    let mut block = [0u8; 16];
    block.copy_from_slice(ciphertext);
    cipher.decrypt_block((&mut block).into());

    if block[0] != 0xc7 {
        return Err(CodecError::BadFormat);
    }

    let uid = CardUid::from_bytes(&block[1..8])?;
    let counter = Counter::from_bytes(&block[8..11])?;
    Ok((uid, counter))
}

/// Compute the 8-byte SUN MAC for a UID/counter pair.
///
/// Per AN12196: CMAC the SV2 vector (prefix + UID + counter) under the
/// card's CMAC key to derive the session MAC key, CMAC an empty message
/// under that session key, and keep the odd-indexed bytes of the result.
pub fn sun_mac(key: &AesKey, uid: &CardUid, counter: &Counter) -> [u8; 8] {
    let mut sv2 = [0u8; 16];
    sv2[..6].copy_from_slice(&SV2_PREFIX);
    sv2[6..13].copy_from_slice(uid.as_bytes());
    sv2[13..16].copy_from_slice(&counter.to_bytes());

    let mut session = <Cmac<Aes128> as Mac>::new(key.as_bytes().into());
    session.update(&sv2);
    let session_key = session.finalize().into_bytes();

    let full = <Cmac<Aes128> as Mac>::new(&session_key).finalize().into_bytes();

    let mut mac = [0u8; 8];
    for (i, byte) in full.iter().skip(1).step_by(2).enumerate() {
        mac[i] = *byte;
    }
    mac
}
