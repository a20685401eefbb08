use aes::cipher::block_padding::{NoPadding, Pkcs7};
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit};
use aes_gcm::aead::{Aead, Payload as AeadPayload};
use aes_gcm::{Aes128Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::protocol::Version;

type Aes128EcbEnc = ecb::Encryptor<aes::Aes128>;
type Aes128EcbDec = ecb::Decryptor<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

const AES_BLOCK_SIZE: usize = 16;

/// GCM nonce length used by the v3.5 wire format.
pub const GCM_IV_SIZE: usize = 12;
/// GCM authentication tag length used by the v3.5 wire format.
pub const GCM_TAG_SIZE: usize = 16;

/// The broadcast key every firmware shares: MD5("yGAdlopoPVldABfn").
/// Hard-coded so discovery does not need to hash at startup.
pub const UDP_KEY: [u8; 16] = [
    0x6c, 0x1e, 0xc8, 0xe2, 0xbb, 0x9b, 0xb5, 0x9a, 0xb5, 0x0b, 0x0d, 0xaf, 0x64, 0x9b, 0x41, 0x0a,
];

#[derive(Debug)]
pub enum CipherError {
    DecryptionFailed,
    BlockAlignment(usize),
    Base64Invalid,
    AadRequired,
}

impl fmt::Display for CipherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CipherError::DecryptionFailed => write!(f, "AES decryption failed"),
            CipherError::BlockAlignment(n) => {
                write!(f, "Input length {n} is not a multiple of the AES block size")
            }
            CipherError::Base64Invalid => write!(f, "Payload is not valid Base64"),
            CipherError::AadRequired => {
                write!(f, "v3.5 GCM needs the frame header as AAD; use gcm_encrypt/gcm_decrypt")
            }
        }
    }
}

impl std::error::Error for CipherError {}

/// Per-device cipher state. Holds the pre-provisioned local key and,
/// for v3.4/v3.5 after session negotiation, the ephemeral session key.
/// All crypto uses the session key when one is installed.
#[derive(Clone)]
pub struct TuyaCipher {
    local_key: [u8; 16],
    session_key: Option<[u8; 16]>,
    version: Version,
}

impl fmt::Debug for TuyaCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TuyaCipher")
            .field("version", &self.version)
            .field("has_session_key", &self.session_key.is_some())
            .finish_non_exhaustive()
    }
}

impl TuyaCipher {
    pub fn new(local_key: [u8; 16], version: Version) -> Self {
        TuyaCipher {
            local_key,
            session_key: None,
            version,
        }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Re-seat the cipher when discovery reports a different protocol version.
    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub fn set_session_key(&mut self, key: [u8; 16]) {
        self.session_key = Some(key);
    }

    pub fn clear_session_key(&mut self) {
        self.session_key = None;
    }

    pub fn local_key(&self) -> &[u8; 16] {
        &self.local_key
    }

    fn active_key(&self) -> &[u8; 16] {
        self.session_key.as_ref().unwrap_or(&self.local_key)
    }

    // -- Version-dispatched encrypt / decrypt --

    /// Encrypt a payload the way the device expects for this version.
    ///
    /// v3.1 produces Base64 text; v3.2/v3.3 raw ECB blocks; v3.4 unpadded
    /// ECB over a caller-padded plaintext. v3.5 is deliberately not
    /// dispatched here: its GCM authenticates the frame header as AAD,
    /// which only the frame codec knows, so v3.5 traffic must go through
    /// `gcm_encrypt` with the header supplied.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        match self.version {
            Version::V31 => {
                let ct = self.ecb_encrypt_pkcs7(plaintext);
                Ok(BASE64.encode(ct).into_bytes())
            }
            Version::V32 | Version::V33 => Ok(self.ecb_encrypt_pkcs7(plaintext)),
            Version::V34 => self.ecb_encrypt_nopad(&pad_block(plaintext)),
            Version::V35 => Err(CipherError::AadRequired),
        }
    }

    /// Decrypt a payload, stripping any plaintext version preamble first.
    /// v3.5 is rejected here for the same reason as in `encrypt`: the tag
    /// covers header AAD that must come from the frame codec, via
    /// `gcm_decrypt`.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CipherError> {
        match self.version {
            Version::V31 => {
                // "3.1" + 16-char MD5 signature precede the Base64 body
                let body = if data.starts_with(b"3.1") && data.len() > 19 {
                    &data[19..]
                } else {
                    data
                };
                let ct = BASE64.decode(body).map_err(|_| CipherError::Base64Invalid)?;
                self.ecb_decrypt_pkcs7(&ct)
            }
            Version::V32 | Version::V33 => {
                let ct = strip_version_preamble(self.version, data);
                self.ecb_decrypt_pkcs7(ct)
            }
            Version::V34 => {
                let pt = self.ecb_decrypt_nopad(data)?;
                let pt = unpad_block(pt);
                Ok(strip_version_preamble(self.version, &pt).to_vec())
            }
            Version::V35 => Err(CipherError::AadRequired),
        }
    }

    // -- ECB primitives --

    fn ecb_encrypt_pkcs7(&self, plaintext: &[u8]) -> Vec<u8> {
        // PKCS7 padded size: next multiple of 16
        let padded_len = (plaintext.len() / AES_BLOCK_SIZE + 1) * AES_BLOCK_SIZE;
        let mut buf = vec![0u8; padded_len];
        buf[..plaintext.len()].copy_from_slice(plaintext);

        let encrypted = Aes128EcbEnc::new(self.active_key().into())
            .encrypt_padded_mut::<Pkcs7>(&mut buf, plaintext.len())
            .expect("buffer is correctly sized for PKCS7 padding");

        encrypted.to_vec()
    }

    fn ecb_decrypt_pkcs7(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut buf = ciphertext.to_vec();

        let decrypted = Aes128EcbDec::new(self.active_key().into())
            .decrypt_padded_mut::<Pkcs7>(&mut buf)
            .map_err(|_| CipherError::DecryptionFailed)?;

        Ok(decrypted.to_vec())
    }

    /// Unpadded ECB encrypt; the input must already be block-aligned.
    pub(crate) fn ecb_encrypt_nopad(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        if plaintext.len() % AES_BLOCK_SIZE != 0 {
            return Err(CipherError::BlockAlignment(plaintext.len()));
        }
        let mut buf = plaintext.to_vec();
        let len = buf.len();
        let encrypted = Aes128EcbEnc::new(self.active_key().into())
            .encrypt_padded_mut::<NoPadding>(&mut buf, len)
            .map_err(|_| CipherError::BlockAlignment(len))?;
        Ok(encrypted.to_vec())
    }

    pub(crate) fn ecb_decrypt_nopad(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        if ciphertext.len() % AES_BLOCK_SIZE != 0 {
            return Err(CipherError::BlockAlignment(ciphertext.len()));
        }
        let mut buf = ciphertext.to_vec();
        let decrypted = Aes128EcbDec::new(self.active_key().into())
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .map_err(|_| CipherError::DecryptionFailed)?;
        Ok(decrypted.to_vec())
    }

    // -- GCM primitives (v3.5) --

    /// AES-128-GCM encrypt. Returns ciphertext followed by the 16-byte tag.
    pub(crate) fn gcm_encrypt(
        &self,
        plaintext: &[u8],
        iv: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CipherError> {
        let cipher = Aes128Gcm::new(self.active_key().into());
        cipher
            .encrypt(Nonce::from_slice(iv), AeadPayload { msg: plaintext, aad })
            .map_err(|_| CipherError::DecryptionFailed)
    }

    /// AES-128-GCM decrypt of ciphertext-plus-tag. Tag mismatch is an error.
    pub(crate) fn gcm_decrypt(
        &self,
        ciphertext: &[u8],
        iv: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CipherError> {
        let cipher = Aes128Gcm::new(self.active_key().into());
        cipher
            .decrypt(Nonce::from_slice(iv), AeadPayload { msg: ciphertext, aad })
            .map_err(|_| CipherError::DecryptionFailed)
    }

    // -- MAC / hash / random --

    /// The v3.1 request signature: MD5 of "data=<ct>||lpv=3.1||<key>",
    /// keeping hex digits 8..24.
    pub fn md5_signature(&self, ciphertext: &[u8]) -> String {
        let mut buf = Vec::with_capacity(ciphertext.len() + 32);
        buf.extend_from_slice(b"data=");
        buf.extend_from_slice(ciphertext);
        buf.extend_from_slice(b"||lpv=3.1||");
        buf.extend_from_slice(&self.local_key);
        let digest = format!("{:x}", md5::compute(&buf));
        digest[8..24].to_owned()
    }

    /// HMAC-SHA256 under the active key. v3.4 frame trailers and the
    /// session-key handshake both use this.
    pub fn hmac(&self, data: &[u8]) -> [u8; 32] {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(self.active_key())
            .expect("HMAC accepts keys of any length");
        mac.update(data);
        mac.finalize().into_bytes().into()
    }

    /// Cryptographically secure 16-byte nonce for session negotiation.
    pub fn random_nonce() -> [u8; 16] {
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);
        nonce
    }
}

/// PKCS7-style fill applied unconditionally: an aligned input still gains a
/// full 0x10 block. The v3.4 wire format expects this before unpadded ECB.
pub(crate) fn pad_block(data: &[u8]) -> Vec<u8> {
    let pad = AES_BLOCK_SIZE - data.len() % AES_BLOCK_SIZE;
    let mut out = Vec::with_capacity(data.len() + pad);
    out.extend_from_slice(data);
    out.extend(std::iter::repeat(pad as u8).take(pad));
    out
}

/// Strip a PKCS7 pad, but only a well-formed one. Binary payloads whose
/// last byte merely looks like a pad length are left untouched.
fn unpad_block(mut data: Vec<u8>) -> Vec<u8> {
    let Some(&pad) = data.last() else {
        return data;
    };
    let pad = pad as usize;
    if pad == 0 || pad > AES_BLOCK_SIZE || pad > data.len() {
        return data;
    }
    if data[data.len() - pad..].iter().all(|&b| b as usize == pad) {
        data.truncate(data.len() - pad);
    }
    data
}

/// Drop the 15-byte "<version>" + 12-filler preamble some firmwares put in
/// front of the ciphertext or plaintext.
pub(crate) fn strip_version_preamble(version: Version, data: &[u8]) -> &[u8] {
    if data.len() >= 15 && data.starts_with(version.as_bytes()) {
        &data[15..]
    } else {
        data
    }
}

/// v3.5 GCM IV: decimal text of now-in-ms times ten, truncated to 12 bytes.
pub(crate) fn gcm_iv_now() -> [u8; GCM_IV_SIZE] {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let digits = (ms * 10).to_string();
    let mut iv = [b'0'; GCM_IV_SIZE];
    let n = digits.len().min(GCM_IV_SIZE);
    iv[..n].copy_from_slice(&digits.as_bytes()[..n]);
    iv
}
