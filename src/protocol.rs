use std::fmt;

use crate::cipher::{self, CipherError, TuyaCipher, GCM_IV_SIZE, GCM_TAG_SIZE};

// Frame markers
pub const PREFIX: u32 = 0x0000_55AA;
pub const SUFFIX: u32 = 0x0000_AA55;
pub const PREFIX_V35: u32 = 0x0000_6699;
pub const SUFFIX_V35: u32 = 0x0000_9966;

// Sizes
pub const HEADER_SIZE: usize = 16; // prefix(4) + seqno(4) + cmd(4) + length(4)
pub const HEADER_SIZE_V35: usize = 18; // prefix(4) + reserved(2) + seqno(4) + cmd(4) + length(4)
pub const CRC_SIZE: usize = 4;
pub const SUFFIX_SIZE: usize = 4;
pub const FOOTER_SIZE: usize = CRC_SIZE + SUFFIX_SIZE; // 8
pub const HMAC_SIZE: usize = 32;
pub const RETCODE_SIZE: usize = 4;

// Shortest parseable frame: header + retcode + crc + suffix
const MIN_FRAME_SIZE: usize = 24;

/// Protocol version spoken by a device. Selects framing magic, payload
/// layout, cipher algorithm, and whether a session-key handshake runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Version {
    #[default]
    V31,
    V32,
    V33,
    V34,
    V35,
}

impl Version {
    pub fn parse(s: &str) -> Option<Version> {
        match s.trim() {
            "3.1" => Some(Version::V31),
            "3.2" => Some(Version::V32),
            "3.3" => Some(Version::V33),
            "3.4" => Some(Version::V34),
            "3.5" => Some(Version::V35),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Version::V31 => "3.1",
            Version::V32 => "3.2",
            Version::V33 => "3.3",
            Version::V34 => "3.4",
            Version::V35 => "3.5",
        }
    }

    pub fn as_bytes(&self) -> &'static [u8] {
        self.as_str().as_bytes()
    }

    /// v3.4 and v3.5 negotiate an ephemeral session key on connect.
    pub fn requires_handshake(&self) -> bool {
        matches!(self, Version::V34 | Version::V35)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// LAN command words, as ported from the original tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CommandType {
    Udp = 0,
    ApConfig = 1,
    Active = 2,
    SessKeyNegStart = 3,
    SessKeyNegRes = 4,
    SessKeyNegFinish = 5,
    Unbind = 6,
    Control = 7,
    Status = 8,
    HeartBeat = 9,
    DpQuery = 10,
    QueryWifi = 11,
    TokenBind = 12,
    ControlNew = 13,
    EnableWifi = 14,
    WifiInfo = 15,
    DpQueryNew = 16,
    SceneExecute = 17,
    DpRefresh = 18,
    UdpNew = 19,
    ApConfigNew = 20,
    BoardcastLpv34 = 35,
    LanExtStream = 64,
    LanGwActive = 240,
    LanSubDevRequest = 241,
    LanDeleteSubDev = 242,
    LanReportSubDev = 243,
    LanScene = 244,
    LanPublishCloudConfig = 245,
    LanPublishAppConfig = 246,
    LanExportAppConfig = 247,
    LanPublishScenePanel = 248,
    LanRemoveGw = 249,
    LanCheckGwUpdate = 250,
    LanGwUpdate = 251,
    LanSetGwChannel = 252,
}

impl CommandType {
    pub fn from_u32(word: u32) -> Option<CommandType> {
        use CommandType::*;
        Some(match word {
            0 => Udp,
            1 => ApConfig,
            2 => Active,
            3 => SessKeyNegStart,
            4 => SessKeyNegRes,
            5 => SessKeyNegFinish,
            6 => Unbind,
            7 => Control,
            8 => Status,
            9 => HeartBeat,
            10 => DpQuery,
            11 => QueryWifi,
            12 => TokenBind,
            13 => ControlNew,
            14 => EnableWifi,
            15 => WifiInfo,
            16 => DpQueryNew,
            17 => SceneExecute,
            18 => DpRefresh,
            19 => UdpNew,
            20 => ApConfigNew,
            35 => BoardcastLpv34,
            64 => LanExtStream,
            240 => LanGwActive,
            241 => LanSubDevRequest,
            242 => LanDeleteSubDev,
            243 => LanReportSubDev,
            244 => LanScene,
            245 => LanPublishCloudConfig,
            246 => LanPublishAppConfig,
            247 => LanExportAppConfig,
            248 => LanPublishScenePanel,
            249 => LanRemoveGw,
            250 => LanCheckGwUpdate,
            251 => LanGwUpdate,
            252 => LanSetGwChannel,
            _ => return None,
        })
    }

    pub fn as_u32(&self) -> u32 {
        *self as u32
    }
}

// Commands whose payload goes out without the 15-byte version header
const NO_HEADER_CMDS: &[CommandType] = &[CommandType::DpQuery, CommandType::DpRefresh];
const NO_HEADER_CMDS_V34: &[CommandType] = &[
    CommandType::DpQuery,
    CommandType::HeartBeat,
    CommandType::DpQueryNew,
    CommandType::SessKeyNegStart,
    CommandType::SessKeyNegFinish,
    CommandType::DpRefresh,
];

// -- Data types --

/// Decoded frame payload. Devices answer with JSON when they can, short
/// diagnostic strings when they cannot, and raw bytes during the session
/// handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(serde_json::Value),
    Text(String),
    Raw(Vec<u8>),
}

impl Payload {
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Json(_) => false,
            Payload::Text(text) => text.is_empty(),
            Payload::Raw(bytes) => bytes.is_empty(),
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Json(value) => write!(f, "{value}"),
            Payload::Text(text) => f.write_str(text),
            Payload::Raw(bytes) => write!(f, "<{} raw bytes>", bytes.len()),
        }
    }
}

/// A parsed message received from a device.
#[derive(Debug, Clone, PartialEq)]
pub struct TuyaMessage {
    pub seqno: u32,
    pub command: CommandType,
    pub retcode: Option<u32>,
    pub payload: Payload,
}

/// Framing fields plus the undecoded payload. For 55AA frames the payload
/// is still ciphertext; for 6699 frames GCM verification forces decryption
/// during the split, so it is plaintext.
#[derive(Debug)]
pub(crate) struct RawFrame {
    pub seqno: u32,
    pub command: u32,
    pub retcode: Option<u32>,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub enum ProtocolError {
    PrefixMismatch(u32),
    SuffixMismatch(u32),
    TruncatedPayload,
    CrcMismatch { expected: u32, actual: u32 },
    HmacMismatch,
    Decrypt(CipherError),
    UnknownCommand(u32),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::PrefixMismatch(v) => write!(f, "Invalid prefix: {v:#010x}"),
            ProtocolError::SuffixMismatch(v) => write!(f, "Invalid suffix: {v:#010x}"),
            ProtocolError::TruncatedPayload => write!(f, "Payload too short"),
            ProtocolError::CrcMismatch { expected, actual } => {
                write!(f, "CRC mismatch: expected {expected:#010x}, got {actual:#010x}")
            }
            ProtocolError::HmacMismatch => write!(f, "Frame HMAC does not verify"),
            ProtocolError::Decrypt(e) => write!(f, "Payload decryption failed: {e}"),
            ProtocolError::UnknownCommand(v) => write!(f, "Unknown command word: {v}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<CipherError> for ProtocolError {
    fn from(e: CipherError) -> Self {
        ProtocolError::Decrypt(e)
    }
}

// -- Encoding --

fn version_header(version: Version) -> [u8; 15] {
    let mut header = [0u8; 15];
    header[..3].copy_from_slice(version.as_bytes());
    header
}

/// Build a complete frame for sending to the device.
///
/// `encrypt` is only consulted for v3.1, where query commands historically
/// went out in the clear; every later version always encrypts.
pub fn build_frame(
    cipher: &TuyaCipher,
    seqno: u32,
    command: CommandType,
    payload: &[u8],
    encrypt: bool,
) -> Result<Vec<u8>, ProtocolError> {
    match cipher.version() {
        Version::V31 => {
            let body = if encrypt {
                // "3.1" ++ md5 signature ++ base64 ciphertext
                let ct = cipher.encrypt(payload)?;
                let sig = cipher.md5_signature(&ct);
                let mut body = Vec::with_capacity(19 + ct.len());
                body.extend_from_slice(b"3.1");
                body.extend_from_slice(sig.as_bytes());
                body.extend_from_slice(&ct);
                body
            } else {
                payload.to_vec()
            };
            Ok(frame_with_crc(seqno, command, &body))
        }
        Version::V32 | Version::V33 => {
            let ct = cipher.encrypt(payload)?;
            let body = if NO_HEADER_CMDS.contains(&command) {
                ct
            } else {
                let mut body = Vec::with_capacity(15 + ct.len());
                body.extend_from_slice(&version_header(cipher.version()));
                body.extend_from_slice(&ct);
                body
            };
            Ok(frame_with_crc(seqno, command, &body))
        }
        Version::V34 => {
            let mut plaintext = Vec::with_capacity(15 + payload.len());
            if !NO_HEADER_CMDS_V34.contains(&command) {
                plaintext.extend_from_slice(&version_header(Version::V34));
            }
            plaintext.extend_from_slice(payload);
            let ct = cipher.ecb_encrypt_nopad(&cipher::pad_block(&plaintext))?;

            let length = (ct.len() + HMAC_SIZE + SUFFIX_SIZE) as u32;
            let mut frame = Vec::with_capacity(HEADER_SIZE + length as usize);
            frame.extend_from_slice(&PREFIX.to_be_bytes());
            frame.extend_from_slice(&seqno.to_be_bytes());
            frame.extend_from_slice(&command.as_u32().to_be_bytes());
            frame.extend_from_slice(&length.to_be_bytes());
            frame.extend_from_slice(&ct);

            let mac = cipher.hmac(&frame);
            frame.extend_from_slice(&mac);
            frame.extend_from_slice(&SUFFIX.to_be_bytes());
            Ok(frame)
        }
        Version::V35 => {
            let mut plaintext = Vec::with_capacity(15 + payload.len());
            if !NO_HEADER_CMDS_V34.contains(&command) {
                plaintext.extend_from_slice(&version_header(Version::V35));
            }
            plaintext.extend_from_slice(payload);

            // length counts IV + ciphertext + tag; the suffix follows
            let length = (plaintext.len() + GCM_IV_SIZE + GCM_TAG_SIZE) as u32;
            let mut frame = Vec::with_capacity(HEADER_SIZE_V35 + length as usize + SUFFIX_SIZE);
            frame.extend_from_slice(&PREFIX_V35.to_be_bytes());
            frame.extend_from_slice(&[0, 0]);
            frame.extend_from_slice(&seqno.to_be_bytes());
            frame.extend_from_slice(&command.as_u32().to_be_bytes());
            frame.extend_from_slice(&length.to_be_bytes());

            let iv = cipher::gcm_iv_now();
            let ct = cipher.gcm_encrypt(&plaintext, &iv, &frame[4..HEADER_SIZE_V35])?;
            frame.extend_from_slice(&iv);
            frame.extend_from_slice(&ct);
            frame.extend_from_slice(&SUFFIX_V35.to_be_bytes());
            Ok(frame)
        }
    }
}

/// The 55AA outer frame shared by v3.1 through v3.3: CRC32 trailer over
/// header and payload.
fn frame_with_crc(seqno: u32, command: CommandType, payload: &[u8]) -> Vec<u8> {
    let length = (payload.len() + FOOTER_SIZE) as u32;

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len() + FOOTER_SIZE);
    frame.extend_from_slice(&PREFIX.to_be_bytes());
    frame.extend_from_slice(&seqno.to_be_bytes());
    frame.extend_from_slice(&command.as_u32().to_be_bytes());
    frame.extend_from_slice(&length.to_be_bytes());
    frame.extend_from_slice(payload);

    let crc = crc32fast::hash(&frame);
    frame.extend_from_slice(&crc.to_be_bytes());
    frame.extend_from_slice(&SUFFIX.to_be_bytes());
    frame
}

// -- Parsing --

fn be_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Parse a buffer holding one or more whole frames into an ordered list of
/// messages. Validates prefix, suffix, and the per-version integrity
/// trailer; decrypts payloads, falling back to the raw bytes when a
/// firmware answers in the clear.
pub fn parse_frames(cipher: &TuyaCipher, data: &[u8]) -> Result<Vec<TuyaMessage>, ProtocolError> {
    let mut messages = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let (raw, consumed) = split_frame(cipher, rest)?;
        messages.push(decode_message(cipher, raw)?);
        rest = &rest[consumed..];
    }
    Ok(messages)
}

/// Validate framing and integrity without interpreting the payload.
/// Returns the frame fields and the number of bytes consumed.
pub(crate) fn split_frame(
    cipher: &TuyaCipher,
    data: &[u8],
) -> Result<(RawFrame, usize), ProtocolError> {
    if data.len() < MIN_FRAME_SIZE {
        return Err(ProtocolError::TruncatedPayload);
    }
    match be_u32(data, 0) {
        PREFIX => split_frame_55aa(cipher, data),
        PREFIX_V35 => split_frame_6699(cipher, data),
        other => Err(ProtocolError::PrefixMismatch(other)),
    }
}

fn split_frame_55aa(
    cipher: &TuyaCipher,
    data: &[u8],
) -> Result<(RawFrame, usize), ProtocolError> {
    let seqno = be_u32(data, 4);
    let command = be_u32(data, 8);
    let length = be_u32(data, 12) as usize;

    let total = HEADER_SIZE + length;
    if data.len() < total || length < FOOTER_SIZE {
        return Err(ProtocolError::TruncatedPayload);
    }

    let suffix = be_u32(data, total - SUFFIX_SIZE);
    if suffix != SUFFIX {
        return Err(ProtocolError::SuffixMismatch(suffix));
    }

    // v3.4 closes frames with a 32-byte HMAC instead of a CRC
    let payload_end = if cipher.version() == Version::V34 {
        let trailer = HMAC_SIZE + SUFFIX_SIZE;
        if length < trailer {
            return Err(ProtocolError::TruncatedPayload);
        }
        let mac_offset = total - trailer;
        let expected = &data[mac_offset..total - SUFFIX_SIZE];
        if cipher.hmac(&data[..mac_offset]) != expected {
            return Err(ProtocolError::HmacMismatch);
        }
        mac_offset
    } else {
        let crc_offset = total - FOOTER_SIZE;
        let expected = be_u32(data, crc_offset);
        let actual = crc32fast::hash(&data[..crc_offset]);
        if expected != actual {
            return Err(ProtocolError::CrcMismatch { expected, actual });
        }
        crc_offset
    };

    // Device frames carry a return code ahead of the payload; frames we
    // built ourselves (and some broadcasts) do not. Top 24 bits zero is
    // the discriminator.
    let mut payload_start = HEADER_SIZE;
    let mut retcode = None;
    if payload_end >= payload_start + RETCODE_SIZE {
        let word = be_u32(data, payload_start);
        if word & 0xFFFF_FF00 == 0 {
            retcode = Some(word);
            payload_start += RETCODE_SIZE;
        }
    }

    Ok((
        RawFrame {
            seqno,
            command,
            retcode,
            payload: data[payload_start..payload_end].to_vec(),
        },
        total,
    ))
}

fn split_frame_6699(
    cipher: &TuyaCipher,
    data: &[u8],
) -> Result<(RawFrame, usize), ProtocolError> {
    let seqno = be_u32(data, 6);
    let command = be_u32(data, 10);
    let length = be_u32(data, 14) as usize;

    let total = HEADER_SIZE_V35 + length + SUFFIX_SIZE;
    if data.len() < total || length < GCM_IV_SIZE + GCM_TAG_SIZE {
        return Err(ProtocolError::TruncatedPayload);
    }

    let suffix = be_u32(data, total - SUFFIX_SIZE);
    if suffix != SUFFIX_V35 {
        return Err(ProtocolError::SuffixMismatch(suffix));
    }

    // GCM verification doubles as the integrity check; the header past the
    // prefix is authenticated as AAD.
    let iv = &data[HEADER_SIZE_V35..HEADER_SIZE_V35 + GCM_IV_SIZE];
    let ct = &data[HEADER_SIZE_V35 + GCM_IV_SIZE..HEADER_SIZE_V35 + length];
    let aad = &data[4..HEADER_SIZE_V35];
    let mut plaintext = cipher.gcm_decrypt(ct, iv, aad)?;

    let mut retcode = None;
    if plaintext.len() >= RETCODE_SIZE {
        let word = be_u32(&plaintext, 0);
        if word & 0xFFFF_FF00 == 0 {
            retcode = Some(word);
            plaintext.drain(..RETCODE_SIZE);
        }
    }

    Ok((
        RawFrame {
            seqno,
            command,
            retcode,
            payload: plaintext,
        },
        total,
    ))
}

fn decode_message(cipher: &TuyaCipher, raw: RawFrame) -> Result<TuyaMessage, ProtocolError> {
    let command = CommandType::from_u32(raw.command)
        .ok_or(ProtocolError::UnknownCommand(raw.command))?;

    let version = cipher.version();
    let payload = if raw.payload.is_empty() {
        Payload::Text(String::new())
    } else if version == Version::V35 {
        // Already decrypted during the split; only the preamble remains
        let body = cipher::strip_version_preamble(version, &raw.payload);
        bytes_to_payload(version, body.to_vec())
    } else {
        match cipher.decrypt(&raw.payload) {
            Ok(plaintext) => bytes_to_payload(version, plaintext),
            // Plaintext answers (v3.1 queries, some broadcasts) land here
            Err(_) => bytes_to_payload(version, raw.payload),
        }
    };

    Ok(TuyaMessage {
        seqno: raw.seqno,
        command,
        retcode: raw.retcode,
        payload,
    })
}

fn bytes_to_payload(version: Version, bytes: Vec<u8>) -> Payload {
    if bytes.is_empty() {
        return Payload::Text(String::new());
    }
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&bytes) {
        return Payload::Json(unwrap_envelope(version, value));
    }
    match String::from_utf8(bytes) {
        Ok(text) => Payload::Text(text),
        Err(e) => Payload::Raw(e.into_bytes()),
    }
}

/// v3.4/v3.5 devices answer with `{"protocol":…,"t":…,"data":{…}}`; the
/// caller only cares about `data`, with the timestamp folded back in.
fn unwrap_envelope(version: Version, value: serde_json::Value) -> serde_json::Value {
    if !version.requires_handshake() {
        return value;
    }
    let serde_json::Value::Object(ref map) = value else {
        return value;
    };
    match (map.get("data"), map.get("t")) {
        (Some(serde_json::Value::Object(data)), Some(t)) => {
            let mut unwrapped = data.clone();
            unwrapped.insert("t".to_owned(), t.clone());
            serde_json::Value::Object(unwrapped)
        }
        _ => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const KEY: [u8; 16] = *b"4226aa407d5c1e2b";

    fn cipher(version: Version) -> TuyaCipher {
        TuyaCipher::new(KEY, version)
    }

    fn dp_query_payload() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "devId": "002004265ccf7fb1b659",
            "dps": {"1": true, "2": 0}
        }))
        .expect("JSON serialization cannot fail for known-good data")
    }

    #[test]
    fn v31_plaintext_roundtrip() {
        let cipher = cipher(Version::V31);
        let frame = build_frame(&cipher, 3, CommandType::DpQuery, &dp_query_payload(), false)
            .unwrap();

        let messages = parse_frames(&cipher, &frame).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].seqno, 3);
        assert_eq!(messages[0].command, CommandType::DpQuery);
        assert_eq!(messages[0].command.as_u32(), 10);
        assert_eq!(
            messages[0].payload,
            Payload::Json(json!({
                "devId": "002004265ccf7fb1b659",
                "dps": {"1": true, "2": 0}
            }))
        );
    }

    #[test]
    fn v31_encrypted_roundtrip_carries_signature() {
        let cipher = cipher(Version::V31);
        let frame =
            build_frame(&cipher, 1, CommandType::Control, &dp_query_payload(), true).unwrap();

        // Preamble: "3.1" + 16 hex chars of signature
        assert_eq!(&frame[HEADER_SIZE..HEADER_SIZE + 3], b"3.1");
        assert!(frame[HEADER_SIZE + 3..HEADER_SIZE + 19]
            .iter()
            .all(|b| b.is_ascii_hexdigit()));

        let messages = parse_frames(&cipher, &frame).unwrap();
        assert_eq!(
            messages[0].payload.as_json().unwrap()["devId"],
            "002004265ccf7fb1b659"
        );
    }

    #[test]
    fn v33_control_has_version_header_and_query_does_not() {
        let cipher = cipher(Version::V33);
        let control =
            build_frame(&cipher, 1, CommandType::Control, &dp_query_payload(), true).unwrap();
        assert_eq!(&control[HEADER_SIZE..HEADER_SIZE + 3], b"3.3");

        let query =
            build_frame(&cipher, 2, CommandType::DpQuery, &dp_query_payload(), true).unwrap();
        assert_ne!(&query[HEADER_SIZE..HEADER_SIZE + 3], b"3.3");
    }

    #[test]
    fn v33_roundtrip() {
        let cipher = cipher(Version::V33);
        for command in [CommandType::Control, CommandType::DpQuery] {
            let frame = build_frame(&cipher, 7, command, &dp_query_payload(), true).unwrap();
            let messages = parse_frames(&cipher, &frame).unwrap();
            assert_eq!(messages[0].command, command);
            assert_eq!(
                messages[0].payload.as_json().unwrap()["dps"],
                json!({"1": true, "2": 0})
            );
        }
    }

    #[test]
    fn v34_roundtrip_with_hmac() {
        let cipher = cipher(Version::V34);
        let frame =
            build_frame(&cipher, 9, CommandType::ControlNew, &dp_query_payload(), true).unwrap();
        let messages = parse_frames(&cipher, &frame).unwrap();
        assert_eq!(messages[0].seqno, 9);
        assert_eq!(messages[0].command, CommandType::ControlNew);
        assert_eq!(
            messages[0].payload.as_json().unwrap()["devId"],
            "002004265ccf7fb1b659"
        );
    }

    #[test]
    fn v34_hmac_corruption_is_rejected() {
        let cipher = cipher(Version::V34);
        let mut frame =
            build_frame(&cipher, 9, CommandType::ControlNew, &dp_query_payload(), true).unwrap();
        let mac_offset = frame.len() - SUFFIX_SIZE - HMAC_SIZE;
        frame[mac_offset] ^= 0xFF;
        assert!(matches!(
            parse_frames(&cipher, &frame),
            Err(ProtocolError::HmacMismatch)
        ));
    }

    #[test]
    fn v35_roundtrip() {
        let cipher = cipher(Version::V35);
        let frame =
            build_frame(&cipher, 11, CommandType::ControlNew, &dp_query_payload(), true).unwrap();
        assert_eq!(be_u32(&frame, 0), PREFIX_V35);
        assert_eq!(be_u32(&frame, frame.len() - 4), SUFFIX_V35);

        let messages = parse_frames(&cipher, &frame).unwrap();
        assert_eq!(messages[0].seqno, 11);
        assert_eq!(
            messages[0].payload.as_json().unwrap()["dps"],
            json!({"1": true, "2": 0})
        );
    }

    #[test]
    fn v35_tag_corruption_is_rejected() {
        let cipher = cipher(Version::V35);
        let mut frame =
            build_frame(&cipher, 11, CommandType::ControlNew, &dp_query_payload(), true).unwrap();
        let tag_offset = frame.len() - SUFFIX_SIZE - GCM_TAG_SIZE;
        frame[tag_offset] ^= 0x01;
        assert!(matches!(
            parse_frames(&cipher, &frame),
            Err(ProtocolError::Decrypt(_))
        ));
    }

    #[test]
    fn multi_frame_buffer_parses_in_order() {
        let cipher = cipher(Version::V33);
        let frame = build_frame(&cipher, 5, CommandType::DpQuery, &dp_query_payload(), true)
            .unwrap();
        let mut doubled = frame.clone();
        doubled.extend_from_slice(&frame);

        let single = parse_frames(&cipher, &frame).unwrap();
        let messages = parse_frames(&cipher, &doubled).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], single[0]);
        assert_eq!(messages[1], single[0]);
    }

    #[test]
    fn crc_corruption_is_rejected() {
        let cipher = cipher(Version::V31);
        let mut frame = build_frame(&cipher, 1, CommandType::DpQuery, &dp_query_payload(), false)
            .unwrap();
        let crc_offset = frame.len() - FOOTER_SIZE;
        frame[crc_offset..crc_offset + 4].copy_from_slice(&0xDEADBEEFu32.to_be_bytes());
        assert!(matches!(
            parse_frames(&cipher, &frame),
            Err(ProtocolError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let cipher = cipher(Version::V33);
        let frame = build_frame(&cipher, 1, CommandType::DpQuery, &dp_query_payload(), true)
            .unwrap();
        for cut in [frame.len() - 1, frame.len() - 7, MIN_FRAME_SIZE - 1, 1] {
            assert!(matches!(
                parse_frames(&cipher, &frame[..cut]),
                Err(ProtocolError::TruncatedPayload)
            ));
        }
    }

    #[test]
    fn bad_prefix_is_rejected() {
        let cipher = cipher(Version::V33);
        let mut frame = build_frame(&cipher, 1, CommandType::DpQuery, &dp_query_payload(), true)
            .unwrap();
        frame[0] = 0x42;
        assert!(matches!(
            parse_frames(&cipher, &frame),
            Err(ProtocolError::PrefixMismatch(_))
        ));
    }

    #[test]
    fn bad_suffix_is_rejected() {
        let cipher = cipher(Version::V33);
        let mut frame = build_frame(&cipher, 1, CommandType::DpQuery, &dp_query_payload(), true)
            .unwrap();
        let len = frame.len();
        frame[len - 4..].copy_from_slice(&0x12345678u32.to_be_bytes());
        assert!(matches!(
            parse_frames(&cipher, &frame),
            Err(ProtocolError::SuffixMismatch(_))
        ));
    }

    #[test]
    fn unknown_command_is_rejected() {
        let cipher = cipher(Version::V31);
        let frame = frame_with_crc(1, CommandType::DpQuery, b"{}");
        let mut bad = frame.clone();
        bad[8..12].copy_from_slice(&999u32.to_be_bytes());
        // Re-seal the CRC so only the command word is wrong
        let crc_offset = bad.len() - FOOTER_SIZE;
        let crc = crc32fast::hash(&bad[..crc_offset]);
        bad[crc_offset..crc_offset + 4].copy_from_slice(&crc.to_be_bytes());
        assert!(matches!(
            parse_frames(&cipher, &bad),
            Err(ProtocolError::UnknownCommand(999))
        ));
    }

    #[test]
    fn device_heartbeat_ack_vector() {
        // Captured from a live device: empty heartbeat ack with retcode 0
        let packet =
            hex::decode("000055aa00000000000000090000000c00000000b051ab030000aa55").unwrap();
        let messages = parse_frames(&cipher(Version::V31), &packet).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].command, CommandType::HeartBeat);
        assert_eq!(messages[0].seqno, 0);
        assert_eq!(messages[0].retcode, Some(0));
        assert!(messages[0].payload.is_empty());
    }

    #[test]
    fn device_error_string_vector() {
        // A v3.3 device rejecting a control request, encrypted with the
        // well-known broadcast key
        let packet = hex::decode(
            "000055aa00000000000000070000003b00000001332e33d504910232d355a59ed1f6ed1f4a816a1e8e\
             30ed09987c020ae45d72c70592bb233c79c43a5b9ae49b6ead38725deb520000aa55",
        )
        .unwrap();
        let udp_cipher = TuyaCipher::new(crate::cipher::UDP_KEY, Version::V33);
        let messages = parse_frames(&udp_cipher, &packet).unwrap();
        assert_eq!(messages[0].command, CommandType::Control);
        assert_eq!(messages[0].retcode, Some(1));
        assert_eq!(messages[0].payload, Payload::Text("data format error".to_owned()));
    }

    #[test]
    fn v34_envelope_is_unwrapped() {
        let cipher = cipher(Version::V34);
        let payload = serde_json::to_vec(&json!({
            "protocol": 5,
            "t": 1700000000,
            "data": {"dps": {"1": true}}
        }))
        .unwrap();
        let frame = build_frame(&cipher, 2, CommandType::Status, &payload, true).unwrap();
        let messages = parse_frames(&cipher, &frame).unwrap();
        assert_eq!(
            messages[0].payload,
            Payload::Json(json!({"dps": {"1": true}, "t": 1700000000}))
        );
    }

    #[test]
    fn version_parse_and_display() {
        for (text, version) in [
            ("3.1", Version::V31),
            ("3.2", Version::V32),
            ("3.3", Version::V33),
            ("3.4", Version::V34),
            ("3.5", Version::V35),
        ] {
            assert_eq!(Version::parse(text), Some(version));
            assert_eq!(version.to_string(), text);
        }
        assert_eq!(Version::parse("4.0"), None);
    }
}
