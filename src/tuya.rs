//! Minimal Tuya local-protocol client, protocol versions 3.1 and 3.3.
//!
//! The meter speaks a framed TCP protocol: a 16-byte header (prefix,
//! sequence, command, length), an optional status word on responses, a
//! payload, then CRC32 and a fixed suffix, all big-endian. Version 3.1
//! status payloads travel as plaintext JSON; 3.3 payloads are AES-128-ECB
//! under the device's local key. Versions 3.4 and later add a session-key
//! handshake and are not supported.

use crate::config::DeviceConfig;
use crate::device::{DeviceClient, DeviceError, StatusResponse};
use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, info};

const FRAME_PREFIX: u32 = 0x0000_55AA;
const FRAME_SUFFIX: u32 = 0x0000_AA55;

/// Command word requesting the current data-point status.
const CMD_DP_QUERY: u32 = 0x0a;

const HEADER_LEN: usize = 16;
/// CRC32 plus suffix.
const TAIL_LEN: usize = 8;
/// Upper bound accepted for a frame body.
const MAX_BODY_LEN: usize = 64 * 1024;

/// Plaintext announcement broadcasts (3.1 devices).
const DISCOVERY_PORT_PLAIN: u16 = 6666;
/// Encrypted announcement broadcasts (3.3 devices).
const DISCOVERY_PORT_ENCRYPTED: u16 = 6667;
/// All 3.3 devices encrypt announcements with the key derived from this seed.
const DISCOVERY_KEY_SEED: &[u8] = b"yGAdlopoPVldABfn";
/// Devices announce every few seconds; this allows several missed rounds.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(20);

/// Supported local-protocol versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    V31,
    V33,
}

impl ProtocolVersion {
    /// Parse the configuration string form ("3.1", "3.3").
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "3.1" => Some(Self::V31),
            "3.3" => Some(Self::V33),
            _ => None,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V31 => write!(f, "3.1"),
            Self::V33 => write!(f, "3.3"),
        }
    }
}

/// AES-128-ECB with PKCS#7 padding, the 3.3 payload cipher.
struct PayloadCipher {
    cipher: Aes128,
}

impl PayloadCipher {
    fn new(key: &[u8; 16]) -> Self {
        Self {
            cipher: Aes128::new(GenericArray::from_slice(key)),
        }
    }

    fn encrypt(&self, plain: &[u8]) -> Vec<u8> {
        let mut buf = plain.to_vec();
        let pad = 16 - buf.len() % 16;
        buf.resize(buf.len() + pad, pad as u8);
        for block in buf.chunks_exact_mut(16) {
            self.cipher
                .encrypt_block(GenericArray::from_mut_slice(block));
        }
        buf
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, DeviceError> {
        if data.is_empty() || data.len() % 16 != 0 {
            return Err(DeviceError::Protocol(format!(
                "Ciphertext length {} is not a positive multiple of the block size",
                data.len()
            )));
        }
        let mut buf = data.to_vec();
        for block in buf.chunks_exact_mut(16) {
            self.cipher
                .decrypt_block(GenericArray::from_mut_slice(block));
        }
        let pad = usize::from(buf[buf.len() - 1]);
        if pad == 0 || pad > 16 {
            return Err(DeviceError::Protocol(format!(
                "Invalid padding byte {}",
                pad
            )));
        }
        buf.truncate(buf.len() - pad);
        Ok(buf)
    }
}

/// A parsed frame body.
#[derive(Debug)]
struct Frame {
    seqno: u32,
    cmd: u32,
    /// Status word, present on device responses; zero means success.
    retcode: Option<u32>,
    payload: Vec<u8>,
}

/// Encode a request frame around the given payload.
fn encode_frame(seqno: u32, cmd: u32, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len() + TAIL_LEN);
    frame.extend_from_slice(&FRAME_PREFIX.to_be_bytes());
    frame.extend_from_slice(&seqno.to_be_bytes());
    frame.extend_from_slice(&cmd.to_be_bytes());
    frame.extend_from_slice(&((payload.len() + TAIL_LEN) as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    let crc = crc32fast::hash(&frame);
    frame.extend_from_slice(&crc.to_be_bytes());
    frame.extend_from_slice(&FRAME_SUFFIX.to_be_bytes());
    frame
}

/// Parse one complete frame, verifying prefix, length, CRC and suffix.
fn parse_frame(data: &[u8]) -> Result<Frame, DeviceError> {
    if data.len() < HEADER_LEN + TAIL_LEN {
        return Err(DeviceError::Protocol(format!(
            "Frame too short: {} bytes",
            data.len()
        )));
    }

    let prefix = read_u32(data, 0);
    if prefix != FRAME_PREFIX {
        return Err(DeviceError::Protocol(format!(
            "Bad frame prefix {:#010x}",
            prefix
        )));
    }

    let seqno = read_u32(data, 4);
    let cmd = read_u32(data, 8);
    let length = read_u32(data, 12) as usize;

    if length < TAIL_LEN || HEADER_LEN + length > data.len() {
        return Err(DeviceError::Protocol(format!(
            "Frame length {} does not fit buffer of {} bytes",
            length,
            data.len()
        )));
    }

    let body_end = HEADER_LEN + length - TAIL_LEN;
    let expected = read_u32(data, body_end);
    let computed = crc32fast::hash(&data[..body_end]);
    if expected != computed {
        return Err(DeviceError::Protocol(format!(
            "CRC mismatch: frame says {:#010x}, computed {:#010x}",
            expected, computed
        )));
    }

    let suffix = read_u32(data, body_end + 4);
    if suffix != FRAME_SUFFIX {
        return Err(DeviceError::Protocol(format!(
            "Bad frame suffix {:#010x}",
            suffix
        )));
    }

    let mut body = &data[HEADER_LEN..body_end];

    // Responses lead with a status word, recognizable by its zero top
    // bytes; neither JSON nor a version header starts that way.
    let mut retcode = None;
    if body.len() >= 4 {
        let word = read_u32(body, 0);
        if (word & 0xFFFF_FF00) == 0 {
            retcode = Some(word);
            body = &body[4..];
        }
    }

    Ok(Frame {
        seqno,
        cmd,
        retcode,
        payload: body.to_vec(),
    })
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Strip the version header some responses prepend before the ciphertext.
fn strip_version_header(payload: &[u8]) -> &[u8] {
    // 3-byte version marker plus a 12-byte session field
    if payload.len() >= 15 && payload.starts_with(b"3.3") {
        &payload[15..]
    } else {
        payload
    }
}

/// Read exactly one frame off the stream.
async fn read_frame(stream: &mut TcpStream) -> Result<Frame, DeviceError> {
    let mut header = [0u8; HEADER_LEN];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|e| DeviceError::Connection(e.to_string()))?;

    let prefix = read_u32(&header, 0);
    if prefix != FRAME_PREFIX {
        return Err(DeviceError::Protocol(format!(
            "Bad frame prefix {:#010x}",
            prefix
        )));
    }

    let length = read_u32(&header, 12) as usize;
    if length < TAIL_LEN || length > MAX_BODY_LEN {
        return Err(DeviceError::Protocol(format!(
            "Unreasonable frame length {}",
            length
        )));
    }

    let mut frame = header.to_vec();
    frame.resize(HEADER_LEN + length, 0);
    stream
        .read_exact(&mut frame[HEADER_LEN..])
        .await
        .map_err(|e| DeviceError::Connection(e.to_string()))?;

    parse_frame(&frame)
}

/// Payload handling per protocol version.
enum PayloadCodec {
    /// 3.1: status payloads travel as plaintext JSON
    Plain,
    /// 3.3: payloads are encrypted with the device's local key
    Encrypted(PayloadCipher),
}

/// Production client for one meter.
///
/// Each status query opens a fresh TCP connection; the device drops idle
/// sessions within seconds, so nothing is kept open across the interval.
pub struct TuyaClient {
    device_id: String,
    addr: SocketAddr,
    codec: PayloadCodec,
    timeout: Duration,
    seqno: u32,
}

impl TuyaClient {
    /// Set up a client from configuration.
    ///
    /// Resolves the device address, by UDP discovery when it is configured
    /// as "Auto". Fails on a bad local key, an unsupported protocol
    /// version, or a discovery timeout.
    pub async fn new(config: &DeviceConfig) -> Result<Self, DeviceError> {
        let version = ProtocolVersion::parse(&config.version).ok_or_else(|| {
            DeviceError::Protocol(format!(
                "Unsupported protocol version '{}' (supported: 3.1, 3.3)",
                config.version
            ))
        })?;

        let codec = match version {
            ProtocolVersion::V31 => PayloadCodec::Plain,
            ProtocolVersion::V33 => {
                let key: &[u8; 16] = config.local_key.as_bytes().try_into().map_err(|_| {
                    DeviceError::Protocol(format!(
                        "Local key must be 16 bytes, got {}",
                        config.local_key.len()
                    ))
                })?;
                PayloadCodec::Encrypted(PayloadCipher::new(key))
            }
        };

        let ip = if config.address.eq_ignore_ascii_case("auto") {
            info!(device_id = %config.id, "Listening for device announcement");
            discover(&config.id, DISCOVERY_TIMEOUT).await?
        } else {
            config.address.parse().map_err(|_| {
                DeviceError::Connection(format!("Invalid device address '{}'", config.address))
            })?
        };

        info!(device_id = %config.id, address = %ip, version = %version, "Device client ready");

        Ok(Self {
            device_id: config.id.clone(),
            addr: SocketAddr::new(ip, config.port),
            codec,
            timeout: Duration::from_millis(config.timeout_ms),
            seqno: 0,
        })
    }

    /// Build the status request payload for this device.
    fn query_payload(&self) -> Vec<u8> {
        let json = serde_json::json!({
            "gwId": self.device_id,
            "devId": self.device_id,
            "uid": self.device_id,
            "t": chrono::Utc::now().timestamp().to_string(),
        })
        .to_string();

        match &self.codec {
            PayloadCodec::Plain => json.into_bytes(),
            PayloadCodec::Encrypted(cipher) => cipher.encrypt(json.as_bytes()),
        }
    }

    /// Decode a response payload into a JSON document.
    fn decode_payload(&self, payload: &[u8]) -> Result<serde_json::Value, DeviceError> {
        let plain = match &self.codec {
            PayloadCodec::Plain => payload.to_vec(),
            PayloadCodec::Encrypted(cipher) => cipher.decrypt(strip_version_header(payload))?,
        };

        serde_json::from_slice(&plain).map_err(|_| {
            // Devices answer some bad requests with bare ASCII error text
            DeviceError::Protocol(format!(
                "Unparseable response payload: {}",
                String::from_utf8_lossy(&plain)
            ))
        })
    }

    /// One request/response exchange over a fresh connection.
    async fn exchange(&mut self) -> Result<StatusResponse, DeviceError> {
        let mut stream = TcpStream::connect(self.addr)
            .await
            .map_err(|e| DeviceError::Connection(e.to_string()))?;

        self.seqno = self.seqno.wrapping_add(1);
        let request = encode_frame(self.seqno, CMD_DP_QUERY, &self.query_payload());
        stream
            .write_all(&request)
            .await
            .map_err(|e| DeviceError::Connection(e.to_string()))?;

        let frame = read_frame(&mut stream).await?;
        debug!(
            seq = frame.seqno,
            cmd = frame.cmd,
            retcode = ?frame.retcode,
            bytes = frame.payload.len(),
            "Received frame"
        );

        if let Some(code) = frame.retcode {
            if code != 0 {
                return Err(DeviceError::ReturnCode(code));
            }
        }

        Ok(StatusResponse::new(self.decode_payload(&frame.payload)?))
    }
}

#[async_trait]
impl DeviceClient for TuyaClient {
    async fn status(&mut self) -> Result<StatusResponse, DeviceError> {
        let timeout = self.timeout;
        match tokio::time::timeout(timeout, self.exchange()).await {
            Ok(result) => result,
            Err(_) => Err(DeviceError::Timeout(timeout)),
        }
    }
}

/// A device announcement datagram.
#[derive(Debug, Deserialize)]
struct Announcement {
    ip: String,
    #[serde(rename = "gwId")]
    gw_id: String,
}

/// Listen for periodic UDP announcements and return the device's address.
///
/// Devices broadcast every few seconds: 3.1 in plaintext on port 6666,
/// 3.3 encrypted with the shared discovery key on port 6667. Both ports
/// are watched; the match is by device id.
pub async fn discover(device_id: &str, timeout: Duration) -> Result<IpAddr, DeviceError> {
    let plain = UdpSocket::bind(("0.0.0.0", DISCOVERY_PORT_PLAIN))
        .await
        .map_err(|e| {
            DeviceError::Discovery(format!(
                "Cannot bind discovery port {}: {}",
                DISCOVERY_PORT_PLAIN, e
            ))
        })?;
    let encrypted = UdpSocket::bind(("0.0.0.0", DISCOVERY_PORT_ENCRYPTED))
        .await
        .map_err(|e| {
            DeviceError::Discovery(format!(
                "Cannot bind discovery port {}: {}",
                DISCOVERY_PORT_ENCRYPTED, e
            ))
        })?;

    let cipher = PayloadCipher::new(&md5::compute(DISCOVERY_KEY_SEED).0);
    let deadline = tokio::time::Instant::now() + timeout;

    let mut plain_buf = [0u8; 2048];
    let mut enc_buf = [0u8; 2048];

    loop {
        let announcement = tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                return Err(DeviceError::Discovery(format!(
                    "No announcement from device '{}' within {:?}",
                    device_id, timeout
                )));
            }
            received = plain.recv_from(&mut plain_buf) => {
                let (len, _) = received.map_err(|e| DeviceError::Discovery(e.to_string()))?;
                parse_announcement(&plain_buf[..len], None)
            }
            received = encrypted.recv_from(&mut enc_buf) => {
                let (len, _) = received.map_err(|e| DeviceError::Discovery(e.to_string()))?;
                parse_announcement(&enc_buf[..len], Some(&cipher))
            }
        };

        match announcement {
            Ok(a) if a.gw_id == device_id => {
                return a.ip.parse().map_err(|_| {
                    DeviceError::Discovery(format!("Device announced invalid address '{}'", a.ip))
                });
            }
            Ok(a) => debug!(device_id = %a.gw_id, "Ignoring announcement from other device"),
            Err(e) => debug!(error = %e, "Ignoring malformed announcement"),
        }
    }
}

/// Parse one announcement datagram, decrypting when required.
fn parse_announcement(
    datagram: &[u8],
    cipher: Option<&PayloadCipher>,
) -> Result<Announcement, DeviceError> {
    let frame = parse_frame(datagram)?;
    let payload = match cipher {
        Some(cipher) => cipher.decrypt(&frame.payload)?,
        None => frame.payload,
    };

    serde_json::from_slice(&payload)
        .map_err(|e| DeviceError::Protocol(format!("Bad announcement payload: {}", e)))
}
