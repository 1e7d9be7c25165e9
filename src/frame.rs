//! Wire framing: the vendor Ethernet payload used for probing and on/off
//! control, and the HomePlug-AV MME sub-protocol used for PIB I/O.
//!
//! Both framings live above the Ethernet header (destination MAC | source
//! MAC | EtherType); this module only ever sees the bytes *after* that
//! 12-byte prefix. [`crate::dispatcher::Dispatcher`] strips/prepends the
//! header.

use thiserror::Error;

/// EtherType that identifies HomePlug-AV MME traffic. Any other EtherType
/// (in practice `0x0040`, the vendor marker below) carries a vendor frame.
pub const HOMEPLUG_ETHERTYPE: u16 = 0x88e1;

/// Leading marker byte of a vendor payload frame. Doubles as the low byte
/// of the (non-standard) EtherType the devices use for their own protocol.
const VENDOR_MARKER: u8 = 0x00;

/// HomePlug-AV MME version field. Frames with any other value are dropped.
const MMV: u8 = 0x00;
/// HomePlug-AV vendor MME OUI.
const OUI: [u8; 3] = [0x00, 0xb0, 0x52];
/// Module ID for the PIB, used in every Read/Write/NVM-commit exchange.
const MODULE_PIB: u8 = 0x02;

/// Read Module Data Request.
pub const MMTYPE_READ_REQ: u16 = 0xa020 + 0x04;
/// Read Module Data Confirmation.
pub const MMTYPE_READ_CONF: u16 = 0xa020 + 0x05;
/// Write Module Data Request.
pub const MMTYPE_WRITE_REQ: u16 = 0xa020;
/// Write Module Data Confirmation.
pub const MMTYPE_WRITE_CONF: u16 = 0xa020 + 0x01;
/// Write Module Data to NVM Request.
pub const MMTYPE_NVM_REQ: u16 = 0xa020 + 0x08;
/// Write Module Data to NVM Confirmation.
pub const MMTYPE_NVM_CONF: u16 = 0xa020 + 0x09;

/// Errors decoding a vendor or HomePlug-AV frame. All are handled by
/// silently dropping the frame; the pending retransmission timer recovers.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short ({0} bytes)")]
    TooShort(usize),
    #[error("bad vendor marker byte {0:#04x}")]
    BadVendorMarker(u8),
    #[error("vendor body length {declared} does not match actual length {actual}")]
    BadVendorLength { declared: usize, actual: usize },
    #[error("vendor body length {0} is not a multiple of 64")]
    UnalignedVendorLength(usize),
    #[error("bad MME version field {0:#04x}")]
    BadMmv(u8),
    #[error("bad MME vendor OUI {0:02x?}")]
    BadOui([u8; 3]),
    #[error("bad PIB module id {0:#04x}")]
    BadModule(u8),
    #[error("non-zero status {0:#04x}")]
    BadStatus(u8),
    #[error("chunk checksum did not fold to zero")]
    BadChunkChecksum,
    #[error("unrecognised device type {0:?}")]
    BadDeviceType(String),
    #[error("malformed power report field: {0}")]
    BadPowerReport(String),
}

/// Device family as reported in a power-data message, field index 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceType {
    /// `type == "2"`.
    Blue,
    /// `type == "3"`.
    White,
}

impl DeviceType {
    fn parse(s: &str) -> Result<Self, FrameError> {
        match s {
            "2" => Ok(DeviceType::Blue),
            "3" => Ok(DeviceType::White),
            other => Err(FrameError::BadDeviceType(other.to_string())),
        }
    }
}

/// A decoded power-data report (vendor function code 1).
#[derive(Clone, Debug, PartialEq)]
pub struct PowerReport {
    pub device_type: DeviceType,
    pub is_on: bool,
    pub power_w: f64,
    /// Opaque identification tuple: `(id1)` for white devices, `(id1, id2, id3)` for blue.
    pub ident: Vec<String>,
    /// Device version tuple: `(version_a)` for white, `(version_a, version_b)` for blue.
    pub version: Vec<String>,
}

/// A decoded vendor-frame event.
#[derive(Clone, Debug, PartialEq)]
pub enum VendorEvent {
    /// Function code 1.
    Power(PowerReport),
    /// Function code 9: reply to an on/off request we sent.
    OnOffReply(bool),
    /// Function code 12: unsolicited on/off notification.
    OnOffUnsolicited(bool),
}

/// Build the fixed 66-byte vendor probe frame.
pub fn encode_vendor_probe() -> Vec<u8> {
    let mut v = vec![VENDOR_MARKER, 0x40, 0x00, 0x00, 0x00];
    v.extend(std::iter::repeat(0x00).take(60));
    v.push(0x01);
    v
}

/// Build the fixed 66-byte vendor "turn on" frame.
pub fn encode_vendor_on() -> Vec<u8> {
    let mut v = vec![VENDOR_MARKER, 0x40, 0x08, 0x01, 0x01];
    v.extend(std::iter::repeat(0x00).take(60));
    v.push(0x00);
    v
}

/// Build the fixed 66-byte vendor "turn off" frame.
pub fn encode_vendor_off() -> Vec<u8> {
    let mut v = vec![VENDOR_MARKER, 0x40, 0x08, 0x01, 0x00];
    v.extend(std::iter::repeat(0x00).take(60));
    v.push(0x01);
    v
}

/// Decode a vendor payload frame into zero or more events.
///
/// `payload` is everything after the Ethernet header. The frame is parsed
/// as `[marker][length L][L bytes of 64-byte messages]`; a message whose
/// function code or fields are unrecognised is logged and skipped without
/// failing the whole frame.
pub fn decode_vendor_frame(payload: &[u8]) -> Result<Vec<VendorEvent>, FrameError> {
    if payload.len() < 2 {
        return Err(FrameError::TooShort(payload.len()));
    }
    if payload[0] != VENDOR_MARKER {
        return Err(FrameError::BadVendorMarker(payload[0]));
    }

    let length = payload[1] as usize;
    let body = &payload[2..];
    if body.len() != length {
        return Err(FrameError::BadVendorLength {
            declared: length,
            actual: body.len(),
        });
    }
    if length % 64 != 0 {
        return Err(FrameError::UnalignedVendorLength(length));
    }

    let mut events = Vec::new();
    for msg in body.chunks_exact(64) {
        let function = msg[0];
        let ml = msg[1] as usize;
        let message = &msg[2..2 + ml.min(62)];

        match function {
            1 => match decode_power_report(message) {
                Ok(report) => events.push(VendorEvent::Power(report)),
                Err(e) => log::debug!("dropping malformed power report: {e}"),
            },
            9 => {
                if let Some(&b) = message.first() {
                    events.push(VendorEvent::OnOffReply(b == 1));
                }
            }
            12 => {
                if let Some(&b) = message.first() {
                    events.push(VendorEvent::OnOffUnsolicited(b == 1));
                }
            }
            other => {
                log::debug!("ignoring unknown vendor function code {other:#04x}");
            }
        }
    }

    Ok(events)
}

fn decode_power_report(message: &[u8]) -> Result<PowerReport, FrameError> {
    let text = std::str::from_utf8(message)
        .map_err(|e| FrameError::BadPowerReport(e.to_string()))?
        .trim_end_matches('\0')
        .trim();
    let parts: Vec<&str> = text.split(';').collect();
    if parts.len() < 5 {
        return Err(FrameError::BadPowerReport(format!(
            "expected at least 5 fields, got {}",
            parts.len()
        )));
    }

    let device_type = DeviceType::parse(parts[0])?;
    let is_on = match parts[3] {
        "1" => true,
        "0" => false,
        other => return Err(FrameError::BadPowerReport(format!("bad is_on {other:?}"))),
    };
    let power_w: f64 = parts[4]
        .parse()
        .map_err(|_| FrameError::BadPowerReport(format!("bad power field {:?}", parts[4])))?;

    let (ident, version) = match device_type {
        DeviceType::Blue => {
            if parts.len() < 8 {
                return Err(FrameError::BadPowerReport(
                    "blue device report missing extra fields".to_string(),
                ));
            }
            (
                vec![parts[1].to_string(), parts[5].to_string(), parts[6].to_string()],
                vec![parts[2].to_string(), parts[7].to_string()],
            )
        }
        DeviceType::White => (vec![parts[1].to_string()], vec![parts[2].to_string()]),
    };

    Ok(PowerReport {
        device_type,
        is_on,
        power_w,
        ident,
        version,
    })
}

/// A decoded HomePlug-AV MME frame header, with the opcode-specific body
/// left unparsed.
struct MmeFrame<'a> {
    mmtype: u16,
    body: &'a [u8],
}

fn decode_mme_header(payload: &[u8]) -> Result<MmeFrame<'_>, FrameError> {
    if payload.len() < 6 {
        return Err(FrameError::TooShort(payload.len()));
    }
    if payload[0] != MMV {
        return Err(FrameError::BadMmv(payload[0]));
    }
    let mmtype = u16::from_le_bytes([payload[1], payload[2]]);
    let oui = [payload[3], payload[4], payload[5]];
    if oui != OUI {
        return Err(FrameError::BadOui(oui));
    }
    Ok(MmeFrame {
        mmtype,
        body: &payload[6..],
    })
}

/// Parsed MME frame: the opcode plus its body, ready for opcode-specific decoding.
pub struct Mme<'a> {
    pub mmtype: u16,
    pub body: &'a [u8],
}

/// Validate the MMV/OUI wrapper around a HomePlug-AV MME frame and return
/// its opcode and body.
pub fn decode_mme(payload: &[u8]) -> Result<Mme<'_>, FrameError> {
    let frame = decode_mme_header(payload)?;
    Ok(Mme {
        mmtype: frame.mmtype,
        body: frame.body,
    })
}

fn encode_mme_header(mmtype: u16) -> Vec<u8> {
    let mut v = Vec::with_capacity(6);
    v.push(MMV);
    v.extend_from_slice(&mmtype.to_le_bytes());
    v.extend_from_slice(&OUI);
    v
}

/// Build a Read Module Data Request for the PIB at `offset`, `length` bytes.
pub fn encode_read_pib_request(offset: u32, length: u16) -> Vec<u8> {
    let mut v = encode_mme_header(MMTYPE_READ_REQ);
    v.push(MODULE_PIB);
    v.push(0x00); // reserved
    v.extend_from_slice(&length.to_le_bytes());
    v.extend_from_slice(&offset.to_le_bytes());
    v
}

/// Build a Write Module Data Request carrying `chunk` at `offset`.
pub fn encode_write_pib_request(offset: u32, chunk: &[u8]) -> Vec<u8> {
    let mut v = encode_mme_header(MMTYPE_WRITE_REQ);
    v.push(MODULE_PIB);
    v.push(0x00); // reserved
    v.extend_from_slice(&(chunk.len() as u16).to_le_bytes());
    v.extend_from_slice(&offset.to_le_bytes());
    v.extend_from_slice(&crate::pib::xor_checksum(chunk).to_le_bytes());
    v.extend_from_slice(chunk);
    v
}

/// Build the one-shot Write Module Data to NVM Request.
pub fn encode_nvm_commit_request() -> Vec<u8> {
    let mut v = encode_mme_header(MMTYPE_NVM_REQ);
    v.push(MODULE_PIB);
    v
}

/// A validated Read Module Data Confirmation.
pub struct ReadConfirmation {
    pub offset: u32,
    pub data: Vec<u8>,
}

/// Decode and validate a Read Module Data Confirmation body.
///
/// Layout: `{status, 3 reserved, module, 1 reserved, length u16, offset u32,
/// chunk_checksum u32, chunk_bytes...}`. The checksum covers `chunk_bytes`
/// appended with the declared checksum; it is accepted only if that folds
/// to zero.
pub fn decode_read_confirmation(body: &[u8]) -> Result<ReadConfirmation, FrameError> {
    if body.len() < 16 {
        return Err(FrameError::TooShort(body.len()));
    }
    let status = body[0];
    if status != 0 {
        return Err(FrameError::BadStatus(status));
    }
    let module = body[4];
    if module != MODULE_PIB {
        return Err(FrameError::BadModule(module));
    }
    let length = u16::from_le_bytes([body[6], body[7]]) as usize;
    let offset = u32::from_le_bytes([body[8], body[9], body[10], body[11]]);

    let chunk_region = &body[12..];
    if crate::pib::xor_checksum(chunk_region) != 0 {
        return Err(FrameError::BadChunkChecksum);
    }

    let data_start = 4; // chunk_checksum precedes chunk_bytes within chunk_region
    if chunk_region.len() < data_start + length {
        return Err(FrameError::TooShort(chunk_region.len()));
    }
    let data = chunk_region[data_start..data_start + length].to_vec();

    Ok(ReadConfirmation { offset, data })
}

/// Decode and validate a Write Module Data Confirmation body (just a status byte).
pub fn decode_write_confirmation(body: &[u8]) -> Result<(), FrameError> {
    decode_status_only(body)
}

/// Decode and validate a Write Module Data to NVM Confirmation body.
pub fn decode_nvm_confirmation(body: &[u8]) -> Result<(), FrameError> {
    decode_status_only(body)
}

fn decode_status_only(body: &[u8]) -> Result<(), FrameError> {
    if body.is_empty() {
        return Err(FrameError::TooShort(0));
    }
    if body[0] != 0 {
        return Err(FrameError::BadStatus(body[0]));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_probe_matches_spec_bytes() {
        let mut expected = vec![0x00, 0x40, 0x00, 0x00, 0x00];
        expected.extend(std::iter::repeat(0x00).take(60));
        expected.push(0x01);
        assert_eq!(encode_vendor_probe(), expected);
        assert_eq!(encode_vendor_probe().len(), 66);
    }

    #[test]
    fn encode_read_pib_request_matches_s1() {
        let frame = encode_read_pib_request(0, 1024);
        let expected: Vec<u8> = vec![
            0x00, 0x24, 0xa0, 0x00, 0xb0, 0x52, 0x02, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00,
        ];
        assert_eq!(frame, expected);
    }

    #[test]
    fn decode_power_report_blue_device() {
        let msg = b"2;id1;va;1;12.3;id2;id3;vb";
        let report = decode_power_report(msg).unwrap();
        assert_eq!(report.device_type, DeviceType::Blue);
        assert!(report.is_on);
        assert_eq!(report.power_w, 12.3);
        assert_eq!(report.ident, vec!["id1", "id2", "id3"]);
        assert_eq!(report.version, vec!["va", "vb"]);
    }

    #[test]
    fn decode_power_report_white_device() {
        let msg = b"3;id1;va;0;5.0";
        let report = decode_power_report(msg).unwrap();
        assert_eq!(report.device_type, DeviceType::White);
        assert!(!report.is_on);
        assert_eq!(report.ident, vec!["id1"]);
        assert_eq!(report.version, vec!["va"]);
    }

    #[test]
    fn decode_vendor_frame_on_off() {
        let mut msg = [0u8; 64];
        msg[0] = 9;
        msg[1] = 1;
        msg[2] = 1;
        let mut payload = vec![VENDOR_MARKER, 64];
        payload.extend_from_slice(&msg);

        let events = decode_vendor_frame(&payload).unwrap();
        assert_eq!(events, vec![VendorEvent::OnOffReply(true)]);
    }

    #[test]
    fn decode_vendor_frame_rejects_unaligned_length() {
        let payload = vec![VENDOR_MARKER, 10, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(
            decode_vendor_frame(&payload),
            Err(FrameError::UnalignedVendorLength(10))
        ));
    }

    #[test]
    fn read_confirmation_round_trips() {
        let data = vec![0xABu8; 1024];
        let cksum = crate::pib::xor_checksum(&data);

        let mut body = vec![0u8, 0, 0, 0, MODULE_PIB, 0];
        body.extend_from_slice(&1024u16.to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes());
        body.extend_from_slice(&cksum.to_le_bytes());
        body.extend_from_slice(&data);

        let conf = decode_read_confirmation(&body).unwrap();
        assert_eq!(conf.offset, 0);
        assert_eq!(conf.data, data);
    }

    #[test]
    fn read_confirmation_rejects_bad_status() {
        let mut body = vec![1u8, 0, 0, 0, MODULE_PIB, 0];
        body.extend_from_slice(&[0u8; 10]);
        assert!(matches!(
            decode_read_confirmation(&body),
            Err(FrameError::BadStatus(1))
        ));
    }

    #[test]
    fn mme_header_rejects_bad_oui() {
        let payload = [0x00, 0x25, 0xa0, 0xff, 0xff, 0xff];
        assert!(matches!(decode_mme(&payload), Err(FrameError::BadOui(_))));
    }
}
