//! The binary meta-header and payload compression
//!
//! Every message published to the broker carries a trailing frame with a
//! fixed 24-byte, big-endian layout:
//!
//! ```text
//! offset  size  field
//!      0     2  tag                 0xCABD
//!      2     1  compression method  0 = none, 2 = snappy
//!      3     1  version             1
//!      4     4  device number       0
//!      8     8  timestamp           milliseconds since the UNIX epoch
//!     16     8  sequence            monotonic per publisher, starts at 1
//! ```
//!
//! The sequence number gives the collector a total order over messages from
//! one publisher; the tag lets it reject foreign traffic early.

use crate::error::WireError;
use std::time::{SystemTime, UNIX_EPOCH};

/// Marker identifying logjam traffic.
pub const META_INFO_TAG: u16 = 0xcabd;
/// Wire format version.
pub const META_INFO_VERSION: u8 = 1;
/// Device number; always 0 for agents.
pub const META_INFO_DEVICE_NUMBER: u32 = 0;
/// Size of the packed meta-header in bytes.
pub const META_INFO_SIZE: usize = 24;

/// Payload compression method carried in the meta-header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    /// Payload is sent as-is. Used for the shutdown ping.
    None = 0,
    /// Payload is Snappy-encoded (block format).
    Snappy = 2,
}

/// Unpacked view of a meta-header frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MetaInfo {
    /// Traffic marker, [`META_INFO_TAG`] for valid frames.
    pub tag: u16,
    /// Raw compression method byte.
    pub compression_method: u8,
    /// Wire format version.
    pub version: u8,
    /// Originating device, 0 for agents.
    pub device_number: u32,
    /// Milliseconds since the UNIX epoch at send time.
    pub timestamp: u64,
    /// Monotonic message sequence number.
    pub sequence: u64,
}

/// Packs a meta-header frame.
pub fn pack(time: SystemTime, sequence: u64, compression: Compression) -> [u8; META_INFO_SIZE] {
    let millis = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);

    let mut data = [0u8; META_INFO_SIZE];
    data[0..2].copy_from_slice(&META_INFO_TAG.to_be_bytes());
    data[2] = compression as u8;
    data[3] = META_INFO_VERSION;
    data[4..8].copy_from_slice(&META_INFO_DEVICE_NUMBER.to_be_bytes());
    data[8..16].copy_from_slice(&millis.to_be_bytes());
    data[16..24].copy_from_slice(&sequence.to_be_bytes());
    data
}

/// Unpacks a meta-header frame. Returns `None` when the frame has the wrong
/// length; the tag is reported as-is so callers can decide what to reject.
pub fn unpack(data: &[u8]) -> Option<MetaInfo> {
    if data.len() != META_INFO_SIZE {
        return None;
    }
    Some(MetaInfo {
        tag: u16::from_be_bytes([data[0], data[1]]),
        compression_method: data[2],
        version: data[3],
        device_number: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        timestamp: u64::from_be_bytes([
            data[8], data[9], data[10], data[11], data[12], data[13], data[14], data[15],
        ]),
        sequence: u64::from_be_bytes([
            data[16], data[17], data[18], data[19], data[20], data[21], data[22], data[23],
        ]),
    })
}

/// Snappy-encodes a payload (block format, as the collector expects).
pub fn compress(payload: &[u8]) -> Result<Vec<u8>, WireError> {
    Ok(snap::raw::Encoder::new().compress_vec(payload)?)
}

/// Decodes a Snappy block payload. Used by receivers and tests.
pub fn decompress(payload: &[u8]) -> Result<Vec<u8>, WireError> {
    Ok(snap::raw::Decoder::new().decompress_vec(payload)?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn packs_the_documented_layout() {
        let time = UNIX_EPOCH + Duration::from_nanos(1_519_659_204_000_000_000);
        assert_eq!(
            pack(time, u64::MAX, Compression::None),
            [
                202, 189, // tag
                0,   // compression method
                1,   // version
                0, 0, 0, 0, // device
                0, 0, 1, 97, 210, 191, 61, 160, // time
                255, 255, 255, 255, 255, 255, 255, 255, // sequence
            ]
        );
    }

    #[test]
    fn round_trips() {
        let time = UNIX_EPOCH + Duration::new(1_000_000_000, 1000);
        let info = unpack(&pack(time, 123_456_789, Compression::Snappy)).unwrap();
        assert_eq!(
            info,
            MetaInfo {
                tag: META_INFO_TAG,
                compression_method: Compression::Snappy as u8,
                version: META_INFO_VERSION,
                device_number: META_INFO_DEVICE_NUMBER,
                timestamp: 1_000_000_000_000,
                sequence: 123_456_789,
            }
        );
    }

    #[test]
    fn timestamp_floors_sub_millisecond_precision() {
        let time = UNIX_EPOCH + Duration::from_nanos(1_999_999);
        let info = unpack(&pack(time, 1, Compression::None)).unwrap();
        assert_eq!(info.timestamp, 1);
    }

    #[test]
    fn rejects_wrong_length() {
        assert_eq!(unpack(&[0; 23]), None);
        assert_eq!(unpack(&[0; 25]), None);
    }

    #[test]
    fn snappy_round_trips() {
        let payload = br#"{"action":"Home#index","code":200}"#;
        let compressed = compress(payload).unwrap();
        assert_eq!(decompress(&compressed).unwrap(), payload);
    }
}
