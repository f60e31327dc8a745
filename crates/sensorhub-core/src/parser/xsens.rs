//! XSens MT binary protocol: framing, checksum, and the data-identifier
//! payload decoder.
//!
//! Grounded in `original_source/src/devices/xsens.h` and `xsens_impl.h`.
//! Only the "MT protocol" (`devices/xsens*`) implementation is ported; the
//! legacy top-level `src/xsens.h` variant named in spec.md §9 is not.

use crate::cache::StampedQuantity;
use crate::quantity::{value_norm, Quantity};

use super::{FrameParser, ParseBuffer};

pub const PREAMBLE: [u8; 2] = [0xFA, 0xFF];

/// Message identifiers used by the configuration command sequence. Ack MIDs
/// are command MID + 1, per spec.md §4.4.
pub mod mid {
    pub const REQ_DID: u8 = 0x00;
    pub const DID: u8 = 0x01;
    pub const ERROR: u8 = 0x42;
    pub const GOTO_CONFIG: u8 = 0x30;
    pub const GOTO_CONFIG_ACK: u8 = 0x31;
    pub const REQ_OUTPUT_CONFIGURATION: u8 = 0xC0;
    pub const OUTPUT_CONFIGURATION: u8 = 0xC1;
    pub const SET_OUTPUT_CONFIGURATION: u8 = 0xC0;
    pub const SET_OUTPUT_CONFIGURATION_ACK: u8 = 0xC1;
    pub const REQ_PRODUCT_CODE: u8 = 0x1C;
    pub const PRODUCT_CODE: u8 = 0x1D;
    pub const REQ_FIRMWARE_REVISION: u8 = 0x12;
    pub const FIRMWARE_REVISION: u8 = 0x13;
    pub const SET_OPTION_FLAGS: u8 = 0x48;
    pub const SET_OPTION_FLAGS_ACK: u8 = 0x49;
    pub const SET_STRING_OUTPUT_TYPE: u8 = 0x8E;
    pub const SET_STRING_OUTPUT_TYPE_ACK: u8 = 0x8F;
    pub const SET_FILTER_PROFILE: u8 = 0x64;
    pub const SET_FILTER_PROFILE_ACK: u8 = 0x65;
    pub const GOTO_MEASUREMENT: u8 = 0x10;
    pub const GOTO_MEASUREMENT_ACK: u8 = 0x11;
    pub const MT_DATA2: u8 = 0x36;
}

/// Data-identifier group base. Low-order bits select coordinate system and
/// numeric sub-format; see [`did_base`]/[`did_format`].
pub mod xdi {
    pub const UTC_TIME: u16 = 0x1010;
    pub const ACCELERATION: u16 = 0x4020;
    pub const FREE_ACCELERATION: u16 = 0x4030;
    pub const RATE_OF_TURN: u16 = 0x8020;
    pub const LAT_LON: u16 = 0x5040;
    pub const MAGNETIC_FIELD: u16 = 0xC020;
    pub const VELOCITY_XYZ: u16 = 0xD010;
    pub const ALTITUDE_ELLIPSOID: u16 = 0x5020;
    pub const ALTITUDE_MSL: u16 = 0x5010;
    pub const EULER_ANGLES: u16 = 0x2030;
    pub const QUATERNION: u16 = 0x2010;
}

/// Numeric sub-format, encoded in the low 2 bits of the DID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    Float32,
    Fp1220,
    Fp1632,
    Float64,
}

pub fn did_base(did: u16) -> u16 {
    did & !0x3
}

pub fn did_format(did: u16) -> DataFormat {
    match did & 0x3 {
        0 => DataFormat::Float32,
        1 => DataFormat::Fp1220,
        2 => DataFormat::Fp1632,
        _ => DataFormat::Float64,
    }
}

/// Checksum over `sys_command..=chk` (inclusive): accumulation starts at the
/// sys-command byte (`0xFF`, `PREAMBLE[1]`), not at `mid`. Valid iff the sum
/// is zero mod 256.
pub fn checksum_is_valid(mid: u8, len: u8, payload: &[u8], chk: u8) -> bool {
    let mut sum: u8 = PREAMBLE[1].wrapping_add(mid).wrapping_add(len);
    for &b in payload {
        sum = sum.wrapping_add(b);
    }
    sum = sum.wrapping_add(chk);
    sum == 0
}

/// The two's-complement checksum byte for `sys_command, mid, len, payload`.
pub fn compute_checksum(mid: u8, len: u8, payload: &[u8]) -> u8 {
    let mut sum: u8 = PREAMBLE[1].wrapping_add(mid).wrapping_add(len);
    for &b in payload {
        sum = sum.wrapping_add(b);
    }
    sum.wrapping_neg()
}

/// `SetOptionFlags` payload: set `EnableInRunCompassCalibration`, clear
/// `EnableAHS`.
pub fn option_flags_payload() -> [u8; 8] {
    [0x00, 0x00, 0x00, 0x80, 0x00, 0x00, 0x00, 0x10]
}

/// `SetStringOutputType` payload: all string outputs disabled.
pub fn string_output_type_payload() -> [u8; 2] {
    [0x00, 0x00]
}

/// Build a complete frame: preamble, mid, len, payload, checksum.
pub fn build_frame(mid: u8, payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u8;
    let chk = compute_checksum(mid, len, payload);
    let mut out = Vec::with_capacity(5 + payload.len());
    out.extend_from_slice(&PREAMBLE);
    out.push(mid);
    out.push(len);
    out.extend_from_slice(payload);
    out.push(chk);
    out
}

/// Axis-flip convention for a 3-component vector (acceleration, free
/// acceleration, rate of turn, magnetic field, velocity): negate components
/// 1 and 2 when flipped.
fn flip_3(values: &mut [f64; 3], flip: bool) {
    if flip {
        values[1] = -values[1];
        values[2] = -values[2];
    }
}

/// Euler angle conversion: degrees to radians, with the roll quirk from
/// `xsens_impl.h`'s `RadConverter<3, false>` specialization.
fn euler_to_quantities(raw_deg: [f64; 3], flip: bool) -> [(Quantity, f64); 3] {
    let mut rad = raw_deg.map(|d| d.to_radians());
    if flip {
        rad[1] = -rad[1];
        rad[2] = -rad[2];
    } else {
        rad[0] = std::f64::consts::PI + rad[0];
    }
    [
        (Quantity::ro, value_norm(Quantity::ro, rad[0])),
        (Quantity::pi, value_norm(Quantity::pi, rad[1])),
        (Quantity::ya, value_norm(Quantity::ya, rad[2])),
    ]
}

/// Quaternion conversion: unflipped mode swaps component pairs then negates
/// even indices; flipped mode keeps order and negates indices >= 2.
fn quaternion_to_quantities(raw: [f64; 4], flip: bool) -> [(Quantity, f64); 4] {
    let mut out = [0.0; 4];
    if flip {
        out = raw;
        out[2] = -out[2];
        out[3] = -out[3];
    } else {
        for i in 0..4 {
            let src = 2 * (i / 2) + (i + 1) % 2;
            out[i] = raw[src];
        }
        out[0] = -out[0];
        out[2] = -out[2];
    }
    [
        (Quantity::q1, out[0]),
        (Quantity::q2, out[1]),
        (Quantity::q3, out[2]),
        (Quantity::q4, out[3]),
    ]
}

fn read_f32_be(bytes: &[u8], i: usize) -> f64 {
    f32::from_be_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]) as f64
}

fn read_f64_be(bytes: &[u8], i: usize) -> f64 {
    f64::from_be_bytes([
        bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3],
        bytes[i + 4], bytes[i + 5], bytes[i + 6], bytes[i + 7],
    ])
}

/// Read `dim` consecutive float values (float32 or float64) big-endian.
fn read_vector(bytes: &[u8], dim: usize, format: DataFormat) -> Option<Vec<f64>> {
    let stride = match format {
        DataFormat::Float32 => 4,
        DataFormat::Float64 => 8,
        _ => return None,
    };
    if bytes.len() < dim * stride {
        return None;
    }
    Some(
        (0..dim)
            .map(|i| match format {
                DataFormat::Float32 => read_f32_be(bytes, i * stride),
                DataFormat::Float64 => read_f64_be(bytes, i * stride),
                _ => unreachable!(),
            })
            .collect(),
    )
}

fn decode_utc_time(bytes: &[u8]) -> Option<f64> {
    if bytes.len() < 12 {
        return None;
    }
    let nano = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let year = u16::from_be_bytes([bytes[4], bytes[5]]);
    let month = bytes[6];
    let day = bytes[7];
    let hour = bytes[8];
    let minute = bytes[9];
    let second = bytes[10];
    let flags = bytes[11];
    const VALID_UTC: u8 = 0x04;
    if flags & VALID_UTC == 0 {
        return None;
    }
    let date = chrono::NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)?;
    let time = chrono::NaiveTime::from_hms_nano_opt(
        hour as u32,
        minute as u32,
        second as u32,
        nano,
    )?;
    let dt = chrono::NaiveDateTime::new(date, time);
    Some(dt.and_utc().timestamp() as f64 + dt.and_utc().timestamp_subsec_nanos() as f64 * 1e-9)
}

/// Decode one `(DID, SIZE, BYTES)` record into zero or more quantities.
/// `flip` and `filter_profile` come from the device's configured options.
fn decode_record(did: u16, bytes: &[u8], flip: bool) -> Vec<(Quantity, f64)> {
    let base = did_base(did);
    let format = did_format(did);
    match base {
        xdi::UTC_TIME => decode_utc_time(bytes).map(|t| vec![(Quantity::ut, t)]).unwrap_or_default(),
        xdi::ACCELERATION | xdi::FREE_ACCELERATION | xdi::RATE_OF_TURN | xdi::VELOCITY_XYZ => {
            let Some(v) = read_vector(bytes, 3, format) else { return vec![] };
            let mut a = [v[0], v[1], v[2]];
            flip_3(&mut a, flip);
            let quants = match base {
                xdi::ACCELERATION => [Quantity::ax, Quantity::ay, Quantity::az],
                xdi::FREE_ACCELERATION => [Quantity::fax, Quantity::fay, Quantity::faz],
                xdi::RATE_OF_TURN => [Quantity::rr, Quantity::pr, Quantity::yr],
                _ => [Quantity::vx, Quantity::vy, Quantity::vz],
            };
            quants.into_iter().zip(a).map(|(q, x)| (q, value_norm(q, x))).collect()
        }
        xdi::MAGNETIC_FIELD => {
            let Some(v) = read_vector(bytes, 3, format) else { return vec![] };
            let mut a = [v[0] * 1e-4, v[1] * 1e-4, v[2] * 1e-4];
            flip_3(&mut a, flip);
            [Quantity::mx, Quantity::my, Quantity::mz]
                .into_iter()
                .zip(a)
                .map(|(q, x)| (q, value_norm(q, x)))
                .collect()
        }
        xdi::LAT_LON => {
            let Some(v) = read_vector(bytes, 2, format) else { return vec![] };
            vec![
                (Quantity::la, value_norm(Quantity::la, v[0].to_radians())),
                (Quantity::lo, value_norm(Quantity::lo, v[1].to_radians())),
            ]
        }
        xdi::ALTITUDE_ELLIPSOID => {
            read_vector(bytes, 1, format).map(|v| vec![(Quantity::hg84, v[0])]).unwrap_or_default()
        }
        xdi::ALTITUDE_MSL => {
            read_vector(bytes, 1, format).map(|v| vec![(Quantity::hmsl, v[0])]).unwrap_or_default()
        }
        xdi::EULER_ANGLES => {
            let Some(v) = read_vector(bytes, 3, format) else { return vec![] };
            euler_to_quantities([v[0], v[1], v[2]], flip).to_vec()
        }
        xdi::QUATERNION => {
            let Some(v) = read_vector(bytes, 4, format) else { return vec![] };
            quaternion_to_quantities([v[0], v[1], v[2], v[3]], flip).to_vec()
        }
        _ => vec![],
    }
}

fn decode_mt_data2(payload: &[u8], flip: bool, stamp: f64, out: &mut Vec<StampedQuantity>) {
    let mut i = 0;
    while i + 3 <= payload.len() {
        let did = u16::from_be_bytes([payload[i], payload[i + 1]]);
        let size = payload[i + 2] as usize;
        i += 3;
        if i + size > payload.len() {
            break;
        }
        let record = &payload[i..i + size];
        for (q, v) in decode_record(did, record, flip) {
            out.push(StampedQuantity::new(q, v, stamp));
        }
        i += size;
    }
}

/// Stateful XSens MT frame parser.
pub struct XsensParser {
    buf: ParseBuffer,
    flip_axes: bool,
}

impl XsensParser {
    pub fn new(flip_axes: bool) -> Self {
        XsensParser { buf: ParseBuffer::new(), flip_axes }
    }

    pub fn set_flip_axes(&mut self, flip_axes: bool) {
        self.flip_axes = flip_axes;
    }

    /// Parse exactly one frame from the front of the buffer, if present.
    /// Returns `true` if a frame (valid or checksum-invalid) was consumed.
    fn parse_single(&mut self, stamp: f64) -> bool {
        // Skip junk until the preamble.
        while self.buf.buffer.len() >= 2
            && !(self.buf.buffer[0] == PREAMBLE[0] && self.buf.buffer[1] == PREAMBLE[1])
        {
            self.buf.buffer.pop_front();
        }
        if self.buf.buffer.len() < 4 {
            return false;
        }
        let mid = self.buf.buffer[2];
        let len = self.buf.buffer[3] as usize;
        let frame_len = 4 + len + 1;
        if self.buf.buffer.len() < frame_len {
            return false;
        }
        let frame: Vec<u8> = self.buf.buffer.iter().take(frame_len).copied().collect();
        for _ in 0..frame_len {
            self.buf.buffer.pop_front();
        }
        let payload = &frame[4..4 + len];
        let chk = frame[4 + len];
        if !checksum_is_valid(mid, len as u8, payload, chk) {
            log::warn!("xsens: checksum mismatch on mid {mid:#x}, discarding frame");
            return true;
        }
        if mid == mid::MT_DATA2 {
            decode_mt_data2(payload, self.flip_axes, stamp, &mut self.buf.ready);
        }
        true
    }
}

impl FrameParser for XsensParser {
    fn feed(&mut self, stamp: f64, bytes: &[u8]) {
        self.buf.push(bytes);
        while self.parse_single(stamp) {}
    }

    fn drain(&mut self) -> Vec<StampedQuantity> {
        self.buf.drain_ready()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_round_trips() {
        let payload = [1u8, 2, 3, 4];
        let frame = build_frame(0x10, &payload);
        let mid = frame[2];
        let len = frame[3];
        let chk = frame[4 + len as usize];
        assert!(checksum_is_valid(mid, len, &frame[4..4 + len as usize], chk));
    }

    #[test]
    fn checksum_rejects_bit_flip() {
        let mut frame = build_frame(0x10, &[1, 2, 3, 4]);
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        let len = frame[3];
        assert!(!checksum_is_valid(frame[2], len, &frame[4..4 + len as usize], frame[last]));
    }

    #[test]
    fn utc_time_frame_decodes() {
        // nano=343000000, 2018-09-10 08:57:56, flags=valid_utc
        let mut payload = Vec::new();
        payload.extend_from_slice(&343_000_000u32.to_be_bytes());
        payload.extend_from_slice(&2018u16.to_be_bytes());
        payload.push(9);
        payload.push(10);
        payload.push(8);
        payload.push(57);
        payload.push(56);
        payload.push(0x04);

        let mut record = Vec::new();
        record.extend_from_slice(&xdi::UTC_TIME.to_be_bytes());
        record.push(payload.len() as u8);
        record.extend_from_slice(&payload);

        let frame = build_frame(mid::MT_DATA2, &record);
        let mut parser = XsensParser::new(false);
        parser.feed(1000.0, &frame);
        let out = parser.drain();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].quantity, Quantity::ut);
        assert!((out[0].value - 1536569876.343).abs() < 1e-3);
        assert_eq!(out[0].stamp, 1000.0);
    }

    #[test]
    fn junk_before_preamble_is_skipped() {
        let frame = build_frame(mid::GOTO_CONFIG_ACK, &[]);
        let mut garbage = vec![0x00, 0x01, 0x02];
        garbage.extend_from_slice(&frame);
        let mut parser = XsensParser::new(false);
        parser.feed(1.0, &garbage);
        assert!(parser.buf.buffer.is_empty());
    }
}
