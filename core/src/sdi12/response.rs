//! SDI-12 reply decoding

use heapless::Vec;

use super::Sdi12Error;

/// Values one data reply may carry (concurrent measurements allow 20)
pub const MAX_VALUES: usize = 20;

pub type Values = Vec<f32, MAX_VALUES>;

/// Phase one reply to `aM!` / `aMC!`: `atttn`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MeasureReply {
    pub address: char,
    /// Seconds until the values are ready
    pub delay_secs: u16,
    /// Number of values the measurement produces
    pub count: u8,
}

pub fn parse_measure_reply(line: &str) -> Result<MeasureReply, Sdi12Error> {
    let line = line.trim();
    let mut chars = line.chars();
    let address = chars.next().ok_or(Sdi12Error::Malformed)?;
    let rest = chars.as_str();
    if !address.is_ascii_alphanumeric()
        || !(4..=6).contains(&rest.len())
        || !rest.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(Sdi12Error::Malformed);
    }
    let (delay, count) = rest.split_at(3);
    Ok(MeasureReply {
        address,
        delay_secs: delay.parse().map_err(|_| Sdi12Error::Malformed)?,
        count: count.parse().map_err(|_| Sdi12Error::Malformed)?,
    })
}

/// Split `+1.5-2.25+3` at each sign (signs kept) into numbers.
///
/// `body` is a data reply with the address and any CRC removed. An empty
/// body means the sensor has no further values.
pub fn parse_values(body: &str) -> Result<Values, Sdi12Error> {
    let body = body.trim();
    let mut values = Values::new();
    if body.is_empty() {
        return Ok(values);
    }
    if !body.starts_with(['+', '-']) {
        return Err(Sdi12Error::Malformed);
    }

    let mut start = 0;
    let bytes = body.as_bytes();
    for end in (1..=bytes.len()).filter(|&i| i == bytes.len() || matches!(bytes[i], b'+' | b'-')) {
        let value: f32 = body[start..end].parse().map_err(|_| Sdi12Error::Malformed)?;
        values.push(value).map_err(|_| Sdi12Error::Malformed)?;
        start = end;
    }
    Ok(values)
}

/// CRC-16/ARC as used by SDI-12 (reflected polynomial 0xA001, zero init)
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &b| {
        (0..8).fold(crc ^ u16::from(b), |crc, _| {
            if crc & 1 != 0 {
                (crc >> 1) ^ 0xA001
            } else {
                crc >> 1
            }
        })
    })
}

/// Three printable characters carrying six CRC bits each
pub fn encode_crc(crc: u16) -> [u8; 3] {
    [
        0x40 | (crc >> 12) as u8,
        0x40 | ((crc >> 6) & 0x3F) as u8,
        0x40 | (crc & 0x3F) as u8,
    ]
}

/// Check and remove the CRC trailing a data reply
pub fn strip_crc(line: &str) -> Result<&str, Sdi12Error> {
    let line = line.trim_end();
    if line.len() < 4 || !line.is_char_boundary(line.len() - 3) {
        return Err(Sdi12Error::Malformed);
    }
    let (data, crc) = line.split_at(line.len() - 3);
    if crc.as_bytes() != encode_crc(crc16(data.as_bytes())).as_slice() {
        return Err(Sdi12Error::CrcMismatch);
    }
    Ok(data)
}
