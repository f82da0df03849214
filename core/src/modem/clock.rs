//! `+CCLK` reply parsing

use crate::calendar::DateTime;

/// Module clock reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NetworkTime {
    /// Unix seconds, UTC
    pub utc: i64,
    /// `utc` plus the configured fixed offset
    pub local: i64,
    /// Zone reported by the network, in quarter hours (informational)
    pub reported_zone: i8,
}

fn two_digits(s: &[u8], at: usize) -> Option<u8> {
    let hi = s.get(at)?;
    let lo = s.get(at + 1)?;
    if !hi.is_ascii_digit() || !lo.is_ascii_digit() {
        return None;
    }
    Some((hi - b'0') * 10 + (lo - b'0'))
}

/// Parse `"yy/MM/dd,hh:mm:ss±zz"` (quotes optional, trailing `,dst` ignored).
///
/// The clock itself is always UTC whatever the zone field says.
pub fn parse_cclk(value: &str) -> Option<(DateTime, i8)> {
    let s = value.trim().trim_start_matches('"').as_bytes();
    let sep = |at: usize, c: u8| s.get(at) == Some(&c);
    if !(sep(2, b'/') && sep(5, b'/') && sep(8, b',') && sep(11, b':') && sep(14, b':')) {
        return None;
    }
    let zone_sign: i8 = match s.get(17)? {
        b'+' => 1,
        b'-' => -1,
        _ => return None,
    };
    let zone = two_digits(s, 18)?;
    let time = DateTime::new(
        2000 + i32::from(two_digits(s, 0)?),
        two_digits(s, 3)?,
        two_digits(s, 6)?,
        two_digits(s, 9)?,
        two_digits(s, 12)?,
        two_digits(s, 15)?,
    )?;
    Some((time, zone_sign * i8::try_from(zone).ok()?))
}
