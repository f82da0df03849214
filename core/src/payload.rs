//! Telemetry payloads and MQTT topics

use core::fmt::Write;

use heapless::{LinearMap, String};

use crate::calendar::write_iso8601;
use crate::config::{ReadingName, MAX_READINGS, MAX_SENSORS};

/// Maximum MQTT topic length
pub const MAX_TOPIC_LEN: usize = 128;

/// Maximum serialized payload
pub const MAX_PAYLOAD_LEN: usize = 1024;

/// Readings merged across every sensor on the bus
pub const MAX_MERGED_READINGS: usize = MAX_SENSORS * MAX_READINGS;

pub type Topic = String<MAX_TOPIC_LEN>;
pub type Payload = String<MAX_PAYLOAD_LEN>;
pub type MergedReadings = LinearMap<ReadingName, f32, MAX_MERGED_READINGS>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PayloadError {
    /// Topic part contains an MQTT wildcard or NUL
    InvalidTopic,
    /// Output does not fit its buffer
    BufferFull,
}

impl core::fmt::Display for PayloadError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidTopic => write!(f, "Invalid MQTT topic"),
            Self::BufferFull => write!(f, "Payload buffer full"),
        }
    }
}

impl core::error::Error for PayloadError {}

impl From<core::fmt::Error> for PayloadError {
    fn from(_: core::fmt::Error) -> Self {
        Self::BufferFull
    }
}

fn has_wildcards(part: &str) -> bool {
    part.contains('+') || part.contains('#') || part.contains('\0')
}

/// Build `<parent>/<device>`, dropping trailing slashes from the parent.
///
/// Topic names cannot contain wildcards (+, #) or null characters.
pub fn format_topic(parent: &str, device: &str) -> Result<Topic, PayloadError> {
    if has_wildcards(parent) {
        error!("Parent topic contains invalid MQTT topic characters");
        return Err(PayloadError::InvalidTopic);
    }
    if has_wildcards(device) {
        error!("Device name contains invalid MQTT topic characters");
        return Err(PayloadError::InvalidTopic);
    }

    let mut topic = Topic::new();
    topic
        .push_str(parent.trim_end_matches('/'))
        .map_err(|_| PayloadError::BufferFull)?;
    topic.push('/').map_err(|_| PayloadError::BufferFull)?;
    topic
        .push_str(device)
        .map_err(|_| PayloadError::BufferFull)?;

    Ok(topic)
}

/// Copy `from` into `into`; later sensors win on key collisions
pub fn merge_readings<const N: usize>(
    into: &mut MergedReadings,
    from: &LinearMap<ReadingName, f32, N>,
) -> Result<(), PayloadError> {
    for (name, value) in from {
        if into.contains_key(name) {
            warn!("{} already recorded and will be overwritten", name.as_str());
        }
        into.insert(name.clone(), *value)
            .map_err(|_| PayloadError::BufferFull)?;
    }
    Ok(())
}

fn write_json_str<W: Write>(out: &mut W, s: &str) -> core::fmt::Result {
    out.write_char('"')?;
    for c in s.chars() {
        match c {
            '"' => out.write_str("\\\"")?,
            '\\' => out.write_str("\\\\")?,
            '\n' => out.write_str("\\n")?,
            '\r' => out.write_str("\\r")?,
            '\t' => out.write_str("\\t")?,
            c if (c as u32) < 0x20 => write!(out, "\\u{:04x}", c as u32)?,
            c => out.write_char(c)?,
        }
    }
    out.write_char('"')
}

fn write_json_number<W: Write>(out: &mut W, value: f32) -> core::fmt::Result {
    if value.is_finite() {
        write!(out, "{}", value)
    } else {
        out.write_str("null")
    }
}

fn write_value<W: Write>(out: &mut W, name: &str, value: f32) -> core::fmt::Result {
    write_json_str(out, name)?;
    out.write_char(':')?;
    write_json_number(out, value)?;
    out.write_char(',')
}

/// Append `"name":value,` per reading, leaving `reserve` bytes free.
///
/// Readings that do not fit are skipped so the rest still goes out.
fn write_values(out: &mut Payload, readings: &MergedReadings, reserve: usize) {
    let mut dropped = 0;
    for (name, value) in readings {
        let mark = out.len();
        let fits = write_value(out, name, *value).is_ok() && out.len() + reserve <= MAX_PAYLOAD_LEN;
        if !fits {
            out.truncate(mark);
            dropped += 1;
        }
    }
    if dropped > 0 {
        warn!("Payload full, left out {} of {} readings", dropped, readings.len());
    }
}

/// Telemetry for the MQTT broker:
/// `{"<reading>": value, ..., "DateTime": "<iso>", "rainfall": total}`
///
/// Readings that would overflow [`MAX_PAYLOAD_LEN`] are left out; the
/// timestamp and rainfall total are always present.
pub fn telemetry_json(
    readings: &MergedReadings,
    taken_at: i64,
    rainfall: f32,
) -> Result<Payload, PayloadError> {
    let mut tail: String<128> = String::new();
    tail.write_str("\"DateTime\":\"")?;
    write_iso8601(&mut tail, taken_at, None)?;
    tail.write_str("\",\"rainfall\":")?;
    write_json_number(&mut tail, rainfall)?;
    tail.write_char('}')?;

    let mut out = Payload::new();
    out.write_char('{')?;
    write_values(&mut out, readings, tail.len());
    out.push_str(&tail).map_err(|_| PayloadError::BufferFull)?;
    Ok(out)
}

/// Body for the MonitorMyWatershed data-stream endpoint
pub fn watershed_json(
    sampling_feature: &str,
    taken_at: i64,
    utc_offset_secs: i32,
    readings: &MergedReadings,
) -> Result<Payload, PayloadError> {
    let mut out = Payload::new();
    out.write_str("{\"sampling_feature\":")?;
    write_json_str(&mut out, sampling_feature)?;
    out.write_str(",\"timestamp\":\"")?;
    write_iso8601(&mut out, taken_at, Some(utc_offset_secs))?;
    out.write_str("\",")?;
    write_values(&mut out, readings, 1);
    // Drop the trailing comma left by the last value.
    if out.ends_with(',') {
        out.pop();
    }
    out.write_char('}')?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> ReadingName {
        let mut n = ReadingName::new();
        n.push_str(s).unwrap();
        n
    }

    #[test]
    fn test_format_topic() {
        let topic = format_topic("gwrc/loggers/", "site-42").unwrap();
        assert_eq!(topic.as_str(), "gwrc/loggers/site-42");

        let topic = format_topic("gwrc//", "site-42").unwrap();
        assert_eq!(topic.as_str(), "gwrc/site-42");

        assert!(topic.len() < MAX_TOPIC_LEN);
    }

    #[test]
    fn test_format_topic_buffer_overflow() {
        let long_parent = "this_is_a_very_long_parent_topic_that_exceeds_the_maximum_allowed_topic_length_for_mqtt_messages_on_the_broker";
        let result = format_topic(long_parent, "device-with-a-long-name");
        assert_eq!(result, Err(PayloadError::BufferFull));
    }

    #[test]
    fn test_format_topic_invalid_characters() {
        assert_eq!(format_topic("loggers/+", "dev"), Err(PayloadError::InvalidTopic));
        assert_eq!(format_topic("loggers/#", "dev"), Err(PayloadError::InvalidTopic));
        assert_eq!(format_topic("loggers", "dev\0"), Err(PayloadError::InvalidTopic));
    }

    #[test]
    fn test_merge_overwrites_duplicate_names() {
        let mut merged = MergedReadings::new();
        let mut a: LinearMap<ReadingName, f32, 4> = LinearMap::new();
        a.insert(name("level"), 1.5).unwrap();
        a.insert(name("temp"), 12.0).unwrap();
        let mut b: LinearMap<ReadingName, f32, 4> = LinearMap::new();
        b.insert(name("level"), 2.5).unwrap();
        merge_readings(&mut merged, &a).unwrap();
        merge_readings(&mut merged, &b).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.get(&name("level")), Some(&2.5));
    }

    #[test]
    fn test_telemetry_json() {
        let mut readings = MergedReadings::new();
        readings.insert(name("level"), 1.25).unwrap();
        readings.insert(name("temp \"C\""), -3.5).unwrap();
        let json = telemetry_json(&readings, 1_676_775_142, 0.4).unwrap();
        assert_eq!(
            json.as_str(),
            "{\"level\":1.25,\"temp \\\"C\\\"\":-3.5,\"DateTime\":\"2023-02-19T02:52:22\",\"rainfall\":0.4}"
        );
    }

    #[test]
    fn test_watershed_json_has_offset_timestamp() {
        let mut readings = MergedReadings::new();
        readings
            .insert(name("2a1c4e7b-0000-4000-8000-000000000001"), 7.0)
            .unwrap();
        let json = watershed_json("feature-uuid", 1_652_351_391, 12 * 3600, &readings).unwrap();
        assert_eq!(
            json.as_str(),
            "{\"sampling_feature\":\"feature-uuid\",\"timestamp\":\"2022-05-12T22:29:51+12:00\",\"2a1c4e7b-0000-4000-8000-000000000001\":7}"
        );
    }

    #[test]
    fn test_telemetry_json_leaves_out_readings_that_do_not_fit() {
        let mut readings = MergedReadings::new();
        for i in 0..MAX_MERGED_READINGS {
            let mut n = ReadingName::new();
            write!(n, "2a1c4e7b-0000-4000-8000-{:012}", i).unwrap();
            readings.insert(n, 1000.5).unwrap();
        }
        let json = telemetry_json(&readings, 1_676_775_142, 2.5).unwrap();
        assert!(json.len() <= MAX_PAYLOAD_LEN);
        assert!(json.starts_with("{\"2a1c4e7b-0000-4000-8000-000000000000\":1000.5,"));
        assert!(json.ends_with(",\"DateTime\":\"2023-02-19T02:52:22\",\"rainfall\":2.5}"));
        let kept = json.matches("\":1000.5,").count();
        assert!(kept > 0 && kept < MAX_MERGED_READINGS);
    }

    #[test]
    fn test_merge_holds_every_sensor_reading() {
        let mut merged = MergedReadings::new();
        for sensor in 0..MAX_SENSORS {
            let mut readings: LinearMap<ReadingName, f32, MAX_READINGS> = LinearMap::new();
            for index in 0..MAX_READINGS {
                let mut n = ReadingName::new();
                write!(n, "s{}r{}", sensor, index).unwrap();
                readings.insert(n, index as f32).unwrap();
            }
            merge_readings(&mut merged, &readings).unwrap();
        }
        assert_eq!(merged.len(), MAX_SENSORS * MAX_READINGS);
    }

    #[test]
    fn test_non_finite_values_become_null() {
        let mut readings = MergedReadings::new();
        readings.insert(name("x"), f32::NAN).unwrap();
        let json = telemetry_json(&readings, 0, 0.0).unwrap();
        assert!(json.starts_with("{\"x\":null,"));
        assert!(json.ends_with("\"rainfall\":0}"));
    }
}
