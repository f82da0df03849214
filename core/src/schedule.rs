//! Duty-cycle arithmetic
//!
//! Pure functions over seconds. `now`, `first_record_at` and `last_sent` must
//! all come from the same clock.

use crate::config::SensorConfig;

/// Transmissions fire this many seconds early to absorb wake-up jitter
pub const TRANSMIT_EARLY_MARGIN: i64 = 60;

/// A `last_sent` less than this far in the future is a daylight-saving artifact
pub const DST_SHIFT: i64 = 3600;

/// A `last_sent` further in the future than this means the clock was reset
pub const CLOCK_RESET_THRESHOLD: i64 = -730_000_000;

/// Base transmit period while it is raining, in minutes
pub const RAIN_INTERVAL_MINUTES: i64 = 5;

/// Base transmit period while it is dry, in minutes
pub const DRY_INTERVAL_MINUTES: i64 = 60;

/// Seconds until `sensor` is due for its next recording.
///
/// Before the first recording the raw distance is returned, however long.
/// Afterwards the result is on the sensor's grid, in `[0, interval)`.
pub fn time_to_next_recording(now: i64, sensor: &SensorConfig) -> i64 {
    let diff = sensor.first_record_at - now;
    if diff > 0 {
        return diff;
    }
    let period = 60 * i64::from(sensor.record_interval.max(1));
    diff.rem_euclid(period)
}

/// Seconds to sleep so the slowest-booting sensor is ready for the next
/// recording. Negative means wake immediately; `None` if there are no sensors.
pub fn calculate_sleep_time<'a, I>(now: i64, sensors: I) -> Option<i64>
where
    I: IntoIterator<Item = &'a SensorConfig>,
{
    let mut next = None::<i64>;
    let mut boot = None::<i64>;
    for sensor in sensors {
        let t = time_to_next_recording(now, sensor);
        next = Some(next.map_or(t, |n| n.min(t)));
        let b = i64::from(sensor.bootup_time);
        boot = Some(boot.map_or(b, |m| m.max(b)));
    }
    Some(next? - boot?)
}

/// Whether this wake should transmit, given the transmit period in seconds
pub fn should_transmit(now: i64, last_sent: i64, interval: i64) -> bool {
    let mut elapsed = now - last_sent;
    if elapsed < 0 {
        error!("Last transmission is {} s in the future", -elapsed);
        if elapsed > -DST_SHIFT {
            warn!("Correcting last transmission time by {} s", DST_SHIFT);
            elapsed = now - (last_sent - DST_SHIFT);
        } else if elapsed < CLOCK_RESET_THRESHOLD {
            warn!("Clock reset detected, forcing a transmission");
            elapsed = interval;
        }
    }
    let transmit = interval - elapsed <= TRANSMIT_EARLY_MARGIN;
    debug!(
        "Elapsed {} s of {} s, transmit: {}",
        elapsed,
        interval,
        transmit
    );
    transmit
}

/// Transmit period in seconds: 5 minute base while raining, 60 otherwise,
/// times the configured send interval
pub fn transmit_interval(rainfall: f32, send_interval: u32) -> i64 {
    let minutes = if rainfall > 0.0 {
        RAIN_INTERVAL_MINUTES
    } else {
        DRY_INTERVAL_MINUTES
    };
    i64::from(send_interval) * minutes * 60
}
