//! One wake cycle: measure, transmit, decide how long to sleep
//!
//! [`WakeCycle::run`] is the single guard around the whole sequence. Every
//! fault inside it is logged and turned into the fallback sleep period, so
//! the board always reaches [`enter_deep_sleep`].

use datalogger_hal::time::Duration;
use datalogger_hal::{DeepSleep, FlexPin, RainGauge, TransmitQueue, WallClock};
use embassy_futures::join::join;
use embedded_hal::delay::DelayNs;
use embedded_io::{Read, ReadReady, Write};
use heapless::{String, Vec};

use crate::config::{SensorConfig, MAX_SENSORS};
use crate::modem::{coverage_percent, Modem, ModemError, NetworkTime};
use crate::payload::{
    format_topic, merge_readings, telemetry_json, MergedReadings, PayloadError, Topic,
    MAX_PAYLOAD_LEN,
};
use crate::runtime::{join_all, Handle, Runtime, TimedOut};
use crate::schedule::{calculate_sleep_time, should_transmit, transmit_interval};
use crate::sdi12::{Sdi12Bus, Sdi12Error};

pub type DeviceName = String<32>;

pub type Sensors = Vec<SensorConfig, MAX_SENSORS>;

/// Wake cycle settings
#[derive(Debug, Clone)]
pub struct CycleConfig {
    /// Last MQTT topic level
    pub device_name: DeviceName,
    /// Topic the device publishes under (trailing `/` ignored)
    pub parent_topic: Topic,
    /// Multiplier of the rain/dry transmit interval
    pub send_interval: u32,
    /// Cached payloads retried after a successful transmission
    pub recovery_count: usize,
    /// Above this size the cache is left for manual recovery
    pub max_cache_bytes: usize,
    /// Sleep period after a failed cycle
    pub fallback_sleep: Duration,
    /// The modem stays on when the next wake is at most this far away (seconds)
    pub modem_keep_on_secs: i64,
    /// Added to every computed sleep period
    pub sleep_margin: Duration,
    /// Pause between publishing and logging out of the broker
    pub publish_settle: Duration,
    /// Upper bound on the whole cycle
    pub cycle_timeout: Duration,
}

impl CycleConfig {
    /// Settings for `device_name` publishing under `parent_topic`, other
    /// values at their production defaults
    pub fn new(device_name: &str, parent_topic: &str) -> Result<Self, PayloadError> {
        Ok(Self {
            device_name: DeviceName::try_from(device_name).map_err(|_| PayloadError::BufferFull)?,
            parent_topic: Topic::try_from(parent_topic).map_err(|_| PayloadError::BufferFull)?,
            send_interval: 1,
            recovery_count: 3,
            max_cache_bytes: 1_000_000,
            fallback_sleep: Duration::secs(60),
            modem_keep_on_secs: 60,
            sleep_margin: Duration::millis(500),
            publish_settle: Duration::secs(1),
            cycle_timeout: Duration::minutes(15),
        })
    }
}

/// State carried from one wake cycle to the next (kept in RTC memory or on
/// flash by the board)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceState {
    /// Unix seconds of the last transmission attempt
    pub last_transmitted: i64,
    /// Rainfall (mm) since the last successful transmission
    pub rainfall: f32,
    /// Signal coverage at the last transmission, `None` when unknown
    pub coverage: Option<u8>,
}

/// Outcome of one cycle
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    /// The current payload reached the broker
    pub transmitted: bool,
    /// The current payload went to the failed-transmission queue
    pub cached: bool,
    /// Cached payloads sent this cycle
    pub backlog_sent: usize,
    /// Readings in the payload
    pub readings: usize,
    /// Sensors that failed to deliver
    pub failed_sensors: usize,
    pub modem_powered_off: bool,
    /// Module clock, for the board to discipline its RTC
    pub network_time: Option<NetworkTime>,
    /// How long to deep sleep
    pub sleep: Duration,
}

impl CycleReport {
    fn idle(sleep: Duration) -> Self {
        Self {
            transmitted: false,
            cached: false,
            backlog_sent: 0,
            readings: 0,
            failed_sensors: 0,
            modem_powered_off: false,
            network_time: None,
            sleep,
        }
    }
}

/// Faults that abort a cycle
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CycleError {
    /// Sensor bus could not be driven
    Sensor(Sdi12Error),
    /// Modem could not be driven
    Modem(ModemError),
    /// Payload or topic could not be built
    Payload(PayloadError),
    /// Cycle ran past its time limit
    TimedOut,
}

impl core::fmt::Display for CycleError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Sensor(e) => write!(f, "Sensor bus: {}", e),
            Self::Modem(e) => write!(f, "Modem: {}", e),
            Self::Payload(e) => write!(f, "Payload: {}", e),
            Self::TimedOut => write!(f, "Wake cycle timed out"),
        }
    }
}

impl core::error::Error for CycleError {}

impl From<Sdi12Error> for CycleError {
    fn from(e: Sdi12Error) -> Self {
        Self::Sensor(e)
    }
}

impl From<ModemError> for CycleError {
    fn from(e: ModemError) -> Self {
        Self::Modem(e)
    }
}

impl From<PayloadError> for CycleError {
    fn from(e: PayloadError) -> Self {
        Self::Payload(e)
    }
}

impl From<TimedOut> for CycleError {
    fn from(_: TimedOut) -> Self {
        Self::TimedOut
    }
}

/// Peripherals a wake cycle drives
pub struct Devices<MS, MP, BS, BP, BD, W, G, Q> {
    pub modem: Modem<MS, MP>,
    pub bus: Sdi12Bus<BS, BP, BD>,
    pub clock: W,
    pub rain_gauge: G,
    pub queue: Q,
}

pub struct WakeCycle<MS, MP, BS, BP, BD, W, G, Q> {
    config: CycleConfig,
    sensors: Sensors,
    devices: Devices<MS, MP, BS, BP, BD, W, G, Q>,
    handle: Handle,
}

impl<MS, MP, BS, BP, BD, W, G, Q> WakeCycle<MS, MP, BS, BP, BD, W, G, Q>
where
    MS: Read + Write + ReadReady,
    MP: FlexPin,
    BS: Read + Write + ReadReady,
    BP: FlexPin,
    BD: DelayNs,
    W: WallClock,
    G: RainGauge,
    Q: TransmitQueue,
{
    pub fn new(
        config: CycleConfig,
        sensors: Sensors,
        devices: Devices<MS, MP, BS, BP, BD, W, G, Q>,
        handle: Handle,
    ) -> Self {
        Self {
            config,
            sensors,
            devices,
            handle,
        }
    }

    pub fn devices(&self) -> &Devices<MS, MP, BS, BP, BD, W, G, Q> {
        &self.devices
    }

    pub fn into_devices(self) -> Devices<MS, MP, BS, BP, BD, W, G, Q> {
        self.devices
    }

    fn enabled(&self) -> impl Iterator<Item = &SensorConfig> {
        self.sensors.iter().filter(|s| s.enabled)
    }

    /// Time until the next recording minus the longest boot-up, as a sleep
    fn sleep_after(&self, now: i64) -> Duration {
        match calculate_sleep_time(now, self.enabled()) {
            Some(secs) => Duration::secs(secs.max(0) as u64) + self.config.sleep_margin,
            None => self.config.fallback_sleep,
        }
    }

    /// Run the cycle. Never fails: a fault yields the fallback sleep period.
    pub async fn run(&mut self, state: &mut DeviceState) -> CycleReport {
        let handle = self.handle.clone();
        let limit = self.config.cycle_timeout;
        let outcome = match handle.timeout(limit, self.pipeline(state)).await {
            Ok(outcome) => outcome,
            Err(e) => Err(e.into()),
        };
        match outcome {
            Ok(report) => report,
            Err(e) => {
                error!("Wake cycle failed: {}", e);
                if self.devices.bus.is_awake() && self.devices.bus.sleep_sensors().is_err() {
                    error!("Failed to switch off the sensor rail");
                }
                info!(
                    "Entering fallback deep sleep for {} ms",
                    self.config.fallback_sleep.ticks()
                );
                CycleReport::idle(self.config.fallback_sleep)
            }
        }
    }

    async fn pipeline(&mut self, state: &mut DeviceState) -> Result<CycleReport, CycleError> {
        let now = self.devices.clock.unix_time();
        let rainfall = self.devices.rain_gauge.take_rainfall();
        state.rainfall += rainfall;

        let interval = transmit_interval(rainfall, self.config.send_interval);
        if !should_transmit(now, state.last_transmitted, interval) {
            let sleep = self.sleep_after(self.devices.clock.unix_time());
            info!("Nothing due; entering deep sleep for {} ms", sleep.ticks());
            return Ok(CycleReport::idle(sleep));
        }

        state.last_transmitted = now;
        debug!("Set last_transmitted {}", now);
        let mut report = CycleReport::idle(self.config.fallback_sleep);

        self.devices.bus.wake_sensors()?;
        let taken_at = self.devices.clock.unix_time();
        let (modem, results) = {
            let bus = &self.devices.bus;
            let reads = join_all(
                self.sensors
                    .iter()
                    .filter(|s| s.enabled)
                    .map(move |s| bus.read_sensor(s)),
            );
            join(self.devices.modem.initialise(), reads).await
        };
        self.devices.bus.sleep_sensors()?;
        if let Err(e) = modem {
            error!("Modem initialisation failed: {}", e);
        }

        let mut merged = MergedReadings::new();
        for (sensor, result) in self.enabled().zip(results.iter()) {
            match result {
                Ok(readings) => {
                    if let Err(e) = merge_readings(&mut merged, readings) {
                        error!("Readings of {} not merged: {}", sensor.name.as_str(), e);
                    }
                }
                Err(e) => {
                    error!("Sensor {} failed: {}", sensor.name.as_str(), e);
                    report.failed_sensors += 1;
                }
            }
        }
        report.readings = merged.len();
        info!("Merged {} readings from all sensors", merged.len());

        let payload = telemetry_json(&merged, taken_at, state.rainfall)?;
        let topic = format_topic(&self.config.parent_topic, &self.config.device_name)?;

        if self.devices.modem.has_network() {
            report.network_time = self.devices.modem.get_network_time().await.unwrap_or_else(|e| {
                error!("Network time unavailable: {}", e);
                None
            });
        }

        if self.devices.modem.has_serial() {
            let signal = self.devices.modem.get_signal_power().await.unwrap_or_else(|e| {
                error!("Signal power unavailable: {}", e);
                crate::modem::SIGNAL_UNKNOWN
            });
            state.coverage = coverage_percent(signal);
        }

        if self.transmit(&topic, &payload).await {
            report.transmitted = true;
            state.rainfall = 0.0;
            report.backlog_sent = self.retransmit_backlog(&topic).await;
        } else {
            warn!("Transmitting failed, caching the payload");
            match self.devices.queue.push(payload.as_bytes()) {
                Ok(()) => report.cached = true,
                Err(_) => error!("Failed to cache the payload"),
            }
        }

        let sleep_secs = calculate_sleep_time(self.devices.clock.unix_time(), self.enabled())
            .unwrap_or(self.config.modem_keep_on_secs + 1);
        if sleep_secs > self.config.modem_keep_on_secs {
            report.modem_powered_off = self.devices.modem.power_off().await.unwrap_or_else(|e| {
                error!("Modem power-off failed: {}", e);
                false
            });
        } else {
            debug!("Leaving modem on as sleep time is only {} s", sleep_secs);
        }

        report.sleep = self.sleep_after(self.devices.clock.unix_time());
        info!("Entering deep sleep for {} ms", report.sleep.ticks());
        Ok(report)
    }

    /// Connect, publish, log out. Modem faults count as a failed send.
    async fn transmit(&mut self, topic: &str, payload: &str) -> bool {
        match self.try_transmit(topic, payload).await {
            Ok(sent) => sent,
            Err(e) => {
                error!("Transmission aborted: {}", e);
                false
            }
        }
    }

    async fn try_transmit(&mut self, topic: &str, payload: &str) -> Result<bool, ModemError> {
        let modem = &mut self.devices.modem;
        if !modem.has_serial() {
            info!("Modem has no network or no response. No transmission");
            return Ok(false);
        }
        info!("Start transmitting data");
        if !modem.mqtt_connect().await? {
            return Ok(false);
        }
        let published = modem.mqtt_publish(topic, payload).await?;
        self.handle.sleep(self.config.publish_settle).await;
        modem.mqtt_disconnect().await?;
        Ok(published)
    }

    /// Resend up to `recovery_count` cached payloads, oldest first
    async fn retransmit_backlog(&mut self, topic: &str) -> usize {
        let mut sent = 0;
        let mut buf = [0u8; MAX_PAYLOAD_LEN];
        for _ in 0..self.config.recovery_count {
            match self.devices.queue.size_bytes() {
                Ok(size) if size > self.config.max_cache_bytes => {
                    warn!("Transmission cache full, entries must be recovered manually");
                    break;
                }
                Ok(_) => {}
                Err(_) => {
                    error!("Failed to read the transmission cache size");
                    break;
                }
            }
            let len = match self.devices.queue.peek_oldest(&mut buf) {
                Ok(Some(len)) => len.min(buf.len()),
                Ok(None) => break,
                Err(_) => {
                    error!("Failed to read the transmission cache");
                    break;
                }
            };
            let Ok(cached) = core::str::from_utf8(&buf[..len]) else {
                error!("Dropping a corrupt cached payload");
                if self.devices.queue.pop_oldest().is_err() {
                    break;
                }
                continue;
            };
            let cached = cached.trim();
            debug!("Attempting to retransmit {}", cached);
            if !self.transmit(topic, cached).await {
                warn!("Retransmission failed, keeping the cache");
                break;
            }
            debug!("Retransmission succeeded");
            sent += 1;
            if self.devices.queue.pop_oldest().is_err() {
                error!("Failed to drop a retransmitted payload");
                break;
            }
        }
        sent
    }
}

/// Tear down in order and sleep: stop and drop the runtime (dropping any
/// task still alive), release the modem and the sensor bus, then assert deep
/// sleep for `duration`.
pub fn enter_deep_sleep<MS, MP, BS, BP, BD, W, G, Q, Z>(
    runtime: Runtime,
    cycle: WakeCycle<MS, MP, BS, BP, BD, W, G, Q>,
    sleeper: &mut Z,
    duration: Duration,
) where
    MS: Read + Write + ReadReady,
    MP: FlexPin,
    BS: Read + Write + ReadReady,
    BP: FlexPin,
    BD: DelayNs,
    W: WallClock,
    G: RainGauge,
    Q: TransmitQueue,
    Z: DeepSleep,
{
    runtime.handle().stop();
    drop(runtime);
    let devices = cycle.into_devices();
    let _ = devices.modem.release();
    let _ = devices.bus.release();
    info!("Deep sleep for {} ms", duration.ticks());
    sleeper.deep_sleep(duration);
}
