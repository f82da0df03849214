//! SDI-12 sensor bus driver
//!
//! One bus, many addressed sensors, one transaction at a time. The bus lock
//! is held for a whole measurement phase, the sensor's conversion delay
//! included, so concurrent [`Sdi12Bus::read_sensor`] calls serialize.
//!
//! A transaction: break and mark to wake the line, write `<address><cmd>!`,
//! turn the line around, drop our own echo, then wait for one CRLF
//! terminated reply. Silence is retried with a longer wait each attempt; a
//! reply from the wrong address is retried as a new transaction.

mod error;
mod response;

use core::cell::Cell;
use core::fmt::Write as _;

use datalogger_hal::serial::LineConfig;
use datalogger_hal::time::{Duration, Instant};
use datalogger_hal::FlexPin;
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::mutex::Mutex;
use embedded_hal::delay::DelayNs;
use embedded_io::{Read, ReadReady, Write};
use heapless::{LinearMap, String};

use crate::config::{Address, ReadingName, SensorConfig, MAX_READINGS};
use crate::protocol::{CommandPort, Response, Sdi12Framing};
use crate::runtime::Handle;

pub use error::Sdi12Error;
pub use response::{
    crc16, encode_crc, parse_measure_reply, parse_values, strip_crc, MeasureReply, Values,
    MAX_VALUES,
};

/// Address query, valid only with a single sensor on the bus
pub const ADDRESS_QUERY: &str = "?!";

/// Reading name to scaled value
pub type Readings = LinearMap<ReadingName, f32, MAX_READINGS>;

type Command = String<16>;

/// Line timing and retry policy
#[derive(Debug, Clone)]
pub struct BusTiming {
    /// UART framing the BSP must set up
    pub line: LineConfig,
    /// Break (spacing) that wakes every sensor, microseconds
    pub break_us: u32,
    /// Marking after the break, microseconds
    pub mark_us: u32,
    /// Wait for the first reply byte on attempt one; attempt `n` waits `n` times this
    pub response_timeout: Duration,
    /// Time allowed for a started reply to reach its CRLF
    pub line_timeout: Duration,
    /// Transactions per command before giving up on silence
    pub attempts: u32,
    /// Pause between attempts
    pub retry_delay: Duration,
    /// Repeats of a command answered by the wrong address
    pub address_retries: u32,
    /// Added to a sensor's boot-up time before it is first addressed
    pub boot_margin: Duration,
}

impl Default for BusTiming {
    fn default() -> Self {
        Self {
            line: LineConfig::seven_e_one(1200),
            break_us: 25_000,
            mark_us: 8_333,
            response_timeout: Duration::millis(500),
            line_timeout: Duration::millis(500),
            attempts: 3,
            retry_delay: Duration::millis(50),
            address_retries: 3,
            boot_margin: Duration::secs(1),
        }
    }
}

/// Pins of the SDI-12 level shifter
pub struct BusPins<P> {
    /// Low transmits, high receives
    pub dir: P,
    /// Holds the data line during break and mark
    pub force_out: P,
    /// Sensor power rail
    pub enable: P,
}

/// Everything [`Sdi12Bus::release`] hands back
pub struct BusParts<S, P, D> {
    pub serial: S,
    pub pins: BusPins<P>,
    pub delay: D,
}

/// State only the lock holder may touch
struct Line<S, P, D> {
    port: CommandPort<S, Sdi12Framing>,
    dir: P,
    force_out: P,
    delay: D,
}

impl<S, P, D> Line<S, P, D>
where
    S: Read + Write + ReadReady,
    P: FlexPin,
    D: DelayNs,
{
    fn wake(&mut self, timing: &BusTiming) -> Result<(), Sdi12Error> {
        self.force_out.set_low().map_err(|_| Sdi12Error::Pin)?;
        self.dir.set_low().map_err(|_| Sdi12Error::Pin)?;
        self.delay.delay_us(timing.break_us);
        self.force_out.set_high().map_err(|_| Sdi12Error::Pin)?;
        self.delay.delay_us(timing.mark_us);
        Ok(())
    }

    /// Send and turn the line around once the last character is out
    fn transmit(&mut self, command: &str, timing: &BusTiming) -> Result<(), Sdi12Error> {
        self.port.send(command).map_err(|_| Sdi12Error::Serial)?;
        self.delay
            .delay_us(timing.line.char_time_us() * command.len() as u32);
        self.dir.set_high().map_err(|_| Sdi12Error::Pin)?;
        let echo = self.port.discard_input().map_err(|_| Sdi12Error::Serial)?;
        trace!("Dropped {} echoed bytes", echo);
        Ok(())
    }
}

pub struct Sdi12Bus<S, P, D> {
    line: Mutex<NoopRawMutex, Line<S, P, D>>,
    enable: P,
    handle: Handle,
    timing: BusTiming,
    awake: Cell<bool>,
    woke_at: Cell<Option<Instant>>,
}

impl<S, P, D> Sdi12Bus<S, P, D>
where
    S: Read + Write + ReadReady,
    P: FlexPin,
    D: DelayNs,
{
    /// Take the transport and pins. The sensor rail starts off.
    pub fn new(
        serial: S,
        pins: BusPins<P>,
        delay: D,
        handle: Handle,
        timing: BusTiming,
    ) -> Result<Self, Sdi12Error> {
        let BusPins {
            dir,
            force_out,
            mut enable,
        } = pins;
        enable.set_low().map_err(|_| Sdi12Error::Pin)?;
        Ok(Self {
            line: Mutex::new(Line {
                port: CommandPort::new(serial, handle.clone()),
                dir,
                force_out,
                delay,
            }),
            enable,
            handle,
            timing,
            awake: Cell::new(false),
            woke_at: Cell::new(None),
        })
    }

    pub fn is_awake(&self) -> bool {
        self.awake.get()
    }

    /// Power the sensor rail. Returns when it was switched on.
    pub fn wake_sensors(&mut self) -> Result<Instant, Sdi12Error> {
        if let (true, Some(at)) = (self.awake.get(), self.woke_at.get()) {
            warn!("Sensors already on");
            return Ok(at);
        }
        info!("Booting all sensors");
        self.enable.set_high().map_err(|_| Sdi12Error::Pin)?;
        let now = self.handle.now();
        self.awake.set(true);
        self.woke_at.set(Some(now));
        Ok(now)
    }

    pub fn sleep_sensors(&mut self) -> Result<(), Sdi12Error> {
        if !self.awake.get() {
            warn!("Sensors already off");
            return Ok(());
        }
        info!("Turning off all sensors");
        self.enable.set_low().map_err(|_| Sdi12Error::Pin)?;
        self.awake.set(false);
        Ok(())
    }

    fn check_awake(&self) -> Result<(), Sdi12Error> {
        if self.awake.get() {
            Ok(())
        } else {
            error!("Sensors are asleep and must not be accessed");
            Err(Sdi12Error::SensorsAsleep)
        }
    }

    /// Wait until `bootup_secs` (plus margin) have passed since the rail came up
    async fn wait_for_boot(&self, bootup_secs: u32) {
        let Some(woke_at) = self.woke_at.get() else {
            return;
        };
        let ready_at = woke_at + Duration::secs(u64::from(bootup_secs));
        let now = self.handle.now();
        if now <= ready_at {
            let wait = (ready_at - now) + self.timing.boot_margin;
            info!("Waiting {} ms for sensor to be ready", wait.ticks());
            self.handle.sleep(wait).await;
        }
    }

    /// One command, retried on silence. The caller holds the lock.
    async fn exchange(&self, line: &mut Line<S, P, D>, command: &str) -> Result<Response, Sdi12Error> {
        for attempt in 1..=self.timing.attempts {
            line.wake(&self.timing)?;
            line.transmit(command, &self.timing)?;

            let limit = Duration::millis(self.timing.response_timeout.ticks() * u64::from(attempt));
            let ready = self
                .handle
                .timeout(limit, self.handle.readable(line.port.serial_mut()))
                .await;
            match ready {
                Ok(Ok(())) => {
                    let reply = line
                        .port
                        .read_until_terminal(self.timing.line_timeout)
                        .await
                        .map_err(|_| Sdi12Error::Serial)?;
                    if reply.is_ok() && !reply.is_empty() {
                        info!("Read data from SDI-12: {}", reply.as_str());
                        return Ok(reply);
                    }
                    error!("Incomplete reply to {}: {}", command, reply.as_str());
                }
                Ok(Err(_)) => return Err(Sdi12Error::Serial),
                Err(_) => error!("No response to {} on attempt {}", command, attempt),
            }
            self.handle.sleep(self.timing.retry_delay).await;
        }
        Err(Sdi12Error::NoResponse {
            address: command.chars().next().unwrap_or('?'),
        })
    }

    /// [`exchange`](Self::exchange) until the reply comes from `address`
    async fn addressed(
        &self,
        line: &mut Line<S, P, D>,
        command: &str,
        address: Address,
    ) -> Result<Response, Sdi12Error> {
        let expected = address.as_char();
        let mut retries = 0;
        loop {
            let reply = self.exchange(line, command).await?;
            let received = reply.as_str().chars().next().unwrap_or('?');
            if received == expected {
                return Ok(reply);
            }
            debug!(
                "Received response from sensor {}. Expected sensor {}",
                received, expected
            );
            if retries >= self.timing.address_retries {
                error!("Sensor {} never answered {}", expected, command);
                return Err(Sdi12Error::AddressMismatch { expected, received });
            }
            retries += 1;
        }
    }

    fn data_values(reply: &Response, crc: bool) -> Result<Values, Sdi12Error> {
        let line = reply.tokens().next().unwrap_or("");
        let line = if crc { strip_crc(line)? } else { line };
        // Address already checked
        parse_values(line.get(1..).unwrap_or(""))
    }

    /// Take one measurement and return the configured readings, scaled.
    ///
    /// Fails with [`Sdi12Error::SensorsAsleep`] before touching the bus if
    /// the rail is off.
    pub async fn read_sensor(&self, sensor: &SensorConfig) -> Result<Readings, Sdi12Error> {
        self.check_awake()?;
        info!("Reading sensor: {}", sensor.name.as_str());
        self.wait_for_boot(sensor.bootup_time).await;

        let address = sensor.address;
        let mut command = Command::new();
        let suffix = if sensor.crc { "C" } else { "" };
        write!(command, "{}M{}!", address, suffix).map_err(|_| Sdi12Error::InvalidCommand)?;

        let measure = {
            let mut line = self.line.lock().await;
            let reply = self.addressed(&mut line, &command, address).await?;
            let measure = parse_measure_reply(reply.as_str())?;
            if measure.delay_secs > 0 {
                debug!("Sensor {} converting for {} s", address.as_char(), measure.delay_secs);
                self.handle
                    .sleep(Duration::secs(u64::from(measure.delay_secs)))
                    .await;
            }
            measure
        };

        let wanted = usize::from(measure.count).min(sensor.max_index());
        let mut values = Values::new();
        let mut data_index = 0;
        while values.len() < wanted && data_index <= 9 {
            command.clear();
            write!(command, "{}D{}!", address, data_index).map_err(|_| Sdi12Error::InvalidCommand)?;
            let reply = {
                let mut line = self.line.lock().await;
                self.addressed(&mut line, &command, address).await?
            };
            let parsed = Self::data_values(&reply, sensor.crc)?;
            if parsed.is_empty() {
                warn!("Sensor {} has no more values after {}", address.as_char(), values.len());
                break;
            }
            for value in parsed {
                if values.push(value).is_err() {
                    break;
                }
            }
            data_index += 1;
            self.handle.yield_now().await;
        }

        let mut readings = Readings::new();
        for reading in &sensor.readings {
            let position = usize::from(reading.index).checked_sub(1);
            let Some(raw) = position.and_then(|i| values.get(i)) else {
                warn!("No value for reading {}", reading.name.as_str());
                continue;
            };
            if readings.insert(reading.name.clone(), reading.apply(*raw)).is_err() {
                warn!("Dropped reading {}", reading.name.as_str());
            }
        }
        Ok(readings)
    }

    /// Address of the only sensor on the bus (`?!`)
    pub async fn query_address(&self) -> Result<Address, Sdi12Error> {
        self.check_awake()?;
        let reply = {
            let mut line = self.line.lock().await;
            self.exchange(&mut line, ADDRESS_QUERY).await?
        };
        reply
            .as_str()
            .chars()
            .next()
            .and_then(|c| Address::new(c).ok())
            .ok_or(Sdi12Error::Malformed)
    }

    /// Send a raw command and return the reply as-is.
    ///
    /// For maintenance. The caller is responsible for boot-up time.
    pub async fn run_command(&self, command: &str) -> Result<Response, Sdi12Error> {
        self.check_awake()?;
        let addressed = command
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '?');
        if !addressed || !command.ends_with('!') {
            return Err(Sdi12Error::InvalidCommand);
        }
        let mut line = self.line.lock().await;
        self.exchange(&mut line, command).await
    }

    /// Switch the rail off, float every bus pin and hand everything back
    pub fn release(mut self) -> BusParts<S, P, D> {
        if self.enable.set_low().is_err() {
            error!("Failed to switch off the sensor rail");
        }
        let Line {
            port,
            mut dir,
            mut force_out,
            delay,
        } = self.line.into_inner();
        if dir.set_floating().is_err()
            || force_out.set_floating().is_err()
            || self.enable.set_floating().is_err()
        {
            error!("Failed to float the bus pins");
        }
        BusParts {
            serial: port.into_inner(),
            pins: BusPins {
                dir,
                force_out,
                enable: self.enable,
            },
            delay,
        }
    }
}
