//! u-blox SARA-R4 cellular modem driver
//!
//! Drives the module over its AT command interface and its `PWR_ON` power
//! key. One command is in flight at a time: every exchange borrows the
//! driver mutably.
//!
//! Failure model:
//! - A command that times out or answers `ERROR` is an expected outcome. It
//!   is logged and reported as `false` or an empty [`Response`].
//! - [`ModemError`] is reserved for transport/pin faults, file uploads the
//!   module did not confirm, and transmit requests to a module that never
//!   came up.

mod clock;
mod config;
mod error;

use core::fmt::Write as _;

use datalogger_hal::time::Duration;
use datalogger_hal::FlexPin;
use embedded_io::{Read, ReadReady, Write};
use heapless::String;

use crate::payload::{watershed_json, MergedReadings};
use crate::protocol::{AtFraming, CommandPort, Completion, Framing, Response};
use crate::runtime::Handle;

pub use clock::{parse_cclk, NetworkTime};
pub use config::{ModemConfig, NetworkPolicy};
pub use error::ModemError;

/// `+CSQ` value for "not known or not detectable"
pub const SIGNAL_UNKNOWN: u8 = 99;

/// Strongest `+CSQ` reading
pub const SIGNAL_MAX: u8 = 31;

/// Longest command line, `AT` prefix included
pub const MAX_COMMAND_LEN: usize = 2560;

type Command = String<MAX_COMMAND_LEN>;

pub type Imei = String<16>;

/// Where the module is in its life cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ModemState {
    Off,
    /// Power pulse sent, waiting for the greeting
    Booting,
    /// Answers AT commands
    Operational,
    /// Waiting for an IP address
    Registering,
    /// Has an IP address (or is assumed to)
    Registered,
    MqttConnected,
    HttpReady,
}

fn command(args: core::fmt::Arguments<'_>) -> Result<Command, ModemError> {
    let mut line = Command::new();
    line.write_fmt(args)
        .map_err(|_| ModemError::CommandTooLong)?;
    Ok(line)
}

/// First number of a `+CSQ: <rssi>,<qual>` value
fn parse_signal_power(value: &str) -> Option<u8> {
    let rssi = value.split(',').next()?.trim().parse::<u8>().ok()?;
    (rssi <= SIGNAL_MAX || rssi == SIGNAL_UNKNOWN).then_some(rssi)
}

/// Signal power as a percentage of the strongest reading
pub fn coverage_percent(signal_power: u8) -> Option<u8> {
    (signal_power <= SIGNAL_MAX).then(|| (u16::from(signal_power) * 100 / u16::from(SIGNAL_MAX)) as u8)
}

pub struct Modem<S, P> {
    port: CommandPort<S, AtFraming>,
    power_key: P,
    handle: Handle,
    config: ModemConfig,
    state: ModemState,
    has_serial: bool,
    has_network: bool,
    signal_power: u8,
}

impl<S, P> Modem<S, P>
where
    S: Read + Write + ReadReady,
    P: FlexPin,
{
    /// Take ownership of the UART and power key. Nothing is sent yet.
    pub fn new(serial: S, power_key: P, handle: Handle, config: ModemConfig) -> Self {
        Self {
            port: CommandPort::new(serial, handle.clone()),
            power_key,
            handle,
            config,
            state: ModemState::Off,
            has_serial: false,
            has_network: false,
            signal_power: SIGNAL_UNKNOWN,
        }
    }

    pub fn state(&self) -> ModemState {
        self.state
    }

    pub fn has_serial(&self) -> bool {
        self.has_serial
    }

    pub fn has_network(&self) -> bool {
        self.has_network
    }

    /// Last `+CSQ` reading, [`SIGNAL_UNKNOWN`] until measured
    pub fn signal_power(&self) -> u8 {
        self.signal_power
    }

    pub fn config(&self) -> &ModemConfig {
        &self.config
    }

    /// Float the power key and hand back the UART and pin
    pub fn release(mut self) -> (S, P) {
        if self.power_key.set_floating().is_err() {
            error!("Failed to float the power key");
        }
        (self.port.into_inner(), self.power_key)
    }

    /// Send `AT<command>` and collect the reply.
    ///
    /// Only a transport fault is an error; check the returned completion.
    pub async fn command_read_with(
        &mut self,
        cmd: &str,
        timeout: Duration,
        silent: bool,
    ) -> Result<Response, ModemError> {
        let line = command(format_args!("AT{}", cmd))?;
        self.port.send(&line).map_err(|_| ModemError::Serial)?;
        self.handle.sleep(self.config.settle_delay).await;
        let response = self
            .port
            .read_until_terminal(timeout)
            .await
            .map_err(|_| ModemError::Serial)?;

        match response.completion() {
            Completion::Ok => debug!("{}", response.as_str()),
            Completion::Error => error!("{}", response.as_str()),
            Completion::TimedOut if silent => {}
            Completion::TimedOut if response.is_empty() => {
                error!("AT{} No response received within {} ms", cmd, timeout.ticks())
            }
            Completion::TimedOut => {
                error!("{}", response.as_str());
                error!("\"OK\" not received within {} ms", timeout.ticks());
            }
        }
        Ok(response)
    }

    pub async fn command_read(&mut self, cmd: &str) -> Result<Response, ModemError> {
        self.command_read_with(cmd, self.config.command_timeout, false)
            .await
    }

    /// Whether `AT<command>` answers `OK`
    pub async fn command_check(&mut self, cmd: &str) -> Result<bool, ModemError> {
        Ok(self.command_read(cmd).await?.is_ok())
    }

    /// Bare `AT`
    pub async fn command_at(&mut self) -> Result<bool, ModemError> {
        self.command_check("").await
    }

    async fn probe(&mut self) -> Result<bool, ModemError> {
        let timeout = self.config.probe_timeout;
        Ok(self.command_read_with("", timeout, true).await?.is_ok())
    }

    fn require_serial(&self) -> Result<(), ModemError> {
        if self.has_serial {
            Ok(())
        } else {
            error!("Modem has no serial connection");
            Err(ModemError::NoResponse)
        }
    }

    /// Switch the module on unless it already answers.
    ///
    /// Returns whether it is operational.
    pub async fn power_on(&mut self) -> Result<bool, ModemError> {
        if self.probe().await? {
            warn!("Modem already responds to AT");
            warn!("Skipping power key pulse");
            self.has_serial = true;
            self.state = ModemState::Operational;
            return Ok(true);
        }

        info!("Powering on modem");
        self.state = ModemState::Booting;
        self.power_key.set_low().map_err(|_| ModemError::Pin)?;
        self.handle.sleep(self.config.power_on_pulse).await;
        self.power_key.set_high().map_err(|_| ModemError::Pin)?;

        let started = self.handle.now();
        let greeting = self.config.greeting;
        let booted = self
            .port
            .poll_until(
                self.config.greeting_window,
                self.config.greeting_poll,
                |raw| {
                    raw.split("\r\n")
                        .any(|t| t.trim() == greeting)
                        .then_some(Completion::Ok)
                },
            )
            .await
            .map_err(|_| ModemError::Serial)?;
        let elapsed = (self.handle.now() - started).ticks();

        let mut responsive = booted.is_ok();
        if !responsive {
            warn!(
                "No greeting within {} ms, probing with AT",
                self.config.greeting_window.ticks()
            );
            responsive = self.probe().await?;
        }
        if responsive {
            info!("Modem operational after {} ms", elapsed);
        } else {
            error!("Modem not operational after {} ms", elapsed);
        }

        // The module pulls the key up once released; a low level here
        // would hold it in reset.
        self.power_key.set_floating().map_err(|_| ModemError::Pin)?;
        if self.power_key.is_low().map_err(|_| ModemError::Pin)? {
            error!("Power key low while floating after power-on");
            info!("Driving power key high");
            self.power_key.set_high().map_err(|_| ModemError::Pin)?;
        }

        self.has_serial = responsive;
        self.state = if responsive {
            ModemState::Operational
        } else {
            ModemState::Off
        };
        Ok(responsive)
    }

    fn settle_power_key(&mut self) -> Result<(), ModemError> {
        self.power_key.set_floating().map_err(|_| ModemError::Pin)?;
        if !self.power_key.is_low().map_err(|_| ModemError::Pin)? {
            return Ok(());
        }
        error!("Power key low while floating before power-off");
        self.power_key.set_high().map_err(|_| ModemError::Pin)?;
        self.power_key.set_floating().map_err(|_| ModemError::Pin)?;
        if self.power_key.is_low().map_err(|_| ModemError::Pin)? {
            error!("Power key still low, holding it high");
            self.power_key.set_high().map_err(|_| ModemError::Pin)?;
        }
        Ok(())
    }

    /// Switch the module off with `+CPWROFF`, falling back to the power key.
    ///
    /// Returns whether silence was confirmed.
    pub async fn power_off(&mut self) -> Result<bool, ModemError> {
        info!("Powering off modem");
        self.settle_power_key()?;

        let timeout = self.config.power_off_timeout;
        self.command_read_with("+CPWROFF", timeout, false).await?;
        self.handle.sleep(self.config.power_off_settle).await;

        let deadline = self.handle.now() + self.config.power_off_window;
        let mut responsive = self.probe().await?;
        while responsive && self.handle.now() < deadline {
            responsive = self.probe().await?;
        }

        if responsive {
            error!("Modem still responds after +CPWROFF");
            info!("Attempting power-off with the power key");
            self.power_key.set_low().map_err(|_| ModemError::Pin)?;
            self.handle.sleep(self.config.power_off_pulse).await;
            self.power_key.set_high().map_err(|_| ModemError::Pin)?;
            responsive = self.probe().await?;
            if responsive {
                error!("Failed to power off the modem with the power key");
            }
        }
        if !responsive {
            info!("Power-off confirmed");
            self.has_serial = false;
            self.has_network = false;
            self.state = ModemState::Off;
        }
        self.power_key.set_floating().map_err(|_| ModemError::Pin)?;
        Ok(!responsive)
    }

    /// Bring the module up for a transmission. Returns `has_network`.
    pub async fn initialise(&mut self) -> Result<bool, ModemError> {
        debug!("Initialising modem");
        if !self.has_serial {
            self.power_on().await?;
        }
        if !self.has_serial {
            error!("Unable to establish serial connection to the modem");
            return Ok(false);
        }

        match self.config.network_policy {
            NetworkPolicy::AssumeConnected => {
                debug!("Assuming network is available");
                self.has_network = true;
                self.state = ModemState::Registered;
            }
            NetworkPolicy::AcquireIp => {
                self.acquire_network().await?;
            }
        }

        if self.has_network {
            self.configure().await?;
            // A session may have survived the last wake.
            self.mqtt_disconnect().await?;
        }
        Ok(self.has_network)
    }

    /// Enable automatic time zone update if it is off. Stored in NVM.
    pub async fn configure(&mut self) -> Result<bool, ModemError> {
        let response = self.command_read("+CTZU?").await?;
        if !response.is_ok() {
            return Ok(false);
        }
        if response.value_of("+CTZU:") == Some("1") {
            return Ok(true);
        }
        warn!("Enabling automatic time zone update");
        self.command_check("+CTZU=1").await
    }

    /// Whether the PDP context has an IP address
    pub async fn check_network(&mut self) -> Result<bool, ModemError> {
        let response = self.command_read("+CGDCONT?").await?;
        self.has_network = response.is_ok() && !response.contains("\"0.0.0.0\"");
        Ok(self.has_network)
    }

    /// Wait for an IP address, soft resetting the module once if needed.
    ///
    /// Bounded: about 10 s of polling, 15 s settle, then 5 checks 5 s apart.
    pub async fn acquire_network(&mut self) -> Result<bool, ModemError> {
        self.state = ModemState::Registering;
        let started = self.handle.now();
        self.check_network().await?;
        let mut timed_out = false;
        while !self.has_network && !timed_out {
            self.handle.sleep(self.config.network_poll_interval).await;
            self.check_network().await?;
            timed_out = self.handle.now() - started > self.config.network_poll_window;
        }

        if !self.has_network {
            warn!("Automatic network registration failed, soft resetting the modem");
            self.command_check("+CFUN=15").await?;
            debug!(
                "Waiting {} ms for registration after soft reset",
                self.config.soft_reset_settle.ticks()
            );
            self.handle.sleep(self.config.soft_reset_settle).await;

            self.check_network().await?;
            let mut checks = 1;
            while !self.has_network && checks <= self.config.recheck_count {
                error!("No IP address after network check {}", checks);
                self.handle.sleep(self.config.recheck_interval).await;
                self.check_network().await?;
                checks += 1;
            }
        }

        if self.has_network {
            info!("Network acquired");
            self.state = ModemState::Registered;
        } else {
            error!("Unable to obtain an IP address from the LTE network");
            self.state = ModemState::Operational;
        }
        Ok(self.has_network)
    }

    /// Measure signal power (0 to 31, or [`SIGNAL_UNKNOWN`])
    pub async fn get_signal_power(&mut self) -> Result<u8, ModemError> {
        self.signal_power = SIGNAL_UNKNOWN;
        let mut attempts = 0;
        while self.signal_power == SIGNAL_UNKNOWN && attempts < self.config.signal_attempts {
            let response = self.command_read("+CSQ").await?;
            self.signal_power = response
                .value_of("+CSQ:")
                .and_then(parse_signal_power)
                .unwrap_or(SIGNAL_UNKNOWN);
            attempts += 1;
            if self.signal_power == SIGNAL_UNKNOWN && attempts < self.config.signal_attempts {
                debug!("Retrying +CSQ");
                self.handle.sleep(self.config.signal_retry_delay).await;
            }
        }

        match self.signal_power {
            0 => warn!("Cellular network RSSI <= -113 dBm"),
            SIGNAL_UNKNOWN => error!("Cellular network RSSI not known or not detected"),
            power => info!(
                "Radio signal strength: {} ({}%)",
                power,
                coverage_percent(power).unwrap_or(0)
            ),
        }
        Ok(self.signal_power)
    }

    /// Store the MQTT client id and broker in the module's NVM profile
    pub async fn mqtt_set_client(&mut self, client_id: &str, server: &str) -> Result<bool, ModemError> {
        let id = command(format_args!("+UMQTT=0,\"{}\"", client_id))?;
        self.command_check(&id).await?;
        let broker = command(format_args!("+UMQTT=2,\"{}\"", server))?;
        self.command_check(&broker).await?;
        self.command_check("+UMQTTNV=2").await
    }

    /// Restore the factory MQTT profile
    pub async fn mqtt_reset(&mut self) -> Result<bool, ModemError> {
        self.command_check("+UMQTTNV=0").await
    }

    /// Load the stored profile and log in to the broker
    pub async fn mqtt_connect(&mut self) -> Result<bool, ModemError> {
        self.require_serial()?;
        self.command_check("+UMQTTNV=1").await?;
        let keep_alive = command(format_args!("+UMQTT=10,{}", self.config.mqtt_keep_alive_secs))?;
        self.command_check(&keep_alive).await?;
        let timeout = self.config.mqtt_timeout;
        let connected = self.command_read_with("+UMQTTC=1", timeout, false).await?.is_ok();
        if connected {
            self.state = ModemState::MqttConnected;
        } else {
            error!("Failed to connect to the MQTT broker");
        }
        Ok(connected)
    }

    /// Publish at QoS 0. Messages containing quotes go out hex encoded.
    pub async fn mqtt_publish(&mut self, topic: &str, message: &str) -> Result<bool, ModemError> {
        self.require_serial()?;
        let line = if message.contains('"') {
            let mut line = command(format_args!("+UMQTTC=2,0,0,1,\"{}\",\"", topic))?;
            for b in message.bytes() {
                write!(line, "{:02X}", b).map_err(|_| ModemError::CommandTooLong)?;
            }
            line.push('"').map_err(|_| ModemError::CommandTooLong)?;
            line
        } else {
            command(format_args!("+UMQTTC=2,0,0,\"{}\",\"{}\"", topic, message))?
        };
        let timeout = self.config.mqtt_timeout;
        Ok(self.command_read_with(&line, timeout, false).await?.is_ok())
    }

    /// Log out of the broker
    pub async fn mqtt_disconnect(&mut self) -> Result<bool, ModemError> {
        let done = self.command_check("+UMQTTC=0").await?;
        if self.state == ModemState::MqttConnected {
            self.state = ModemState::Registered;
        }
        Ok(done)
    }

    /// Point HTTP profile 0 at `server`
    pub async fn http_connect(&mut self, server: &str) -> Result<bool, ModemError> {
        let line = command(format_args!("+UHTTP=0,1,\"{}\"", server))?;
        let ready = self.command_check(&line).await?;
        if ready {
            self.state = ModemState::HttpReady;
        }
        Ok(ready)
    }

    /// POST readings to a MonitorMyWatershed endpoint on profile 0.
    ///
    /// The body is uploaded to a module file first; `taken_at` is UTC and
    /// is stamped with the configured fixed offset.
    pub async fn http_send(
        &mut self,
        registration_token: &str,
        sampling_feature: &str,
        taken_at: i64,
        values: &MergedReadings,
        path: &str,
    ) -> Result<bool, ModemError> {
        self.require_serial()?;
        let auth = command(format_args!("+UHTTP=0,9,\"0:TOKEN:{}\"", registration_token))?;
        self.command_read(&auth).await?;

        let body = watershed_json(sampling_feature, taken_at, self.config.time_offset_secs, values)?;
        let body_file = self.config.http_body_file;
        self.file_write(body_file, body.as_bytes(), false).await?;

        let post = command(format_args!(
            "+UHTTPC=0,4,\"{}\",\"{}\",\"{}\",4",
            path, self.config.http_response_file, body_file
        ))?;
        Ok(self.command_read(&post).await?.is_ok())
    }

    /// Last HTTP error of profile 0 (`+UHTTPER`)
    pub async fn http_last_error(&mut self) -> Result<Response, ModemError> {
        self.command_read("+UHTTPER=0").await
    }

    /// Write `data` to a module file, replacing it unless `append`
    pub async fn file_write(&mut self, filename: &str, data: &[u8], append: bool) -> Result<(), ModemError> {
        if !append {
            // A missing file just logs an error.
            debug!("Deleting file from modem: {}", filename);
            let delete = command(format_args!("+UDELFILE=\"{}\"", filename))?;
            self.command_read(&delete).await?;
        }

        let upload = command(format_args!("AT+UDWNFILE=\"{}\",{}", filename, data.len()))?;
        self.port.send(&upload).map_err(|_| ModemError::Serial)?;
        let prompt = self
            .port
            .read_until(self.config.command_timeout, |raw| {
                if raw.contains('>') {
                    Some(Completion::Ok)
                } else {
                    AtFraming::completion(raw)
                }
            })
            .await
            .map_err(|_| ModemError::Serial)?;
        if !prompt.is_ok() {
            error!("No upload prompt for {}: {}", filename, prompt.as_str());
            return Err(ModemError::FileWrite);
        }

        self.handle.sleep(self.config.upload_settle).await;
        self.port.send_raw(data).map_err(|_| ModemError::Serial)?;
        let confirm = self
            .port
            .read_until_terminal(self.config.upload_confirm_timeout)
            .await
            .map_err(|_| ModemError::Serial)?;
        debug!("{}", confirm.as_str());
        if !confirm.is_ok() {
            error!("Writing file {} failed", filename);
            return Err(ModemError::FileWrite);
        }
        Ok(())
    }

    /// Read the module clock. `None` if it has no valid time.
    pub async fn get_network_time(&mut self) -> Result<Option<NetworkTime>, ModemError> {
        let response = self.command_read("+CCLK?").await?;
        let Some((time, zone)) = response.value_of("+CCLK:").and_then(parse_cclk) else {
            error!("Unable to obtain network time");
            return Ok(None);
        };
        let utc = time.to_unix();
        let local = utc + i64::from(self.config.time_offset_secs);
        info!("Network time: {} (UTC)", utc);
        Ok(Some(NetworkTime {
            utc,
            local,
            reported_zone: zone,
        }))
    }

    /// IMEI (`+CGSN`)
    pub async fn imei(&mut self) -> Result<Option<Imei>, ModemError> {
        let response = self.command_read("+CGSN").await?;
        if !response.is_ok() {
            return Ok(None);
        }
        let imei = response
            .tokens()
            .find(|t| t.len() == 15 && t.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|t| Imei::try_from(t).ok());
        Ok(imei)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{event_log, EventLog, FakeModem, ManualClock, MockPin, PinEvent};
    use crate::runtime::{Runtime, RuntimeConfig};
    use heapless::LinearMap;
    use std::vec::Vec;

    struct Rig {
        clock: ManualClock,
        fake: FakeModem,
        log: EventLog,
        rt: Runtime,
    }

    impl Rig {
        fn new(running: bool) -> Self {
            let clock = ManualClock::new();
            let fake = if running {
                FakeModem::running(&clock)
            } else {
                FakeModem::new(&clock)
            };
            let rt = Runtime::new(clock.clone(), RuntimeConfig::default());
            Self {
                clock,
                fake,
                log: event_log(),
                rt,
            }
        }

        fn key(&self) -> MockPin {
            MockPin::new("key", &self.clock, &self.log).with_hook(self.fake.key_hook())
        }

        fn modem(&self, config: ModemConfig) -> Modem<FakeModem, MockPin> {
            Modem::new(self.fake.clone(), self.key(), self.rt.handle(), config)
        }

        fn key_events(&self) -> Vec<PinEvent> {
            self.log.borrow().iter().map(|(_, e)| *e).collect()
        }
    }

    #[test]
    fn test_power_on_skips_pulse_when_already_responsive() {
        let rig = Rig::new(true);
        let mut modem = rig.modem(ModemConfig::default());
        let on = rig
            .rt
            .run_until_complete(async move { modem.power_on().await.unwrap() })
            .unwrap();
        assert!(on);
        assert!(!rig.key_events().contains(&PinEvent::Low));
        assert_eq!(rig.fake.sim().boots, 0);
    }

    #[test]
    fn test_power_on_pulses_and_waits_for_greeting() {
        let rig = Rig::new(false);
        let mut modem = rig.modem(ModemConfig::default());
        let (on, state) = rig
            .rt
            .run_until_complete(async move {
                let on = modem.power_on().await.unwrap();
                (on, modem.state())
            })
            .unwrap();
        assert!(on);
        assert_eq!(state, ModemState::Operational);
        assert_eq!(rig.fake.sim().boots, 1);
        assert_eq!(
            rig.key_events(),
            [PinEvent::Low, PinEvent::High, PinEvent::Float]
        );
        // Probe, pulse, then the four second boot
        assert!(rig.clock.now_ms() >= 110 + 300 + 4000);
        assert!(rig.clock.now_ms() < 110 + 300 + 5000);
    }

    #[test]
    fn test_power_on_corrects_floating_low_key() {
        let rig = Rig::new(false);
        let key = rig.key();
        key.float_level().set(false);
        let mut modem = Modem::new(rig.fake.clone(), key, rig.rt.handle(), ModemConfig::default());
        rig.rt
            .run_until_complete(async move { modem.power_on().await.unwrap() })
            .unwrap();
        assert_eq!(
            rig.key_events(),
            [PinEvent::Low, PinEvent::High, PinEvent::Float, PinEvent::High]
        );
    }

    #[test]
    fn test_power_on_gives_up_when_module_is_dead() {
        let rig = Rig::new(false);
        // No hook: the pulse never reaches the module.
        let key = MockPin::new("key", &rig.clock, &rig.log);
        let mut modem = Modem::new(rig.fake.clone(), key, rig.rt.handle(), ModemConfig::default());
        let (on, has_serial) = rig
            .rt
            .run_until_complete(async move {
                let on = modem.power_on().await.unwrap();
                (on, modem.has_serial())
            })
            .unwrap();
        assert!(!on);
        assert!(!has_serial);
        assert!(rig.clock.now_ms() < 110 + 300 + 5000 + 200);
    }

    #[test]
    fn test_power_off_confirms_silence() {
        let rig = Rig::new(true);
        let mut modem = rig.modem(ModemConfig::default());
        let (off, probe) = rig
            .rt
            .run_until_complete(async move {
                let off = modem.power_off().await.unwrap();
                let probe = modem.command_at().await.unwrap();
                (off, probe)
            })
            .unwrap();
        assert!(off);
        assert!(!probe);
        assert_eq!(rig.fake.commands(), ["+CPWROFF"]);
        assert!(!rig.key_events().contains(&PinEvent::Low));
    }

    #[test]
    fn test_power_off_falls_back_to_key_pulse() {
        let rig = Rig::new(true);
        rig.fake.sim().ignores_power_off = true;
        let mut modem = rig.modem(ModemConfig::default());
        let off = rig
            .rt
            .run_until_complete(async move { modem.power_off().await.unwrap() })
            .unwrap();
        assert!(off);
        assert!(!rig.fake.sim().powered);
        let events = rig.key_events();
        assert_eq!(events.first(), Some(&PinEvent::Float));
        assert!(events.contains(&PinEvent::Low));
        assert_eq!(events.last(), Some(&PinEvent::Float));
    }

    #[test]
    fn test_initialise_assumes_network_by_default() {
        let rig = Rig::new(true);
        let mut modem = rig.modem(ModemConfig::default());
        let networked = rig
            .rt
            .run_until_complete(async move { modem.initialise().await.unwrap() })
            .unwrap();
        assert!(networked);
        assert_eq!(rig.fake.commands(), ["", "+CTZU?", "+UMQTTC=0"]);
    }

    #[test]
    fn test_initialise_enables_time_zone_update() {
        let rig = Rig::new(true);
        rig.fake.reply_once("+CTZU?", &["+CTZU: 0", "OK"]);
        let mut modem = rig.modem(ModemConfig::default());
        rig.rt
            .run_until_complete(async move { modem.initialise().await.unwrap() })
            .unwrap();
        assert!(rig.fake.commands().contains(&"+CTZU=1".into()));
    }

    #[test]
    fn test_initialise_can_require_an_ip_address() {
        let rig = Rig::new(true);
        let config = ModemConfig {
            network_policy: NetworkPolicy::AcquireIp,
            ..ModemConfig::default()
        };
        let mut modem = rig.modem(config);
        let networked = rig
            .rt
            .run_until_complete(async move { modem.initialise().await.unwrap() })
            .unwrap();
        assert!(networked);
        assert_eq!(rig.fake.commands()[1], "+CGDCONT?");
    }

    #[test]
    fn test_acquire_network_soft_resets_then_gives_up() {
        let rig = Rig::new(true);
        rig.fake.reply_always(
            "+CGDCONT?",
            &["+CGDCONT: 1,\"IP\",\"hologram\",\"0.0.0.0\",0,0,0,0", "OK"],
        );
        let mut modem = rig.modem(ModemConfig::default());
        let (networked, state) = rig
            .rt
            .run_until_complete(async move {
                let networked = modem.acquire_network().await.unwrap();
                (networked, modem.state())
            })
            .unwrap();
        assert!(!networked);
        assert_eq!(state, ModemState::Operational);

        let commands = rig.fake.commands();
        let reset = commands.iter().position(|c| c == "+CFUN=15").unwrap();
        assert!(reset >= 5);
        assert_eq!(commands[reset + 1..].len(), 6);
        assert!(commands[reset + 1..].iter().all(|c| c == "+CGDCONT?"));
        // 10 s polling, 15 s settle, 25 s of rechecks, plus command time
        assert!(rig.clock.now_ms() < 55_000);
    }

    #[test]
    fn test_signal_power_retries_while_unknown() {
        let rig = Rig::new(true);
        rig.fake.reply_once("+CSQ", &["+CSQ: 99,99", "OK"]);
        rig.fake.reply_once("+CSQ", &["+CSQ: 99,99", "OK"]);
        let mut modem = rig.modem(ModemConfig::default());
        let power = rig
            .rt
            .run_until_complete(async move { modem.get_signal_power().await.unwrap() })
            .unwrap();
        assert_eq!(power, 17);
        assert_eq!(coverage_percent(power), Some(54));
        assert_eq!(rig.fake.commands().len(), 3);
    }

    #[test]
    fn test_signal_power_stops_after_three_attempts() {
        let rig = Rig::new(true);
        rig.fake.reply_always("+CSQ", &["+CSQ: 99,99", "OK"]);
        let mut modem = rig.modem(ModemConfig::default());
        let power = rig
            .rt
            .run_until_complete(async move { modem.get_signal_power().await.unwrap() })
            .unwrap();
        assert_eq!(power, SIGNAL_UNKNOWN);
        assert_eq!(coverage_percent(power), None);
        assert_eq!(rig.fake.commands(), ["+CSQ", "+CSQ", "+CSQ"]);
    }

    #[test]
    fn test_silent_signal_query_is_unknown() {
        let rig = Rig::new(true);
        rig.fake.silent("+CSQ");
        let mut modem = rig.modem(ModemConfig::default());
        let power = rig
            .rt
            .run_until_complete(async move { modem.get_signal_power().await.unwrap() })
            .unwrap();
        assert_eq!(power, SIGNAL_UNKNOWN);
        assert_eq!(rig.fake.commands(), ["+CSQ", "+CSQ", "+CSQ"]);
    }

    #[test]
    fn test_mqtt_session_commands() {
        let rig = Rig::new(true);
        let mut modem = rig.modem(ModemConfig::default());
        let results = rig
            .rt
            .run_until_complete(async move {
                modem.power_on().await.unwrap();
                let set = modem.mqtt_set_client("logger-7", "broker.example.net").await.unwrap();
                let connected = modem.mqtt_connect().await.unwrap();
                let state = modem.state();
                let plain = modem.mqtt_publish("site/7", "hello").await.unwrap();
                let json = modem.mqtt_publish("site/7", "{\"a\":1}").await.unwrap();
                modem.mqtt_disconnect().await.unwrap();
                (set, connected, state, plain, json, modem.state())
            })
            .unwrap();
        assert_eq!(
            results,
            (true, true, ModemState::MqttConnected, true, true, ModemState::Registered)
        );
        assert_eq!(
            rig.fake.commands()[1..],
            [
                "+UMQTT=0,\"logger-7\"",
                "+UMQTT=2,\"broker.example.net\"",
                "+UMQTTNV=2",
                "+UMQTTNV=1",
                "+UMQTT=10,60",
                "+UMQTTC=1",
                "+UMQTTC=2,0,0,\"site/7\",\"hello\"",
                "+UMQTTC=2,0,0,1,\"site/7\",\"7B2261223A317D\"",
                "+UMQTTC=0",
            ]
        );
    }

    #[test]
    fn test_error_reply_is_false_not_an_error() {
        let rig = Rig::new(true);
        rig.fake.reply_once("+UMQTTC=1", &["+CME ERROR: 3"]);
        let mut modem = rig.modem(ModemConfig::default());
        let connected = rig
            .rt
            .run_until_complete(async move {
                modem.power_on().await.unwrap();
                modem.mqtt_connect().await
            })
            .unwrap();
        assert_eq!(connected, Ok(false));
    }

    #[test]
    fn test_transmit_without_serial_is_rejected() {
        let rig = Rig::new(false);
        let mut modem = rig.modem(ModemConfig::default());
        let result = rig
            .rt
            .run_until_complete(async move { modem.mqtt_publish("t", "m").await })
            .unwrap();
        assert_eq!(result, Err(ModemError::NoResponse));
        assert!(rig.fake.commands().is_empty());
    }

    #[test]
    fn test_file_write_uploads_bytes() {
        let rig = Rig::new(true);
        let mut modem = rig.modem(ModemConfig::default());
        let result = rig
            .rt
            .run_until_complete(async move { modem.file_write("data.tmp", b"{\"x\":1}", false).await })
            .unwrap();
        assert_eq!(result, Ok(()));
        assert_eq!(
            rig.fake.commands(),
            ["+UDELFILE=\"data.tmp\"", "+UDWNFILE=\"data.tmp\",7"]
        );
        assert_eq!(rig.fake.sim().files.get("data.tmp").map(Vec::as_slice), Some(&b"{\"x\":1}"[..]));
    }

    #[test]
    fn test_unconfirmed_upload_is_a_file_error() {
        let rig = Rig::new(true);
        rig.fake.sim().upload_fails = true;
        let mut modem = rig.modem(ModemConfig::default());
        let result = rig
            .rt
            .run_until_complete(async move { modem.file_write("data.tmp", b"abc", true).await })
            .unwrap();
        assert_eq!(result, Err(ModemError::FileWrite));
        assert_eq!(rig.fake.commands(), ["+UDWNFILE=\"data.tmp\",3"]);
    }

    #[test]
    fn test_http_send_posts_uploaded_body() {
        let rig = Rig::new(true);
        let mut modem = rig.modem(ModemConfig::default());
        let mut values: MergedReadings = LinearMap::new();
        values.insert(String::try_from("result-uuid").unwrap(), 4.5).unwrap();
        let sent = rig
            .rt
            .run_until_complete(async move {
                modem.power_on().await.unwrap();
                let connected = modem.http_connect("data.envirodiy.org").await.unwrap();
                let sent = modem
                    .http_send("tok", "feature", 1_652_351_391, &values, "/api/data-stream/")
                    .await
                    .unwrap();
                (connected, sent, modem.state())
            })
            .unwrap();
        assert_eq!(sent, (true, true, ModemState::HttpReady));
        assert_eq!(
            rig.fake.commands()[1..],
            [
                "+UHTTP=0,1,\"data.envirodiy.org\"",
                "+UHTTP=0,9,\"0:TOKEN:tok\"",
                "+UDELFILE=\"post_data.tmp\"",
                "+UDWNFILE=\"post_data.tmp\",88",
                "+UHTTPC=0,4,\"/api/data-stream/\",\"post_resp\",\"post_data.tmp\",4",
            ]
        );
        let body = rig.fake.sim().files.get("post_data.tmp").cloned().unwrap();
        assert_eq!(
            body,
            b"{\"sampling_feature\":\"feature\",\"timestamp\":\"2022-05-12T22:29:51+12:00\",\"result-uuid\":4.5}"
        );
    }

    #[test]
    fn test_http_error_query_and_mqtt_profile_reset() {
        let rig = Rig::new(true);
        rig.fake.reply_always("+UHTTPER=0", &["+UHTTPER: 0,3,11", "OK"]);
        let mut modem = rig.modem(ModemConfig::default());
        let (error, reset) = rig
            .rt
            .run_until_complete(async move {
                modem.power_on().await.unwrap();
                let error = modem.http_last_error().await.unwrap();
                let reset = modem.mqtt_reset().await.unwrap();
                (error, reset)
            })
            .unwrap();
        assert_eq!(error.value_of("+UHTTPER:"), Some("0,3,11"));
        assert!(reset);
        assert_eq!(rig.fake.commands()[1..], ["+UHTTPER=0", "+UMQTTNV=0"]);
    }

    #[test]
    fn test_network_time_applies_fixed_offset() {
        let rig = Rig::new(true);
        let mut modem = rig.modem(ModemConfig::default());
        let time = rig
            .rt
            .run_until_complete(async move { modem.get_network_time().await.unwrap() })
            .unwrap()
            .unwrap();
        assert_eq!(time.utc, 1_676_775_142);
        assert_eq!(time.local, 1_676_775_142 + 12 * 3600);
        assert_eq!(time.reported_zone, 52);
    }

    #[test]
    fn test_network_time_error_is_none() {
        let rig = Rig::new(true);
        rig.fake.reply_once("+CCLK?", &["+CME ERROR: 3"]);
        let mut modem = rig.modem(ModemConfig::default());
        let time = rig
            .rt
            .run_until_complete(async move { modem.get_network_time().await.unwrap() })
            .unwrap();
        assert_eq!(time, None);
    }

    #[test]
    fn test_imei_query() {
        let rig = Rig::new(true);
        let mut modem = rig.modem(ModemConfig::default());
        let imei = rig
            .rt
            .run_until_complete(async move { modem.imei().await.unwrap() })
            .unwrap();
        assert_eq!(imei.as_deref(), Some("352753090123456"));
    }

    #[test]
    fn test_residual_bytes_are_dropped_before_a_command() {
        let rig = Rig::new(true);
        rig.fake.inject("\r\n+UUMQTTC: 1,0\r\n");
        let mut modem = rig.modem(ModemConfig::default());
        let response = rig
            .rt
            .run_until_complete(async move { modem.command_read("+CSQ").await.unwrap() })
            .unwrap();
        assert!(response.is_ok());
        assert!(!response.contains("UUMQTTC"));
        assert_eq!(response.tokens().collect::<Vec<_>>(), ["AT+CSQ", "+CSQ: 17,99", "OK"]);
    }
}
