//! Modem timing and behaviour settings

use datalogger_hal::serial::LineConfig;
use datalogger_hal::time::Duration;

/// What `initialise` does about the data connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NetworkPolicy {
    /// Mark the network as available without waiting for an IP address.
    ///
    /// TCP/IP through the module works before `+CGDCONT?` reports an
    /// address, so waiting only costs power. An unregistered module is then
    /// discovered later by a failed MQTT connect.
    AssumeConnected,
    /// Run [`acquire_network`](super::Modem::acquire_network) and trust its
    /// answer
    AcquireIp,
}

/// SARA-R4 driver configuration
#[derive(Debug, Clone)]
pub struct ModemConfig {
    /// UART framing the BSP must set up
    pub line: LineConfig,
    /// Standard AT command timeout
    pub command_timeout: Duration,
    /// Pause between writing a command and the first read
    pub settle_delay: Duration,
    /// Timeout of the bare `AT` liveness probe
    pub probe_timeout: Duration,
    /// Power key low time to switch on (data sheet: 0.15 s to 3.2 s)
    pub power_on_pulse: Duration,
    /// Power key low time for a graceful switch-off (data sheet: at least 1.5 s)
    pub power_off_pulse: Duration,
    /// Text printed by the module once it is up
    pub greeting: &'static str,
    /// How long to wait for the greeting after the power-on pulse
    pub greeting_window: Duration,
    /// Poll interval while waiting for the greeting
    pub greeting_poll: Duration,
    /// Timeout of `+CPWROFF`
    pub power_off_timeout: Duration,
    /// Pause after `+CPWROFF` before checking for silence
    pub power_off_settle: Duration,
    /// How long the module may keep answering after `+CPWROFF`
    pub power_off_window: Duration,
    /// Timeout of MQTT login and publish
    pub mqtt_timeout: Duration,
    /// MQTT keep-alive, seconds
    pub mqtt_keep_alive_secs: u32,
    /// Interval between IP address checks
    pub network_poll_interval: Duration,
    /// How long to poll before soft resetting the module
    pub network_poll_window: Duration,
    /// Wait after the `+CFUN=15` soft reset
    pub soft_reset_settle: Duration,
    /// Checks after the soft reset settle period
    pub recheck_count: u32,
    /// Interval between those checks
    pub recheck_interval: Duration,
    /// `+CSQ` attempts while the signal reads as unknown
    pub signal_attempts: u32,
    /// Pause between `+CSQ` attempts
    pub signal_retry_delay: Duration,
    pub network_policy: NetworkPolicy,
    /// Module file holding the HTTP POST body
    pub http_body_file: &'static str,
    /// Module file receiving the HTTP response
    pub http_response_file: &'static str,
    /// Pause between the upload prompt and the raw bytes
    pub upload_settle: Duration,
    /// Time allowed for the module to confirm an upload
    pub upload_confirm_timeout: Duration,
    /// Fixed offset added to the module clock (seconds). The module reports
    /// UTC; this yields local standard time.
    pub time_offset_secs: i32,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            line: LineConfig::eight_n_one(115_200),
            command_timeout: Duration::millis(1000),
            settle_delay: Duration::millis(10),
            probe_timeout: Duration::millis(100),
            power_on_pulse: Duration::millis(300),
            power_off_pulse: Duration::millis(1750),
            greeting: "SARA-R410M-02B-01 Operational",
            greeting_window: Duration::millis(5000),
            greeting_poll: Duration::millis(75),
            power_off_timeout: Duration::millis(1500),
            power_off_settle: Duration::millis(200),
            power_off_window: Duration::millis(1000),
            mqtt_timeout: Duration::millis(120_000),
            mqtt_keep_alive_secs: 60,
            network_poll_interval: Duration::millis(2000),
            network_poll_window: Duration::millis(10_000),
            soft_reset_settle: Duration::millis(15_000),
            recheck_count: 5,
            recheck_interval: Duration::millis(5000),
            signal_attempts: 3,
            signal_retry_delay: Duration::millis(1000),
            network_policy: NetworkPolicy::AssumeConnected,
            http_body_file: "post_data.tmp",
            http_response_file: "post_resp",
            upload_settle: Duration::millis(100),
            upload_confirm_timeout: Duration::millis(500),
            time_offset_secs: 12 * 3600,
        }
    }
}
