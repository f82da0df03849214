//! Command/response primitive over a half-duplex serial line
//!
//! Both the modem and the SDI-12 bus talk the same way: throw away whatever
//! is sitting in the receive buffer, write one command, then poll until the
//! reply carries a terminal marker or the deadline passes. A plain timeout is
//! not an error here; the [`Response`] says how the exchange ended and the
//! driver decides whether to retry.

use core::marker::PhantomData;

use datalogger_hal::time::Duration;
use embedded_io::{Read, ReadReady, Write};
use heapless::{String, Vec};

use crate::runtime::Handle;

/// Raw bytes kept per exchange; older bytes are dropped first
pub const RAW_CAPACITY: usize = 1024;

/// Normalized text kept per response
pub const RESPONSE_CAPACITY: usize = 512;

/// How an exchange ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Completion {
    /// Success marker seen (`OK`, or a complete SDI-12 line)
    Ok,
    /// Error marker seen (`ERROR`, `+CME ERROR: ...`)
    Error,
    /// Deadline passed without a terminal marker
    TimedOut,
}

/// Line discipline of one protocol
pub trait Framing {
    /// Appended to every command
    const TERMINATOR: &'static [u8];
    /// How often the transport is polled while waiting for a reply
    const POLL_INTERVAL: Duration;

    /// Decide whether the bytes received so far end the exchange
    fn completion(raw: &str) -> Option<Completion>;
}

/// AT commands: `\r` terminated, replies end in a final result code
pub struct AtFraming;

impl Framing for AtFraming {
    const TERMINATOR: &'static [u8] = b"\r";
    const POLL_INTERVAL: Duration = Duration::millis(25);

    fn completion(raw: &str) -> Option<Completion> {
        // Only whole lines count; the last segment may still be arriving.
        let (complete, _partial) = raw.rsplit_once("\r\n")?;
        complete.split("\r\n").map(str::trim).find_map(final_result_code)
    }
}

/// Classify one trimmed AT token
pub fn final_result_code(token: &str) -> Option<Completion> {
    match token {
        "OK" => Some(Completion::Ok),
        "ERROR" => Some(Completion::Error),
        t if t.starts_with("+CME ERROR") || t.starts_with("+CMS ERROR") => {
            Some(Completion::Error)
        }
        _ => None,
    }
}

/// SDI-12: the command carries its own `!`, replies are one CRLF line
pub struct Sdi12Framing;

impl Framing for Sdi12Framing {
    const TERMINATOR: &'static [u8] = b"";
    const POLL_INTERVAL: Duration = Duration::millis(50);

    fn completion(raw: &str) -> Option<Completion> {
        raw.contains("\r\n").then_some(Completion::Ok)
    }
}

/// Normalized reply: CRLF tokens, trimmed, empties dropped, one per line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    text: String<RESPONSE_CAPACITY>,
    completion: Completion,
}

impl Response {
    pub fn new(raw: &str, completion: Completion) -> Self {
        let mut text = String::new();
        for token in raw.split(['\r', '\n']).map(str::trim).filter(|t| !t.is_empty()) {
            let sep = if text.is_empty() { "" } else { "\n" };
            if text.push_str(sep).is_err() || text.push_str(token).is_err() {
                break;
            }
        }
        Self { text, completion }
    }

    pub fn empty() -> Self {
        Self::new("", Completion::TimedOut)
    }

    pub fn completion(&self) -> Completion {
        self.completion
    }

    pub fn is_ok(&self) -> bool {
        self.completion == Completion::Ok
    }

    pub fn is_error(&self) -> bool {
        self.completion == Completion::Error
    }

    pub fn timed_out(&self) -> bool {
        self.completion == Completion::TimedOut
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.text.split('\n').filter(|t| !t.is_empty())
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.text.contains(needle)
    }

    /// Rest of the first token starting with `prefix`, trimmed
    pub fn value_of(&self, prefix: &str) -> Option<&str> {
        self.tokens()
            .find_map(|t| t.strip_prefix(prefix))
            .map(str::trim)
    }
}

/// Owns a serial transport and runs exchanges over it
pub struct CommandPort<S, F> {
    serial: S,
    handle: Handle,
    _framing: PhantomData<F>,
}

impl<S, F> CommandPort<S, F>
where
    S: Read + Write + ReadReady,
    F: Framing,
{
    pub fn new(serial: S, handle: Handle) -> Self {
        Self {
            serial,
            handle,
            _framing: PhantomData,
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn serial_mut(&mut self) -> &mut S {
        &mut self.serial
    }

    pub fn into_inner(self) -> S {
        self.serial
    }

    /// Read and drop everything currently buffered; returns the byte count
    pub fn discard_input(&mut self) -> Result<usize, S::Error> {
        let mut scratch = [0u8; 64];
        let mut discarded = 0;
        while self.serial.read_ready()? {
            let n = self.serial.read(&mut scratch)?;
            if n == 0 {
                break;
            }
            discarded += n;
        }
        Ok(discarded)
    }

    /// Write one command plus the terminator, after clearing stale input
    pub fn send(&mut self, command: &str) -> Result<(), S::Error> {
        let stale = self.discard_input()?;
        if stale > 0 {
            warn!("Discarded {} unread bytes before sending", stale);
        }
        self.serial.write_all(command.as_bytes())?;
        self.serial.write_all(F::TERMINATOR)?;
        self.serial.flush()
    }

    /// Write bytes as-is, no terminator and no input flush
    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<(), S::Error> {
        self.serial.write_all(bytes)?;
        self.serial.flush()
    }

    /// Poll until a terminal marker or `timeout`
    pub async fn read_until_terminal(&mut self, timeout: Duration) -> Result<Response, S::Error> {
        self.read_until(timeout, F::completion).await
    }

    /// Poll until `done` classifies the received text, or `timeout`
    pub async fn read_until(
        &mut self,
        timeout: Duration,
        done: impl Fn(&str) -> Option<Completion>,
    ) -> Result<Response, S::Error> {
        self.poll_until(timeout, F::POLL_INTERVAL, done).await
    }

    /// [`read_until`](Self::read_until) with a custom poll interval
    pub async fn poll_until(
        &mut self,
        timeout: Duration,
        poll: Duration,
        done: impl Fn(&str) -> Option<Completion>,
    ) -> Result<Response, S::Error> {
        let deadline = self.handle.now() + timeout;
        let mut raw: Vec<u8, RAW_CAPACITY> = Vec::new();
        loop {
            self.drain_into(&mut raw)?;
            let text = ascii(&raw);
            if let Some(completion) = done(&text) {
                return Ok(Response::new(&text, completion));
            }
            let now = self.handle.now();
            if now >= deadline {
                return Ok(Response::new(&text, Completion::TimedOut));
            }
            let remaining = deadline - now;
            self.handle.sleep(poll.min(remaining)).await;
        }
    }

    fn drain_into(&mut self, raw: &mut Vec<u8, RAW_CAPACITY>) -> Result<(), S::Error> {
        let mut chunk = [0u8; 64];
        while self.serial.read_ready()? {
            let n = self.serial.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            let overflow = (raw.len() + n).saturating_sub(RAW_CAPACITY);
            if overflow > 0 {
                let dropped = overflow.min(raw.len());
                let keep = raw.len() - dropped;
                raw.rotate_left(dropped);
                raw.truncate(keep);
            }
            let start = n.saturating_sub(RAW_CAPACITY);
            // Fits after the truncation above.
            let _ = raw.extend_from_slice(&chunk[start..n]);
        }
        Ok(())
    }
}

fn ascii(raw: &[u8]) -> String<RAW_CAPACITY> {
    raw.iter()
        .map(|&b| if b.is_ascii() { b as char } else { '?' })
        .collect()
}
