//! Test doubles: a manual clock, recording pins and simulated serial peers

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::rc::Rc;
use std::string::String;
use std::vec::Vec;

use datalogger_hal::time::{Duration, Instant, Monotonic, WallClock};
use datalogger_hal::FlexPin;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{ErrorType as PinErrorType, InputPin, OutputPin};
use embedded_io::{ErrorType, Read, ReadReady, Write};

/// Clock that only moves when told to, or when the runtime idles
#[derive(Clone)]
pub struct ManualClock {
    now_us: Rc<Cell<u64>>,
    unix_base: Rc<Cell<i64>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now_us: Rc::new(Cell::new(0)),
            unix_base: Rc::new(Cell::new(0)),
        }
    }

    /// Wall clock reads `unix` at monotonic zero
    pub fn with_unix_base(unix: i64) -> Self {
        let clock = Self::new();
        clock.unix_base.set(unix);
        clock
    }

    pub fn now(&self) -> Instant {
        Instant::from_ticks(self.now_us.get() / 1000)
    }

    pub fn now_ms(&self) -> u64 {
        self.now_us.get() / 1000
    }

    pub fn advance(&self, by: Duration) {
        self.advance_us(by.ticks() * 1000);
    }

    pub fn advance_us(&self, us: u64) {
        self.now_us.set(self.now_us.get() + us);
    }
}

impl Monotonic for ManualClock {
    fn now(&self) -> Instant {
        ManualClock::now(self)
    }

    fn idle_until(&self, deadline: Option<Instant>) {
        let deadline = deadline.expect("runtime idled with nothing scheduled");
        let target = deadline.ticks() * 1000;
        if target > self.now_us.get() {
            self.now_us.set(target);
        }
    }
}

impl WallClock for ManualClock {
    fn unix_time(&self) -> i64 {
        self.unix_base.get() + (self.now_us.get() / 1_000_000) as i64
    }
}

/// Blocking delay that advances the manual clock
pub struct MockDelay {
    clock: ManualClock,
}

impl MockDelay {
    pub fn new(clock: &ManualClock) -> Self {
        Self {
            clock: clock.clone(),
        }
    }
}

impl DelayNs for MockDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.clock.advance_us(u64::from(ns).div_ceil(1000));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinEvent {
    High,
    Low,
    Float,
}

pub type EventLog = Rc<RefCell<Vec<(&'static str, PinEvent)>>>;

pub fn event_log() -> EventLog {
    Rc::new(RefCell::new(Vec::new()))
}

type PinHook = Rc<dyn Fn(PinEvent, u64)>;

/// Pin that records every transition into a shared log
pub struct MockPin {
    name: &'static str,
    driven: Option<bool>,
    float_level: Rc<Cell<bool>>,
    log: EventLog,
    clock: ManualClock,
    hook: Option<PinHook>,
}

impl MockPin {
    pub fn new(name: &'static str, clock: &ManualClock, log: &EventLog) -> Self {
        Self {
            name,
            driven: None,
            float_level: Rc::new(Cell::new(true)),
            log: log.clone(),
            clock: clock.clone(),
            hook: None,
        }
    }

    pub fn with_hook(mut self, hook: PinHook) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Level read back while floating; shared so a test can flip it later
    pub fn float_level(&self) -> Rc<Cell<bool>> {
        self.float_level.clone()
    }

    fn record(&mut self, event: PinEvent) {
        self.log.borrow_mut().push((self.name, event));
        if let Some(hook) = &self.hook {
            hook(event, self.clock.now_ms());
        }
    }
}

impl PinErrorType for MockPin {
    type Error = Infallible;
}

impl OutputPin for MockPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.driven = Some(false);
        self.record(PinEvent::Low);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.driven = Some(true);
        self.record(PinEvent::High);
        Ok(())
    }
}

impl InputPin for MockPin {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Ok(self.driven.unwrap_or_else(|| self.float_level.get()))
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        self.is_high().map(|high| !high)
    }
}

impl FlexPin for MockPin {
    fn set_floating(&mut self) -> Result<(), Self::Error> {
        self.driven = None;
        self.record(PinEvent::Float);
        Ok(())
    }
}

/// Bytes that become readable at a given millisecond
#[derive(Default)]
struct Line {
    rx: VecDeque<(u64, u8)>,
}

impl Line {
    fn push(&mut self, at_ms: u64, text: &[u8]) {
        self.rx.extend(text.iter().map(|b| (at_ms, *b)));
    }

    fn ready(&self, now_ms: u64) -> bool {
        self.rx.front().is_some_and(|(at, _)| *at <= now_ms)
    }

    fn read(&mut self, now_ms: u64, buf: &mut [u8]) -> usize {
        let mut n = 0;
        while n < buf.len() && self.ready(now_ms) {
            if let Some((_, b)) = self.rx.pop_front() {
                buf[n] = b;
                n += 1;
            }
        }
        n
    }
}

fn at_reply(tokens: &[&str]) -> String {
    let mut text = String::from("\r\n");
    text.push_str(&tokens.join("\r\n\r\n"));
    text.push_str("\r\n");
    text
}

pub const GREETING: &str = "SARA-R410M-02B-01 Operational";

/// Simulated SARA-R4: power key timing, greeting, echo and scripted replies
pub struct ModemSim {
    clock: ManualClock,
    pub powered: bool,
    ready_at: u64,
    key_low_since: Option<u64>,
    line: Line,
    pending: Vec<u8>,
    upload: Option<(String, usize, Vec<u8>)>,
    pub latency_ms: u64,
    scripted: HashMap<String, VecDeque<String>>,
    fixed: HashMap<String, String>,
    pub commands: Vec<String>,
    pub files: HashMap<String, Vec<u8>>,
    pub boots: usize,
    pub upload_fails: bool,
    /// Answer `+CPWROFF` but stay on
    pub ignores_power_off: bool,
}

impl ModemSim {
    fn key_event(&mut self, event: PinEvent, now: u64) {
        match event {
            PinEvent::Low => self.key_low_since = Some(now),
            PinEvent::High | PinEvent::Float => {
                let Some(since) = self.key_low_since.take() else {
                    return;
                };
                let held = now - since;
                if !self.powered && (150..=3200).contains(&held) {
                    self.powered = true;
                    self.boots += 1;
                    self.ready_at = now + 4000;
                    self.line
                        .push(now + 4000, at_reply(&[GREETING]).as_bytes());
                } else if self.powered && held >= 1500 {
                    self.powered = false;
                    self.line.rx.clear();
                }
            }
        }
    }

    fn default_reply(&mut self, command: &str) -> String {
        if command.is_empty() {
            return at_reply(&["OK"]);
        }
        if let Some(rest) = command.strip_prefix("+UDWNFILE=") {
            let mut parts = rest.split(',');
            let name = parts.next().unwrap_or("").trim_matches('"').to_string();
            let len = parts.next().and_then(|l| l.parse().ok()).unwrap_or(0);
            self.upload = Some((name, len, Vec::new()));
            return String::from(">");
        }
        if let Some(rest) = command.strip_prefix("+UDELFILE=") {
            let name = rest.trim_matches('"');
            return if self.files.remove(name).is_some() {
                at_reply(&["OK"])
            } else {
                at_reply(&["+CME ERROR: FILE NOT FOUND"])
            };
        }
        match command {
            "+CGDCONT?" => at_reply(&["+CGDCONT: 1,\"IP\",\"hologram\",\"10.170.3.4\",0,0,0,0", "OK"]),
            "+CSQ" => at_reply(&["+CSQ: 17,99", "OK"]),
            "+CTZU?" => at_reply(&["+CTZU: 1", "OK"]),
            "+CCLK?" => at_reply(&["+CCLK: \"23/02/19,02:52:22+52\"", "OK"]),
            "+CGSN" => at_reply(&["352753090123456", "OK"]),
            _ => at_reply(&["OK"]),
        }
    }

    fn receive(&mut self, bytes: &[u8]) {
        let now = self.clock.now_ms();
        for &b in bytes {
            if let Some((name, remaining, data)) = &mut self.upload {
                data.push(b);
                *remaining -= 1;
                if *remaining == 0 {
                    let name = name.clone();
                    let data = core::mem::take(data);
                    self.upload = None;
                    let reply = if self.upload_fails {
                        at_reply(&["ERROR"])
                    } else {
                        self.files.insert(name, data);
                        at_reply(&["OK"])
                    };
                    self.line.push(now + self.latency_ms, reply.as_bytes());
                }
                continue;
            }
            if b != b'\r' {
                self.pending.push(b);
                continue;
            }
            let text = String::from_utf8_lossy(&core::mem::take(&mut self.pending)).into_owned();
            if !self.powered || now < self.ready_at {
                continue;
            }
            let mut echo = text.clone().into_bytes();
            echo.push(b'\r');
            self.line.push(now, &echo);
            let Some(command) = text.strip_prefix("AT") else {
                continue;
            };
            self.commands.push(command.to_string());
            let reply = match self.scripted.get_mut(command).and_then(|q| q.pop_front()) {
                Some(reply) => reply,
                None => match self.fixed.get(command) {
                    Some(reply) => reply.clone(),
                    None => self.default_reply(command),
                },
            };
            self.line.push(now + self.latency_ms, reply.as_bytes());
            if command == "+CPWROFF" && !self.ignores_power_off {
                self.powered = false;
            }
        }
    }
}

#[derive(Clone)]
pub struct FakeModem {
    sim: Rc<RefCell<ModemSim>>,
}

impl FakeModem {
    /// A module that is powered off
    pub fn new(clock: &ManualClock) -> Self {
        Self {
            sim: Rc::new(RefCell::new(ModemSim {
                clock: clock.clone(),
                powered: false,
                ready_at: 0,
                key_low_since: None,
                line: Line::default(),
                pending: Vec::new(),
                upload: None,
                latency_ms: 20,
                scripted: HashMap::new(),
                fixed: HashMap::new(),
                commands: Vec::new(),
                files: HashMap::new(),
                boots: 0,
                upload_fails: false,
                ignores_power_off: false,
            })),
        }
    }

    /// A module that is already up and answering
    pub fn running(clock: &ManualClock) -> Self {
        let modem = Self::new(clock);
        modem.sim.borrow_mut().powered = true;
        modem
    }

    pub fn sim(&self) -> std::cell::RefMut<'_, ModemSim> {
        self.sim.borrow_mut()
    }

    /// Pin hook that feeds the power key into the simulation
    pub fn key_hook(&self) -> PinHook {
        let sim = self.sim.clone();
        Rc::new(move |event, now| sim.borrow_mut().key_event(event, now))
    }

    /// Reply once to `command` (without the `AT` prefix)
    pub fn reply_once(&self, command: &str, tokens: &[&str]) {
        self.sim
            .borrow_mut()
            .scripted
            .entry(command.to_string())
            .or_default()
            .push_back(at_reply(tokens));
    }

    /// Reply to `command` whenever nothing scripted is queued
    pub fn reply_always(&self, command: &str, tokens: &[&str]) {
        self.sim
            .borrow_mut()
            .fixed
            .insert(command.to_string(), at_reply(tokens));
    }

    /// Stay silent to `command` (the echo still appears)
    pub fn silent(&self, command: &str) {
        self.sim
            .borrow_mut()
            .fixed
            .insert(command.to_string(), String::new());
    }

    pub fn commands(&self) -> Vec<String> {
        self.sim.borrow().commands.clone()
    }

    /// Unsolicited bytes, readable immediately
    pub fn inject(&self, text: &str) {
        let mut sim = self.sim.borrow_mut();
        let now = sim.clock.now_ms();
        sim.line.push(now, text.as_bytes());
    }
}

impl ErrorType for FakeModem {
    type Error = Infallible;
}

impl Read for FakeModem {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let mut sim = self.sim.borrow_mut();
        let now = sim.clock.now_ms();
        Ok(sim.line.read(now, buf))
    }
}

impl ReadReady for FakeModem {
    fn read_ready(&mut self) -> Result<bool, Self::Error> {
        let sim = self.sim.borrow();
        Ok(sim.line.ready(sim.clock.now_ms()))
    }
}

impl Write for FakeModem {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.sim.borrow_mut().receive(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Simulated SDI-12 line: echoes commands and answers from a script
pub struct SdiSim {
    clock: ManualClock,
    line: Line,
    pending: Vec<u8>,
    latency_ms: u64,
    scripted: HashMap<String, VecDeque<Option<String>>>,
    fixed: HashMap<String, String>,
    /// Commands in the order they were written, with the write time (ms)
    pub written: Vec<(String, u64)>,
}

impl SdiSim {
    fn receive(&mut self, bytes: &[u8]) {
        let now = self.clock.now_ms();
        for &b in bytes {
            self.pending.push(b);
            if b != b'!' {
                continue;
            }
            let command = String::from_utf8_lossy(&core::mem::take(&mut self.pending)).into_owned();
            self.line.push(now, command.as_bytes());
            let reply = match self.scripted.get_mut(&command).and_then(|q| q.pop_front()) {
                Some(reply) => reply,
                None => self.fixed.get(&command).cloned(),
            };
            if let Some(reply) = reply {
                // Command shifts out at ~8.3 ms per character before the sensor answers
                let at = now + 9 * command.len() as u64 + self.latency_ms;
                self.line.push(at, reply.as_bytes());
            }
            self.written.push((command, now));
        }
    }
}

#[derive(Clone)]
pub struct FakeSdi {
    sim: Rc<RefCell<SdiSim>>,
}

impl FakeSdi {
    pub fn new(clock: &ManualClock) -> Self {
        Self {
            sim: Rc::new(RefCell::new(SdiSim {
                clock: clock.clone(),
                line: Line::default(),
                pending: Vec::new(),
                latency_ms: 15,
                scripted: HashMap::new(),
                fixed: HashMap::new(),
                written: Vec::new(),
            })),
        }
    }

    /// Answer `command` once; `None` stays silent for that attempt
    pub fn reply_once(&self, command: &str, reply: Option<&str>) {
        self.sim
            .borrow_mut()
            .scripted
            .entry(command.to_string())
            .or_default()
            .push_back(reply.map(|r| r.to_string()));
    }

    pub fn reply_always(&self, command: &str, reply: &str) {
        self.sim
            .borrow_mut()
            .fixed
            .insert(command.to_string(), reply.to_string());
    }

    pub fn written(&self) -> Vec<String> {
        self.sim.borrow().written.iter().map(|(c, _)| c.clone()).collect()
    }

    pub fn written_at(&self) -> Vec<(String, u64)> {
        self.sim.borrow().written.clone()
    }
}

impl ErrorType for FakeSdi {
    type Error = Infallible;
}

impl Read for FakeSdi {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let mut sim = self.sim.borrow_mut();
        let now = sim.clock.now_ms();
        Ok(sim.line.read(now, buf))
    }
}

impl ReadReady for FakeSdi {
    fn read_ready(&mut self) -> Result<bool, Self::Error> {
        let sim = self.sim.borrow();
        Ok(sim.line.ready(sim.clock.now_ms()))
    }
}

impl Write for FakeSdi {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.sim.borrow_mut().receive(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}
