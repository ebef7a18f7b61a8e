//! Packetiser and sender.
//!
//! Byte flow: producers append to `queue` (mutex) or prepend to `preempt`
//! (mutex); the sender thread drains both into its privately owned `buffer`
//! at the top of every iteration, then carves one packet from the head.
//! Only the sender consumes bytes, and only from the head of `buffer`, so a
//! packet that fails to send stays put and is retried verbatim.
//!
//! Packet carving:
//! - a packet is the first 30 bytes, or up to and including the first
//!   newline within them;
//! - a trailing in-band directive (`-` wait-finished, `*` abort, `!` pause,
//!   `&` resume) is stripped with its newline; resume runs immediately so a
//!   resume buried in a paused stream can unblock the sender, the others run
//!   after the packet is sent;
//! - a short packet with remaining payload is right-padded with `F` to 30
//!   bytes; a packet that was purely directives transmits nothing.
//!
//! Status discipline: before sending, poll until the busy bit (0x20) clears;
//! after sending, a rejected packet (0xCF) is counted and retried, status 0
//! is a broken pipe. `wait_finished` polls the finish bit (0x02) the same
//! way. Both waits honour the one-shot `abort_waiting` flag.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use core_codec::{STATUS_FINISH, STATUS_OK, STATUS_PACKET_REJECTED, onewire_crc_lookup};
use core_config::{DeviceConfig, UsbConfig};
use core_events::{Signal, SignalBus, ThreadState};
use tracing::{debug, info, trace, warn};

use crate::driver::{DriverError, DriverProbe, UsbDriver, UsbState};
use crate::Pipe;

const PACKET_LEN: usize = 30;
const MAX_REFUSE_ATTEMPTS: u32 = 5;
const STATUS_POLL_ATTEMPTS: u32 = 300;
const STATUS_POLL: Duration = Duration::from_millis(50);
const REJECT_BACKOFF: Duration = Duration::from_millis(50);
const REFUSE_BACKOFF: Duration = Duration::from_secs(3);
const RECONNECT_BACKOFF: Duration = Duration::from_millis(500);
const PAUSE_TICK: Duration = Duration::from_secs(1);
const MOCK_SEND: Duration = Duration::from_millis(40);
const MOCK_STATUS: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    /// No device; the sender backs off and retries a few times.
    #[error("connection refused")]
    Refused,
    /// The link died mid-transfer; the sender reopens on the next pass.
    #[error("broken pipe")]
    Broken,
}

impl From<DriverError> for PipeError {
    fn from(err: DriverError) -> PipeError {
        match err {
            DriverError::Refused | DriverError::NoBackend => PipeError::Refused,
            DriverError::Broken => PipeError::Broken,
        }
    }
}

/// Directive action deferred until after the carved packet went out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PostSend {
    WaitFinished,
    Abort,
    Pause,
}

pub struct Controller {
    mock: bool,
    usb: UsbConfig,
    bus: SignalBus,
    queue: Mutex<Vec<u8>>,
    preempt: Mutex<Vec<u8>>,
    /// Mirror of the sender-owned buffer length, for `len()` and the
    /// interpreter's hold gate.
    buffer_len: AtomicUsize,
    state: AtomicI32,
    usb_state: AtomicI32,
    status: Mutex<[u8; 6]>,
    packet_count: AtomicU32,
    rejected_count: AtomicU32,
    abort_waiting: AtomicBool,
    driver: Mutex<Option<Box<dyn UsbDriver>>>,
    probes: Mutex<Vec<Box<dyn DriverProbe>>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Controller {
    pub fn new(config: &DeviceConfig, bus: SignalBus) -> Arc<Controller> {
        Arc::new(Controller {
            mock: config.mock,
            usb: config.usb,
            bus,
            queue: Mutex::new(Vec::new()),
            preempt: Mutex::new(Vec::new()),
            buffer_len: AtomicUsize::new(0),
            state: AtomicI32::new(ThreadState::Unstarted.code()),
            usb_state: AtomicI32::new(UsbState::Uninitialized.code()),
            status: Mutex::new([0; 6]),
            packet_count: AtomicU32::new(0),
            rejected_count: AtomicU32::new(0),
            abort_waiting: AtomicBool::new(false),
            driver: Mutex::new(None),
            probes: Mutex::new(Vec::new()),
            thread: Mutex::new(None),
        })
    }

    /// Register a bus-driver probe. Probes are tried in registration order.
    pub fn register_probe(&self, probe: Box<dyn DriverProbe>) {
        self.probes.lock().expect("probes poisoned").push(probe);
    }

    /// Install a driver directly, bypassing detection.
    pub fn set_driver(&self, driver: Box<dyn UsbDriver>) {
        *self.driver.lock().expect("driver poisoned") = Some(driver);
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_code(self.state.load(Ordering::Acquire)).expect("valid thread state")
    }

    fn set_state(&self, state: ThreadState) {
        let prior = self.state.swap(state.code(), Ordering::Release);
        if prior != state.code() {
            debug!(state = %state, "pipe state");
            self.bus.publish("pipe;thread", Signal::Thread(state));
        }
    }

    pub fn status(&self) -> [u8; 6] {
        *self.status.lock().expect("status poisoned")
    }

    pub fn packet_count(&self) -> u32 {
        self.packet_count.load(Ordering::Relaxed)
    }

    pub fn rejected_count(&self) -> u32 {
        self.rejected_count.load(Ordering::Relaxed)
    }

    pub fn usb_state(&self) -> i32 {
        self.usb_state.load(Ordering::Relaxed)
    }

    /// Spawn the sender thread. A finished pipe is reset and restarted; an
    /// aborted pipe stays down until [`Controller::reset`].
    pub fn start(self: &Arc<Self>) {
        match self.state() {
            ThreadState::Abort => return,
            ThreadState::Finished => self.reset(),
            _ => {}
        }
        if self.state() == ThreadState::Unstarted {
            let mut slot = self.thread.lock().expect("thread poisoned");
            if slot.is_none() {
                self.set_state(ThreadState::Started);
                let me = Arc::clone(self);
                *slot = Some(
                    thread::Builder::new()
                        .name("nanogl-pipe".into())
                        .spawn(move || me.thread_loop())
                        .expect("spawn pipe sender"),
                );
            }
        }
    }

    pub fn pause(&self) {
        self.set_state(ThreadState::Paused);
    }

    pub fn resume(&self) {
        self.set_state(ThreadState::Started);
    }

    /// Ask the sender to drain and exit once the pipe is empty.
    pub fn finish(&self) {
        self.set_state(ThreadState::Finished);
    }

    /// Drop pending data and stop the sender. Instantaneous from the
    /// producer's viewpoint; the sender clears its own buffer when it
    /// observes the state.
    pub fn abort(&self) {
        self.set_state(ThreadState::Abort);
        self.queue.lock().expect("queue poisoned").clear();
        self.buffer_len.store(0, Ordering::Release);
        self.bus.publish("pipe;buffer", Signal::Buffer(0));
    }

    /// Clear an aborted/finished pipe back to restartable.
    pub fn reset(&self) {
        if let Some(handle) = self.thread.lock().expect("thread poisoned").take() {
            let _ = handle.join();
        }
        self.set_state(ThreadState::Unstarted);
    }

    /// Break the current status wait without changing the thread state.
    pub fn abort_waiting(&self) {
        self.abort_waiting.store(true, Ordering::Release);
    }

    /// Join the sender thread after `finish()` or `abort()`.
    pub fn join(&self) {
        if let Some(handle) = self.thread.lock().expect("thread poisoned").take() {
            let _ = handle.join();
        }
    }

    /// Open the underlying driver, probing for one if none is installed.
    pub fn open(&self) -> Result<(), PipeError> {
        let mut driver = self.driver.lock().expect("driver poisoned");
        match driver.as_mut() {
            Some(driver) => driver.open().map_err(PipeError::from),
            None => self.detect_driver_and_open(&mut driver),
        }
    }

    pub fn close(&self) {
        if let Some(driver) = self.driver.lock().expect("driver poisoned").as_mut() {
            driver.close();
            self.state_listener(UsbState::Disconnected.code());
        }
    }

    fn detect_driver_and_open(
        &self,
        slot: &mut Option<Box<dyn UsbDriver>>,
    ) -> Result<(), PipeError> {
        let probes = self.probes.lock().expect("probes poisoned");
        if probes.is_empty() {
            self.state_listener(UsbState::NoBackend.code());
            return Err(PipeError::Refused);
        }
        for probe in probes.iter() {
            self.state_listener(UsbState::Connecting.code());
            match probe.probe(&self.usb) {
                Ok(mut driver) => {
                    if let Err(err) = driver.open() {
                        warn!(probe = probe.name(), %err, "driver open failed");
                        continue;
                    }
                    if let Ok(chip_version) = driver.get_chip_version() {
                        self.bus.publish("pipe;chipv", Signal::ChipVersion(chip_version));
                    }
                    info!(probe = probe.name(), "usb driver connected");
                    self.state_listener(UsbState::Connected.code());
                    *slot = Some(driver);
                    return Ok(());
                }
                Err(err) => {
                    warn!(probe = probe.name(), %err, "probe failed");
                }
            }
        }
        self.state_listener(UsbState::ConnectionFailed.code());
        Err(PipeError::Refused)
    }

    fn state_listener(&self, code: i32) {
        self.usb_state.store(code, Ordering::Relaxed);
        let name = UsbState::describe_code(code);
        trace!(code, name, "usb state");
        self.bus.publish("pipe;usb_state", Signal::UsbState(code));
        self.bus.publish("pipe;usb_status", Signal::UsbStatus(name.to_string()));
    }

    /// Query the board status into `status` and publish it.
    pub fn update_status(&self) -> Result<(), PipeError> {
        let status = if self.mock {
            thread::sleep(MOCK_STATUS);
            [255, STATUS_OK, 0, 0, 0, 1]
        } else {
            let mut driver = self.driver.lock().expect("driver poisoned");
            let driver = driver.as_mut().ok_or(PipeError::Refused)?;
            driver.get_status().map_err(PipeError::from)?
        };
        *self.status.lock().expect("status poisoned") = status;
        self.bus.publish("pipe;status", Signal::Status(status));
        Ok(())
    }

    /// One sender iteration: drain producers, carve a packet, deliver it.
    /// `Ok(true)` consumed something; `Ok(false)` nothing sendable (packet
    /// rejected, paused, partial tail, or empty).
    pub fn process_queue(&self, buffer: &mut Vec<u8>) -> Result<bool, PipeError> {
        {
            let mut queue = self.queue.lock().expect("queue poisoned");
            if !queue.is_empty() {
                buffer.append(&mut queue);
                drop(queue);
                self.buffer_len.store(buffer.len(), Ordering::Release);
                self.bus.publish("pipe;buffer", Signal::Buffer(buffer.len()));
            }
        }
        {
            let mut preempt = self.preempt.lock().expect("preempt poisoned");
            if !preempt.is_empty() {
                preempt.append(buffer);
                std::mem::swap(&mut *preempt, buffer);
                self.buffer_len.store(buffer.len(), Ordering::Release);
            }
        }
        if buffer.is_empty() {
            return Ok(false);
        }

        let window = &buffer[..buffer.len().min(PACKET_LEN)];
        let mut length = match window.iter().position(|&b| b == b'\n') {
            Some(at) => at + 1,
            None => window.len(),
        };
        let mut packet = buffer[..length].to_vec();

        // Edge condition of catching only a pipe directive without its '\n'.
        if matches!(packet.last(), Some(b'-' | b'*' | b'&' | b'!')) && !packet.ends_with(b"\n") {
            match buffer.get(length) {
                Some(&next) => {
                    packet.push(next);
                    length += 1;
                }
                None => return Ok(false), // newline not arrived yet
            }
        }

        let mut post_send = None;
        if packet.last() == Some(&b'\n') {
            packet.pop();
            match packet.last() {
                Some(b'-') => {
                    packet.pop();
                    post_send = Some(PostSend::WaitFinished);
                }
                Some(b'*') => {
                    packet.pop();
                    post_send = Some(PostSend::Abort);
                }
                Some(b'&') => {
                    // Resume must run before the pause check below so a
                    // resume inside a paused buffer unblocks the sender.
                    packet.pop();
                    self.resume();
                }
                Some(b'!') => {
                    packet.pop();
                    post_send = Some(PostSend::Pause);
                }
                _ => {}
            }
            if !packet.is_empty() {
                packet.resize(PACKET_LEN, b'F');
            }
        }
        if self.state() == ThreadState::Paused {
            // Nothing is consumed; the directive is re-read after resume.
            return Ok(false);
        }

        if self.mock {
            self.state_listener(UsbState::Mock.code());
        } else {
            self.open()?;
        }

        if packet.len() == PACKET_LEN {
            if self.wait_until_accepting_packets().is_err() {
                return Ok(false);
            }
            if self.state() == ThreadState::Paused {
                return Ok(false); // paused during the wait
            }
            if self.send_packet(&packet).is_err() {
                // Failure exactly at send assumes no packet went out.
                return Ok(false);
            }
            let mut attempts = 0;
            let mut condition = 0u8;
            while attempts < STATUS_POLL_ATTEMPTS {
                match self.update_status() {
                    Ok(()) => {
                        condition = self.status()[1];
                        break;
                    }
                    Err(_) => attempts += 1,
                }
            }
            if condition == STATUS_PACKET_REJECTED {
                self.rejected_count.fetch_add(1, Ordering::Relaxed);
                debug!("packet rejected, will retry");
                thread::sleep(REJECT_BACKOFF);
                return Ok(false); // packet stays at the head of the buffer
            }
            if condition == 0 {
                return Err(PipeError::Broken);
            }
            self.packet_count.fetch_add(1, Ordering::Relaxed);
        } else if !packet.is_empty() {
            return Ok(false); // partial tail; wait for more bytes
        }

        buffer.drain(..length);
        self.buffer_len.store(buffer.len(), Ordering::Release);
        self.bus.publish("pipe;buffer", Signal::Buffer(buffer.len()));

        if let Some(action) = post_send {
            let outcome = match action {
                PostSend::WaitFinished => self.wait_finished(),
                PostSend::Abort => {
                    self.abort_on_sender(buffer);
                    Ok(())
                }
                PostSend::Pause => {
                    self.pause();
                    Ok(())
                }
            };
            if let Err(err) = outcome {
                // The packet already went out; a broken post-send wait is
                // absorbed here.
                warn!(%err, "post-send action failed");
            }
        }
        Ok(true)
    }

    fn abort_on_sender(&self, buffer: &mut Vec<u8>) {
        self.set_state(ThreadState::Abort);
        self.queue.lock().expect("queue poisoned").clear();
        buffer.clear();
        self.buffer_len.store(0, Ordering::Release);
        self.bus.publish("pipe;buffer", Signal::Buffer(0));
    }

    fn send_packet(&self, packet: &[u8]) -> Result<(), PipeError> {
        let sent: Vec<u8>;
        if self.mock {
            thread::sleep(MOCK_SEND);
            sent = packet.to_vec();
        } else {
            let mut frame = Vec::with_capacity(PACKET_LEN + 2);
            frame.push(0);
            frame.extend_from_slice(packet);
            frame.push(onewire_crc_lookup(packet));
            let mut driver = self.driver.lock().expect("driver poisoned");
            let driver = driver.as_mut().ok_or(PipeError::Broken)?;
            driver.write(&frame).map_err(PipeError::from)?;
            sent = frame;
        }
        trace!(len = sent.len(), "packet sent");
        self.bus.publish("pipe;packet", Signal::Packet(sent.clone()));
        self.bus.publish("pipe;packet_text", Signal::PacketText(sent));
        Ok(())
    }

    /// Poll until the busy bit clears. Status 0 is a broken pipe; an abort
    /// or the `abort_waiting` flag ends the wait early.
    pub fn wait_until_accepting_packets(&self) -> Result<(), PipeError> {
        let mut attempt = 0u32;
        while self.state() != ThreadState::Abort {
            self.update_status()?;
            let condition = self.status()[1];
            if condition == 0 {
                return Err(PipeError::Broken);
            }
            if condition & 0x20 == 0 {
                break;
            }
            thread::sleep(STATUS_POLL);
            self.bus.publish(
                "pipe;wait",
                Signal::Wait { status: STATUS_OK, attempt },
            );
            attempt += 1;
            if self.abort_waiting.swap(false, Ordering::AcqRel) {
                break;
            }
        }
        Ok(())
    }

    /// Poll until the finish bit clears. Rejections observed during the
    /// wait are counted but polling continues.
    pub fn wait_finished(&self) -> Result<(), PipeError> {
        let mut attempt = 0u32;
        loop {
            self.update_status()?;
            if self.mock {
                *self.status.lock().expect("status poisoned") = [255, STATUS_FINISH, 0, 0, 0, 1];
            }
            let condition = self.status()[1];
            if condition == 0 {
                return Err(PipeError::Broken);
            }
            if condition == STATUS_PACKET_REJECTED {
                self.rejected_count.fetch_add(1, Ordering::Relaxed);
            }
            if condition & 0x02 == 0 {
                break;
            }
            thread::sleep(STATUS_POLL);
            self.bus.publish(
                "pipe;wait",
                Signal::Wait { status: condition, attempt },
            );
            attempt += 1;
            if self.abort_waiting.swap(false, Ordering::AcqRel) {
                break;
            }
        }
        Ok(())
    }

    fn thread_loop(&self) {
        info!("pipe sender started");
        let mut buffer: Vec<u8> = Vec::new();
        let mut refuse_count = 0u32;
        let mut idle_ticks: u64 = 0;
        while self.state() != ThreadState::Abort {
            let processed = match self.process_queue(&mut buffer) {
                Ok(processed) => {
                    refuse_count = 0;
                    processed
                }
                Err(PipeError::Refused) => {
                    refuse_count += 1;
                    warn!(attempt = refuse_count, "connection refused");
                    thread::sleep(REFUSE_BACKOFF);
                    if refuse_count >= MAX_REFUSE_ATTEMPTS {
                        self.set_state(ThreadState::Abort);
                        self.bus.publish("pipe;error", Signal::Error(refuse_count));
                    }
                    continue;
                }
                Err(PipeError::Broken) => {
                    warn!("connection broken mid-transfer, reopening");
                    thread::sleep(RECONNECT_BACKOFF);
                    self.close();
                    continue;
                }
            };
            if processed {
                idle_ticks = 0;
            } else {
                // Idle backoff ticks up to one-second waits.
                idle_ticks = idle_ticks.min(100);
                thread::sleep(Duration::from_millis(10) * idle_ticks as u32);
                idle_ticks += 2;
                if self.state() == ThreadState::Paused {
                    debug!("pipe paused");
                    while self.state() == ThreadState::Paused {
                        thread::sleep(PAUSE_TICK);
                        if self.state() == ThreadState::Abort {
                            self.drop_buffer(&mut buffer);
                            info!("pipe sender aborted");
                            return;
                        }
                    }
                    debug!("pipe resumed");
                }
            }
            if self.state() == ThreadState::Finished
                && buffer.is_empty()
                && self.queue.lock().expect("queue poisoned").is_empty()
                && self.preempt.lock().expect("preempt poisoned").is_empty()
            {
                break;
            }
        }
        if self.state() == ThreadState::Abort {
            self.drop_buffer(&mut buffer);
            info!("pipe sender aborted");
            return;
        }
        self.set_state(ThreadState::Finished);
        info!("pipe sender finished");
    }

    fn drop_buffer(&self, buffer: &mut Vec<u8>) {
        buffer.clear();
        self.buffer_len.store(0, Ordering::Release);
        self.bus.publish("pipe;buffer", Signal::Buffer(0));
    }
}

impl Pipe for Arc<Controller> {
    fn write(&self, bytes: &[u8]) {
        self.queue.lock().expect("queue poisoned").extend_from_slice(bytes);
    }

    fn realtime_write(&self, bytes: &[u8]) {
        {
            let mut preempt = self.preempt.lock().expect("preempt poisoned");
            let mut fresh = bytes.to_vec();
            fresh.append(&mut preempt);
            *preempt = fresh;
        }
        if self.state() == ThreadState::Paused {
            self.resume();
        }
    }

    fn len(&self) -> usize {
        self.buffer_len.load(Ordering::Acquire)
            + self.queue.lock().expect("queue poisoned").len()
            + self.preempt.lock().expect("preempt poisoned").len()
    }
}
