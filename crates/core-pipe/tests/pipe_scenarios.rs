//! Packet-carving and delivery scenarios, driven synchronously through
//! `process_queue` with a scripted driver (or mock mode) so every step is
//! deterministic.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use core_codec::{STATUS_OK, STATUS_PACKET_REJECTED};
use core_config::DeviceConfig;
use core_events::{Signal, SignalBus, ThreadState};
use core_pipe::{Controller, DriverError, Pipe, UsbDriver};

/// Driver whose status answers are scripted in advance; frames written are
/// recorded for inspection.
struct ScriptedDriver {
    statuses: VecDeque<[u8; 6]>,
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl ScriptedDriver {
    fn new(codes: &[u8]) -> (ScriptedDriver, Arc<Mutex<Vec<Vec<u8>>>>) {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let driver = ScriptedDriver {
            statuses: codes.iter().map(|&c| [255, c, 0, 0, 0, 1]).collect(),
            frames: frames.clone(),
        };
        (driver, frames)
    }
}

impl UsbDriver for ScriptedDriver {
    fn open(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    fn close(&mut self) {}

    fn write(&mut self, frame: &[u8]) -> Result<(), DriverError> {
        self.frames.lock().unwrap().push(frame.to_vec());
        Ok(())
    }

    fn get_status(&mut self) -> Result<[u8; 6], DriverError> {
        Ok(self.statuses.pop_front().unwrap_or([255, STATUS_OK, 0, 0, 0, 1]))
    }

    fn get_chip_version(&mut self) -> Result<i32, DriverError> {
        Ok(0x30)
    }
}

fn mock_controller() -> (Arc<Controller>, SignalBus) {
    let config = DeviceConfig {
        mock: true,
        ..DeviceConfig::default()
    };
    let bus = SignalBus::new();
    (Controller::new(&config, bus.clone()), bus)
}

fn capture_packets(bus: &SignalBus) -> Arc<Mutex<Vec<Vec<u8>>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    bus.listen("pipe;packet", move |signal| {
        if let Signal::Packet(bytes) = signal {
            sink.lock().unwrap().push(bytes.clone());
        }
    });
    seen
}

#[test]
fn pause_directive_carves_padded_packet_then_pauses() {
    let (controller, bus) = mock_controller();
    let packets = capture_packets(&bus);
    let mut buffer = Vec::new();

    controller.write(b"IBaS1P\n!\nIBb");

    assert!(controller.process_queue(&mut buffer).unwrap());
    let mut expected = b"IBaS1P".to_vec();
    expected.resize(30, b'F');
    assert_eq!(packets.lock().unwrap().as_slice(), &[expected]);
    assert_eq!(controller.packet_count(), 1);
    assert_eq!(controller.state(), ThreadState::Unstarted);

    // Second carve is the bare pause directive: nothing transmits, the
    // sender pauses after the (empty) packet.
    assert!(controller.process_queue(&mut buffer).unwrap());
    assert_eq!(controller.packet_count(), 1);
    assert_eq!(controller.state(), ThreadState::Paused);

    // Paused: the remaining tail is untouched.
    assert!(!controller.process_queue(&mut buffer).unwrap());
    assert_eq!(buffer, b"IBb");
}

#[test]
fn rejected_packet_stays_in_buffer_for_retry() {
    let config = DeviceConfig::default();
    let bus = SignalBus::new();
    let controller = Controller::new(&config, bus);
    // Script: accept-wait OK, post-send REJECTED; accept-wait OK, post-send OK.
    let (driver, frames) = ScriptedDriver::new(&[
        STATUS_OK,
        STATUS_PACKET_REJECTED,
        STATUS_OK,
        STATUS_OK,
    ]);
    controller.set_driver(Box::new(driver));

    let mut payload = b"IBa".to_vec();
    payload.resize(30, b'F');
    controller.write(&payload);

    let mut buffer = Vec::new();
    assert!(!controller.process_queue(&mut buffer).unwrap());
    assert_eq!(controller.rejected_count(), 1);
    assert_eq!(controller.packet_count(), 0);
    assert_eq!(buffer.len(), 30, "rejected packet must stay queued");

    assert!(controller.process_queue(&mut buffer).unwrap());
    assert_eq!(controller.rejected_count(), 1);
    assert_eq!(controller.packet_count(), 1);
    assert!(buffer.is_empty());

    // The identical frame went out twice: 0x00 + payload + CRC.
    let frames = frames.lock().unwrap();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0], frames[1]);
    assert_eq!(frames[0].len(), 32);
    assert_eq!(frames[0][0], 0);
    assert_eq!(&frames[0][1..31], payload.as_slice());
    assert_eq!(frames[0][31], core_codec::onewire_crc_lookup(&payload));
}

#[test]
fn realtime_bytes_overtake_queued_bytes() {
    let (controller, bus) = mock_controller();
    let packets = capture_packets(&bus);

    controller.write(&[b'X'; 35]);
    controller.realtime_write(b"RT\n");

    let mut buffer = Vec::new();
    assert!(controller.process_queue(&mut buffer).unwrap());
    assert!(controller.process_queue(&mut buffer).unwrap());
    // Tail of 5 X's is a partial packet; nothing more is consumed.
    assert!(!controller.process_queue(&mut buffer).unwrap());
    assert_eq!(buffer.len(), 5);

    let packets = packets.lock().unwrap();
    let mut first = b"RT".to_vec();
    first.resize(30, b'F');
    assert_eq!(packets[0], first, "preempt must be carved first");
    assert_eq!(packets[1], vec![b'X'; 30]);
}

#[test]
fn directive_only_stream_transmits_nothing() {
    let (controller, bus) = mock_controller();
    let packets = capture_packets(&bus);

    controller.write(b"-\n");
    let mut buffer = Vec::new();
    assert!(controller.process_queue(&mut buffer).unwrap());
    assert!(buffer.is_empty());
    assert_eq!(controller.packet_count(), 0);
    assert!(packets.lock().unwrap().is_empty());
}

#[test]
fn inband_resume_unblocks_before_pause_check() {
    let (controller, _bus) = mock_controller();
    controller.write(b"!\n&\nIBjS1P\n");

    let mut buffer = Vec::new();
    assert!(controller.process_queue(&mut buffer).unwrap());
    assert_eq!(controller.state(), ThreadState::Paused);

    // The resume directive is next in the stream; it must run before the
    // pause check, so this iteration consumes it and unblocks.
    assert!(controller.process_queue(&mut buffer).unwrap());
    assert_eq!(controller.state(), ThreadState::Started);

    assert!(controller.process_queue(&mut buffer).unwrap());
    assert_eq!(controller.packet_count(), 1);
    assert!(buffer.is_empty());
}

#[test]
fn partial_tail_waits_for_more_bytes() {
    let (controller, _bus) = mock_controller();
    controller.write(b"IB");
    let mut buffer = Vec::new();
    assert!(!controller.process_queue(&mut buffer).unwrap());
    assert_eq!(buffer, b"IB");

    // Completing the statement makes it sendable.
    controller.write(b"jS1P\n");
    assert!(controller.process_queue(&mut buffer).unwrap());
    assert_eq!(controller.packet_count(), 1);
    assert!(buffer.is_empty());
}

#[test]
fn abort_drops_pending_data() {
    let (controller, _bus) = mock_controller();
    controller.write(b"IBjS1P\n");
    controller.abort();
    assert_eq!(controller.state(), ThreadState::Abort);
    assert_eq!(controller.len(), 0);

    // An aborted pipe refuses to restart until reset.
    controller.start();
    assert_eq!(controller.state(), ThreadState::Abort);
    controller.reset();
    assert_eq!(controller.state(), ThreadState::Unstarted);
}

#[test]
fn inband_abort_clears_and_stops() {
    let (controller, _bus) = mock_controller();
    controller.write(b"IBjS1P\n*\nleftover");
    let mut buffer = Vec::new();
    assert!(controller.process_queue(&mut buffer).unwrap());
    assert_eq!(controller.packet_count(), 1);
    assert!(controller.process_queue(&mut buffer).unwrap());
    assert_eq!(controller.state(), ThreadState::Abort);
    assert!(buffer.is_empty(), "abort must clear the buffer");
    assert_eq!(controller.len(), 0);
}

#[test]
fn zero_status_after_send_is_broken_pipe() {
    let config = DeviceConfig::default();
    let controller = Controller::new(&config, SignalBus::new());
    let (driver, _frames) = ScriptedDriver::new(&[STATUS_OK, 0]);
    controller.set_driver(Box::new(driver));

    let mut payload = b"IBa".to_vec();
    payload.resize(30, b'F');
    controller.write(&payload);

    let mut buffer = Vec::new();
    assert!(matches!(
        controller.process_queue(&mut buffer),
        Err(core_pipe::PipeError::Broken)
    ));
    // Nothing was consumed; the packet is retried after reopen.
    assert_eq!(buffer.len(), 30);
}

#[test]
fn sender_thread_drains_and_finishes() {
    let (controller, _bus) = mock_controller();
    controller.start();
    controller.write(b"IBjS1P\nITjS1P\n");
    controller.finish();
    controller.join();
    assert_eq!(controller.state(), ThreadState::Finished);
    assert_eq!(controller.packet_count(), 2);
    assert_eq!(controller.len(), 0);
}
