//! Byte-emission scenarios: the interpreter driven against a recorder pipe,
//! asserting the exact dialect on the wire.

use std::sync::{Arc, Mutex};

use core_config::DeviceConfig;
use core_events::SignalBus;
use core_interp::{Directions, Interpreter, LaserCommand, Mode, RealtimeCommand};
use core_pipe::Pipe;

#[derive(Default)]
struct RecorderPipe {
    written: Mutex<Vec<u8>>,
    realtime: Mutex<Vec<u8>>,
}

#[derive(Clone, Default)]
struct SharedRecorderPipe(Arc<RecorderPipe>);

impl Pipe for SharedRecorderPipe {
    fn write(&self, bytes: &[u8]) {
        self.0.written.lock().unwrap().extend_from_slice(bytes);
    }

    fn realtime_write(&self, bytes: &[u8]) {
        self.0.realtime.lock().unwrap().extend_from_slice(bytes);
    }

    fn len(&self) -> usize {
        self.0.written.lock().unwrap().len()
    }
}

fn interpreter(config: DeviceConfig) -> (Interpreter<SharedRecorderPipe>, Arc<RecorderPipe>) {
    let pipe = SharedRecorderPipe::default();
    let interp = Interpreter::new(pipe.clone(), SignalBus::new(), &config).unwrap();
    (interp, pipe.0)
}

fn drain(pipe: &RecorderPipe) -> Vec<u8> {
    std::mem::take(&mut *pipe.written.lock().unwrap())
}

// M2 @ 30 mm/s, step 0, default d-ratio.
const SPEEDCODE_30: &[u8] = b"CV0370062031000086";

#[test]
fn default_move_wraps_in_burst() {
    let (mut interp, pipe) = interpreter(DeviceConfig::default());
    interp.move_absolute(10, 0);
    assert_eq!(drain(&pipe), b"IBjS1P\n");
    assert_eq!(interp.position(), (10, 0));
}

#[test]
fn default_move_without_autolock_releases_rail() {
    let config = DeviceConfig {
        autolock: false,
        ..DeviceConfig::default()
    };
    let (mut interp, pipe) = interpreter(config);
    interp.move_absolute(10, 0);
    assert_eq!(drain(&pipe), b"IBjS1P\nIS2P\n");
}

#[test]
fn default_move_emits_both_legs() {
    let (mut interp, pipe) = interpreter(DeviceConfig::default());
    interp.move_absolute(-3, 7);
    // X leg first, then Y leg, inside one burst.
    assert_eq!(drain(&pipe), b"ITcRgS1P\n");
    assert_eq!(interp.position(), (-3, 7));
}

#[test]
fn compact_entry_writes_speedcode_directions_and_s1e() {
    let (mut interp, pipe) = interpreter(DeviceConfig::default());
    interp.command(LaserCommand::ModeCompact);
    let mut expected = b"I".to_vec();
    expected.extend_from_slice(SPEEDCODE_30);
    expected.extend_from_slice(b"N");
    expected.extend_from_slice(b"BR"); // right, bottom: no flags committed
    expected.extend_from_slice(b"S1E");
    assert_eq!(drain(&pipe), expected);
    assert_eq!(interp.mode(), Mode::Compact);
}

#[test]
fn compact_diagonal_declares_disengaged_axes() {
    let (mut interp, pipe) = interpreter(DeviceConfig::default());
    interp.command(LaserCommand::ModeCompact);
    drain(&pipe);
    interp.move_absolute(5, 5);
    // Y declaration, X declaration, then the angle move.
    assert_eq!(drain(&pipe), b"RBMe");
    assert_eq!(interp.position(), (5, 5));
    assert!(interp.directions().contains(Directions::X | Directions::Y));
}

#[test]
fn compact_repeated_diagonal_omits_directions() {
    let (mut interp, pipe) = interpreter(DeviceConfig::default());
    interp.command(LaserCommand::ModeCompact);
    interp.move_absolute(5, 5);
    drain(&pipe);
    interp.move_absolute(8, 8);
    assert_eq!(drain(&pipe), b"Mc");
}

#[test]
fn compact_mixed_vector_replans_as_runs() {
    let (mut interp, pipe) = interpreter(DeviceConfig::default());
    interp.command(LaserCommand::ModeCompact);
    drain(&pipe);
    interp.move_absolute(5, 2);
    // Bresenham 5x2: diagonal and orthogonal runs only; position lands
    // exactly on the target.
    assert_eq!(interp.position(), (5, 2));
    let emitted = drain(&pipe);
    assert!(!emitted.is_empty());
    for &b in &emitted {
        assert!(
            b"BTLRMabcdefghijklmnopqrstuvwxyz|0123456789".contains(&b),
            "unexpected byte {b:?} in compact stream"
        );
    }
}

#[test]
fn compact_exit_to_default_resets_modes() {
    let (mut interp, pipe) = interpreter(DeviceConfig::default());
    interp.command(LaserCommand::ModeCompact);
    interp.move_absolute(5, 5);
    drain(&pipe);
    interp.command(LaserCommand::ModeDefault);
    assert_eq!(drain(&pipe), b"FNSE-\n");
    assert_eq!(interp.mode(), Mode::Default);
    assert!(interp.directions().is_empty());
}

#[test]
fn compact_exit_to_concat_uses_nse() {
    let (mut interp, pipe) = interpreter(DeviceConfig::default());
    interp.command(LaserCommand::ModeCompact);
    drain(&pipe);
    interp.command(LaserCommand::ModeConcat);
    assert_eq!(drain(&pipe), b"@NSE");
    assert_eq!(interp.mode(), Mode::Concat);
}

#[test]
fn conditional_mode_commands_are_idempotent() {
    let (mut interp, pipe) = interpreter(DeviceConfig::default());
    interp.command(LaserCommand::ModeDefault);
    interp.command(LaserCommand::ModeCompactSet);
    drain(&pipe);
    interp.command(LaserCommand::ModeCompactSet);
    assert_eq!(drain(&pipe), b"", "already compact; nothing re-emitted");
}

#[test]
fn pen_control_is_mode_shaped_and_idempotent() {
    let (mut interp, pipe) = interpreter(DeviceConfig::default());
    interp.down();
    assert_eq!(drain(&pipe), b"IDS1P\n");
    assert!(!interp.down(), "second down is a no-op");
    assert_eq!(drain(&pipe), b"");
    interp.up();
    assert_eq!(drain(&pipe), b"IUS1P\n");

    interp.command(LaserCommand::ModeConcat);
    drain(&pipe);
    interp.down();
    assert_eq!(drain(&pipe), b"DN");
    interp.up();
    assert_eq!(drain(&pipe), b"UN");

    interp.command(LaserCommand::ModeCompact);
    drain(&pipe);
    interp.down();
    assert_eq!(drain(&pipe), b"D");
}

#[test]
fn speed_change_in_compact_reenters() {
    let (mut interp, pipe) = interpreter(DeviceConfig::default());
    interp.command(LaserCommand::ModeCompact);
    drain(&pipe);
    interp.command(LaserCommand::SetSpeed(50.0));
    let emitted = drain(&pipe);
    assert!(emitted.starts_with(b"@NSE"), "must leave compact first");
    assert!(emitted.ends_with(b"S1E"), "must re-enter compact");
    assert_eq!(interp.mode(), Mode::Compact);

    // Same speed again: no traffic at all.
    interp.command(LaserCommand::SetSpeed(50.0));
    assert_eq!(drain(&pipe), b"");
}

#[test]
fn cut_in_default_mode_drives_pen_and_moves() {
    let (mut interp, pipe) = interpreter(DeviceConfig::default());
    interp.command(LaserCommand::Cut { x: 3, y: 0 });
    assert_eq!(drain(&pipe), b"IDS1P\nIBcS1P\n");
    assert_eq!(interp.position(), (3, 0));
}

#[test]
fn rapid_move_forces_default_mode() {
    let (mut interp, pipe) = interpreter(DeviceConfig::default());
    interp.command(LaserCommand::ModeCompact);
    drain(&pipe);
    interp.command(LaserCommand::RapidMove { x: 4, y: 0 });
    let emitted = drain(&pipe);
    assert!(emitted.starts_with(b"FNSE-\n"));
    assert!(emitted.ends_with(b"IBdS1P\n"));
    assert_eq!(interp.mode(), Mode::Default);
}

#[test]
fn home_resets_position_and_applies_adjust() {
    let config = DeviceConfig::default();
    let (mut interp, pipe) = interpreter(config);
    interp.move_absolute(100, 50);
    drain(&pipe);
    interp.command(LaserCommand::Home);
    assert_eq!(drain(&pipe), b"IPP\n");
    assert_eq!(interp.position(), (0, 0));

    let mut config = DeviceConfig::default();
    config.home.adjust_x = 5;
    config.home.adjust_y = -3;
    let (mut interp, pipe) = interpreter(config);
    interp.command(LaserCommand::Home);
    // Adjustment is executed but erased from the logical coordinates.
    assert_eq!(drain(&pipe), b"IPP\nIBeLcS1P\n");
    assert_eq!(interp.position(), (0, 0));
}

#[test]
fn home_corner_honours_bed_geometry() {
    let mut config = DeviceConfig::default();
    config.home.right = true;
    config.home.bottom = true;
    let (mut interp, _pipe) = interpreter(config);
    interp.command(LaserCommand::Home);
    // 320 mm and 220 mm beds at 39.3701 steps/mm.
    assert_eq!(interp.position(), (12598, 8661));
}

#[test]
fn rail_lock_unlock() {
    let (mut interp, pipe) = interpreter(DeviceConfig::default());
    interp.command(LaserCommand::Lock);
    assert_eq!(drain(&pipe), b"IS1P\n");
    interp.command(LaserCommand::Unlock);
    assert_eq!(drain(&pipe), b"IS2P\n");
}

#[test]
fn emergency_reset_preempts_and_forces_default() {
    let (mut interp, pipe) = interpreter(DeviceConfig::default());
    interp.command(LaserCommand::ModeCompact);
    interp.command(LaserCommand::Reset);
    assert_eq!(pipe.realtime.lock().unwrap().as_slice(), b"I*\n");
    assert_eq!(interp.mode(), Mode::Default);
}

#[test]
fn realtime_pause_resume_ride_the_preempt_channel() {
    let (mut interp, pipe) = interpreter(DeviceConfig::default());
    interp.realtime_command(RealtimeCommand::Pause);
    interp.realtime_command(RealtimeCommand::Resume);
    assert_eq!(pipe.realtime.lock().unwrap().as_slice(), b"PN!\nPN&\n");
}

#[test]
fn position_is_the_sum_of_committed_moves() {
    let (mut interp, _pipe) = interpreter(DeviceConfig::default());
    let moves = [(10, 0), (0, 10), (-4, 3), (7, -7), (2, 2)];
    let mut expect = (0, 0);
    for (dx, dy) in moves {
        interp.move_relative(dx, dy);
        expect = (expect.0 + dx, expect.1 + dy);
    }
    assert_eq!(interp.position(), expect);
    assert_eq!(interp.bounds(), ((0, 0), (15, 13)));
}

#[test]
fn relative_mode_resolves_against_current_position() {
    let (mut interp, _pipe) = interpreter(DeviceConfig::default());
    interp.command(LaserCommand::SetIncremental);
    interp.command(LaserCommand::Move { x: 5, y: 5 });
    interp.command(LaserCommand::Move { x: 5, y: 0 });
    assert_eq!(interp.position(), (10, 5));
    interp.command(LaserCommand::SetAbsolute);
    interp.command(LaserCommand::Move { x: 3, y: 3 });
    assert_eq!(interp.position(), (3, 3));
}

#[test]
fn raster_rows_switch_direction_and_advance() {
    let (mut interp, pipe) = interpreter(DeviceConfig::default());
    interp.command(LaserCommand::SetStep(2));
    interp.command(LaserCommand::ModeCompactSet);
    drain(&pipe);
    // Two scanline rows: right along y=0, back left along y=2.
    let runs = vec![(0, 0, 1), (5, 0, 1), (5, 2, 1), (0, 2, 1)];
    interp.command(LaserCommand::Raster(runs));
    assert_eq!(drain(&pipe), b"DBeTDe");
    assert_eq!(interp.position(), (0, 2));
    assert!(interp.directions().contains(Directions::LEFT));
}

#[test]
fn raster_overstep_realigns_through_concat() {
    let (mut interp, pipe) = interpreter(DeviceConfig::default());
    interp.command(LaserCommand::SetStep(2));
    interp.command(LaserCommand::ModeCompactSet);
    drain(&pipe);
    // Second row is two steps down (dy = 4 > raster_step = 2).
    let runs = vec![(0, 0, 1), (5, 0, 1), (5, 4, 1), (0, 4, 1)];
    interp.command(LaserCommand::Raster(runs));
    let emitted = drain(&pipe);
    let text = String::from_utf8_lossy(&emitted);
    assert!(text.contains("@NSE"), "must drop to concat to realign: {text}");
    assert!(text.contains("G002"), "re-entry speedcode is a raster code: {text}");
    assert_eq!(interp.position(), (0, 4));
    assert_eq!(interp.mode(), Mode::Compact);
}

#[test]
fn wait_gates_execution_until_deadline() {
    let (mut interp, _pipe) = interpreter(DeviceConfig::default());
    assert!(!interp.hold());
    interp.command(LaserCommand::Wait(30.0));
    assert!(interp.hold());
    interp.command(LaserCommand::Wait(0.0));
    // An expired deadline clears itself on the next poll.
    assert!(!interp.hold());
    assert!(!interp.hold());
}

#[test]
fn wait_buffer_empty_holds_while_pipe_has_data() {
    let (mut interp, pipe) = interpreter(DeviceConfig::default());
    interp.move_absolute(10, 0); // queue some bytes
    interp.command(LaserCommand::WaitBufferEmpty);
    assert!(interp.hold());
    drain(&pipe);
    assert!(!interp.hold());
}

#[test]
fn buffer_limit_engages_hold_gate() {
    let config = DeviceConfig {
        buffer_max: 4,
        ..DeviceConfig::default()
    };
    let (mut interp, pipe) = interpreter(config);
    interp.move_absolute(10, 0);
    assert!(interp.hold(), "pipe beyond buffer_max must hold");
    drain(&pipe);
    assert!(!interp.hold());
}

#[test]
fn swapped_and_flipped_axes_permute_direction_bytes() {
    let mut config = DeviceConfig::default();
    config.axis.swap_xy = true;
    let (mut interp, pipe) = interpreter(config);
    interp.move_absolute(10, 0);
    assert_eq!(drain(&pipe), b"IRjS1P\n");

    let mut config = DeviceConfig::default();
    config.axis.flip_x = true;
    let (mut interp, pipe) = interpreter(config);
    interp.move_absolute(10, 0);
    assert_eq!(drain(&pipe), b"ITjS1P\n");
}

#[test]
fn cut_quad_and_cubic_land_on_endpoints() {
    let (mut interp, _pipe) = interpreter(DeviceConfig::default());
    interp.command(LaserCommand::CutQuad { cx: 10, cy: 0, x: 10, y: 10 });
    assert_eq!(interp.position(), (10, 10));
    interp.command(LaserCommand::CutCubic {
        c1x: 14,
        c1y: 22,
        c2x: 22,
        c2y: 6,
        x: 26,
        y: 18,
    });
    assert_eq!(interp.position(), (26, 18));
}

#[test]
fn set_direction_seeds_flags() {
    let (mut interp, pipe) = interpreter(DeviceConfig::default());
    interp.command(LaserCommand::SetDirection { left: true, top: false, x: true, y: false });
    interp.command(LaserCommand::ModeCompact);
    let emitted = drain(&pipe);
    // X momentum: declaration order is y then x; left is committed.
    let tail = &emitted[emitted.len() - 5..];
    assert_eq!(tail, b"RTS1E");
}
