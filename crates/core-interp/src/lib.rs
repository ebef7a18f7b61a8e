//! Stateful translator from geometric commands to the board's byte dialect.
//!
//! The interpreter is an optimistic predictor: after any command returns,
//! `position()` is where the head will be once the pipe drains. It tracks
//! three machine modes and the direction flags the board itself keeps:
//!
//! - DEFAULT: every action is a self-contained `I…S1P\n` burst (plus an
//!   `IS2P\n` rail release when autolock is off);
//! - CONCAT: actions are concatenated, each terminated with `N`;
//! - COMPACT: streamed mode entered with speedcode + `N` + direction
//!   declaration + `S1E`; inside it only direction bytes and distance
//!   tokens flow. Changing speed, d-ratio, step or acceleration while in
//!   COMPACT transparently leaves and re-enters so the new speedcode takes
//!   effect.
//!
//! A direction byte is emitted only when the required direction differs
//! from the last committed one; the engaged-axis flags decide raster
//! switching. Mixed non-diagonal vectors inside COMPACT are re-planned
//! through the line plotter and grouper, one orthogonal/diagonal run at a
//! time.

mod command;

pub use command::{LaserCommand, RealtimeCommand};

use std::time::{Duration, Instant};

use bitflags::bitflags;
use core_codec::{Board, CodeSet, SpeedProfile, UnknownBoard, lhymicro_distance};
use core_config::DeviceConfig;
use core_events::{Signal, SignalBus};
use core_pipe::Pipe;
use core_plot::{
    GroupPlots, Plot, PulseModulator, group_plots, plot_cubic_bezier, plot_line, plot_path,
    plot_quad_bezier, ungroup_plots,
};
use tracing::debug;

bitflags! {
    /// Last-committed movement axes and signs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Directions: u8 {
        /// Direction is flagged left rather than right.
        const LEFT = 1;
        /// Direction is flagged top rather than bottom.
        const TOP = 2;
        /// X stepper motor is engaged.
        const X = 4;
        /// Y stepper motor is engaged.
        const Y = 8;
    }
}

/// Machine-level operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Default,
    Concat,
    Compact,
}

impl Mode {
    pub fn code(self) -> u8 {
        match self {
            Mode::Default => 0,
            Mode::Concat => 1,
            Mode::Compact => 2,
        }
    }
}

/// One-shot gate blocking further execution until cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HoldCondition {
    Until(Instant),
    BufferEmpty,
}

pub struct Interpreter<P: Pipe> {
    pipe: P,
    bus: SignalBus,
    codes: CodeSet,
    board: Board,
    mode: Mode,
    flags: Directions,
    x: i32,
    y: i32,
    min_x: i32,
    min_y: i32,
    max_x: i32,
    max_y: i32,
    is_on: bool,
    is_relative: bool,
    raster_step: u32,
    speed: f64,
    d_ratio: Option<f64>,
    acceleration: Option<u8>,
    modulator: PulseModulator,
    autolock: bool,
    fix_speeds: bool,
    home_right: bool,
    home_bottom: bool,
    home_adjust_x: i32,
    home_adjust_y: i32,
    bed_width_mm: u32,
    bed_height_mm: u32,
    buffer_max: usize,
    buffer_limit: bool,
    extra_hold: Option<HoldCondition>,
}

impl<P: Pipe> Interpreter<P> {
    pub fn new(pipe: P, bus: SignalBus, config: &DeviceConfig) -> Result<Interpreter<P>, UnknownBoard> {
        Ok(Interpreter {
            pipe,
            bus,
            codes: CodeSet::configured(config.axis.swap_xy, config.axis.flip_x, config.axis.flip_y),
            board: config.board.parse()?,
            mode: Mode::Default,
            flags: Directions::empty(),
            x: 0,
            y: 0,
            min_x: 0,
            min_y: 0,
            max_x: 0,
            max_y: 0,
            is_on: false,
            is_relative: false,
            raster_step: 0,
            speed: 30.0,
            d_ratio: None,
            acceleration: None,
            modulator: PulseModulator::default(),
            autolock: config.autolock,
            fix_speeds: config.fix_speeds,
            home_right: config.home.right,
            home_bottom: config.home.bottom,
            home_adjust_x: config.home.adjust_x,
            home_adjust_y: config.home.adjust_y,
            bed_width_mm: config.bed_width_mm,
            bed_height_mm: config.bed_height_mm,
            buffer_max: config.buffer_max,
            buffer_limit: config.buffer_limit,
            extra_hold: None,
        })
    }

    pub fn position(&self) -> (i32, i32) {
        (self.x, self.y)
    }

    /// Traversal envelope since construction (or the last `SetPosition`).
    pub fn bounds(&self) -> ((i32, i32), (i32, i32)) {
        ((self.min_x, self.min_y), (self.max_x, self.max_y))
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn directions(&self) -> Directions {
        self.flags
    }

    pub fn is_on(&self) -> bool {
        self.is_on
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn power(&self) -> f64 {
        self.modulator.power
    }

    /// True while execution must stay suspended: a one-shot gate (wait, or
    /// wait-for-drain) is pending, or the pipe is over its fill limit. The
    /// execution loop polls this between commands.
    pub fn hold(&mut self) -> bool {
        if let Some(condition) = self.extra_hold {
            let holding = match condition {
                HoldCondition::Until(deadline) => Instant::now() < deadline,
                HoldCondition::BufferEmpty => !self.pipe.is_empty(),
            };
            if holding {
                return true;
            }
            self.extra_hold = None;
        }
        self.buffer_limit && self.pipe.len() > self.buffer_max
    }

    pub fn command(&mut self, command: LaserCommand) {
        match command {
            LaserCommand::LaserOff => {
                self.up();
            }
            LaserCommand::LaserOn => {
                self.down();
            }
            LaserCommand::RapidMove { x, y } => {
                self.to_default_mode();
                self.move_to(x, y);
            }
            LaserCommand::Shift { x, y } => {
                let (sx, sy) = (self.x, self.y);
                self.up();
                self.modulator.enabled = false;
                if self.mode == Mode::Compact {
                    let (tx, ty) = self.resolve(x, y);
                    self.travel_grouped(sx, sy, plot_line(sx, sy, tx, ty));
                } else {
                    self.move_to(x, y);
                }
            }
            LaserCommand::Move { x, y } => {
                let (sx, sy) = (self.x, self.y);
                self.modulator.enabled = self.is_on;
                if self.mode == Mode::Compact {
                    let (tx, ty) = self.resolve(x, y);
                    self.travel_grouped(sx, sy, plot_line(sx, sy, tx, ty));
                } else {
                    self.move_to(x, y);
                }
            }
            LaserCommand::Cut { x, y } => {
                let (sx, sy) = (self.x, self.y);
                self.modulator.enabled = true;
                let (tx, ty) = self.resolve(x, y);
                self.cut_grouped(sx, sy, plot_line(sx, sy, tx, ty));
            }
            LaserCommand::CutQuad { cx, cy, x, y } => {
                let (sx, sy) = (self.x, self.y);
                self.modulator.enabled = true;
                self.cut_grouped(sx, sy, plot_quad_bezier(sx, sy, cx, cy, x, y));
            }
            LaserCommand::CutCubic { c1x, c1y, c2x, c2y, x, y } => {
                let (sx, sy) = (self.x, self.y);
                self.modulator.enabled = true;
                self.cut_grouped(sx, sy, plot_cubic_bezier(sx, sy, c1x, c1y, c2x, c2y, x, y));
            }
            LaserCommand::PlotPath(segments) => {
                if segments.is_empty() {
                    return;
                }
                let (fx, fy) = segments[0].start();
                self.move_absolute(fx, fy);
                let (sx, sy) = (self.x, self.y);
                self.modulator.enabled = true;
                self.cut_grouped(sx, sy, plot_path(&segments));
            }
            LaserCommand::Raster(runs) => self.raster(runs),
            LaserCommand::HStep => self.v_switch(),
            LaserCommand::VStep => self.h_switch(),
            LaserCommand::Home => self.home(),
            LaserCommand::Lock => self.lock_rail(),
            LaserCommand::Unlock => self.unlock_rail(),
            LaserCommand::SetSpeed(speed) => self.set_speed(speed),
            LaserCommand::SetPower(power) => self.set_power(power),
            LaserCommand::SetStep(step) => self.set_step(step),
            LaserCommand::SetDRatio(d_ratio) => self.set_d_ratio(d_ratio),
            LaserCommand::SetAcceleration(accel) => self.set_acceleration(accel),
            LaserCommand::SetDirection { left, top, x, y } => {
                self.flags = Directions::empty();
                self.flags.set(Directions::LEFT, left);
                self.flags.set(Directions::TOP, top);
                self.flags.set(Directions::X, x);
                self.flags.set(Directions::Y, y);
            }
            LaserCommand::SetIncremental => self.is_relative = true,
            LaserCommand::SetAbsolute => self.is_relative = false,
            LaserCommand::SetPosition { x, y } => {
                self.x = x;
                self.y = y;
            }
            LaserCommand::ModeCompact => self.to_compact_mode(),
            LaserCommand::ModeCompactSet => {
                if self.mode != Mode::Compact {
                    self.to_compact_mode();
                }
            }
            LaserCommand::ModeDefault => {
                if self.mode != Mode::Default {
                    self.to_default_mode();
                }
            }
            LaserCommand::ModeConcat => {
                if self.mode != Mode::Concat {
                    self.to_concat_mode();
                }
            }
            LaserCommand::Wait(seconds) => {
                self.extra_hold = Some(HoldCondition::Until(
                    Instant::now() + Duration::from_secs_f64(seconds.max(0.0)),
                ));
            }
            LaserCommand::WaitBufferEmpty => {
                self.extra_hold = Some(HoldCondition::BufferEmpty);
            }
            LaserCommand::Beep => {
                self.bus.publish("interpreter;beep", Signal::Text("beep".to_string()));
            }
            LaserCommand::Signal(topic) => {
                self.bus.publish(&topic, Signal::Text(topic.clone()));
            }
            LaserCommand::Close => self.to_default_mode(),
            LaserCommand::Open => {
                self.reset_modes();
                self.set_mode(Mode::Default);
            }
            LaserCommand::Reset => self.emergency_reset(),
            LaserCommand::Pause => self.pause(),
            LaserCommand::Resume => {
                // A queued resume cannot run: the queue it rides is the one
                // that is paused. Only the realtime variant is effective.
                debug!("queued resume ignored");
            }
            LaserCommand::Status => {
                let status = self.status_report();
                self.bus.publish("interpreter;status", Signal::Text(status));
            }
        }
    }

    /// Immediate commands, honoured ahead of the queued stream.
    pub fn realtime_command(&mut self, command: RealtimeCommand) {
        match command {
            RealtimeCommand::SetSpeed(speed) => self.set_speed(speed),
            RealtimeCommand::SetPower(power) => self.set_power(power),
            RealtimeCommand::SetStep(step) => self.set_step(step),
            RealtimeCommand::SetDRatio(d_ratio) => self.set_d_ratio(d_ratio),
            RealtimeCommand::SetPosition { x, y } => {
                self.x = x;
                self.y = y;
            }
            RealtimeCommand::Reset => self.emergency_reset(),
            RealtimeCommand::Pause => self.pause(),
            RealtimeCommand::Resume => self.resume(),
            RealtimeCommand::Status => {
                let status = self.status_report();
                self.bus.publish("interpreter;status", Signal::Text(status));
            }
        }
    }

    fn status_report(&self) -> String {
        format!(
            "x={};y={};speed={};power={}",
            self.x, self.y, self.speed, self.modulator.power
        )
    }

    fn resolve(&self, x: i32, y: i32) -> (i32, i32) {
        if self.is_relative { (x + self.x, y + self.y) } else { (x, y) }
    }

    /// Drain a grouped plot, driving the pen and moving per run.
    fn cut_grouped<I: Iterator<Item = Plot>>(&mut self, start_x: i32, start_y: i32, plots: I) {
        let mut grouper = group_plots(start_x, start_y, plots, self.modulator.clone());
        while let Some((x, y, on)) = grouper.next() {
            self.bus.publish("interpreter;plot", Signal::Plot { x, y, on });
            if on == 0 {
                self.up();
            } else {
                self.down();
            }
            self.move_absolute(x, y);
        }
        self.restore_modulator(grouper);
    }

    /// Drain a grouped plot, moving only; the pen is left alone.
    fn travel_grouped<I: Iterator<Item = Plot>>(&mut self, start_x: i32, start_y: i32, plots: I) {
        let mut grouper = group_plots(start_x, start_y, plots, self.modulator.clone());
        while let Some((x, y, _)) = grouper.next() {
            self.move_absolute(x, y);
        }
        self.restore_modulator(grouper);
    }

    fn restore_modulator<I: Iterator<Item = Plot>>(&mut self, grouper: GroupPlots<I>) {
        self.modulator = grouper.into_modulator();
    }

    /// Raster sweep over grouped scanline runs. Between rows the head
    /// switches direction; a row advance larger than the raster step drops
    /// to CONCAT, realigns, and re-enters COMPACT.
    fn raster(&mut self, runs: Vec<Plot>) {
        let mut sx = self.x;
        let mut sy = self.y;
        self.modulator.enabled = true;
        let step = self.raster_step as i32;
        let mut grouper = group_plots(sx, sy, ungroup_plots(runs.into_iter()), self.modulator.clone());
        while let Some((x, y, on)) = grouper.next() {
            self.bus.publish("interpreter;plot", Signal::Plot { x, y, on });
            let dx = x - sx;
            let dy = y - sy;
            sx = x;
            sy = y;
            if self.flags.contains(Directions::X) && dy != 0 {
                if dy.abs() > step {
                    let realign = if self.flags.contains(Directions::TOP) {
                        dy + step
                    } else {
                        dy - step
                    };
                    self.to_concat_mode();
                    self.move_relative(0, realign);
                    self.flags.insert(Directions::X);
                    self.flags.remove(Directions::Y);
                    self.to_compact_mode();
                }
                self.h_switch();
            } else if self.flags.contains(Directions::Y) && dx != 0 {
                if dx.abs() > step {
                    let realign = if self.flags.contains(Directions::LEFT) {
                        dx + step
                    } else {
                        dx - step
                    };
                    self.to_concat_mode();
                    self.move_relative(realign, 0);
                    self.flags.insert(Directions::Y);
                    self.flags.remove(Directions::X);
                    self.to_compact_mode();
                }
                self.v_switch();
            } else {
                if on == 0 {
                    self.up();
                } else {
                    self.down();
                }
                self.move_relative(dx, dy);
            }
        }
        self.restore_modulator(grouper);
    }

    pub fn move_to(&mut self, x: i32, y: i32) {
        if self.is_relative {
            self.move_relative(x, y);
        } else {
            self.move_absolute(x, y);
        }
    }

    pub fn move_absolute(&mut self, x: i32, y: i32) {
        self.move_relative(x - self.x, y - self.y);
    }

    pub fn move_relative(&mut self, dx: i32, dy: i32) {
        if dx == 0 && dy == 0 {
            return;
        }
        match self.mode {
            Mode::Default => {
                self.pipe.write(b"I");
                if dx != 0 {
                    self.move_x(dx);
                }
                if dy != 0 {
                    self.move_y(dy);
                }
                self.pipe.write(b"S1P\n");
                if !self.autolock {
                    self.pipe.write(b"IS2P\n");
                }
            }
            Mode::Compact => {
                if dx != 0 && dy != 0 && dx.abs() != dy.abs() {
                    // Mixed vector: the board only takes orthogonal or pure
                    // diagonal steps, so re-plan through the line plotter.
                    let (sx, sy) = (self.x, self.y);
                    self.travel_grouped(sx, sy, plot_line(sx, sy, sx + dx, sy + dy));
                } else if dx.abs() == dy.abs() {
                    self.move_angle(dx, dy);
                } else if dx != 0 {
                    self.move_x(dx);
                } else {
                    self.move_y(dy);
                }
            }
            Mode::Concat => {
                if dx != 0 {
                    self.move_x(dx);
                }
                if dy != 0 {
                    self.move_y(dy);
                }
                self.pipe.write(b"N");
            }
        }
        self.check_bounds();
        self.bus.publish(
            "interpreter;position",
            Signal::Position {
                x: self.x,
                y: self.y,
                from_x: self.x - dx,
                from_y: self.y - dy,
            },
        );
    }

    fn move_x(&mut self, dx: i32) {
        if dx > 0 {
            self.move_right(dx);
        } else {
            self.move_left(dx);
        }
    }

    fn move_y(&mut self, dy: i32) {
        if dy > 0 {
            self.move_bottom(dy);
        } else {
            self.move_top(dy);
        }
    }

    fn move_right(&mut self, dx: i32) {
        self.x += dx;
        if !self.is_right() || self.mode != Mode::Compact {
            self.pipe.write(&[self.codes.right]);
            self.set_right();
        }
        if dx != 0 {
            self.pipe.write(&lhymicro_distance(dx.unsigned_abs()));
            self.check_bounds();
        }
    }

    fn move_left(&mut self, dx: i32) {
        self.x -= dx.abs();
        if !self.is_left() || self.mode != Mode::Compact {
            self.pipe.write(&[self.codes.left]);
            self.set_left();
        }
        if dx != 0 {
            self.pipe.write(&lhymicro_distance(dx.unsigned_abs()));
            self.check_bounds();
        }
    }

    fn move_bottom(&mut self, dy: i32) {
        self.y += dy;
        if !self.is_bottom() || self.mode != Mode::Compact {
            self.pipe.write(&[self.codes.bottom]);
            self.set_bottom();
        }
        if dy != 0 {
            self.pipe.write(&lhymicro_distance(dy.unsigned_abs()));
            self.check_bounds();
        }
    }

    fn move_top(&mut self, dy: i32) {
        self.y -= dy.abs();
        if !self.is_top() || self.mode != Mode::Compact {
            self.pipe.write(&[self.codes.top]);
            self.set_top();
        }
        if dy != 0 {
            self.pipe.write(&lhymicro_distance(dy.unsigned_abs()));
            self.check_bounds();
        }
    }

    /// Pure diagonal move. Any axis whose direction is not already
    /// committed gets its direction byte first, y leg before x leg.
    fn move_angle(&mut self, dx: i32, dy: i32) {
        assert!(dx.abs() == dy.abs(), "abs(dx) must equal abs(dy)");
        let want_left = dx < 0;
        let want_top = dy < 0;
        if !self.flags.contains(Directions::Y) || self.flags.contains(Directions::TOP) != want_top {
            self.pipe
                .write(&[if want_top { self.codes.top } else { self.codes.bottom }]);
            self.flags.set(Directions::TOP, want_top);
        }
        if !self.flags.contains(Directions::X) || self.flags.contains(Directions::LEFT) != want_left {
            self.pipe
                .write(&[if want_left { self.codes.left } else { self.codes.right }]);
            self.flags.set(Directions::LEFT, want_left);
        }
        self.flags.insert(Directions::X | Directions::Y);
        self.x += dx;
        self.y += dy;
        self.check_bounds();
        self.pipe.write(&[CodeSet::ANGLE]);
        self.pipe.write(&lhymicro_distance(dy.unsigned_abs()));
    }

    /// Declare raster directions: left/top signs with the primary momentum
    /// axis going last. Diagonal directions cannot be declared.
    fn declare_directions(&mut self) {
        let x_dir = if self.flags.contains(Directions::LEFT) {
            self.codes.left
        } else {
            self.codes.right
        };
        let y_dir = if self.flags.contains(Directions::TOP) {
            self.codes.top
        } else {
            self.codes.bottom
        };
        if self.flags.contains(Directions::X) {
            self.pipe.write(&[y_dir, x_dir]);
        } else {
            self.pipe.write(&[x_dir, y_dir]);
        }
    }

    /// Reverse the horizontal sweep and advance one raster row in Y.
    /// The direction change drops the laser, so the pen state resets.
    pub fn h_switch(&mut self) {
        if self.flags.contains(Directions::LEFT) {
            self.pipe.write(&[self.codes.right]);
            self.flags.remove(Directions::LEFT);
        } else {
            self.pipe.write(&[self.codes.left]);
            self.flags.insert(Directions::LEFT);
        }
        if self.flags.contains(Directions::TOP) {
            self.y -= self.raster_step as i32;
        } else {
            self.y += self.raster_step as i32;
        }
        self.is_on = false;
    }

    /// Reverse the vertical sweep and advance one raster column in X.
    pub fn v_switch(&mut self) {
        if self.flags.contains(Directions::TOP) {
            self.pipe.write(&[self.codes.bottom]);
            self.flags.remove(Directions::TOP);
        } else {
            self.pipe.write(&[self.codes.top]);
            self.flags.insert(Directions::TOP);
        }
        if self.flags.contains(Directions::LEFT) {
            self.x -= self.raster_step as i32;
        } else {
            self.x += self.raster_step as i32;
        }
        self.is_on = false;
    }

    pub fn down(&mut self) -> bool {
        if self.is_on {
            return false;
        }
        match self.mode {
            Mode::Default => {
                self.pipe.write(b"I");
                self.pipe.write(&[CodeSet::LASER_ON]);
                self.pipe.write(b"S1P\n");
                if !self.autolock {
                    self.pipe.write(b"IS2P\n");
                }
            }
            Mode::Compact => self.pipe.write(&[CodeSet::LASER_ON]),
            Mode::Concat => {
                self.pipe.write(&[CodeSet::LASER_ON]);
                self.pipe.write(b"N");
            }
        }
        self.is_on = true;
        true
    }

    pub fn up(&mut self) -> bool {
        if !self.is_on {
            return false;
        }
        match self.mode {
            Mode::Default => {
                self.pipe.write(b"I");
                self.pipe.write(&[CodeSet::LASER_OFF]);
                self.pipe.write(b"S1P\n");
                if !self.autolock {
                    self.pipe.write(b"IS2P\n");
                }
            }
            Mode::Compact => self.pipe.write(&[CodeSet::LASER_OFF]),
            Mode::Concat => {
                self.pipe.write(&[CodeSet::LASER_OFF]);
                self.pipe.write(b"N");
            }
        }
        self.is_on = false;
        true
    }

    fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
        debug!(mode = ?mode, "interpreter mode");
        self.bus.publish("interpreter;mode", Signal::Mode(mode.code()));
    }

    pub fn to_default_mode(&mut self) {
        match self.mode {
            Mode::Concat => {
                self.pipe.write(b"S1P\n");
                if !self.autolock {
                    self.pipe.write(b"IS2P\n");
                }
            }
            Mode::Compact => {
                self.pipe.write(b"FNSE-\n");
                self.reset_modes();
            }
            Mode::Default => {}
        }
        self.set_mode(Mode::Default);
    }

    pub fn to_concat_mode(&mut self) {
        match self.mode {
            Mode::Compact => {
                self.pipe.write(b"@NSE");
                self.reset_modes();
            }
            Mode::Default => self.pipe.write(b"I"),
            Mode::Concat => {}
        }
        self.set_mode(Mode::Concat);
    }

    pub fn to_compact_mode(&mut self) {
        self.to_concat_mode();
        let mut profile = SpeedProfile::vector(self.board, self.speed);
        profile.raster_step = self.raster_step;
        profile.d_ratio = self.d_ratio;
        profile.acceleration = self.acceleration;
        profile.fix_speeds = self.fix_speeds;
        self.pipe.write(&profile.speedcode());
        self.pipe.write(b"N");
        self.declare_directions();
        self.pipe.write(b"S1E");
        self.set_mode(Mode::Compact);
    }

    fn home_position(&self) -> (i32, i32) {
        // Bed is configured in mm; the rail works in mil steps.
        let x = if self.home_right {
            (self.bed_width_mm as f64 * 39.3701) as i32
        } else {
            0
        };
        let y = if self.home_bottom {
            (self.bed_height_mm as f64 * 39.3701) as i32
        } else {
            0
        };
        (x, y)
    }

    /// Force DEFAULT, home the rail, then apply the configured post-home
    /// adjustment without letting it show in the logical coordinates.
    pub fn home(&mut self) {
        let (hx, hy) = self.home_position();
        self.to_default_mode();
        self.pipe.write(b"IPP\n");
        let (old_x, old_y) = (self.x, self.y);
        self.x = hx;
        self.y = hy;
        self.reset_modes();
        if self.home_adjust_x != 0 || self.home_adjust_y != 0 {
            self.move_relative(self.home_adjust_x, self.home_adjust_y);
            self.x = hx;
            self.y = hy;
        }
        self.bus.publish("interpreter;mode", Signal::Mode(self.mode.code()));
        self.bus.publish(
            "interpreter;position",
            Signal::Position { x: self.x, y: self.y, from_x: old_x, from_y: old_y },
        );
    }

    pub fn lock_rail(&mut self) {
        self.to_default_mode();
        self.pipe.write(b"IS1P\n");
    }

    pub fn unlock_rail(&mut self) {
        self.to_default_mode();
        self.pipe.write(b"IS2P\n");
    }

    /// Realtime machine reset; forces the mode machine back to DEFAULT.
    pub fn emergency_reset(&mut self) {
        self.pipe.realtime_write(b"I*\n");
        self.set_mode(Mode::Default);
    }

    pub fn pause(&self) {
        self.pipe.realtime_write(b"PN!\n");
    }

    pub fn resume(&self) {
        self.pipe.realtime_write(b"PN&\n");
    }

    pub fn set_speed(&mut self, speed: f64) {
        if self.speed == speed {
            return;
        }
        self.speed = speed;
        if self.mode == Mode::Compact {
            // Compact runs at the committed speedcode; re-enter for effect.
            self.to_concat_mode();
            self.to_compact_mode();
        }
    }

    pub fn set_power(&mut self, power: f64) {
        self.modulator.power = power.clamp(0.0, 1000.0);
    }

    pub fn set_step(&mut self, step: u32) {
        if self.raster_step == step {
            return;
        }
        self.raster_step = step;
        if self.mode == Mode::Compact {
            self.to_concat_mode();
            self.to_compact_mode();
        }
    }

    pub fn set_d_ratio(&mut self, d_ratio: Option<f64>) {
        if self.d_ratio == d_ratio {
            return;
        }
        self.d_ratio = d_ratio;
        if self.mode == Mode::Compact {
            self.to_concat_mode();
            self.to_compact_mode();
        }
    }

    pub fn set_acceleration(&mut self, acceleration: Option<u8>) {
        if self.acceleration == acceleration {
            return;
        }
        self.acceleration = acceleration;
        if self.mode == Mode::Compact {
            self.to_concat_mode();
            self.to_compact_mode();
        }
    }

    fn check_bounds(&mut self) {
        self.min_x = self.min_x.min(self.x);
        self.min_y = self.min_y.min(self.y);
        self.max_x = self.max_x.max(self.x);
        self.max_y = self.max_y.max(self.y);
    }

    fn reset_modes(&mut self) {
        self.is_on = false;
        self.flags = Directions::empty();
    }

    fn is_right(&self) -> bool {
        self.flags.contains(Directions::X)
            && !self.flags.contains(Directions::Y)
            && !self.flags.contains(Directions::LEFT)
    }

    fn is_left(&self) -> bool {
        self.flags.contains(Directions::X)
            && !self.flags.contains(Directions::Y)
            && self.flags.contains(Directions::LEFT)
    }

    fn is_bottom(&self) -> bool {
        !self.flags.contains(Directions::X)
            && self.flags.contains(Directions::Y)
            && !self.flags.contains(Directions::TOP)
    }

    fn is_top(&self) -> bool {
        !self.flags.contains(Directions::X)
            && self.flags.contains(Directions::Y)
            && self.flags.contains(Directions::TOP)
    }

    fn set_right(&mut self) {
        self.flags.insert(Directions::X);
        self.flags.remove(Directions::Y);
        self.flags.remove(Directions::LEFT);
    }

    fn set_left(&mut self) {
        self.flags.insert(Directions::X);
        self.flags.remove(Directions::Y);
        self.flags.insert(Directions::LEFT);
    }

    fn set_bottom(&mut self) {
        self.flags.remove(Directions::X);
        self.flags.insert(Directions::Y);
        self.flags.remove(Directions::TOP);
    }

    fn set_top(&mut self) {
        self.flags.remove(Directions::X);
        self.flags.insert(Directions::Y);
        self.flags.insert(Directions::TOP);
    }
}
