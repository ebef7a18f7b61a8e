//! Device-agnostic laser commands accepted by the interpreter.
//!
//! The spooler (or any other producer) feeds these to
//! [`Interpreter::command`](crate::Interpreter::command); the realtime
//! subset in [`RealtimeCommand`] bypasses the queue discipline and is safe
//! to issue while a job is running.

use core_plot::{Plot, Segment};

#[derive(Debug, Clone, PartialEq)]
pub enum LaserCommand {
    LaserOn,
    LaserOff,
    /// Travel move via DEFAULT mode, pen up.
    RapidMove { x: i32, y: i32 },
    /// Unmodulated reposition honouring the current mode.
    Shift { x: i32, y: i32 },
    /// Move with modulation only if the pen is already down.
    Move { x: i32, y: i32 },
    /// Modulated straight cut.
    Cut { x: i32, y: i32 },
    /// Modulated quadratic Bézier cut (control, then endpoint).
    CutQuad { cx: i32, cy: i32, x: i32, y: i32 },
    /// Modulated cubic Bézier cut (two controls, then endpoint).
    CutCubic { c1x: i32, c1y: i32, c2x: i32, c2y: i32, x: i32, y: i32 },
    /// Modulated compound-path cut.
    PlotPath(Vec<Segment>),
    /// Raster sweep: grouped runs as produced by an image scanline walker.
    Raster(Vec<Plot>),
    HStep,
    VStep,
    Home,
    Lock,
    Unlock,
    SetSpeed(f64),
    SetPower(f64),
    SetStep(u32),
    SetDRatio(Option<f64>),
    SetAcceleration(Option<u8>),
    /// Seed the direction flags: left/top signs and engaged axes.
    SetDirection { left: bool, top: bool, x: bool, y: bool },
    SetIncremental,
    SetAbsolute,
    SetPosition { x: i32, y: i32 },
    /// Unconditional COMPACT re-entry (flushes a changed speedcode).
    ModeCompact,
    /// Enter COMPACT only if not already there.
    ModeCompactSet,
    /// Return to DEFAULT only if not already there.
    ModeDefault,
    /// Enter CONCAT only if not already there.
    ModeConcat,
    /// Gate execution for the given number of seconds.
    Wait(f64),
    /// Gate execution until the pipe has drained.
    WaitBufferEmpty,
    Beep,
    /// Publish a user signal on the bus.
    Signal(String),
    Open,
    Close,
    Reset,
    Pause,
    Resume,
    Status,
}

/// Commands honoured immediately, ahead of queued work.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeCommand {
    SetSpeed(f64),
    SetPower(f64),
    SetStep(u32),
    SetDRatio(Option<f64>),
    SetPosition { x: i32, y: i32 },
    Reset,
    Pause,
    Resume,
    Status,
}
