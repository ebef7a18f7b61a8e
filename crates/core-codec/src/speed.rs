//! Speedcode formatter.
//!
//! The board takes its feed rate as a variable-length decimal string, the
//! "speedcode". The encoded value is derived from the step period the board
//! must hold for a given mm/s feed: `value = |b - m / frequency_kHz|` with
//! `frequency_kHz = speed / 25.4`, where `(b, m)` come from the per-board
//! calibration table below. The 16-bit value is rendered as two 3-digit
//! decimal groups (high byte, low byte).
//!
//! Forms:
//! - vector: `CV<value><accel>[<step><diag>]`, with a trailing `C` and a
//!   forced accel digit `1` in the slow suffix-C regime;
//! - raster: `V<value><accel>G<step>` (no suffix-C, no diagonal group).
//!
//! The diagonal group corrects the period for 45° travel; boards A, B and M
//! predate it, and a `d_ratio` of exactly 0 disables it.

use std::fmt;
use std::str::FromStr;

/// Diagonal correction ratio used when the caller does not override it.
pub const DEFAULT_D_RATIO: f64 = 0.261199033289;

/// Calibration ratio for boards running the alternate stepping firmware.
const FIX_SPEEDS_RATIO: f64 = 0.919_493_599_053_179;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Board {
    A,
    B,
    B1,
    B2,
    M,
    M1,
    M2,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown board {0:?}")]
pub struct UnknownBoard(String);

impl FromStr for Board {
    type Err = UnknownBoard;

    fn from_str(s: &str) -> Result<Board, UnknownBoard> {
        match s {
            "A" => Ok(Board::A),
            "B" => Ok(Board::B),
            "B1" => Ok(Board::B1),
            "B2" => Ok(Board::B2),
            "M" => Ok(Board::M),
            "M1" => Ok(Board::M1),
            "M2" => Ok(Board::M2),
            other => Err(UnknownBoard(other.to_string())),
        }
    }
}

impl fmt::Display for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Board::A => "A",
            Board::B => "B",
            Board::B1 => "B1",
            Board::B2 => "B2",
            Board::M => "M",
            Board::M1 => "M1",
            Board::M2 => "M2",
        };
        f.write_str(name)
    }
}

/// Input to the speedcode formatter. Construct with [`SpeedProfile::vector`]
/// or [`SpeedProfile::raster`] and override fields as needed.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeedProfile {
    pub board: Board,
    /// Feed rate in mm/s.
    pub speed: f64,
    /// Raster row stride in motor steps; 0 selects the vector form.
    pub raster_step: u32,
    /// Diagonal correction ratio; `None` uses [`DEFAULT_D_RATIO`].
    pub d_ratio: Option<f64>,
    /// Acceleration class 1..=4; `None` derives it from the speed.
    pub acceleration: Option<u8>,
    /// Alternate-firmware speed calibration.
    pub fix_speeds: bool,
    /// Clamp out-of-range encodings instead of wrapping.
    pub fix_lows: bool,
    /// Permit vector speeds above 240 mm/s instead of falling back.
    pub fix_limit: bool,
    /// Raster rows run along X.
    pub raster_horizontal: bool,
}

impl SpeedProfile {
    pub fn vector(board: Board, speed: f64) -> SpeedProfile {
        SpeedProfile {
            board,
            speed,
            raster_step: 0,
            d_ratio: None,
            acceleration: None,
            fix_speeds: false,
            fix_lows: true,
            fix_limit: true,
            raster_horizontal: true,
        }
    }

    pub fn raster(board: Board, speed: f64, raster_step: u32) -> SpeedProfile {
        SpeedProfile {
            raster_step,
            ..SpeedProfile::vector(board, speed)
        }
    }

    /// Render the speedcode.
    pub fn speedcode(&self) -> Vec<u8> {
        let mut speed = self.speed;
        if speed > 240.0 && self.raster_step == 0 && !self.fix_limit {
            // Out-of-range vector feed falls back to a safe default.
            speed = 19.05;
        }
        if self.fix_speeds {
            speed /= FIX_SPEEDS_RATIO;
        }
        let accel = self
            .acceleration
            .unwrap_or_else(|| acceleration_class(speed, self.raster_step != 0, self.raster_horizontal));
        let suffix_c = suffix_c_for(self.board, speed);
        let (b, m) = equation(self.board, accel, suffix_c);
        let mut value = value_from_speed(speed, b, m);
        if self.fix_lows && value > 65535.0 {
            value = 65535.0;
        }
        let encoded = encode_16bit(value);

        if self.raster_step != 0 {
            return format!("V{encoded}{accel}G{:03}", self.raster_step).into_bytes();
        }

        let d_ratio = self.d_ratio.unwrap_or(DEFAULT_D_RATIO);
        let code = if d_ratio == 0.0 || matches!(self.board, Board::A | Board::B | Board::M) {
            if suffix_c {
                format!("CV{encoded}1C")
            } else {
                format!("CV{encoded}{accel}")
            }
        } else {
            let step_value = ((speed.floor() as i64) + 1).min(128);
            let frequency_khz = speed / 25.4;
            let period_ms = if frequency_khz != 0.0 { 1.0 / frequency_khz } else { 0.0 };
            let mut d_value = d_ratio * m * period_ms / step_value as f64;
            if self.fix_lows && d_value > 65535.0 {
                d_value = 65535.0;
            }
            let diag = encode_16bit(d_value);
            if suffix_c {
                format!("CV{encoded}1{step_value:03}{diag}C")
            } else {
                format!("CV{encoded}{accel}{step_value:03}{diag}")
            }
        };
        code.into_bytes()
    }
}

/// Acceleration class for a feed rate. Horizontal raster sweeps tolerate one
/// class less braking than vector or vertical travel in the mid band.
fn acceleration_class(speed: f64, raster: bool, raster_horizontal: bool) -> u8 {
    if speed <= 25.4 {
        return 1;
    }
    if speed <= 60.0 {
        return 2;
    }
    if raster && raster_horizontal {
        if speed < 127.0 {
            2
        } else if speed <= 320.0 {
            3
        } else {
            4
        }
    } else if speed < 127.0 {
        3
    } else {
        4
    }
}

/// M2 and B2 firmware switches to the suffix-C encoding below 7 mm/s.
fn suffix_c_for(board: Board, speed: f64) -> bool {
    matches!(board, Board::M2 | Board::B2) && speed < 7.0
}

/// Per-board `(b, m)` calibration pair.
fn equation(board: Board, accel: u8, suffix_c: bool) -> (f64, f64) {
    let mut b = match accel {
        3 => 84.0,
        4 => 1280.0,
        _ => 784.0,
    };
    let mut m = match board {
        Board::B2 => 24240.0,
        _ => 12120.0,
    };
    if suffix_c {
        b = 8.0;
        m /= 12.0;
    }
    (b, m)
}

fn value_from_speed(speed: f64, b: f64, m: f64) -> f64 {
    let frequency_khz = speed / 25.4;
    if frequency_khz == 0.0 {
        return b;
    }
    (b - m / frequency_khz).abs()
}

/// Two 3-digit decimal groups: high byte, then low byte.
fn encode_16bit(value: f64) -> String {
    let v = value.round().clamp(0.0, 65535.0) as u32;
    format!("{:03}{:03}", (v >> 8) & 0xFF, v & 0xFF)
}
