//! Run-length grouping of single steps, and its inverse.
//!
//! `group_plots` compacts a single-step stream into orthogonal/diagonal runs:
//! a point is emitted only when the `(dx, dy, on)` triple changes, plus a
//! final flush. PPI power modulation happens here, on the way in, so the
//! emitted `on` values already carry the duty cycle.
//!
//! `ungroup_plots` expands long runs back into unit steps. Both transducers
//! treat contract violations as caller bugs and panic: the grouper refuses
//! input steps larger than one pixel, the ungrouper refuses runs that are
//! neither orthogonal nor pure diagonal.

use crate::Plot;

/// Pulses-per-inch power integrator.
///
/// Each incoming step adds `power * on` to the accumulator; a pulse fires
/// when it crosses 1000 and the overshoot carries to the next step. In group
/// mode, once a pulse has fired the threshold drops to zero until the
/// accumulator is exhausted, trading pulse spacing for longer continuous-on
/// runs at moderate power.
#[derive(Debug, Clone, PartialEq)]
pub struct PulseModulator {
    /// Power level in [0, 1000].
    pub power: f64,
    /// When false, steps pass through unmodulated.
    pub enabled: bool,
    /// Group mode: lowered threshold while a run is on.
    pub group: bool,
    pub total: f64,
}

impl Default for PulseModulator {
    fn default() -> Self {
        PulseModulator {
            power: 1000.0,
            enabled: true,
            group: false,
            total: 0.0,
        }
    }
}

impl PulseModulator {
    pub fn new(power: f64) -> PulseModulator {
        PulseModulator {
            power,
            ..PulseModulator::default()
        }
    }

    /// Current accumulator value, for observability.
    pub fn accumulator(&self) -> f64 {
        self.total
    }

    fn modulate(&mut self, plot_on: u8, last_on: u8) -> u8 {
        if !self.enabled {
            return plot_on.min(1);
        }
        self.total += self.power * plot_on as f64;
        if self.group && last_on == 1 {
            if self.total > 0.0 {
                self.total -= 1000.0;
                1
            } else {
                0
            }
        } else if self.total >= 1000.0 {
            self.total -= 1000.0;
            1
        } else {
            0
        }
    }
}

/// Compact `inner` (single steps) into runs starting from
/// `(start_x, start_y)`. The modulator travels with the grouper; recover it
/// with [`GroupPlots::into_modulator`] after draining.
pub fn group_plots<I>(start_x: i32, start_y: i32, inner: I, modulator: PulseModulator) -> GroupPlots<I>
where
    I: Iterator<Item = Plot>,
{
    GroupPlots {
        inner,
        modulator,
        last: (start_x, start_y, 0),
        dx: 0,
        dy: 0,
        flushed: false,
    }
}

#[derive(Debug)]
pub struct GroupPlots<I: Iterator<Item = Plot>> {
    inner: I,
    modulator: PulseModulator,
    last: Plot,
    dx: i32,
    dy: i32,
    flushed: bool,
}

impl<I: Iterator<Item = Plot>> GroupPlots<I> {
    /// Hand the modulator (and its accumulator) back after the stream is
    /// drained.
    pub fn into_modulator(self) -> PulseModulator {
        self.modulator
    }
}

impl<I: Iterator<Item = Plot>> Iterator for GroupPlots<I> {
    type Item = Plot;

    fn next(&mut self) -> Option<Plot> {
        loop {
            match self.inner.next() {
                Some((x, y, plot_on)) => {
                    let on = self.modulator.modulate(plot_on, self.last.2);
                    if x == self.last.0 + self.dx && y == self.last.1 + self.dy && on == self.last.2 {
                        self.last.0 = x;
                        self.last.1 = y;
                        continue;
                    }
                    let emit = self.last;
                    let dx = x - self.last.0;
                    let dy = y - self.last.1;
                    // A violation here means the upstream plotter produced
                    // data more than a pixel apart; the bug is there.
                    assert!(
                        dx.abs() <= 1 && dy.abs() <= 1,
                        "dx({dx}) or dy({dy}) exceeds 1"
                    );
                    self.dx = dx;
                    self.dy = dy;
                    self.last = (x, y, on);
                    return Some(emit);
                }
                None => {
                    if self.flushed {
                        return None;
                    }
                    self.flushed = true;
                    return Some(self.last);
                }
            }
        }
    }
}

/// Expand grouped runs back into unit steps. The first point passes through
/// unchanged; each subsequent point must be reachable by repeating one
/// orthogonal or diagonal unit step.
pub fn ungroup_plots<I>(inner: I) -> UngroupPlots<I>
where
    I: Iterator<Item = Plot>,
{
    UngroupPlots {
        inner,
        current: None,
        target: None,
        dx: 0,
        dy: 0,
    }
}

#[derive(Debug)]
pub struct UngroupPlots<I: Iterator<Item = Plot>> {
    inner: I,
    current: Option<(i32, i32)>,
    target: Option<Plot>,
    dx: i32,
    dy: i32,
}

impl<I: Iterator<Item = Plot>> Iterator for UngroupPlots<I> {
    type Item = Plot;

    fn next(&mut self) -> Option<Plot> {
        loop {
            if let Some((tx, ty, on)) = self.target {
                let (cx, cy) = self.current.expect("target implies current");
                if cx != tx || cy != ty {
                    let next = (cx + self.dx, cy + self.dy);
                    self.current = Some(next);
                    return Some((next.0, next.1, on));
                }
                self.target = None;
            }
            let (nx, ny, on) = self.inner.next()?;
            match self.current {
                None => {
                    self.current = Some((nx, ny));
                    return Some((nx, ny, on));
                }
                Some((cx, cy)) => {
                    let total_dx = nx - cx;
                    let total_dy = ny - cy;
                    let dx = total_dx.signum();
                    let dy = total_dy.signum();
                    assert!(
                        total_dy as i64 * dx as i64 == total_dx as i64 * dy as i64,
                        "must be uniformly diagonal or orthogonal: ({total_dx}, {total_dy}) is not"
                    );
                    self.dx = dx;
                    self.dy = dy;
                    self.target = Some((nx, ny, on));
                }
            }
        }
    }
}
