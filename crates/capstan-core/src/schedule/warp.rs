//! Variable-speed time warping
//!
//! A time warp maps between track time (position in project content) and
//! real wall-clock time. Straight playback is the identity; a warp curve
//! makes a track span take more or less real time than its nominal length.
//! The schedule only ever needs the two integrals below, so the curve
//! itself stays behind a trait and the engine treats it as opaque.

/// Mapping between track-time spans and the real seconds they take to play
///
/// `warped_length` and `solve_warped_length` are inverses of each other
/// along the second argument. Both are signed: traversing backwards yields
/// negative real time and vice versa.
pub trait TimeWarp: Send + Sync {
    /// Real seconds consumed playing from track time `t0` to `t1`
    fn warped_length(&self, t0: f64, t1: f64) -> f64;

    /// Track time reached starting at `t0` after `real_seconds` of real
    /// time (negative to solve backwards)
    fn solve_warped_length(&self, t0: f64, real_seconds: f64) -> f64;
}

/// Piecewise-constant speed curve
///
/// Control points `(track_time, speed)` sorted by time; the speed at a
/// point governs until the next point, the first speed extends to -inf and
/// the last to +inf. Speeds are playback-rate multipliers, so a segment of
/// track length `d` at speed `s` takes `d / s` real seconds.
#[derive(Debug, Clone)]
pub struct StepWarp {
    points: Vec<(f64, f64)>,
}

impl StepWarp {
    /// Build from control points; they are sorted here. All speeds must be
    /// positive and finite.
    pub fn new(mut points: Vec<(f64, f64)>) -> Self {
        assert!(!points.is_empty(), "warp needs at least one control point");
        assert!(
            points.iter().all(|&(_, s)| s.is_finite() && s > 0.0),
            "warp speeds must be positive"
        );
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        Self { points }
    }

    /// Uniform speed over the whole timeline
    pub fn constant(speed: f64) -> Self {
        Self::new(vec![(0.0, speed)])
    }

    /// Speed governing the segment that starts at or before `t`
    fn speed_at(&self, t: f64) -> f64 {
        match self.points.iter().rev().find(|&&(pt, _)| pt <= t) {
            Some(&(_, s)) => s,
            None => self.points[0].1,
        }
    }

    /// First control point strictly after `t`, or +inf
    fn boundary_after(&self, t: f64) -> f64 {
        self.points
            .iter()
            .map(|&(pt, _)| pt)
            .find(|&pt| pt > t)
            .unwrap_or(f64::INFINITY)
    }

    /// Last control point strictly before `t`, or -inf
    fn boundary_before(&self, t: f64) -> f64 {
        self.points
            .iter()
            .rev()
            .map(|&(pt, _)| pt)
            .find(|&pt| pt < t)
            .unwrap_or(f64::NEG_INFINITY)
    }
}

impl TimeWarp for StepWarp {
    fn warped_length(&self, t0: f64, t1: f64) -> f64 {
        if t1 < t0 {
            return -self.warped_length(t1, t0);
        }
        let mut total = 0.0;
        let mut t = t0;
        while t < t1 {
            let seg_end = self.boundary_after(t).min(t1);
            total += (seg_end - t) / self.speed_at(t);
            t = seg_end;
        }
        total
    }

    fn solve_warped_length(&self, t0: f64, real_seconds: f64) -> f64 {
        if real_seconds >= 0.0 {
            let mut remaining = real_seconds;
            let mut t = t0;
            loop {
                let speed = self.speed_at(t);
                let seg_end = self.boundary_after(t);
                if seg_end.is_infinite() {
                    return t + remaining * speed;
                }
                let seg_real = (seg_end - t) / speed;
                if remaining <= seg_real {
                    return t + remaining * speed;
                }
                remaining -= seg_real;
                t = seg_end;
            }
        } else {
            let mut remaining = -real_seconds;
            let mut t = t0;
            loop {
                let seg_start = self.boundary_before(t);
                // The segment ending at t is governed by the speed at its
                // own start, not at t
                let speed = if seg_start.is_infinite() {
                    self.points[0].1
                } else {
                    self.speed_at(seg_start)
                };
                if seg_start.is_infinite() {
                    return t - remaining * speed;
                }
                let seg_real = (t - seg_start) / speed;
                if remaining <= seg_real {
                    return t - remaining * speed;
                }
                remaining -= seg_real;
                t = seg_start;
            }
        }
    }
}
