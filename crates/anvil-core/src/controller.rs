//! Adaptive feedback controller.
//!
//! The controller cycles `Bursting → Cooldown → Sampling → Bursting` over a single
//! active chunk of the region until the round budget is spent. After each
//! sample it applies [`adapt`] to the active chunk's [`ChunkState`], which may
//! slide the active chunk or change the pacing delay added to the cooldown.

use std::time::Duration;

use log::{debug, info};
use serde::Serialize;

use crate::analyzer::{ChunkState, RegionStateTable};

/// Phase of the adaptive loop.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
pub enum ControllerState {
    /// Hammer the targets of the active chunk
    Bursting,
    /// Idle so the disturbance can manifest before measuring
    Cooldown,
    /// Recompute region state and adapt
    Sampling,
    /// Round budget exhausted
    Done,
}

/// What [`adapt`] decided for one sampling point.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
pub enum Decision {
    /// Calm chunk: move to the next one and reset pacing
    Slide,
    /// Noisy chunk: increase the pacing delay
    BackOff,
    /// Low entropy with flips: decrease the pacing delay
    PushHarder,
    /// Leave everything unchanged
    Hold,
}

/// Thresholds and pacing limits of the adaptation rule.
#[derive(Clone, Copy, Debug, Serialize, PartialEq)]
pub struct ControllerParams {
    /// Entropy below which a chunk counts as calm
    pub entropy_low: f64,
    /// Entropy above which a chunk counts as noisy
    pub entropy_high: f64,
    /// Amount the pacing delay changes per decision
    pub pacing_step: Duration,
    /// Upper bound for the pacing part of one cooldown sleep
    pub max_pacing_delay: Duration,
    /// Base idle time between burst and sample
    pub cooldown: Duration,
}

/// Result of one application of the adaptation rule.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
pub struct Adaptation {
    /// Which branch of the rule fired
    pub decision: Decision,
    /// Active chunk after adaptation
    pub active_chunk: usize,
    /// Pacing delay after adaptation
    pub pacing_delay: Duration,
}

/// The adaptation rule.
///
/// With `E = state.entropy` and `F = state.flip_count`:
///
/// 1. `E < low` and `F == 0`: slide to `(active + 1) % total`, delay = 0.
/// 2. else `E > high`: delay += step (saturating, never capped).
/// 3. else `E < low`: delay -= step, floored at zero.
/// 4. otherwise: no change.
pub fn adapt(
    state: &ChunkState,
    active_chunk: usize,
    total_chunks: usize,
    pacing_delay: Duration,
    params: &ControllerParams,
) -> Adaptation {
    let (decision, active_chunk, pacing_delay) =
        if state.entropy < params.entropy_low && state.flip_count == 0 {
            (
                Decision::Slide,
                (active_chunk + 1) % total_chunks.max(1),
                Duration::ZERO,
            )
        } else if state.entropy > params.entropy_high {
            (
                Decision::BackOff,
                active_chunk,
                pacing_delay.saturating_add(params.pacing_step),
            )
        } else if state.entropy < params.entropy_low {
            (
                Decision::PushHarder,
                active_chunk,
                pacing_delay.saturating_sub(params.pacing_step),
            )
        } else {
            (Decision::Hold, active_chunk, pacing_delay)
        };
    Adaptation {
        decision,
        active_chunk,
        pacing_delay,
    }
}

/// State machine driving the adaptive loop.
///
/// The controller owns no memory and performs no hammering; the session calls
/// [`finish_burst`](Self::finish_burst), [`cool_down`](Self::cool_down) and
/// [`sampled`](Self::sampled) as it executes each phase.
#[derive(Debug)]
pub struct AdaptiveController {
    params: ControllerParams,
    state: ControllerState,
    active_chunk: usize,
    total_chunks: usize,
    pacing_delay: Duration,
    round: u64,
    round_budget: u64,
}

impl AdaptiveController {
    /// Starts in [`ControllerState::Bursting`] on chunk 0, or [`ControllerState::Done`]
    /// if `round_budget` is zero.
    pub fn new(params: ControllerParams, total_chunks: usize, round_budget: u64) -> Self {
        AdaptiveController {
            params,
            state: if round_budget == 0 {
                ControllerState::Done
            } else {
                ControllerState::Bursting
            },
            active_chunk: 0,
            total_chunks,
            pacing_delay: Duration::ZERO,
            round: 0,
            round_budget,
        }
    }

    /// Current phase.
    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Chunk whose targets are hammered next.
    pub fn active_chunk(&self) -> usize {
        self.active_chunk
    }

    /// Current pacing delay.
    pub fn pacing_delay(&self) -> Duration {
        self.pacing_delay
    }

    /// Completed sampling points.
    pub fn round(&self) -> u64 {
        self.round
    }

    /// Total idle time of the next cooldown.
    ///
    /// The pacing delay itself keeps growing while chunks stay noisy; only the
    /// part of it slept per round is bounded by `max_pacing_delay`.
    pub fn cooldown_duration(&self) -> Duration {
        self.params
            .cooldown
            .saturating_add(self.pacing_delay.min(self.params.max_pacing_delay))
    }

    /// `Bursting → Cooldown`.
    pub fn finish_burst(&mut self) {
        debug_assert_eq!(self.state, ControllerState::Bursting);
        self.state = ControllerState::Cooldown;
    }

    /// Sleeps for [`cooldown_duration`](Self::cooldown_duration), then `Cooldown → Sampling`.
    ///
    /// This is a blocking sleep; it always elapses in full.
    pub fn cool_down(&mut self) {
        debug_assert_eq!(self.state, ControllerState::Cooldown);
        let idle = self.cooldown_duration();
        if !idle.is_zero() {
            std::thread::sleep(idle);
        }
        self.state = ControllerState::Sampling;
    }

    /// Applies [`adapt`] to the active chunk of a freshly sampled `table`.
    ///
    /// Moves to [`ControllerState::Bursting`], or to [`ControllerState::Done`]
    /// once the round budget is spent.
    pub fn sampled(&mut self, table: &RegionStateTable) -> Adaptation {
        debug_assert_eq!(self.state, ControllerState::Sampling);
        let state = table
            .get(self.active_chunk)
            .copied()
            .unwrap_or_default();
        let adaptation = adapt(
            &state,
            self.active_chunk,
            self.total_chunks,
            self.pacing_delay,
            &self.params,
        );
        debug!(
            "round {}: chunk {} E={:.6} F={} -> {:?}",
            self.round, self.active_chunk, state.entropy, state.flip_count, adaptation
        );
        if adaptation.active_chunk != self.active_chunk {
            info!(
                "Sliding active chunk {} -> {}",
                self.active_chunk, adaptation.active_chunk
            );
        }
        self.active_chunk = adaptation.active_chunk;
        self.pacing_delay = adaptation.pacing_delay;
        self.round += 1;
        self.state = if self.round >= self.round_budget {
            ControllerState::Done
        } else {
            ControllerState::Bursting
        };
        adaptation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ControllerParams {
        ControllerParams {
            entropy_low: 0.001,
            entropy_high: 0.03,
            pacing_step: Duration::from_micros(100),
            max_pacing_delay: Duration::from_micros(250),
            cooldown: Duration::ZERO,
        }
    }

    fn chunk(entropy: f64, flip_count: usize) -> ChunkState {
        ChunkState {
            entropy,
            flip_count,
        }
    }

    #[test]
    fn test_calm_chunk_slides_and_resets() {
        let delay = Duration::from_micros(200);
        let a = adapt(&chunk(0.0005, 0), 2, 8, delay, &params());
        assert_eq!(a.decision, Decision::Slide);
        assert_eq!(a.active_chunk, 3);
        assert_eq!(a.pacing_delay, Duration::ZERO);
        let a = adapt(&chunk(0.0005, 0), 7, 8, delay, &params());
        assert_eq!(a.active_chunk, 0);
    }

    #[test]
    fn test_noisy_chunk_backs_off() {
        let a = adapt(&chunk(0.05, 3), 1, 8, Duration::ZERO, &params());
        assert_eq!(a.decision, Decision::BackOff);
        assert!(a.pacing_delay > Duration::ZERO);
        assert_eq!(a.active_chunk, 1);
        let next = adapt(&chunk(0.05, 0), 1, 8, Duration::from_micros(200), &params());
        assert_eq!(next.pacing_delay, Duration::from_micros(300));
    }

    #[test]
    fn test_back_off_grows_past_sleep_bound() {
        let p = params();
        let a = adapt(&chunk(0.05, 0), 0, 64, p.max_pacing_delay, &p);
        assert_eq!(a.decision, Decision::BackOff);
        assert!(a.pacing_delay > p.max_pacing_delay);
        let a = adapt(&chunk(0.05, 0), 0, 64, Duration::MAX, &p);
        assert_eq!(a.pacing_delay, Duration::MAX);
    }

    #[test]
    fn test_cooldown_sleep_is_bounded() -> anyhow::Result<()> {
        let p = params();
        let mut table = RegionStateTable::new(4096, 4096)?;
        let mut noisy = vec![0xAAu8; 4096];
        for (i, b) in noisy.iter_mut().enumerate().take(256) {
            *b = i as u8;
        }
        table.update(0, &noisy, 0xAA)?;
        let mut controller = AdaptiveController::new(p, 1, 10);
        let mut last = Duration::ZERO;
        for _ in 0..5 {
            controller.finish_burst();
            controller.cool_down();
            let a = controller.sampled(&table);
            assert_eq!(a.decision, Decision::BackOff);
            assert!(controller.pacing_delay() > last);
            last = controller.pacing_delay();
        }
        assert_eq!(controller.pacing_delay(), Duration::from_micros(500));
        assert_eq!(controller.cooldown_duration(), p.cooldown + p.max_pacing_delay);
        Ok(())
    }

    #[test]
    fn test_low_entropy_with_flips_pushes_harder() {
        let a = adapt(&chunk(0.0005, 1), 4, 8, Duration::from_micros(150), &params());
        assert_eq!(a.decision, Decision::PushHarder);
        assert_eq!(a.pacing_delay, Duration::from_micros(50));
        let floor = adapt(&chunk(0.0005, 1), 4, 8, Duration::from_micros(50), &params());
        assert_eq!(floor.pacing_delay, Duration::ZERO);
    }

    #[test]
    fn test_mid_entropy_holds() {
        let delay = Duration::from_micros(100);
        let a = adapt(&chunk(0.01, 2), 4, 8, delay, &params());
        assert_eq!(a.decision, Decision::Hold);
        assert_eq!((a.active_chunk, a.pacing_delay), (4, delay));
    }

    #[test]
    fn test_controller_cycle() -> anyhow::Result<()> {
        let mut table = RegionStateTable::new(4 * 4096, 4096)?;
        let calm = vec![0xAAu8; 4096];
        for i in 0..4 {
            table.update(i, &calm, 0xAA)?;
        }
        let mut controller = AdaptiveController::new(params(), 4, 2);
        assert_eq!(controller.state(), ControllerState::Bursting);
        controller.finish_burst();
        assert_eq!(controller.state(), ControllerState::Cooldown);
        controller.cool_down();
        assert_eq!(controller.state(), ControllerState::Sampling);
        let a = controller.sampled(&table);
        assert_eq!(a.decision, Decision::Slide);
        assert_eq!(controller.active_chunk(), 1);
        assert_eq!(controller.state(), ControllerState::Bursting);
        controller.finish_burst();
        controller.cool_down();
        controller.sampled(&table);
        assert_eq!(controller.round(), 2);
        assert_eq!(controller.state(), ControllerState::Done);
        Ok(())
    }

    #[test]
    fn test_zero_budget_is_done() {
        let controller = AdaptiveController::new(params(), 4, 0);
        assert_eq!(controller.state(), ControllerState::Done);
    }
}
