//! Triadic rendezvous.
//!
//! A [`Rendezvous`] is a one-shot latch opened per step: each stream task
//! arrives after its update and the driver waits for everyone, bounded by the
//! barrier timeout. Whatever arrived is then coupled (activation lerp toward
//! the mean, state blend toward the mean state) and scored.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::{step_config, StepType};
use crate::coherence::{CoherenceComputer, CoherenceMatrix};
use crate::config::{EngineConfig, StepCoupling};
use crate::stream::{StreamId, StreamSlot, StreamState};

#[derive(Debug, Clone, PartialEq)]
pub struct RendezvousOutcome {
    pub arrived: Vec<StreamId>,
    pub missing: Vec<StreamId>,
    pub waited: Duration,
    pub timed_out: bool,
}

impl RendezvousOutcome {
    pub fn is_partial(&self) -> bool {
        !self.missing.is_empty()
    }
}

pub struct Rendezvous {
    participants: Vec<StreamId>,
    arrived: Mutex<Vec<bool>>,
    cv: Condvar,
}

impl Rendezvous {
    pub fn new(participants: Vec<StreamId>) -> Self {
        let n = participants.len();
        Self {
            participants,
            arrived: Mutex::new(vec![false; n]),
            cv: Condvar::new(),
        }
    }

    pub fn participants(&self) -> &[StreamId] {
        &self.participants
    }

    /// Record an arrival. Returns true if this one completed the set.
    pub fn arrive(&self, stream: StreamId) -> bool {
        let Some(pos) = self.participants.iter().position(|&p| p == stream) else {
            return false;
        };
        let mut arrived = self.arrived.lock();
        arrived[pos] = true;
        let complete = arrived.iter().all(|&a| a);
        drop(arrived);
        self.cv.notify_all();
        complete
    }

    /// Block until every participant arrived or `timeout` passes.
    pub fn wait(&self, timeout: Duration) -> RendezvousOutcome {
        let start = Instant::now();
        let deadline = start.checked_add(timeout);
        let mut arrived = self.arrived.lock();
        let mut timed_out = false;
        while !arrived.iter().all(|&a| a) {
            match deadline {
                Some(deadline) => {
                    if self.cv.wait_until(&mut arrived, deadline).timed_out() {
                        timed_out = !arrived.iter().all(|&a| a);
                        break;
                    }
                }
                None => self.cv.wait(&mut arrived),
            }
        }

        let (mut present, mut missing) = (Vec::new(), Vec::new());
        for (&id, &a) in self.participants.iter().zip(arrived.iter()) {
            if a {
                present.push(id);
            } else {
                missing.push(id);
            }
        }
        RendezvousOutcome {
            arrived: present,
            missing,
            waited: start.elapsed(),
            timed_out,
        }
    }
}

/// Result of one rendezvous. Lives for a single step.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SyncBarrier {
    pub triad_index: u8,
    pub step: u8,
    pub participants: Vec<StreamId>,
    pub expected: usize,
    /// Aggregate coherence of the participants.
    pub coherence: f64,
    /// Coherence scaled by the arrived fraction.
    pub sync_quality: f64,
    pub partial: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BarrierStats {
    pub rendezvous: u64,
    pub partial: u64,
    pub timeouts: u64,
    pub total_wait_us: u64,
    pub last_quality: f64,
}

pub struct SyncBarrierCoordinator {
    coupling_strength: f64,
    step_coupling: Option<StepCoupling>,
    state_coupling: f64,
    timeout: Duration,
    computer: CoherenceComputer,
    stats: BarrierStats,
}

impl SyncBarrierCoordinator {
    pub fn new(coupling_strength: f64, state_coupling: f64, timeout: Duration) -> Self {
        Self {
            coupling_strength: coupling_strength.clamp(0.0, 1.0),
            step_coupling: None,
            state_coupling: state_coupling.clamp(0.0, 1.0),
            timeout,
            computer: CoherenceComputer,
            stats: BarrierStats {
                last_quality: 1.0,
                ..BarrierStats::default()
            },
        }
    }

    pub fn from_config(cfg: &EngineConfig) -> Self {
        let coordinator = Self::new(cfg.coupling_strength, cfg.state_coupling, cfg.barrier_timeout());
        match cfg.step_coupling {
            Some(coupling) => coordinator.with_step_coupling(coupling),
            None => coordinator,
        }
    }

    pub fn with_step_coupling(mut self, coupling: StepCoupling) -> Self {
        self.step_coupling = Some(coupling);
        self
    }

    pub fn coupling_for(&self, step_type: StepType) -> f64 {
        self.step_coupling
            .map_or(self.coupling_strength, |c| c.strength(step_type))
            .clamp(0.0, 1.0)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn stats(&self) -> BarrierStats {
        self.stats
    }

    pub fn open(&self, participants: Vec<StreamId>) -> Arc<Rendezvous> {
        Arc::new(Rendezvous::new(participants))
    }

    pub fn await_rendezvous(&mut self, latch: &Rendezvous) -> RendezvousOutcome {
        self.await_within(latch, self.timeout)
    }

    /// Like [`Self::await_rendezvous`] with a caller-chosen bound.
    pub fn await_within(&mut self, latch: &Rendezvous, timeout: Duration) -> RendezvousOutcome {
        let outcome = latch.wait(timeout);
        self.stats.total_wait_us += outcome.waited.as_micros() as u64;
        if outcome.timed_out {
            self.stats.timeouts += 1;
            warn!(
                missing = ?outcome.missing,
                waited_ms = outcome.waited.as_millis() as u64,
                "rendezvous timed out, continuing with partial sync"
            );
        }
        outcome
    }

    /// Pull the streams toward each other on a `step_type` step. Returns the
    /// mean activation.
    pub fn couple(&self, streams: &mut [&mut StreamState], step_type: StepType) -> f64 {
        if streams.is_empty() {
            return 0.0;
        }
        let strength = self.coupling_for(step_type);
        let mean = streams.iter().map(|s| s.activation_level).sum::<f64>() / streams.len() as f64;
        for s in streams.iter_mut() {
            s.couple_activation(mean, strength);
        }

        if self.state_coupling > 0.0 && streams.len() > 1 {
            let n = streams.iter().map(|s| s.state().len()).min().unwrap_or(0);
            let mut centroid = vec![0.0; n];
            for s in streams.iter() {
                for (c, x) in centroid.iter_mut().zip(s.state()) {
                    *c += x;
                }
            }
            let k = streams.len() as f64;
            centroid.iter_mut().for_each(|c| *c /= k);
            for s in streams.iter_mut() {
                s.couple_state(&centroid, self.state_coupling);
            }
        }
        mean
    }

    /// Couple the arrived streams in place and return their post-coupling states.
    pub fn couple_slots(&self, slots: &[StreamSlot], arrived: &[StreamId], step_type: StepType) -> Vec<Arc<[f64]>> {
        let mut guards: Vec<_> = arrived
            .iter()
            .filter_map(|&id| slots.get(id))
            .map(|slot| slot.lock())
            .collect();
        let mut refs: Vec<&mut StreamState> = guards.iter_mut().map(|g| &mut **g).collect();
        self.couple(&mut refs, step_type);
        refs.iter().map(|s| Arc::from(s.state())).collect()
    }

    pub fn apply_coherence(&self, slots: &[StreamSlot], arrived: &[StreamId], matrix: &CoherenceMatrix) {
        for (i, &id) in arrived.iter().enumerate() {
            if let Some(slot) = slots.get(id) {
                slot.lock().coherence = matrix.member_coherence(i);
            }
        }
    }

    pub fn conclude(
        &mut self,
        triad_index: u8,
        step: u8,
        outcome: &RendezvousOutcome,
        matrix: &CoherenceMatrix,
    ) -> SyncBarrier {
        let expected = outcome.arrived.len() + outcome.missing.len();
        let coherence = matrix.aggregate();
        let fraction = if expected == 0 {
            1.0
        } else {
            outcome.arrived.len() as f64 / expected as f64
        };
        let sync_quality = (coherence * fraction).clamp(0.0, 1.0);
        let partial = outcome.is_partial();

        self.stats.rendezvous += 1;
        if partial {
            self.stats.partial += 1;
        }
        self.stats.last_quality = sync_quality;
        debug!(triad_index, step, sync_quality, partial, "triadic sync");

        SyncBarrier {
            triad_index,
            step,
            participants: outcome.arrived.clone(),
            expected,
            coherence,
            sync_quality,
            partial,
        }
    }

    /// Whole protocol inline on the calling thread: wait, couple, score.
    pub fn synchronize(
        &mut self,
        triad_index: u8,
        step: u8,
        latch: &Rendezvous,
        slots: &[StreamSlot],
    ) -> SyncBarrier {
        let outcome = self.await_rendezvous(latch);
        let states = self.couple_slots(slots, &outcome.arrived, step_config(step).step_type);
        let matrix = self.computer.matrix(&states);
        self.apply_coherence(slots, &outcome.arrived, &matrix);
        self.conclude(triad_index, step, &outcome, &matrix)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::config::default_streams;

    fn slots() -> Vec<StreamSlot> {
        default_streams()
            .iter()
            .enumerate()
            .map(|(i, cfg)| StreamSlot::new(StreamState::new(i, cfg).unwrap()))
            .collect()
    }

    #[test]
    fn waits_for_all_three() {
        let latch = Arc::new(Rendezvous::new(vec![0, 1, 2]));
        let delays = [5u64, 25, 12];
        let handles: Vec<_> = delays
            .iter()
            .enumerate()
            .map(|(id, &ms)| {
                let latch = Arc::clone(&latch);
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(ms));
                    latch.arrive(id);
                })
            })
            .collect();

        let outcome = latch.wait(Duration::from_secs(5));
        assert!(!outcome.timed_out);
        assert_eq!(outcome.arrived, vec![0, 1, 2]);
        assert!(outcome.waited >= Duration::from_millis(20));
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn times_out_with_partial_set() {
        let latch = Rendezvous::new(vec![0, 1, 2]);
        latch.arrive(0);
        latch.arrive(1);
        latch.arrive(7);
        let timeout = Duration::from_millis(30);
        let outcome = latch.wait(timeout);
        assert!(outcome.timed_out);
        assert!(outcome.waited >= timeout);
        assert_eq!(outcome.missing, vec![2]);
        assert!(outcome.is_partial());
    }

    #[test]
    fn coupling_pulls_toward_mean() {
        let slots = slots();
        let levels = [0.1, 0.4, 0.7];
        for (slot, &level) in slots.iter().zip(&levels) {
            slot.lock().activation_level = level;
        }
        let coordinator = SyncBarrierCoordinator::new(0.5, 0.0, Duration::from_millis(10));
        coordinator.couple_slots(&slots, &[0, 1, 2], StepType::Affordance);
        let after: Vec<f64> = slots.iter().map(|s| s.lock().activation_level).collect();
        let expected = [0.25, 0.4, 0.55];
        for (a, e) in after.iter().zip(expected) {
            assert!((a - e).abs() < 1e-12, "{after:?}");
        }
    }

    #[test]
    fn step_type_sets_coupling_strength() {
        let coordinator =
            SyncBarrierCoordinator::new(0.1, 0.0, Duration::from_millis(10)).with_step_coupling(StepCoupling::default());
        for (step_type, expected) in [(StepType::Pivotal, 0.25), (StepType::Salience, 0.22), (StepType::Affordance, 0.19)] {
            let slots = slots();
            for (slot, level) in slots.iter().zip([0.1, 0.4, 0.7]) {
                slot.lock().activation_level = level;
            }
            coordinator.couple_slots(&slots, &[0, 1, 2], step_type);
            let first = slots[0].lock().activation_level;
            assert!((first - expected).abs() < 1e-12, "{step_type:?}: {first}");
        }
        assert_eq!(SyncBarrierCoordinator::new(0.1, 0.0, Duration::ZERO).coupling_for(StepType::Pivotal), 0.1);
    }

    #[test]
    fn state_coupling_raises_coherence() {
        let slots = slots();
        let computer = CoherenceComputer;
        let before: Vec<Arc<[f64]>> = slots.iter().map(|s| Arc::from(s.lock().state())).collect();
        let coordinator = SyncBarrierCoordinator::new(0.3, 0.5, Duration::from_millis(10));
        let after = coordinator.couple_slots(&slots, &[0, 1, 2], StepType::Salience);
        assert!(computer.aggregate(&after) > computer.aggregate(&before));
        for s in &after {
            assert!(s.iter().all(|x| (-1.0..=1.0).contains(x)));
        }
    }

    #[test]
    fn quality_scales_with_arrivals() {
        let slots = slots();
        let mut coordinator = SyncBarrierCoordinator::new(0.3, 0.1, Duration::from_millis(20));

        let latch = coordinator.open(vec![0, 1, 2]);
        for id in 0..3 {
            latch.arrive(id);
        }
        let full = coordinator.synchronize(1, 5, &latch, &slots);
        assert!(!full.partial);
        assert_eq!(full.participants, vec![0, 1, 2]);
        assert!((full.sync_quality - full.coherence).abs() < 1e-12);

        let latch = coordinator.open(vec![0, 1, 2]);
        latch.arrive(0);
        latch.arrive(2);
        let partial = coordinator.synchronize(2, 9, &latch, &slots);
        assert!(partial.partial);
        assert!((partial.sync_quality - partial.coherence * 2.0 / 3.0).abs() < 1e-12);

        let stats = coordinator.stats();
        assert_eq!((stats.rendezvous, stats.partial, stats.timeouts), (2, 1, 1));
        assert_eq!(stats.last_quality, partial.sync_quality);
        let c = slots[1].lock().coherence;
        assert!((0.0..=1.0).contains(&c));
    }
}
