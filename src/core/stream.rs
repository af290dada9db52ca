//! Concurrent cognitive streams.
//!
//! Each stream owns exactly one reservoir. The executor reaches a stream only
//! through its [`StreamSlot`]; a task leases the slot for the duration of the
//! update and a second concurrent lease fails instead of blocking.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::clock::{phase_for, StreamKind};
use crate::config::StreamConfig;
use crate::error::{ConfigError, TaskError};
use crate::reservoir::ReservoirUnit;

pub type StreamId = usize;

const ATTENTION_DECAY: f64 = 0.9;

#[derive(Debug, Clone)]
pub struct StreamState {
    pub id: StreamId,
    pub kind: StreamKind,
    pub name: String,
    pub phase_offset: u8,
    reservoir: ReservoirUnit,

    /// Mean |state| after the last update, possibly blended at a rendezvous.
    pub activation_level: f64,
    /// Mean pairwise coherence with the other participants at the last rendezvous.
    pub coherence: f64,
    pub attention: f64,
    pub relevance: f64,

    /// Input held until replaced by the next `process_input`.
    drive: Vec<f64>,
}

impl StreamState {
    pub fn new(id: StreamId, cfg: &StreamConfig) -> Result<Self, ConfigError> {
        let reservoir = ReservoirUnit::new(cfg.reservoir.clone())?;
        let activation_level = reservoir.activation_level();
        Ok(Self {
            id,
            kind: cfg.kind,
            name: cfg.name.clone(),
            phase_offset: cfg.phase_offset,
            reservoir,
            activation_level,
            coherence: 1.0,
            attention: if cfg.kind == StreamKind::Pivotal { 1.0 } else { 0.0 },
            relevance: 0.0,
            drive: Vec::new(),
        })
    }

    /// Derived from the shared step every time; never stored.
    pub fn current_phase(&self, step: u8) -> u8 {
        phase_for(step, self.phase_offset)
    }

    pub fn reservoir(&self) -> &ReservoirUnit {
        &self.reservoir
    }

    pub fn state(&self) -> &[f64] {
        self.reservoir.state()
    }

    pub fn drive(&self) -> &[f64] {
        &self.drive
    }

    pub fn set_drive(&mut self, input: Vec<f64>) {
        self.drive = input;
    }

    /// Run one reservoir update with the held drive. Returns the new activation level.
    pub fn step(&mut self) -> f64 {
        self.reservoir.update(&self.drive);
        self.activation_level = self.reservoir.activation_level();
        self.activation_level
    }

    pub fn focus(&mut self, primary: bool) {
        if primary {
            self.attention = 1.0;
        } else {
            self.attention *= ATTENTION_DECAY;
        }
    }

    pub fn couple_activation(&mut self, mean: f64, strength: f64) {
        let t = strength.clamp(0.0, 1.0);
        self.activation_level = (self.activation_level + t * (mean - self.activation_level)).clamp(0.0, 1.0);
    }

    /// Blend state toward `target`, keeping the coupled activation level.
    pub fn couple_state(&mut self, target: &[f64], amount: f64) {
        self.reservoir.blend_toward(target, amount);
    }

    pub fn reset(&mut self) {
        self.reservoir.reset();
        self.activation_level = self.reservoir.activation_level();
        self.coherence = 1.0;
        self.relevance = 0.0;
        self.attention = if self.kind == StreamKind::Pivotal { 1.0 } else { 0.0 };
        self.drive.clear();
    }

    pub fn summary(&self, step: u8) -> StreamSummary {
        StreamSummary {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
            phase_offset: self.phase_offset,
            current_phase: self.current_phase(step),
            activation_level: self.activation_level,
            coherence: self.coherence,
            attention: self.attention,
            relevance: self.relevance,
            updates: self.reservoir.updates(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StreamSummary {
    pub id: StreamId,
    pub name: String,
    pub kind: StreamKind,
    pub phase_offset: u8,
    pub current_phase: u8,
    pub activation_level: f64,
    pub coherence: f64,
    pub attention: f64,
    pub relevance: f64,
    pub updates: u64,
}

pub type StreamLease<'a> = MutexGuard<'a, StreamState>;

/// Shared handle to one stream. Cheap to clone into task closures.
#[derive(Debug, Clone)]
pub struct StreamSlot {
    id: StreamId,
    inner: Arc<Mutex<StreamState>>,
}

impl StreamSlot {
    pub fn new(state: StreamState) -> Self {
        Self {
            id: state.id,
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Exclusive access for a task. Fails if another task holds the stream.
    pub fn lease(&self) -> Result<StreamLease<'_>, TaskError> {
        self.inner
            .try_lock()
            .ok_or(TaskError::StreamBusy { stream: self.id })
    }

    /// Driver-side access once the stream's tasks have settled.
    pub fn lock(&self) -> StreamLease<'_> {
        self.inner.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_streams;

    fn triad() -> Vec<StreamState> {
        default_streams()
            .iter()
            .enumerate()
            .map(|(i, cfg)| StreamState::new(i, cfg).unwrap())
            .collect()
    }

    #[test]
    fn phases_follow_offsets() {
        let streams = triad();
        assert_eq!(streams[0].current_phase(1), 1);
        assert_eq!(streams[1].current_phase(1), 5);
        assert_eq!(streams[2].current_phase(1), 9);
        assert_eq!(streams[2].current_phase(5), 1);
    }

    #[test]
    fn step_uses_held_drive() {
        let mut streams = triad();
        let s = &mut streams[0];
        s.set_drive(vec![0.8, -0.4]);
        let before = s.state().to_vec();
        let level = s.step();
        assert_ne!(before, s.state());
        assert!((0.0..=1.0).contains(&level));
        assert_eq!(s.drive(), &[0.8, -0.4]);
    }

    #[test]
    fn attention_decays_off_primary() {
        let mut s = triad().remove(1);
        s.focus(true);
        s.focus(false);
        s.focus(false);
        assert!((s.attention - 0.81).abs() < 1e-12);
    }

    #[test]
    fn activation_coupling_is_a_lerp() {
        let mut s = triad().remove(0);
        s.activation_level = 0.2;
        s.couple_activation(0.6, 0.5);
        assert!((s.activation_level - 0.4).abs() < 1e-12);
        s.couple_activation(0.6, 0.0);
        assert!((s.activation_level - 0.4).abs() < 1e-12);
    }

    #[test]
    fn second_lease_reports_busy() {
        let slot = StreamSlot::new(triad().remove(2));
        let held = slot.lease().unwrap();
        assert_eq!(slot.lease().unwrap_err(), TaskError::StreamBusy { stream: 2 });
        drop(held);
        assert!(slot.lease().is_ok());
    }
}
