//! 12-step cycle clock and the fixed step table.
//!
//! The clock is a pure counter: it never touches reservoir state and cannot
//! fail. Whoever drives it decides when `advance` is allowed (the engine only
//! advances once the previous step's rendezvous has resolved).

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub const STEPS_PER_CYCLE: u8 = 12;
pub const TRIADIC_GROUPS: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum StepType {
    Pivotal,
    Affordance,
    Salience,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CognitiveMode {
    Expressive,
    Reflective,
}

/// Role of a concurrent stream. Also names the primary stream of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum StreamKind {
    Pivotal,
    Affordance,
    Salience,
}

impl StreamKind {
    pub fn default_phase_offset(self) -> u8 {
        match self {
            StreamKind::Pivotal => 0,
            StreamKind::Affordance => 4,
            StreamKind::Salience => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            StreamKind::Pivotal => "pivotal",
            StreamKind::Affordance => "affordance",
            StreamKind::Salience => "salience",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StepConfig {
    pub step: u8,
    pub step_type: StepType,
    pub mode: CognitiveMode,
    pub primary: StreamKind,
    pub triadic_group: u8,
}

const fn entry(step: u8, step_type: StepType, mode: CognitiveMode, primary: StreamKind) -> StepConfig {
    StepConfig {
        step,
        step_type,
        mode,
        primary,
        triadic_group: (step - 1) % TRIADIC_GROUPS,
    }
}

use CognitiveMode::{Expressive, Reflective};

pub static STEP_TABLE: [StepConfig; 12] = [
    entry(1, StepType::Pivotal, Expressive, StreamKind::Pivotal),
    entry(2, StepType::Affordance, Expressive, StreamKind::Affordance),
    entry(3, StepType::Affordance, Expressive, StreamKind::Salience),
    entry(4, StepType::Affordance, Expressive, StreamKind::Pivotal),
    entry(5, StepType::Affordance, Expressive, StreamKind::Pivotal),
    entry(6, StepType::Affordance, Reflective, StreamKind::Affordance),
    entry(7, StepType::Pivotal, Reflective, StreamKind::Salience),
    entry(8, StepType::Salience, Expressive, StreamKind::Pivotal),
    entry(9, StepType::Salience, Expressive, StreamKind::Pivotal),
    entry(10, StepType::Salience, Reflective, StreamKind::Affordance),
    entry(11, StepType::Salience, Reflective, StreamKind::Salience),
    entry(12, StepType::Salience, Reflective, StreamKind::Pivotal),
];

/// Table entry for `step` (1-based). Out-of-range steps wrap onto the cycle.
pub fn step_config(step: u8) -> &'static StepConfig {
    &STEP_TABLE[(step.max(1) as usize - 1) % STEPS_PER_CYCLE as usize]
}

pub fn triadic_group(step: u8) -> u8 {
    (step.max(1) - 1) % TRIADIC_GROUPS
}

/// Phase of a stream with `offset` when the shared clock is at `step`.
pub fn phase_for(step: u8, offset: u8) -> u8 {
    let step = step.max(1) as u16;
    (((step - 1 + offset as u16) % STEPS_PER_CYCLE as u16) + 1) as u8
}

/// Micro-ticks per step needed to co-run a clock of `period` steps per cycle.
pub fn subdivision_for(period: u32) -> u32 {
    let base = STEPS_PER_CYCLE as u32;
    lcm(base, period.max(1)) / base
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

fn lcm(a: u32, b: u32) -> u32 {
    a / gcd(a, b) * b
}

/// Which steps gate a triadic rendezvous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SyncPolicy {
    /// Steps 1, 5 and 9: `(step - 1) % 4 == 0`.
    #[default]
    GroupStart,
    /// Steps 9..=12: the last visit of each triadic group in a cycle.
    TriadClosure,
}

impl SyncPolicy {
    pub fn is_sync_point(self, step: u8) -> bool {
        match self {
            SyncPolicy::GroupStart => (step.max(1) - 1) % TRIADIC_GROUPS == 0,
            SyncPolicy::TriadClosure => step > STEPS_PER_CYCLE - TRIADIC_GROUPS,
        }
    }

    pub fn triad_index(self, step: u8) -> Option<u8> {
        if !self.is_sync_point(step) {
            return None;
        }
        Some(match self {
            SyncPolicy::GroupStart => (step - 1) / TRIADIC_GROUPS,
            SyncPolicy::TriadClosure => triadic_group(step),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StepChange {
    pub old: u8,
    pub new: u8,
    pub cycle: u64,
    /// True when this change closed a cycle (12 -> 1).
    pub wrapped: bool,
}

#[derive(Debug, Clone)]
pub struct CycleClock {
    step: u8,
    cycle: u64,
    micro: u32,
    subdivision: u32,
    cycle_duration: Duration,
    policy: SyncPolicy,
    advances: u64,
}

impl CycleClock {
    pub fn new(cycle_duration: Duration) -> Self {
        Self {
            step: 1,
            cycle: 0,
            micro: 0,
            subdivision: 1,
            cycle_duration,
            policy: SyncPolicy::default(),
            advances: 0,
        }
    }

    pub fn with_policy(mut self, policy: SyncPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_subdivision(mut self, subdivision: u32) -> Self {
        self.subdivision = subdivision.max(1);
        self
    }

    pub fn step(&self) -> u8 {
        self.step
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycle
    }

    pub fn advances(&self) -> u64 {
        self.advances
    }

    pub fn policy(&self) -> SyncPolicy {
        self.policy
    }

    pub fn subdivision(&self) -> u32 {
        self.subdivision
    }

    pub fn config(&self) -> &'static StepConfig {
        step_config(self.step)
    }

    pub fn step_type(&self) -> StepType {
        self.config().step_type
    }

    pub fn mode(&self) -> CognitiveMode {
        self.config().mode
    }

    pub fn is_sync_point(&self) -> bool {
        self.policy.is_sync_point(self.step)
    }

    pub fn triad_index(&self) -> Option<u8> {
        self.policy.triad_index(self.step)
    }

    pub fn step_interval(&self) -> Duration {
        self.cycle_duration / STEPS_PER_CYCLE as u32
    }

    pub fn advance(&mut self) -> StepChange {
        let old = self.step;
        let wrapped = old == STEPS_PER_CYCLE;
        self.step = if wrapped { 1 } else { old + 1 };
        if wrapped {
            self.cycle += 1;
        }
        self.micro = 0;
        self.advances += 1;
        StepChange {
            old,
            new: self.step,
            cycle: self.cycle,
            wrapped,
        }
    }

    /// Advance the micro-clock by one tick. Returns the step change when the
    /// tick crosses a step boundary.
    pub fn tick_micro(&mut self) -> Option<StepChange> {
        self.micro += 1;
        if self.micro >= self.subdivision {
            Some(self.advance())
        } else {
            None
        }
    }

    /// Zero-based micro-tick position within the current cycle.
    pub fn micro_position(&self) -> u32 {
        (self.step as u32 - 1) * self.subdivision + self.micro
    }

    pub fn micro_cycle_len(&self) -> u32 {
        STEPS_PER_CYCLE as u32 * self.subdivision
    }

    /// 1-based position on a co-clock with `period` steps per cycle, if that
    /// clock lines up with the micro-ticks.
    pub fn aligned_position(&self, period: u32) -> Option<u32> {
        let len = self.micro_cycle_len();
        if period == 0 || len % period != 0 {
            return None;
        }
        Some(self.micro_position() / (len / period) + 1)
    }

    pub fn jump_to(&mut self, step: u8) -> Option<StepChange> {
        if !(1..=STEPS_PER_CYCLE).contains(&step) {
            return None;
        }
        let old = self.step;
        self.step = step;
        self.micro = 0;
        Some(StepChange {
            old,
            new: step,
            cycle: self.cycle,
            wrapped: false,
        })
    }

    pub fn reset(&mut self) {
        self.step = 1;
        self.cycle = 0;
        self.micro = 0;
        self.advances = 0;
    }
}
