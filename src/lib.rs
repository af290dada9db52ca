#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/error.rs"]
pub mod error;

#[path = "core/config.rs"]
pub mod config;

#[path = "core/clock.rs"]
pub mod clock;

#[path = "core/reservoir.rs"]
pub mod reservoir;

#[path = "core/stream.rs"]
pub mod stream;

#[path = "core/coherence.rs"]
pub mod coherence;

#[path = "core/events.rs"]
pub mod events;

#[path = "core/profiler.rs"]
pub mod profiler;

#[path = "core/executor.rs"]
pub mod executor;

#[path = "core/barrier.rs"]
pub mod barrier;

#[path = "core/engine.rs"]
pub mod engine;

pub mod observer;

pub mod prelude {
    pub use crate::barrier::{SyncBarrier, SyncBarrierCoordinator};
    pub use crate::clock::{CognitiveMode, CycleClock, StepConfig, StepType, StreamKind, SyncPolicy};
    pub use crate::coherence::{pairwise_coherence, CoherenceComputer, CoherenceMatrix};
    pub use crate::config::{EngineConfig, StepCoupling, StreamConfig};
    pub use crate::engine::{CognitiveEngine, EngineBuilder, EngineMetrics, StepReport};
    pub use crate::error::{CapacityError, ConfigError, EchoError, TaskError, TimeoutError};
    pub use crate::events::{EngineEvent, Subscription};
    pub use crate::executor::{
        BarrierType, ExecutorConfig, TaskDescriptor, TaskDomain, TaskGraphExecutor, TaskHandle,
        TaskPriority, TaskStatus,
    };
    pub use crate::reservoir::{Activation, ReservoirConfig, ReservoirUnit};
    pub use crate::stream::{StreamId, StreamState, StreamSummary};
}
