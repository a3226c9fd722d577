pub mod delivery;
pub mod group_queue;
pub mod runner;
pub mod state;

pub use delivery::{Engine, EngineConfig, TaskOutcome};
pub use group_queue::{GroupQueue, ProcessHandle, QueueStats};
pub use runner::{AgentRunner, ContainerRunner};
pub use state::RouterState;
