pub mod bus;
pub mod engine;
pub mod expr;
pub mod limiter;
pub mod pool;
pub mod provider;
pub mod routing;

pub use bus::{EventBus, Subscription};
pub use engine::gate::{ControlGate, Stopped};
pub use engine::prompt::PromptStore;
pub use engine::resolve::{plan, Plan, PlanError};
pub use engine::session::{SessionHandle, SessionRegistry};
pub use engine::{Engine, EngineOptions, Invocation, WorkflowProvider};
pub use expr::{evaluate, evaluate_truthy, is_truthy, ExprError};
pub use limiter::{
    AdmissionDecision, Dimension, DimensionLimits, RateLimitConfig, RateLimiter, RateRequest,
};
pub use pool::{PoolConfig, PoolEvent, PoolStatus, WorkItem, WorkerPool, WorkerStats};
pub use provider::{
    CommandProvider, ExecutionContext, HumanInputProvider, LogProvider, MemoryProvider,
    NoopProvider, Provider, ProviderRegistry, RunMemory,
};
pub use routing::{PreconditionCheck, RoutingContext};
