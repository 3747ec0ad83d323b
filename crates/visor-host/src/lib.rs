pub mod bridge;
pub mod frontend;
pub mod trigger;
pub mod webhook;

pub use bridge::{EngineExecutor, WebhookOutputAdapter};
pub use frontend::{Frontend, FrontendContext, FrontendHost};
pub use trigger::{TriggerDecision, TriggerJob, TriggerService};
pub use webhook::{webhook_router, WebhookConfig};
