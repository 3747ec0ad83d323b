//! The provider capability: one implementation per step `type`. The engine
//! calls `execute` with a typed context and never inspects provider
//! internals. Heavyweight providers (AI, GitHub, MCP, script, HTTP) are
//! external collaborators registered by the embedding process; the
//! built-ins here cover the engine's own needs and the lightweight types.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::io::AsyncReadExt;
use tracing::info;
use uuid::Uuid;

use visor_types::{
    DependencyOutputs, EventKind, InvocationInput, ProviderOutput, StepConfig, StepType,
};

use crate::bus::EventBus;
use crate::engine::prompt::PromptStore;
use crate::engine::session::SessionHandle;

/// Run-scoped key/value store backing the `memory` provider and the
/// `memory` expression binding. Dropped with the invocation.
#[derive(Clone, Default)]
pub struct RunMemory {
    values: Arc<Mutex<Map<String, Value>>>,
}

impl RunMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Value {
        self.values.lock().get(key).cloned().unwrap_or(Value::Null)
    }

    pub fn set(&self, key: &str, value: Value) {
        self.values.lock().insert(key.to_string(), value);
    }

    pub fn snapshot(&self) -> Map<String, Value> {
        self.values.lock().clone()
    }
}

/// Everything a provider sees for one step execution.
pub struct ExecutionContext<'a> {
    pub input: &'a InvocationInput,
    pub step: &'a StepConfig,
    /// Direct dependency outputs; inside a fan-out scope the fanned-out
    /// dependency maps to the bound item.
    pub deps: &'a DependencyOutputs,
    /// Bound iteration variable, present inside fan-out scopes.
    pub item: Option<&'a Value>,
    /// Conversation session for `ai`-type steps with session reuse.
    pub session: Option<SessionHandle>,
    pub memory: RunMemory,
    /// Nested workflow depth of the enclosing invocation.
    pub depth: u32,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> StepType;
    async fn execute(&self, ctx: ExecutionContext<'_>) -> anyhow::Result<ProviderOutput>;
}

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: Arc<Mutex<HashMap<StepType, Arc<dyn Provider>>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in lightweight providers installed.
    pub fn with_builtins(bus: EventBus, prompts: PromptStore) -> Self {
        let registry = Self::new();
        registry.register(Arc::new(NoopProvider));
        registry.register(Arc::new(LogProvider));
        registry.register(Arc::new(MemoryProvider));
        registry.register(Arc::new(CommandProvider));
        registry.register(Arc::new(HumanInputProvider { bus, prompts }));
        registry
    }

    pub fn register(&self, provider: Arc<dyn Provider>) {
        self.providers.lock().insert(provider.kind(), provider);
    }

    pub fn resolve(&self, kind: StepType) -> Option<Arc<dyn Provider>> {
        self.providers.lock().get(&kind).cloned()
    }
}

// ---------------------------------------------------------------------------
// Built-ins
// ---------------------------------------------------------------------------

/// Passes its configured `content` through as output.
pub struct NoopProvider;

#[async_trait]
impl Provider for NoopProvider {
    fn kind(&self) -> StepType {
        StepType::Noop
    }

    async fn execute(&self, ctx: ExecutionContext<'_>) -> anyhow::Result<ProviderOutput> {
        Ok(ProviderOutput::with_output(
            ctx.step.content.clone().unwrap_or(Value::Null),
        ))
    }
}

/// Logs its message through `tracing` and echoes it as content.
pub struct LogProvider;

#[async_trait]
impl Provider for LogProvider {
    fn kind(&self) -> StepType {
        StepType::Log
    }

    async fn execute(&self, ctx: ExecutionContext<'_>) -> anyhow::Result<ProviderOutput> {
        let message = ctx
            .step
            .prompt
            .clone()
            .or_else(|| ctx.step.content.as_ref().map(value_to_text))
            .unwrap_or_default();
        info!(step = %ctx.step.name, run_id = %ctx.input.run_id, "{message}");
        Ok(ProviderOutput {
            content: Some(message),
            ..ProviderOutput::default()
        })
    }
}

/// Run-scoped memory. `content` selects the operation:
/// `{op: set, key, value}` or `{op: get, key}`.
pub struct MemoryProvider;

#[async_trait]
impl Provider for MemoryProvider {
    fn kind(&self) -> StepType {
        StepType::Memory
    }

    async fn execute(&self, ctx: ExecutionContext<'_>) -> anyhow::Result<ProviderOutput> {
        let content = ctx.step.content.clone().unwrap_or_else(|| json!({}));
        let op = content["op"].as_str().unwrap_or("get");
        let key = content["key"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("memory step '{}' needs a key", ctx.step.name))?;
        match op {
            "set" => {
                let value = content.get("value").cloned().unwrap_or(Value::Null);
                ctx.memory.set(key, value.clone());
                Ok(ProviderOutput::with_output(value))
            }
            "get" => Ok(ProviderOutput::with_output(ctx.memory.get(key))),
            other => Err(anyhow::anyhow!(
                "memory step '{}': unknown op '{other}'",
                ctx.step.name
            )),
        }
    }
}

/// Executes `exec` through the shell, parsing stdout as JSON when possible.
pub struct CommandProvider;

#[async_trait]
impl Provider for CommandProvider {
    fn kind(&self) -> StepType {
        StepType::Command
    }

    async fn execute(&self, ctx: ExecutionContext<'_>) -> anyhow::Result<ProviderOutput> {
        let exec = ctx
            .step
            .exec
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("command step '{}' has no exec", ctx.step.name))?;

        let mut command = tokio::process::Command::new("sh");
        command
            .arg("-c")
            .arg(exec)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &ctx.input.env {
            command.env(key, value);
        }

        let mut child = command.spawn()?;
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        // Drain both pipes concurrently so neither can back up and stall
        // the child.
        let (stdout, stderr) = tokio::join!(
            async {
                let mut buffer = String::new();
                if let Some(pipe) = stdout_pipe.as_mut() {
                    pipe.read_to_string(&mut buffer).await?;
                }
                Ok::<_, std::io::Error>(buffer)
            },
            async {
                let mut buffer = String::new();
                if let Some(pipe) = stderr_pipe.as_mut() {
                    pipe.read_to_string(&mut buffer).await?;
                }
                Ok::<_, std::io::Error>(buffer)
            }
        );
        let (stdout, stderr) = (stdout?, stderr?);
        let status = child.wait().await?;
        if !status.success() {
            anyhow::bail!(
                "command exited with {}: {}",
                status.code().unwrap_or(-1),
                stderr.trim()
            );
        }

        let trimmed = stdout.trim();
        let output = serde_json::from_str::<Value>(trimmed)
            .unwrap_or_else(|_| Value::String(trimmed.to_string()));
        Ok(ProviderOutput {
            output,
            content: Some(stdout),
            ..ProviderOutput::default()
        })
    }
}

/// Publishes `HumanInputRequested` and parks until a frontend resolves the
/// prompt. The engine's per-step timeout bounds the wait.
pub struct HumanInputProvider {
    pub bus: EventBus,
    pub prompts: PromptStore,
}

#[async_trait]
impl Provider for HumanInputProvider {
    fn kind(&self) -> StepType {
        StepType::HumanInput
    }

    async fn execute(&self, ctx: ExecutionContext<'_>) -> anyhow::Result<ProviderOutput> {
        let prompt_id = format!("{}:{}:{}", ctx.input.run_id, ctx.step.name, Uuid::new_v4());
        let receiver = self.prompts.register(&prompt_id);
        self.bus.emit_kind(
            EventKind::HumanInputRequested,
            json!({
                "prompt_id": prompt_id,
                "run_id": ctx.input.run_id,
                "step": ctx.step.name,
                "message": ctx.step.prompt,
            }),
        );
        let answer = receiver
            .await
            .map_err(|_| anyhow::anyhow!("human input prompt was cancelled"))?;
        Ok(ProviderOutput::with_output(answer))
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use visor_types::InvocationInput;

    fn exec_ctx<'a>(
        input: &'a InvocationInput,
        step: &'a StepConfig,
        deps: &'a DependencyOutputs,
        memory: RunMemory,
    ) -> ExecutionContext<'a> {
        ExecutionContext {
            input,
            step,
            deps,
            item: None,
            session: None,
            memory,
            depth: 0,
        }
    }

    fn step(yaml: &str) -> StepConfig {
        let mut step: StepConfig = serde_yaml::from_str(yaml).unwrap();
        step.name = "test".to_string();
        step
    }

    #[tokio::test]
    async fn noop_passes_content_through() {
        let input = InvocationInput::default();
        let step = step("type: noop\ncontent: [1, 2, 3]");
        let deps = DependencyOutputs::new();
        let out = NoopProvider
            .execute(exec_ctx(&input, &step, &deps, RunMemory::new()))
            .await
            .unwrap();
        assert_eq!(out.output, json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn memory_set_then_get_round_trips() {
        let input = InvocationInput::default();
        let memory = RunMemory::new();
        let deps = DependencyOutputs::new();
        let set = step("type: memory\ncontent:\n  op: set\n  key: seen\n  value: 7");
        MemoryProvider
            .execute(exec_ctx(&input, &set, &deps, memory.clone()))
            .await
            .unwrap();
        let get = step("type: memory\ncontent:\n  op: get\n  key: seen");
        let out = MemoryProvider
            .execute(exec_ctx(&input, &get, &deps, memory))
            .await
            .unwrap();
        assert_eq!(out.output, json!(7));
    }

    #[tokio::test]
    async fn command_parses_json_stdout() {
        let input = InvocationInput::default();
        let step = step("type: command\nexec: \"echo '[1,2]'\"");
        let deps = DependencyOutputs::new();
        let out = CommandProvider
            .execute(exec_ctx(&input, &step, &deps, RunMemory::new()))
            .await
            .unwrap();
        assert_eq!(out.output, json!([1, 2]));
    }

    #[tokio::test]
    async fn command_failure_is_an_error() {
        let input = InvocationInput::default();
        let step = step("type: command\nexec: \"exit 3\"");
        let deps = DependencyOutputs::new();
        let err = CommandProvider
            .execute(exec_ctx(&input, &step, &deps, RunMemory::new()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited with 3"));
    }

    #[tokio::test]
    async fn human_input_resolves_through_the_prompt_store() {
        let bus = EventBus::new();
        let prompts = PromptStore::new();
        let captured = Arc::new(Mutex::new(None::<String>));
        let sink = Arc::clone(&captured);
        let _sub = bus.on(EventKind::HumanInputRequested, move |envelope| {
            *sink.lock() = envelope.payload["prompt_id"].as_str().map(str::to_string);
        });

        let provider = HumanInputProvider {
            bus,
            prompts: prompts.clone(),
        };
        let input = InvocationInput::default();
        let step = step("type: human-input\nprompt: \"approve?\"");
        let deps = DependencyOutputs::new();

        let answer_task = tokio::spawn(async move {
            loop {
                let pending = prompts.pending_ids();
                if let Some(id) = pending.first() {
                    prompts.resolve(id, json!({"approved": true}));
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        });

        let out = provider
            .execute(exec_ctx(&input, &step, &deps, RunMemory::new()))
            .await
            .unwrap();
        answer_task.await.unwrap();
        assert_eq!(out.output, json!({"approved": true}));
        assert!(captured.lock().is_some());
    }
}
