use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tracing::{debug, error, instrument, warn};

use crew_core::tools::{ToolContext, ToolOutcome};

use crate::registry::ToolRegistry;
use crate::truncate::{self, DEFAULT_MAX_OUTPUT};

const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    pub tool_timeout: Duration,
    pub max_output_bytes: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            max_output_bytes: DEFAULT_MAX_OUTPUT,
        }
    }
}

/// Outcome of one dispatched call plus how long it ran.
#[derive(Clone, Debug)]
pub struct Dispatched {
    pub outcome: ToolOutcome,
    pub duration: Duration,
}

/// Routes a named call to its tool. Every failure mode, including unknown
/// names, panics and timeouts, comes back as a failed outcome.
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    config: DispatcherConfig,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, config: DispatcherConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Same settings over a registry holding only read-only tools.
    pub fn read_only(&self) -> Self {
        Self {
            registry: Arc::new(self.registry.read_only()),
            config: self.config.clone(),
        }
    }

    #[instrument(skip(self, input, ctx), fields(session_id = %ctx.session_id, tool = %name))]
    pub async fn execute(&self, name: &str, input: serde_json::Value, ctx: &ToolContext) -> Dispatched {
        let start = Instant::now();

        let Some(tool) = self.registry.get(name) else {
            warn!("unknown tool requested");
            return Dispatched {
                outcome: ToolOutcome::failed(format!("unknown tool: {name}")),
                duration: start.elapsed(),
            };
        };

        let timeout = self.config.tool_timeout;
        let result = tokio::time::timeout(
            timeout,
            AssertUnwindSafe(tool.execute(input, ctx)).catch_unwind(),
        )
        .await;
        let duration = start.elapsed();

        let outcome = match result {
            Ok(Ok(Ok(r))) => ToolOutcome::ok(r.content),
            Ok(Ok(Err(e))) => {
                debug!(error = %e, "tool returned an error");
                ToolOutcome::failed(e.to_string())
            }
            Ok(Err(panic)) => {
                let msg = panic_message(&panic);
                error!(panic = %msg, "tool panicked during execution");
                ToolOutcome::failed("Internal error: tool crashed")
            }
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "tool timed out");
                ToolOutcome::failed(format!("Tool timed out after {}s", timeout.as_secs()))
            }
        };

        Dispatched {
            outcome: ToolOutcome {
                success: outcome.success,
                output: truncate::truncate_output(&outcome.output, self.config.max_output_bytes),
            },
            duration,
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
