use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::EngineError;

/// What a step function sees: the run's validated input plus the outputs of
/// every step that completed before it, keyed by step name. Steps not yet
/// reached are simply absent.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub input: Value,
    pub outputs: Map<String, Value>,
}

impl StepContext {
    pub fn output(&self, step_name: &str) -> Option<&Value> {
        self.outputs.get(step_name)
    }
}

/// A unit of work within a workflow. May perform network calls or store
/// writes; must be written so that re-invocation after a crash that happened
/// before its checkpoint committed is safe.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn run(&self, ctx: StepContext) -> anyhow::Result<Value>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> StepHandler for FnHandler<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn run(&self, ctx: StepContext) -> anyhow::Result<Value> {
        (self.0)(ctx).await
    }
}

#[derive(Clone)]
pub struct Step {
    name: String,
    handler: Arc<dyn StepHandler>,
}

impl Step {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn handler(&self) -> &dyn StepHandler {
        self.handler.as_ref()
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step").field("name", &self.name).finish()
    }
}

/// Bounded automatic retry: a run gets at most `max_retries` execution
/// attempts, with exponential backoff between them.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: i32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, given how many attempts have failed so
    /// far. Doubles per failure, capped at `max_backoff`.
    pub fn backoff_for(&self, failures: i32) -> Duration {
        let exp = failures.saturating_sub(1).clamp(0, 16) as u32;
        self.base_backoff
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_backoff)
    }
}

type InputValidator = Box<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Static description of a workflow: an ordered sequence of named steps plus
/// its retry, timeout, and input-validation contracts. Built once at process
/// start and never persisted; only the name is stored on runs.
pub struct WorkflowDefinition {
    name: String,
    steps: Vec<Step>,
    retry_policy: RetryPolicy,
    timeout: Duration,
    input_validator: Option<InputValidator>,
}

impl fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("name", &self.name)
            .field("steps", &self.steps)
            .field("retry_policy", &self.retry_policy)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl WorkflowDefinition {
    pub fn builder(name: impl Into<String>) -> WorkflowDefinitionBuilder {
        WorkflowDefinitionBuilder {
            name: name.into(),
            steps: Vec::new(),
            retry_policy: RetryPolicy::default(),
            timeout: Duration::from_secs(300),
            input_validator: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn validate_input(&self, input: &Value) -> Result<(), EngineError> {
        if let Some(validator) = &self.input_validator {
            validator(input).map_err(EngineError::InvalidInput)?;
        }
        Ok(())
    }
}

pub struct WorkflowDefinitionBuilder {
    name: String,
    steps: Vec<Step>,
    retry_policy: RetryPolicy,
    timeout: Duration,
    input_validator: Option<InputValidator>,
}

impl WorkflowDefinitionBuilder {
    /// Append a step built from an async closure.
    pub fn step<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.step_handler(name, FnHandler(f))
    }

    /// Append a step backed by a handler implementation.
    pub fn step_handler(
        mut self,
        name: impl Into<String>,
        handler: impl StepHandler + 'static,
    ) -> Self {
        self.steps.push(Step {
            name: name.into(),
            handler: Arc::new(handler),
        });
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn input_validator(
        mut self,
        validator: impl Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.input_validator = Some(Box::new(validator));
        self
    }

    pub fn build(self) -> Result<WorkflowDefinition, EngineError> {
        if self.steps.is_empty() {
            return Err(EngineError::InvalidInput(format!(
                "workflow `{}` has no steps",
                self.name
            )));
        }
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name()) {
                return Err(EngineError::InvalidInput(format!(
                    "workflow `{}` declares step `{}` more than once",
                    self.name,
                    step.name()
                )));
            }
        }
        Ok(WorkflowDefinition {
            name: self.name,
            steps: self.steps,
            retry_policy: self.retry_policy,
            timeout: self.timeout,
            input_validator: self.input_validator,
        })
    }
}

/// In-memory map from workflow name to definition. Populated during startup,
/// read-only once the engine is running, so lookups need no locking.
#[derive(Default)]
pub struct WorkflowRegistry {
    definitions: HashMap<String, Arc<WorkflowDefinition>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: WorkflowDefinition) -> Result<(), EngineError> {
        if self.definitions.contains_key(definition.name()) {
            return Err(EngineError::DuplicateWorkflow(definition.name().to_string()));
        }
        self.definitions
            .insert(definition.name().to_string(), Arc::new(definition));
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<WorkflowDefinition>, EngineError> {
        self.definitions
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownWorkflow(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }
}
