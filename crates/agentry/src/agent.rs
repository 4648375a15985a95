//! The top-level agent: one configured pipeline, one run at a time.

use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};

use agentry_core::{ChatMessage, DynProvider};
use futures::Stream;
use futures::stream;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::AgentConfig;
use crate::driver::{Driver, ReActDriver, ToolCallingDriver};
use crate::error::AgentError;
use crate::events::EventEmitter;
use crate::hooks::{Hook, HookStack};
use crate::pipeline::{
    Continuation, ContinuationCriterion, ExecutionPipeline, Phase, PhaseHandler,
};
use crate::state::ExecutionState;
use crate::tool::{ToolHandler, ToolRegistry};

/// A pinned, boxed, `Send` stream of intermediate states.
///
/// Returned by [`Agent::iterate`]. Yields the state after every step, then
/// the final state once `AfterExecution` has run. Dropping the stream stops
/// the run between steps.
pub type AgentStream = Pin<Box<dyn Stream<Item = Result<ExecutionState, AgentError>> + Send>>;

/// Cancellation for the active or next run.
///
/// Each run checks a child of the pipeline's token. A child that was
/// cancelled is swapped for a fresh one when its run ends, so cancelling one
/// run leaves the agent usable. Cancelling the parent stops every run.
#[derive(Debug, Clone)]
struct RunCancellation {
    parent: CancellationToken,
    current: Arc<Mutex<CancellationToken>>,
}

impl RunCancellation {
    fn new(parent: CancellationToken) -> Self {
        let current = Arc::new(Mutex::new(parent.child_token()));
        Self { parent, current }
    }

    fn token(&self) -> CancellationToken {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn renew_if_cancelled(&self) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if current.is_cancelled() {
            *current = self.parent.child_token();
        }
    }
}

/// Releases the agent's run slot on drop.
#[derive(Debug)]
struct RunGuard {
    active: Arc<AtomicBool>,
    cancellation: RunCancellation,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.cancellation.renew_if_cancelled();
        self.active.store(false, Ordering::Release);
    }
}

/// An agent: a provider, a driver, tools, hooks and limits.
///
/// Cloning shares the pipeline and the run slot, so clones also refuse to
/// run concurrently.
///
/// ```rust,no_run
/// use std::sync::{Arc, Mutex, PoisonError};
/// use agentry::{Agent, AgentConfig, ExecutionState};
/// use agentry::hooks::ToolCallGuard;
/// # async fn demo(provider: Arc<dyn agentry_core::DynProvider>) -> Result<(), agentry::AgentError> {
///
/// let agent = Agent::builder(provider)
///     .config(AgentConfig { max_steps: 8, ..AgentConfig::default() })
///     .hook(ToolCallGuard::dangerous_commands(), 100)
///     .build();
///
/// let done = agent.run(ExecutionState::from_user("What's new?")).await?;
/// println!("{:?}: {:?}", done.status(), done.final_text());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Agent {
    pipeline: Arc<ExecutionPipeline>,
    active: Arc<AtomicBool>,
    cancellation: RunCancellation,
}

impl Agent {
    /// Starts building an agent around `provider`.
    pub fn builder(provider: Arc<dyn DynProvider>) -> AgentBuilder {
        AgentBuilder::new(provider)
    }

    /// Wraps an already assembled pipeline.
    pub fn new(pipeline: ExecutionPipeline) -> Self {
        let cancellation = RunCancellation::new(pipeline.cancellation_token().clone());
        Self {
            pipeline: Arc::new(pipeline),
            active: Arc::new(AtomicBool::new(false)),
            cancellation,
        }
    }

    /// The pipeline.
    pub fn pipeline(&self) -> &ExecutionPipeline {
        &self.pipeline
    }

    /// A token that ends the active run, or the next one if none is
    /// active, at its next step boundary.
    ///
    /// Once a cancelled run has ended the agent switches to a fresh token,
    /// so fetch a new one for later runs. The token given to
    /// [`AgentBuilder::cancellation_token`] stops every run instead.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.token()
    }

    fn acquire(&self) -> Result<RunGuard, AgentError> {
        if self.active.swap(true, Ordering::AcqRel) {
            return Err(AgentError::ReentrantRun);
        }
        Ok(RunGuard {
            active: Arc::clone(&self.active),
            cancellation: self.cancellation.clone(),
        })
    }

    /// Runs to completion.
    ///
    /// Returns `Err` only for programming errors, including
    /// [`AgentError::ReentrantRun`] if another run is active. Runtime
    /// failures are in the returned state.
    #[instrument(skip_all)]
    pub async fn run(&self, state: ExecutionState) -> Result<ExecutionState, AgentError> {
        let guard = self.acquire()?;
        let cancel = guard.cancellation.token();
        self.pipeline.run_cancellable(state, &cancel).await
    }

    /// Runs lazily, one step per pull.
    ///
    /// ```rust,no_run
    /// use futures::StreamExt;
    /// # async fn demo(agent: agentry::Agent) {
    /// let mut states = agent.iterate(agentry::ExecutionState::from_user("hi"));
    /// while let Some(state) = states.next().await {
    ///     let state = state.expect("programming error");
    ///     println!("{} steps so far", state.step_count());
    /// }
    /// # }
    /// ```
    pub fn iterate(&self, state: ExecutionState) -> AgentStream {
        let guard = match self.acquire() {
            Ok(guard) => guard,
            Err(err) => return Box::pin(stream::once(async move { Err(err) })),
        };
        let iteration = Iteration {
            pipeline: Arc::clone(&self.pipeline),
            cancel: guard.cancellation.token(),
            phase: IterPhase::Start(state),
            guard: Some(guard),
        };
        Box::pin(stream::unfold(iteration, |mut it| async move {
            loop {
                match std::mem::replace(&mut it.phase, IterPhase::Done) {
                    IterPhase::Done => return None,
                    IterPhase::Start(state) => match it.pipeline.before_execution(state).await {
                        Ok(state) => it.phase = IterPhase::Loop(state),
                        Err(err) => return Some((Err(err), it.released())),
                    },
                    IterPhase::Loop(state) => match it.pipeline.continuation(state, &it.cancel) {
                        Continuation::Continue(state) => {
                            return match it.pipeline.run_step(state).await {
                                Ok(state) => {
                                    it.phase = IterPhase::Loop(state.clone());
                                    Some((Ok(state), it))
                                }
                                Err(err) => Some((Err(err), it.released())),
                            };
                        }
                        Continuation::Stop(state) => it.phase = IterPhase::Finish(state),
                    },
                    IterPhase::Finish(state) => {
                        let result = it.pipeline.after_execution(state).await;
                        return Some((result, it.released()));
                    }
                }
            }
        }))
    }
}

enum IterPhase {
    Start(ExecutionState),
    Loop(ExecutionState),
    Finish(ExecutionState),
    Done,
}

struct Iteration {
    pipeline: Arc<ExecutionPipeline>,
    cancel: CancellationToken,
    phase: IterPhase,
    guard: Option<RunGuard>,
}

impl Iteration {
    fn released(mut self) -> Self {
        self.guard = None;
        self
    }
}

enum DriverChoice {
    ToolCalling,
    ReAct,
    Custom(Arc<dyn Driver>),
}

/// Assembles an [`Agent`].
pub struct AgentBuilder {
    provider: Arc<dyn DynProvider>,
    config: AgentConfig,
    driver: DriverChoice,
    tools: ToolRegistry,
    hooks: HookStack,
    handlers: Vec<(Phase, Arc<dyn PhaseHandler>)>,
    criteria: Vec<Arc<dyn ContinuationCriterion>>,
    events: EventEmitter,
    cancel: CancellationToken,
    cached_context: Vec<ChatMessage>,
    finalize_via_inference: bool,
}

impl fmt::Debug for AgentBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let driver = match &self.driver {
            DriverChoice::ToolCalling => "tool_calling",
            DriverChoice::ReAct => "react",
            DriverChoice::Custom(d) => d.name(),
        };
        f.debug_struct("AgentBuilder")
            .field("config", &self.config)
            .field("driver", &driver)
            .field("tools", &self.tools.names())
            .field("hooks", &self.hooks)
            .field("handlers", &self.handlers.len())
            .field("criteria", &self.criteria.len())
            .finish_non_exhaustive()
    }
}

impl AgentBuilder {
    fn new(provider: Arc<dyn DynProvider>) -> Self {
        Self {
            provider,
            config: AgentConfig::default(),
            driver: DriverChoice::ToolCalling,
            tools: ToolRegistry::new(),
            hooks: HookStack::new(),
            handlers: Vec::new(),
            criteria: Vec::new(),
            events: EventEmitter::new(),
            cancel: CancellationToken::new(),
            cached_context: Vec::new(),
            finalize_via_inference: false,
        }
    }

    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses the [`ReActDriver`] instead of the tool-calling default.
    #[must_use]
    pub fn react(mut self) -> Self {
        self.driver = DriverChoice::ReAct;
        self
    }

    /// Uses a custom driver. Driver-specific settings in the configuration
    /// are not applied to it.
    #[must_use]
    pub fn driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.driver = DriverChoice::Custom(driver);
        self
    }

    /// Registers a tool.
    #[must_use]
    pub fn tool(mut self, tool: impl ToolHandler + 'static) -> Self {
        self.tools.register(tool);
        self
    }

    /// Replaces the tool registry.
    #[must_use]
    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    /// Adds a hook at `priority`. Higher runs first.
    #[must_use]
    pub fn hook(mut self, hook: impl Hook + 'static, priority: i32) -> Self {
        self.hooks = self.hooks.with(hook, priority);
        self
    }

    /// Adds a handler for `phase`, after those already added.
    #[must_use]
    pub fn phase_handler(mut self, phase: Phase, handler: impl PhaseHandler + 'static) -> Self {
        self.handlers.push((phase, Arc::new(handler)));
        self
    }

    /// Adds a continuation criterion to those the configuration implies.
    #[must_use]
    pub fn criterion(mut self, criterion: impl ContinuationCriterion + 'static) -> Self {
        self.criteria.push(Arc::new(criterion));
        self
    }

    /// Sets the event emitter shared by the pipeline, driver and executor.
    #[must_use]
    pub fn events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    /// Sets the cancellation token.
    #[must_use]
    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Messages sent ahead of the conversation on every request.
    #[must_use]
    pub fn cached_context(mut self, messages: Vec<ChatMessage>) -> Self {
        self.cached_context = messages;
        self
    }

    /// Makes the ReAct driver re-issue final answers as plain text.
    #[must_use]
    pub fn finalize_via_inference(mut self, enabled: bool) -> Self {
        self.finalize_via_inference = enabled;
        self
    }

    fn build_driver(&mut self) -> Arc<dyn Driver> {
        let config = &self.config;
        match &self.driver {
            DriverChoice::Custom(driver) => Arc::clone(driver),
            DriverChoice::ToolCalling => {
                let mut driver = ToolCallingDriver::new(Arc::clone(&self.provider))
                    .with_inference_mode(config.inference_mode)
                    .with_events(self.events.clone())
                    .with_cached_context(std::mem::take(&mut self.cached_context))
                    .with_tool_choice(config.tool_choice.clone());
                if let Some(prompt) = &config.system_prompt {
                    driver = driver.with_system_prompt(prompt.clone());
                }
                if let Some(t) = config.temperature {
                    driver = driver.with_temperature(t);
                }
                if let Some(n) = config.max_tokens {
                    driver = driver.with_max_tokens(n);
                }
                Arc::new(driver)
            }
            DriverChoice::ReAct => {
                let mut driver = ReActDriver::new(Arc::clone(&self.provider))
                    .with_inference_mode(config.inference_mode)
                    .with_events(self.events.clone())
                    .with_cached_context(std::mem::take(&mut self.cached_context))
                    .with_finalize_via_inference(self.finalize_via_inference);
                if let Some(prompt) = &config.system_prompt {
                    driver = driver.with_instructions(prompt.clone());
                }
                if let Some(t) = config.temperature {
                    driver = driver.with_temperature(t);
                }
                if let Some(n) = config.max_tokens {
                    driver = driver.with_max_tokens(n);
                }
                Arc::new(driver)
            }
        }
    }

    /// Builds the agent.
    pub fn build(mut self) -> Agent {
        let driver = self.build_driver();
        let criteria = self
            .criteria
            .into_iter()
            .fold(self.config.criteria(), |acc, c| acc.with_shared(c));
        let pipeline = ExecutionPipeline::new(driver, self.tools)
            .with_hooks(self.hooks)
            .with_criteria(criteria)
            .with_error_policy(self.config.error_policy)
            .with_events(self.events)
            .with_cancellation(self.cancel)
            .with_keep_tool_traces(self.config.keep_tool_traces)
            .with_parallel_tools(self.config.parallel_tool_execution);
        let pipeline = self
            .handlers
            .into_iter()
            .fold(pipeline, |p, (phase, handler)| p.with_handler(phase, handler));
        Agent::new(pipeline)
    }
}
