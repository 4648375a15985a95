//! Continuation criteria: may the loop take another step?

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use agentry_core::StopReason;

use crate::state::ExecutionState;

/// What a criterion sees at the top of each iteration.
#[derive(Debug, Clone, Copy)]
pub struct ContinuationContext<'a> {
    /// Current state.
    pub state: &'a ExecutionState,
    /// Wall-clock time since `BeforeExecution`.
    pub elapsed: Duration,
}

impl<'a> ContinuationContext<'a> {
    /// A context for `state`, measuring elapsed time from the run start.
    pub fn new(state: &'a ExecutionState) -> Self {
        Self {
            state,
            elapsed: state.elapsed().unwrap_or_default(),
        }
    }
}

/// A predicate deciding whether another step may run.
pub trait ContinuationCriterion: Send + Sync {
    /// Name recorded in [`TerminationReason::Criterion`](crate::state::TerminationReason).
    fn name(&self) -> &str;

    /// `None` to allow another step, `Some(detail)` to stop.
    fn evaluate(&self, ctx: &ContinuationContext<'_>) -> Option<String>;
}

/// Criteria combined with AND. The first one to stop the run wins.
#[derive(Clone, Default)]
pub struct ContinuationCriteria {
    criteria: Vec<Arc<dyn ContinuationCriterion>>,
}

impl fmt::Debug for ContinuationCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.criteria.iter().map(|c| c.name()))
            .finish()
    }
}

impl ContinuationCriteria {
    /// No criteria: every step is allowed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a criterion, evaluated after those already present.
    #[must_use]
    pub fn with(mut self, criterion: impl ContinuationCriterion + 'static) -> Self {
        self.criteria.push(Arc::new(criterion));
        self
    }

    /// Adds a shared criterion.
    #[must_use]
    pub fn with_shared(mut self, criterion: Arc<dyn ContinuationCriterion>) -> Self {
        self.criteria.push(criterion);
        self
    }

    /// Number of criteria.
    pub fn len(&self) -> usize {
        self.criteria.len()
    }

    /// Whether there are no criteria.
    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }

    /// Returns `(name, detail)` of the first criterion that stops the run.
    pub fn first_stop(&self, ctx: &ContinuationContext<'_>) -> Option<(String, String)> {
        self.criteria.iter().find_map(|c| {
            c.evaluate(ctx).map(|detail| (c.name().to_owned(), detail))
        })
    }
}

/// Stops once `max` steps have started in the current run.
#[derive(Debug, Clone, Copy)]
pub struct StepsLimit(pub u32);

impl ContinuationCriterion for StepsLimit {
    fn name(&self) -> &str {
        "steps_limit"
    }

    fn evaluate(&self, ctx: &ContinuationContext<'_>) -> Option<String> {
        let steps = ctx.state.stats().step_counter;
        (steps >= self.0).then(|| format!("{steps} of {} steps used", self.0))
    }
}

/// Stops once the steps of the current run have consumed `max` tokens.
/// Steps kept from earlier runs on the same conversation do not count.
#[derive(Debug, Clone, Copy)]
pub struct TokenUsageLimit(pub u64);

impl ContinuationCriterion for TokenUsageLimit {
    fn name(&self) -> &str {
        "token_usage_limit"
    }

    fn evaluate(&self, ctx: &ContinuationContext<'_>) -> Option<String> {
        let used = ctx.state.run_usage().total();
        (used >= self.0).then(|| format!("{used} tokens used, budget {}", self.0))
    }
}

/// Stops once the run has been going for longer than the limit.
///
/// Checked only between steps; a slow step is not interrupted.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionTimeLimit(pub Duration);

impl ContinuationCriterion for ExecutionTimeLimit {
    fn name(&self) -> &str {
        "execution_time_limit"
    }

    fn evaluate(&self, ctx: &ContinuationContext<'_>) -> Option<String> {
        (ctx.elapsed >= self.0).then(|| {
            format!(
                "{}ms elapsed, limit {}ms",
                ctx.elapsed.as_millis(),
                self.0.as_millis()
            )
        })
    }
}

/// Stops once the current run has produced a final response.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToolCallPresenceCheck;

impl ContinuationCriterion for ToolCallPresenceCheck {
    fn name(&self) -> &str {
        "tool_call_presence"
    }

    fn evaluate(&self, ctx: &ContinuationContext<'_>) -> Option<String> {
        ctx.state
            .current_step()
            .filter(|s| s.is_final())
            .map(|_| "final response produced".to_owned())
    }
}

/// Stops when the last inference ended with one of the given reasons.
#[derive(Debug, Clone)]
pub struct FinishReasonCheck {
    reasons: Vec<StopReason>,
}

impl FinishReasonCheck {
    /// Stops on any of `reasons`.
    pub fn new(reasons: impl IntoIterator<Item = StopReason>) -> Self {
        Self {
            reasons: reasons.into_iter().collect(),
        }
    }
}

impl ContinuationCriterion for FinishReasonCheck {
    fn name(&self) -> &str {
        "finish_reason"
    }

    fn evaluate(&self, ctx: &ContinuationContext<'_>) -> Option<String> {
        let reason = &ctx.state.current_step()?.inference.as_ref()?.stop_reason;
        self.reasons
            .contains(reason)
            .then(|| format!("inference finished with {reason:?}"))
    }
}

/// Stops when the current step is an error step.
///
/// Useful together with an [`ErrorPolicy`](super::ErrorPolicy) that ignores
/// some failures but should still end the run on them.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorPresenceCheck;

impl ContinuationCriterion for ErrorPresenceCheck {
    fn name(&self) -> &str {
        "error_presence"
    }

    fn evaluate(&self, ctx: &ContinuationContext<'_>) -> Option<String> {
        let failure = ctx.state.current_step()?.failure.as_ref()?;
        Some(format!("{}: {}", failure.kind, failure.message))
    }
}

/// Adapts a closure into a criterion.
///
/// ```rust
/// use agentry::pipeline::{ContinuationCriteria, CustomCriterion};
///
/// let criteria = ContinuationCriteria::new().with(CustomCriterion::new("halt_flag", |ctx| {
///     ctx.state.metadata_value("halt").map(|_| "halt requested".to_owned())
/// }));
/// assert_eq!(criteria.len(), 1);
/// ```
pub struct CustomCriterion<F> {
    name: String,
    f: F,
}

impl<F> CustomCriterion<F>
where
    F: Fn(&ContinuationContext<'_>) -> Option<String> + Send + Sync,
{
    /// Wraps `f` under `name`.
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> fmt::Debug for CustomCriterion<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomCriterion")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<F> ContinuationCriterion for CustomCriterion<F>
where
    F: Fn(&ContinuationContext<'_>) -> Option<String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, ctx: &ContinuationContext<'_>) -> Option<String> {
        (self.f)(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::state::{InferenceInfo, Step};
    use agentry_core::{ChatMessage, Usage};
    use chrono::Utc;

    fn stepped(n: u32) -> ExecutionState {
        (0..n).fold(ExecutionState::from_user("hi"), |s, _| s.with_step_started())
    }

    fn final_step(stop_reason: StopReason, usage: Usage) -> Step {
        Step::final_response(
            vec![],
            vec![ChatMessage::assistant("done")],
            Some(InferenceInfo {
                usage,
                stop_reason,
                model: "m".into(),
            }),
            Utc::now(),
        )
    }

    #[test]
    fn test_steps_limit() {
        let limit = StepsLimit(3);
        assert!(limit.evaluate(&ContinuationContext::new(&stepped(2))).is_none());
        let detail = limit.evaluate(&ContinuationContext::new(&stepped(3))).unwrap();
        assert_eq!(detail, "3 of 3 steps used");
    }

    #[test]
    fn test_token_usage_limit() {
        let state = ExecutionState::default()
            .with_step(final_step(StopReason::EndTurn, Usage::new(60, 40)));
        assert!(TokenUsageLimit(101).evaluate(&ContinuationContext::new(&state)).is_none());
        assert!(TokenUsageLimit(100).evaluate(&ContinuationContext::new(&state)).is_some());
    }

    #[test]
    fn test_token_usage_limit_ignores_earlier_runs() {
        let mut earlier = final_step(StopReason::EndTurn, Usage::new(600, 400));
        earlier.started_at = Utc::now() - chrono::TimeDelta::hours(1);
        let state = ExecutionState::default()
            .with_step(earlier)
            .with_run_started(Utc::now() - chrono::TimeDelta::minutes(1))
            .with_step(final_step(StopReason::EndTurn, Usage::new(60, 40)));

        assert_eq!(state.total_usage().total(), 1100);
        assert!(TokenUsageLimit(500).evaluate(&ContinuationContext::new(&state)).is_none());
        assert!(TokenUsageLimit(100).evaluate(&ContinuationContext::new(&state)).is_some());
    }

    #[test]
    fn test_execution_time_limit_uses_elapsed() {
        let state = ExecutionState::default();
        let ctx = ContinuationContext {
            state: &state,
            elapsed: Duration::from_secs(5),
        };
        assert!(ExecutionTimeLimit(Duration::from_secs(10)).evaluate(&ctx).is_none());
        assert!(ExecutionTimeLimit(Duration::from_secs(5)).evaluate(&ctx).is_some());
    }

    #[test]
    fn test_tool_call_presence_stops_on_final() {
        let running = ExecutionState::from_user("hi");
        assert!(ToolCallPresenceCheck.evaluate(&ContinuationContext::new(&running)).is_none());
        let done = running.with_step(final_step(StopReason::EndTurn, Usage::default()));
        assert!(ToolCallPresenceCheck.evaluate(&ContinuationContext::new(&done)).is_some());
    }

    #[test]
    fn test_finish_reason_check() {
        let check = FinishReasonCheck::new([StopReason::MaxTokens]);
        let truncated = ExecutionState::default()
            .with_step(final_step(StopReason::MaxTokens, Usage::default()));
        let normal = ExecutionState::default()
            .with_step(final_step(StopReason::EndTurn, Usage::default()));
        assert!(check.evaluate(&ContinuationContext::new(&truncated)).is_some());
        assert!(check.evaluate(&ContinuationContext::new(&normal)).is_none());
    }

    #[test]
    fn test_error_presence_check() {
        let state = ExecutionState::default().with_step(Step::error(
            ErrorKind::Validation,
            "bad",
            vec![],
            Utc::now(),
        ));
        let detail = ErrorPresenceCheck.evaluate(&ContinuationContext::new(&state)).unwrap();
        assert_eq!(detail, "validation: bad");
    }

    #[test]
    fn test_first_stop_short_circuits() {
        let criteria = ContinuationCriteria::new()
            .with(StepsLimit(1))
            .with(CustomCriterion::new("never_reached", |_| -> Option<String> {
                panic!("evaluated after a stopping criterion")
            }));
        let (name, _) = criteria.first_stop(&ContinuationContext::new(&stepped(1))).unwrap();
        assert_eq!(name, "steps_limit");
    }

    #[test]
    fn test_empty_criteria_allow() {
        let criteria = ContinuationCriteria::new();
        assert!(criteria.is_empty());
        assert!(criteria.first_stop(&ContinuationContext::new(&stepped(100))).is_none());
    }
}
