use std::fmt;
use std::sync::Arc;

use super::{Hook, HookContext, HookTrigger};

#[derive(Clone)]
struct Entry {
    hook: Arc<dyn Hook>,
    priority: i32,
}

/// Hooks ordered by priority.
///
/// Higher priority runs first; equal priorities run in registration order.
/// Building is by value, so a stack that has been handed out is never
/// modified behind its holder's back. Cloning is cheap.
#[derive(Clone, Default)]
pub struct HookStack {
    entries: Vec<Entry>,
}

impl fmt::Debug for HookStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hooks: Vec<(&str, i32)> = self
            .entries
            .iter()
            .map(|e| (e.hook.name(), e.priority))
            .collect();
        f.debug_struct("HookStack").field("hooks", &hooks).finish()
    }
}

impl HookStack {
    /// An empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stack with `hook` inserted at `priority`.
    #[must_use]
    pub fn with(self, hook: impl Hook + 'static, priority: i32) -> Self {
        self.with_shared(Arc::new(hook), priority)
    }

    /// Returns the stack with a shared hook inserted at `priority`.
    #[must_use]
    pub fn with_shared(mut self, hook: Arc<dyn Hook>, priority: i32) -> Self {
        // Insert after every entry of equal or higher priority.
        let pos = self
            .entries
            .iter()
            .position(|e| e.priority < priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, Entry { hook, priority });
        self
    }

    /// Number of hooks.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the stack is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Hook names in dispatch order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.hook.name()).collect()
    }

    /// Whether any hook fires on `trigger`.
    pub fn handles(&self, trigger: HookTrigger) -> bool {
        self.entries
            .iter()
            .any(|e| e.hook.triggers().contains(&trigger))
    }

    /// Threads `ctx` through every hook registered for `trigger`, highest
    /// priority first.
    pub fn dispatch(&self, trigger: HookTrigger, mut ctx: HookContext) -> HookContext {
        for entry in &self.entries {
            if !entry.hook.triggers().contains(&trigger) {
                continue;
            }
            tracing::trace!(hook = entry.hook.name(), %trigger, "dispatching hook");
            ctx.trigger = trigger;
            ctx = entry.hook.handle(ctx);
        }
        ctx
    }
}
