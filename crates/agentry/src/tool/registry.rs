//! Ordered, name-keyed tool collection.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use agentry_core::ToolDefinition;

use super::ToolHandler;

/// Tool handlers in registration order, indexed by name.
///
/// Definitions are offered to the model in registration order. Registering
/// a name twice replaces the handler but keeps its original position.
/// Cloning is cheap: handlers are shared through `Arc`.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    handlers: Vec<(String, Arc<dyn ToolHandler>)>,
    index: HashMap<String, usize>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler.
    pub fn register(&mut self, handler: impl ToolHandler + 'static) -> &mut Self {
        self.register_shared(Arc::new(handler))
    }

    /// Registers a shared handler.
    pub fn register_shared(&mut self, handler: Arc<dyn ToolHandler>) -> &mut Self {
        let name = handler.definition().name;
        match self.index.get(&name) {
            Some(&pos) => self.handlers[pos].1 = handler,
            None => {
                self.index.insert(name.clone(), self.handlers.len());
                self.handlers.push((name, handler));
            }
        }
        self
    }

    /// The handler for `name`.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn ToolHandler>> {
        self.index.get(name).map(|&pos| &self.handlers[pos].1)
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Definitions in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.handlers.iter().map(|(_, h)| h.definition()).collect()
    }

    /// Tool names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.handlers.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Number of tools.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no tools are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// A registry without the named tools.
    #[must_use]
    pub fn without<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Self {
        let exclude: HashSet<&str> = names.into_iter().collect();
        self.filtered(|name| !exclude.contains(name))
    }

    /// A registry with only the named tools.
    #[must_use]
    pub fn only<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Self {
        let include: HashSet<&str> = names.into_iter().collect();
        self.filtered(|name| include.contains(name))
    }

    fn filtered(&self, keep: impl Fn(&str) -> bool) -> Self {
        let mut out = Self::new();
        for (name, handler) in &self.handlers {
            if keep(name) {
                out.register_shared(Arc::clone(handler));
            }
        }
        out
    }
}
