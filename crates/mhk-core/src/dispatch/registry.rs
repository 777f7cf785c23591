use std::{collections::HashMap, fmt, sync::Arc};

use crate::ports::ExecutionEngine;

/// Command name → engine lookup used by the dispatcher's execution units.
#[derive(Clone, Default)]
pub struct CommandRegistry {
    engines: HashMap<String, Arc<dyn ExecutionEngine>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, engine: Arc<dyn ExecutionEngine>) -> &mut Self {
        self.engines.insert(name.into(), engine);
        self
    }

    pub fn with(mut self, name: impl Into<String>, engine: Arc<dyn ExecutionEngine>) -> Self {
        self.register(name, engine);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ExecutionEngine>> {
        self.engines.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.engines.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.names())
            .finish()
    }
}
