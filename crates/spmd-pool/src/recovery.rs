//! Rollback stack for multi-step operations
//!
//! Each completed step pushes the action that undoes it. On failure the
//! stack unwinds last-in-first-out. An undo failure is logged and the
//! remaining actions still run, so the caller can always surface the error
//! that caused the unwind.

use spmd_common::Result;
use tracing::{debug, error, info};

type Undo = Box<dyn FnOnce() -> Result<()> + Send>;

pub struct RecoveryStack {
    name: String,
    actions: Vec<(String, Undo)>,
}

impl RecoveryStack {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            actions: Vec::new(),
        }
    }

    pub fn push(&mut self, description: impl Into<String>, undo: impl FnOnce() -> Result<()> + Send + 'static) {
        let description = description.into();
        debug!("{}: registered recovery {:?}", self.name, description);
        self.actions.push((description, Box::new(undo)));
    }

    /// Drop every pending action and register `undo` alone
    pub fn replace(&mut self, description: impl Into<String>, undo: impl FnOnce() -> Result<()> + Send + 'static) {
        self.actions.clear();
        self.push(description, undo);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Run all actions newest first. Returns the number that failed.
    pub fn unwind(mut self) -> usize {
        info!("{}: rolling back {} steps", self.name, self.actions.len());
        let mut failed = 0;
        while let Some((description, undo)) = self.actions.pop() {
            if let Err(e) = undo() {
                error!("{}: recovery {:?} failed: {}", self.name, description, e);
                failed += 1;
            }
        }
        failed
    }

    /// Forget all actions; the operation succeeded
    pub fn commit(mut self) {
        debug!("{}: committed, {} recoveries dropped", self.name, self.actions.len());
        self.actions.clear();
    }
}
