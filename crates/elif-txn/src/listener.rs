//! Transaction lifecycle listeners
//!
//! Listeners are attached to a root transaction and fired in registration
//! order around its physical completion. `before_*` and `after_*` callbacks
//! always come in pairs, even when the step between them fails.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

/// How a root transaction finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Committed,
    RolledBack,
}

impl fmt::Display for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Completion::Committed => write!(f, "committed"),
            Completion::RolledBack => write!(f, "rolled back"),
        }
    }
}

/// Hooks around the commit and rollback of a root transaction
#[async_trait]
pub trait TransactionListener: Send + Sync {
    /// Called before deferred statements are flushed
    async fn before_process(&self) {}

    /// Called after the flush, whether or not it succeeded
    async fn after_process(&self) {}

    async fn before_rollback(&self) {}

    async fn after_rollback(&self) {}

    /// Called once, after every resource has been ended or rolled back
    async fn complete(&self, _completion: Completion) {}
}

type Hook = Box<dyn Fn() + Send + Sync>;
type CompletionHook = Box<dyn Fn(Completion) + Send + Sync>;

/// Listener built from plain closures
#[derive(Default)]
pub struct CallbackListener {
    before_process: Option<Hook>,
    after_process: Option<Hook>,
    before_rollback: Option<Hook>,
    after_rollback: Option<Hook>,
    complete: Option<CompletionHook>,
}

impl CallbackListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_before_process(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.before_process = Some(Box::new(f));
        self
    }

    pub fn on_after_process(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.after_process = Some(Box::new(f));
        self
    }

    pub fn on_before_rollback(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.before_rollback = Some(Box::new(f));
        self
    }

    pub fn on_after_rollback(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.after_rollback = Some(Box::new(f));
        self
    }

    pub fn on_complete(mut self, f: impl Fn(Completion) + Send + Sync + 'static) -> Self {
        self.complete = Some(Box::new(f));
        self
    }
}

#[async_trait]
impl TransactionListener for CallbackListener {
    async fn before_process(&self) {
        if let Some(f) = &self.before_process {
            f();
        }
    }

    async fn after_process(&self) {
        if let Some(f) = &self.after_process {
            f();
        }
    }

    async fn before_rollback(&self) {
        if let Some(f) = &self.before_rollback {
            f();
        }
    }

    async fn after_rollback(&self) {
        if let Some(f) = &self.after_rollback {
            f();
        }
    }

    async fn complete(&self, completion: Completion) {
        if let Some(f) = &self.complete {
            f(completion);
        }
    }
}

/// Ordered set of listeners owned by a root transaction
#[derive(Default, Clone)]
pub(crate) struct ListenerRegistry {
    listeners: Vec<Arc<dyn TransactionListener>>,
}

impl ListenerRegistry {
    pub fn register(&mut self, listener: Arc<dyn TransactionListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub async fn trigger_before_process(&self) {
        for listener in &self.listeners {
            listener.before_process().await;
        }
    }

    pub async fn trigger_after_process(&self) {
        for listener in &self.listeners {
            listener.after_process().await;
        }
    }

    pub async fn trigger_before_rollback(&self) {
        for listener in &self.listeners {
            listener.before_rollback().await;
        }
    }

    pub async fn trigger_after_rollback(&self) {
        for listener in &self.listeners {
            listener.after_rollback().await;
        }
    }

    pub async fn trigger_complete(&self, completion: Completion) {
        for listener in &self.listeners {
            listener.complete(completion).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[tokio::test]
    async fn test_listeners_fire_in_registration_order() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ListenerRegistry::default();

        for name in ["first", "second"] {
            let events = events.clone();
            registry.register(Arc::new(
                CallbackListener::new().on_before_process(move || events.lock().push(name)),
            ));
        }

        registry.trigger_before_process().await;
        registry.trigger_after_process().await;
        assert_eq!(*events.lock(), vec!["first", "second"]);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_completion_is_passed_through() {
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let listener = CallbackListener::new().on_complete(move |c| *sink.lock() = Some(c));

        listener.complete(Completion::RolledBack).await;
        assert_eq!(*seen.lock(), Some(Completion::RolledBack));
        assert_eq!(Completion::Committed.to_string(), "committed");
    }
}
