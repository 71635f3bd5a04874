//! Delivery of cache transitions to registered handlers.

use std::{
    any::Any,
    fmt,
    panic::{self, AssertUnwindSafe},
};

use crate::{
    resource::{IngressGroup, QualifiedName},
    store::Transition,
};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerResult = Result<(), HandlerError>;

/// Receives notifications for observed `IngressGroup` transitions.
///
/// Every method defaults to a no-op, so implementors only override the
/// notifications they care about. Handlers run serially on the list-watch
/// task in the order transitions were applied, and may see the same state
/// more than once after a reconnect, so they must be idempotent.
pub trait EventHandler: Send + Sync {
    fn on_add(&self, _obj: &IngressGroup) -> HandlerResult {
        Ok(())
    }

    fn on_update(&self, _prior: &IngressGroup, _current: &IngressGroup) -> HandlerResult {
        Ok(())
    }

    fn on_delete(&self, _obj: &IngressGroup) -> HandlerResult {
        Ok(())
    }

    /// Identifies the handler in failure logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

type ObjectFn = Box<dyn Fn(&IngressGroup) -> HandlerResult + Send + Sync>;
type UpdateFn = Box<dyn Fn(&IngressGroup, &IngressGroup) -> HandlerResult + Send + Sync>;

/// An [`EventHandler`] assembled from closures. Unset callbacks are no-ops.
#[derive(Default)]
pub struct HandlerFns {
    name: Option<String>,
    add: Option<ObjectFn>,
    update: Option<UpdateFn>,
    delete: Option<ObjectFn>,
}

impl HandlerFns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_add(
        mut self,
        f: impl Fn(&IngressGroup) -> HandlerResult + Send + Sync + 'static,
    ) -> Self {
        self.add = Some(Box::new(f));
        self
    }

    pub fn with_update(
        mut self,
        f: impl Fn(&IngressGroup, &IngressGroup) -> HandlerResult + Send + Sync + 'static,
    ) -> Self {
        self.update = Some(Box::new(f));
        self
    }

    pub fn with_delete(
        mut self,
        f: impl Fn(&IngressGroup) -> HandlerResult + Send + Sync + 'static,
    ) -> Self {
        self.delete = Some(Box::new(f));
        self
    }
}

impl EventHandler for HandlerFns {
    fn on_add(&self, obj: &IngressGroup) -> HandlerResult {
        self.add.as_ref().map_or(Ok(()), |f| f(obj))
    }

    fn on_update(&self, prior: &IngressGroup, current: &IngressGroup) -> HandlerResult {
        self.update.as_ref().map_or(Ok(()), |f| f(prior, current))
    }

    fn on_delete(&self, obj: &IngressGroup) -> HandlerResult {
        self.delete.as_ref().map_or(Ok(()), |f| f(obj))
    }

    fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("HandlerFns")
    }
}

impl fmt::Debug for HandlerFns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerFns")
            .field("name", &self.name)
            .field("add", &self.add.is_some())
            .field("update", &self.update.is_some())
            .field("delete", &self.delete.is_some())
            .finish()
    }
}

/// Logs every notification and does nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHandler;

impl EventHandler for LogHandler {
    fn on_add(&self, obj: &IngressGroup) -> HandlerResult {
        log::warn!("addIngGroup: {}", display_key(obj));
        Ok(())
    }

    fn on_update(&self, prior: &IngressGroup, current: &IngressGroup) -> HandlerResult {
        log::warn!(
            "oldIngGroup: {} ; curIngGroup: {}",
            display_key(prior),
            display_key(current)
        );
        Ok(())
    }

    fn on_delete(&self, obj: &IngressGroup) -> HandlerResult {
        log::warn!("delIngGroup: {}", display_key(obj));
        Ok(())
    }
}

fn display_key(obj: &IngressGroup) -> String {
    match QualifiedName::from_resource(obj) {
        Some(key) => key.to_string(),
        None => "<unnamed>".to_owned(),
    }
}

/// Fans transitions out to every registered handler.
#[derive(Default)]
pub struct Dispatcher {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: impl EventHandler + 'static) {
        self.handlers.push(Box::new(handler));
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Delivers `transition` to each handler in registration order.
    ///
    /// A handler that errors or panics is logged and skipped; the remaining
    /// handlers still run. Returns the number of handlers that failed.
    pub fn dispatch(&self, transition: &Transition) -> usize {
        let mut failures = 0;
        for handler in &self.handlers {
            let result = panic::catch_unwind(AssertUnwindSafe(|| match transition {
                Transition::Added(obj) => handler.on_add(obj),
                Transition::Updated { prior, current } => handler.on_update(prior, current),
                Transition::Deleted(obj) => handler.on_delete(obj),
            }));

            let failure = match result {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err.to_string(),
                Err(payload) => format!("panicked: {}", panic_message(&*payload)),
            };
            failures += 1;
            log::error!(
                "Handler {} failed on {} of {}: {failure}",
                handler.name(),
                transition_kind(transition),
                display_key(transition.object()),
            );
        }
        failures
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.handlers.iter().map(|handler| handler.name()))
            .finish()
    }
}

fn transition_kind(transition: &Transition) -> &'static str {
    match transition {
        Transition::Added(_) => "add",
        Transition::Updated { .. } => "update",
        Transition::Deleted(_) => "delete",
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        *msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}
