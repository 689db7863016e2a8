//! The root binding: what `serve` installs on a connection.
//!
//! A binding pairs a served root with its method table and the caller's
//! error transformer. Finders are bound to the root at install time, so the
//! rest of the engine never sees the root's concrete type. Each binding
//! counts the handlers dispatched against it: when the binding has been
//! displaced (by another `serve`, by `stop_serving`, or by teardown) and the
//! last of those handlers completes, the root's destructor hook runs exactly
//! once, however many times the binding is retired.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::dispatch::{DispatchFuture, Method, MethodTable, Receiver};
use crate::error::{codes, ServerError};

/// Transformer applied to domain errors (finder and method errors) before
/// they go on the wire. The transformed error's code becomes `error_code`.
pub type ErrorTransform = Arc<dyn Fn(ServerError) -> ServerError + Send + Sync>;

type BoundFinder = Box<dyn Fn(String) -> DispatchFuture<Result<Receiver, ServerError>> + Send + Sync>;

/// An object type with its finder bound to the served root.
pub(crate) struct BoundObject {
    finder: BoundFinder,
    methods: HashMap<&'static str, Method>,
}

impl std::fmt::Debug for BoundObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundObject")
            .field("methods", &self.methods)
            .finish()
    }
}

impl BoundObject {
    /// Resolve an instance id to a receiver. Finder errors are domain
    /// errors and propagate unchanged.
    pub(crate) fn find(&self, id: String) -> DispatchFuture<Result<Receiver, ServerError>> {
        (self.finder)(id)
    }
}

#[derive(Default)]
struct BindingLifecycle {
    active: usize,
    retired: bool,
}

/// The (root, method table, transformer) triple installed by `serve`.
pub(crate) struct RootBinding {
    objects: HashMap<&'static str, BoundObject>,
    transform: Option<ErrorTransform>,
    lifecycle: Mutex<BindingLifecycle>,
    kill: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl RootBinding {
    pub(crate) fn bind<R: Send + Sync + 'static>(
        table: &MethodTable<R>,
        root: Arc<R>,
        transform: Option<ErrorTransform>,
    ) -> RootBinding {
        let mut objects = HashMap::new();
        for (name, entry) in &table.entries {
            let finder = entry.finder.clone();
            let root = root.clone();
            let bound: BoundFinder = Box::new(move |id| finder(root.clone(), id));
            objects.insert(
                *name,
                BoundObject {
                    finder: bound,
                    methods: entry.methods.clone(),
                },
            );
        }
        let kill = table.kill.clone().map(|hook| {
            let root = root.clone();
            Box::new(move || hook(root)) as Box<dyn FnOnce() + Send>
        });
        RootBinding {
            objects,
            transform,
            lifecycle: Mutex::new(BindingLifecycle::default()),
            kill: Mutex::new(kill),
        }
    }

    /// Look up (object type, method) in the table.
    pub(crate) fn lookup(
        &self,
        object_type: &str,
        request: &str,
    ) -> Result<(&BoundObject, Method), ServerError> {
        let Some(object) = self.objects.get(object_type) else {
            return Err(ServerError::with_code(
                format!("unknown object type {object_type:?}"),
                codes::UNKNOWN_OBJECT_TYPE,
            ));
        };
        let Some(method) = object.methods.get(request) else {
            return Err(ServerError::with_code(
                format!("no such request {request:?} on {object_type}"),
                codes::UNKNOWN_REQUEST,
            ));
        };
        Ok((object, method.clone()))
    }

    /// Run a domain error through the installed transformer, if any.
    pub(crate) fn transform_error(&self, err: ServerError) -> ServerError {
        match &self.transform {
            Some(transform) => transform(err),
            None => err,
        }
    }

    /// A handler was dispatched against this binding.
    pub(crate) fn begin_request(&self) {
        self.lifecycle.lock().unwrap().active += 1;
    }

    /// A handler dispatched against this binding completed.
    pub(crate) fn end_request(&self) {
        let run_kill = {
            let mut lifecycle = self.lifecycle.lock().unwrap();
            lifecycle.active -= 1;
            lifecycle.retired && lifecycle.active == 0
        };
        if run_kill {
            self.run_kill();
        }
    }

    /// The binding was displaced. The destructor runs now if no handlers are
    /// in flight, otherwise when the last one completes.
    pub(crate) fn retire(&self) {
        let run_kill = {
            let mut lifecycle = self.lifecycle.lock().unwrap();
            lifecycle.retired = true;
            lifecycle.active == 0
        };
        if run_kill {
            self.run_kill();
        }
    }

    fn run_kill(&self) {
        let kill = self.kill.lock().unwrap().take();
        if let Some(kill) = kill {
            kill();
        }
    }
}
