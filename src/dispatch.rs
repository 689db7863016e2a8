//! The method table: object-type entries, finders, and invoker thunks.
//!
//! A [`MethodTable`] describes everything a root type exposes over a
//! connection. Each object type has a finder, the function that resolves an
//! instance id to a receiver, and a set of methods on that receiver. The
//! table is built once per root type and is immutable afterwards: lookups
//! happen without locks, and one table can back any number of `serve` calls.
//!
//! Handlers are registered through a typed builder and erased into thunks at
//! registration time. A thunk decodes the wire body into the handler's
//! concrete argument type, invokes the handler, and encodes the result back
//! into a wire value. Receivers travel across the erased boundary as
//! `Arc<dyn Any>`; the registration step guarantees the downcast inside the
//! thunk, because the entry's finder is the only producer of receivers for
//! its methods.
//!
//! The recognized method shapes, with `A` the argument record and `T` the
//! result record:
//!
//! | registration | signature          |
//! |--------------|--------------------|
//! | `method`     | `(A) -> (T, error)` |
//! | `method0`    | `() -> (T, error)`  |
//! | `notify`     | `(A) -> error`      |
//! | `notify0`    | `() -> error`       |
//!
//! Handlers that never return `Err` cover the infallible shapes.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::ServerError;

/// Boxed future used across the erased dispatch boundary.
pub(crate) type DispatchFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// A receiver resolved by a finder, with its concrete type erased.
pub(crate) type Receiver = Arc<dyn Any + Send + Sync>;

pub(crate) type FinderFn<R> =
    Arc<dyn Fn(Arc<R>, String) -> DispatchFuture<Result<Receiver, ServerError>> + Send + Sync>;

pub(crate) type InvokeFn =
    Arc<dyn Fn(Receiver, Option<Value>) -> DispatchFuture<Result<Option<Value>, InvokeError>> + Send + Sync>;

pub(crate) type KillFn<R> = Arc<dyn Fn(Arc<R>) + Send + Sync>;

/// How an invocation failed, before error mapping.
#[derive(Debug)]
pub(crate) enum InvokeError {
    /// The body did not decode into the argument type.
    Decode(serde_json::Error),
    /// The result did not encode into a wire value.
    Encode(serde_json::Error),
    /// The handler itself returned an error.
    Method(ServerError),
}

/// Descriptor of one registered method.
#[derive(Clone)]
pub(crate) struct Method {
    pub(crate) has_arg: bool,
    pub(crate) has_result: bool,
    pub(crate) invoke: InvokeFn,
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("has_arg", &self.has_arg)
            .field("has_result", &self.has_result)
            .finish()
    }
}

/// One object-type entry: the finder plus the receiver's method map.
pub(crate) struct ObjectEntry<R> {
    pub(crate) finder: FinderFn<R>,
    pub(crate) methods: HashMap<&'static str, Method>,
}

/// Everything a root type exposes: object types, their methods, and the
/// optional destructor hook.
pub struct MethodTable<R> {
    pub(crate) entries: HashMap<&'static str, ObjectEntry<R>>,
    pub(crate) kill: Option<KillFn<R>>,
}

impl<R: Send + Sync + 'static> MethodTable<R> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            kill: None,
        }
    }

    /// Register an object type. The finder resolves an instance id to a
    /// receiver; a finder error is a domain error and reaches the caller
    /// unchanged. Registering the same name again replaces the entry.
    pub fn object_type<O, F, Fut>(&mut self, name: &'static str, finder: F) -> ObjectTypeBuilder<'_, O>
    where
        O: Send + Sync + 'static,
        F: Fn(Arc<R>, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<O>, ServerError>> + Send + 'static,
    {
        let finder: FinderFn<R> = Arc::new(move |root, id| {
            let fut = finder(root, id);
            Box::pin(async move { fut.await.map(|receiver| receiver as Receiver) })
        });
        let entry = self.entries.entry(name).or_insert_with(|| ObjectEntry {
            finder: finder.clone(),
            methods: HashMap::new(),
        });
        entry.finder = finder;
        entry.methods.clear();
        ObjectTypeBuilder {
            methods: &mut entry.methods,
            _receiver: PhantomData,
        }
    }

    /// Register the destructor hook: invoked exactly once per served root,
    /// after the last handler dispatched against it has completed. Absence of
    /// a hook is not an error.
    pub fn on_kill<F>(&mut self, f: F)
    where
        F: Fn(Arc<R>) + Send + Sync + 'static,
    {
        self.kill = Some(Arc::new(f));
    }

    /// Names of the registered object types, for diagnostics.
    pub fn object_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }
}

impl<R: Send + Sync + 'static> Default for MethodTable<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// Registers methods on one object type's receiver.
pub struct ObjectTypeBuilder<'a, O> {
    methods: &'a mut HashMap<&'static str, Method>,
    _receiver: PhantomData<fn() -> O>,
}

impl<O: Send + Sync + 'static> ObjectTypeBuilder<'_, O> {
    /// `(A) -> (T, error)`: takes an argument, returns a result.
    pub fn method<A, T, F, Fut>(&mut self, name: &'static str, f: F) -> &mut Self
    where
        A: DeserializeOwned + Default + Send + 'static,
        T: Serialize + Send + 'static,
        F: Fn(Arc<O>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ServerError>> + Send + 'static,
    {
        let invoke: InvokeFn = Arc::new(move |receiver, body| {
            let (receiver, arg) = match prepare::<O, A>(receiver, body) {
                Ok(bound) => bound,
                Err(e) => return fail(e),
            };
            let fut = f(receiver, arg);
            Box::pin(async move {
                let result = fut.await.map_err(InvokeError::Method)?;
                let value = serde_json::to_value(result).map_err(InvokeError::Encode)?;
                Ok(Some(value))
            })
        });
        self.insert(name, true, true, invoke)
    }

    /// `() -> (T, error)`: no argument, returns a result. A body sent anyway
    /// is discarded.
    pub fn method0<T, F, Fut>(&mut self, name: &'static str, f: F) -> &mut Self
    where
        T: Serialize + Send + 'static,
        F: Fn(Arc<O>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ServerError>> + Send + 'static,
    {
        let invoke: InvokeFn = Arc::new(move |receiver, _body| {
            let receiver = match downcast::<O>(receiver) {
                Ok(receiver) => receiver,
                Err(e) => return fail(e),
            };
            let fut = f(receiver);
            Box::pin(async move {
                let result = fut.await.map_err(InvokeError::Method)?;
                let value = serde_json::to_value(result).map_err(InvokeError::Encode)?;
                Ok(Some(value))
            })
        });
        self.insert(name, false, true, invoke)
    }

    /// `(A) -> error`: takes an argument, returns nothing.
    pub fn notify<A, F, Fut>(&mut self, name: &'static str, f: F) -> &mut Self
    where
        A: DeserializeOwned + Default + Send + 'static,
        F: Fn(Arc<O>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ServerError>> + Send + 'static,
    {
        let invoke: InvokeFn = Arc::new(move |receiver, body| {
            let (receiver, arg) = match prepare::<O, A>(receiver, body) {
                Ok(bound) => bound,
                Err(e) => return fail(e),
            };
            let fut = f(receiver, arg);
            Box::pin(async move {
                fut.await.map_err(InvokeError::Method)?;
                Ok(None)
            })
        });
        self.insert(name, true, false, invoke)
    }

    /// `() -> error`: no argument, returns nothing.
    pub fn notify0<F, Fut>(&mut self, name: &'static str, f: F) -> &mut Self
    where
        F: Fn(Arc<O>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ServerError>> + Send + 'static,
    {
        let invoke: InvokeFn = Arc::new(move |receiver, _body| {
            let receiver = match downcast::<O>(receiver) {
                Ok(receiver) => receiver,
                Err(e) => return fail(e),
            };
            let fut = f(receiver);
            Box::pin(async move {
                fut.await.map_err(InvokeError::Method)?;
                Ok(None)
            })
        });
        self.insert(name, false, false, invoke)
    }

    fn insert(&mut self, name: &'static str, has_arg: bool, has_result: bool, invoke: InvokeFn) -> &mut Self {
        self.methods.insert(
            name,
            Method {
                has_arg,
                has_result,
                invoke,
            },
        );
        self
    }
}

fn downcast<O: Send + Sync + 'static>(receiver: Receiver) -> Result<Arc<O>, InvokeError> {
    receiver
        .downcast::<O>()
        .map_err(|_| InvokeError::Method(ServerError::new("internal: receiver type mismatch")))
}

/// Bind the receiver and decode the argument. An absent body synthesizes the
/// argument type's zero value.
fn prepare<O, A>(receiver: Receiver, body: Option<Value>) -> Result<(Arc<O>, A), InvokeError>
where
    O: Send + Sync + 'static,
    A: DeserializeOwned + Default,
{
    let receiver = downcast::<O>(receiver)?;
    let arg = match body {
        Some(value) => serde_json::from_value(value).map_err(InvokeError::Decode)?,
        None => A::default(),
    };
    Ok((receiver, arg))
}

fn fail(e: InvokeError) -> DispatchFuture<Result<Option<Value>, InvokeError>> {
    Box::pin(std::future::ready(Err(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    struct Payload {
        val: String,
    }

    struct Counter;
    struct TestRoot {
        counter: Arc<Counter>,
    }

    fn table() -> MethodTable<TestRoot> {
        let mut table = MethodTable::new();
        let mut obj = table.object_type("Counter", |root: Arc<TestRoot>, _id: String| {
            let counter = root.counter.clone();
            async move { Ok(counter) }
        });
        obj.method("Echo", |_c: Arc<Counter>, arg: Payload| async move { Ok(arg) });
        obj.notify0("Touch", |_c: Arc<Counter>| async move { Ok(()) });
        table
    }

    #[test]
    fn descriptors_record_shape() {
        let table = table();
        let entry = &table.entries["Counter"];
        assert!(entry.methods["Echo"].has_arg);
        assert!(entry.methods["Echo"].has_result);
        assert!(!entry.methods["Touch"].has_arg);
        assert!(!entry.methods["Touch"].has_result);
    }

    #[tokio::test]
    async fn thunk_decodes_invokes_and_encodes() {
        let table = table();
        let invoke = table.entries["Counter"].methods["Echo"].invoke.clone();
        let receiver: Receiver = Arc::new(Counter);

        let body = serde_json::json!({"val": "hi"});
        let out = invoke(receiver, Some(body)).await.expect("invoke");
        assert_eq!(out, Some(serde_json::json!({"val": "hi"})));
    }

    #[tokio::test]
    async fn absent_body_synthesizes_zero_value() {
        let table = table();
        let invoke = table.entries["Counter"].methods["Echo"].invoke.clone();

        let out = invoke(Arc::new(Counter), None).await.expect("invoke");
        assert_eq!(out, Some(serde_json::json!({"val": ""})));
    }

    #[tokio::test]
    async fn wrong_shape_is_a_decode_error() {
        let table = table();
        let invoke = table.entries["Counter"].methods["Echo"].invoke.clone();

        let body = serde_json::json!({"val": {"nested": true}});
        let err = invoke(Arc::new(Counter), Some(body)).await.expect_err("decode must fail");
        assert!(matches!(err, InvokeError::Decode(_)));
    }

    #[tokio::test]
    async fn notify_returns_no_body() {
        let table = table();
        let invoke = table.entries["Counter"].methods["Touch"].invoke.clone();

        let out = invoke(Arc::new(Counter), None).await.expect("invoke");
        assert_eq!(out, None);
    }

    #[test]
    fn reregistering_an_object_type_replaces_it() {
        let mut table = table();
        table.object_type("Counter", |root: Arc<TestRoot>, _id: String| {
            let counter = root.counter.clone();
            async move { Ok(counter) }
        });
        assert!(table.entries["Counter"].methods.is_empty());
    }
}
