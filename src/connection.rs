//! The public connection handle and its lifecycle.
//!
//! A [`Connection`] is cheap to clone and shareable; server methods that need
//! to call back over the same connection hold a clone. The engine itself runs
//! in a driver task spawned by [`Connection::start`] (see the `driver`
//! module). Callers talk to it over a message queue and park on a one-shot
//! rendezvous until the response (or teardown) releases them.
//!
//! Lifecycle: `new → running → closing → dead`. Calls are only accepted
//! while running. `close` drains in-flight handlers, releases every waiter,
//! runs the root's destructor, and is idempotent: a second call returns the
//! first call's outcome.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};

use crate::binder::{ErrorTransform, RootBinding};
use crate::codec::Codec;
use crate::dispatch::MethodTable;
use crate::driver::{Driver, DriverMessage};
use crate::error::{CallError, RequestError};
use crate::wire::Header;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Created but not reading; calls fail with [`CallError::Shutdown`].
    New,
    /// Reader loop active; calls accepted.
    Running,
    /// Draining in-flight handlers; no new work accepted.
    Closing,
    /// Torn down: waiters released, destructor run, transport closed.
    Dead,
}

type DriverStart = Pin<Box<dyn Future<Output = ()> + Send>>;

/// State shared between the handle and the driver task.
pub(crate) struct Shared {
    pub(crate) state: Mutex<State>,
    pub(crate) binding: RwLock<Option<Arc<RootBinding>>>,
    next_request_id: AtomicU64,
    /// Set when a transport write fails; subsequent calls fail fast.
    pub(crate) write_broken: AtomicBool,
    pub(crate) driver_tx: mpsc::Sender<DriverMessage>,
    close_tx: watch::Sender<bool>,
    pub(crate) dead_tx: watch::Sender<bool>,
    /// Outcome of closing the transport, `Err` as a message. First write wins.
    pub(crate) close_outcome: Mutex<Option<Result<(), String>>>,
}

/// One end of a bidirectional RPC connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Shared>,
    driver: Arc<Mutex<Option<DriverStart>>>,
}

impl Connection {
    /// Wrap a codec in a new connection. The connection does not read until
    /// [`start`](Connection::start) is called; [`serve`](Connection::serve)
    /// may be called first so the root is installed before the first request
    /// can arrive.
    pub fn new<C: Codec>(codec: C) -> Connection {
        let (driver_tx, driver_rx) = mpsc::channel(128);
        let (close_tx, _) = watch::channel(false);
        let (dead_tx, _) = watch::channel(false);
        let close_rx = close_tx.subscribe();
        let inner = Arc::new(Shared {
            state: Mutex::new(State::New),
            binding: RwLock::new(None),
            next_request_id: AtomicU64::new(0),
            write_broken: AtomicBool::new(false),
            driver_tx,
            close_tx,
            dead_tx,
            close_outcome: Mutex::new(None),
        });
        let driver = Driver::new(codec, inner.clone(), driver_rx, close_rx);
        let driver: DriverStart = Box::pin(driver.run());
        Connection {
            inner,
            driver: Arc::new(Mutex::new(Some(driver))),
        }
    }

    /// Transition to running and begin reading. A no-op if already started
    /// or closed.
    pub fn start(&self) {
        let driver = {
            let mut state = self.inner.state.lock().unwrap();
            if *state != State::New {
                return;
            }
            let Some(driver) = self.driver.lock().unwrap().take() else {
                return;
            };
            *state = State::Running;
            driver
        };
        tokio::spawn(driver);
    }

    /// Install or replace the server root. Valid at any point while the
    /// connection is alive, including from inside a running handler.
    /// Handlers already in progress keep running against the root they were
    /// dispatched under; the displaced root's destructor runs once they have
    /// all completed.
    pub fn serve<R: Send + Sync + 'static>(
        &self,
        root: Arc<R>,
        table: &MethodTable<R>,
        transform: Option<ErrorTransform>,
    ) {
        let binding = Arc::new(RootBinding::bind(table, root, transform));
        let old = self.inner.binding.write().unwrap().replace(binding);
        if let Some(old) = old {
            old.retire();
        }
    }

    /// Revoke service: subsequent inbound requests fail with `no service`.
    pub fn stop_serving(&self) {
        let old = self.inner.binding.write().unwrap().take();
        if let Some(old) = old {
            old.retire();
        }
    }

    /// Invoke `request` on the receiver resolved from `(object_type,
    /// object_id)` at the peer, and decode the result into `R`.
    ///
    /// Pass `&()` as the argument for methods that take none. A response with
    /// no body decodes as `R::default()`; use [`serde_json::Value`] as `R` to
    /// discard the result.
    pub async fn call<A, R>(
        &self,
        object_type: &str,
        object_id: &str,
        request: &str,
        arg: &A,
    ) -> Result<R, CallError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Default,
    {
        if *self.inner.state.lock().unwrap() != State::Running
            || self.inner.write_broken.load(Ordering::Relaxed)
        {
            return Err(CallError::Shutdown);
        }

        let body = match serde_json::to_value(arg) {
            Ok(Value::Null) => None,
            Ok(value) => Some(value),
            Err(e) => return Err(CallError::Encode(e)),
        };
        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed) + 1;
        let header = Header {
            request_id,
            object_type: object_type.to_string(),
            object_id: object_id.to_string(),
            request: request.to_string(),
            ..Default::default()
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let message = DriverMessage::Call {
            header,
            body,
            reply: reply_tx,
        };
        if self.inner.driver_tx.send(message).await.is_err() {
            return Err(CallError::Shutdown);
        }

        let envelope = match reply_rx.await {
            Ok(result) => result?,
            // Driver went away without completing the entry.
            Err(_) => return Err(CallError::Shutdown),
        };

        if !envelope.error.is_empty() {
            let code = (!envelope.error_code.is_empty()).then_some(envelope.error_code);
            return Err(CallError::Request(RequestError::new(envelope.error, code)));
        }
        match envelope.body {
            Some(value) => serde_json::from_value(value).map_err(CallError::Decode),
            None => Ok(R::default()),
        }
    }

    /// Shut the connection down: stop accepting work, drain in-flight
    /// handlers, release pending callers with [`CallError::Shutdown`], run
    /// the root destructor, close the transport. Idempotent; repeated calls
    /// return the first call's outcome.
    pub async fn close(&self) -> io::Result<()> {
        enum Action {
            TearDownUnstarted,
            SignalDriver,
            Wait,
        }

        let action = {
            let mut state = self.inner.state.lock().unwrap();
            match *state {
                State::New => {
                    *state = State::Dead;
                    Action::TearDownUnstarted
                }
                State::Running => {
                    *state = State::Closing;
                    Action::SignalDriver
                }
                State::Closing | State::Dead => Action::Wait,
            }
        };

        match action {
            Action::TearDownUnstarted => {
                // Never started reading: dropping the driver drops the codec
                // and with it the transport.
                drop(self.driver.lock().unwrap().take());
                let old = self.inner.binding.write().unwrap().take();
                if let Some(old) = old {
                    old.retire();
                }
                self.inner.close_outcome.lock().unwrap().get_or_insert(Ok(()));
                self.inner.dead_tx.send_replace(true);
            }
            Action::SignalDriver => {
                self.inner.close_tx.send_replace(true);
            }
            Action::Wait => {}
        }

        self.dead().await;
        match self.inner.close_outcome.lock().unwrap().clone() {
            Some(Err(message)) => Err(io::Error::other(message)),
            _ => Ok(()),
        }
    }

    /// Resolves when the connection reaches the dead state.
    pub async fn dead(&self) {
        let mut rx = self.inner.dead_tx.subscribe();
        let _ = rx.wait_for(|dead| *dead).await;
    }

    pub fn is_dead(&self) -> bool {
        *self.inner.dead_tx.borrow()
    }

    pub fn state(&self) -> State {
        *self.inner.state.lock().unwrap()
    }
}
