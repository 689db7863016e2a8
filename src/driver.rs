//! The connection engine.
//!
//! One driver task owns the codec exclusively: it is both the reader loop and
//! the serialization point for every outbound frame. Callers and executors
//! funnel their writes through a message queue, so a frame is always written
//! whole, and a pending entry is inserted before its request frame is
//! written. Responses are processed on the same task, so an out-of-order
//! response can never observe the table without the entry.
//!
//! Each inbound request fans out to its own executor task; executors never
//! touch the codec and hold no lock across the method invocation, so a
//! handler is free to issue calls back over the same connection. Inbound
//! bodies are read eagerly (the codec parses them into a wire value), which
//! keeps the transport framed even when the header turns out to be unusable.
//!
//! Teardown, whatever triggers it: stop dispatching, drain in-flight
//! executors, release every pending caller, retire the root binding (running
//! the destructor), close the codec, signal dead.

use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::binder::RootBinding;
use crate::codec::Codec;
use crate::connection::{Shared, State};
use crate::dispatch::InvokeError;
use crate::error::{codes, CallError, ServerError};
use crate::wire::Header;

/// A response as delivered to the waiting caller.
pub(crate) struct ResponseEnvelope {
    pub(crate) error: String,
    pub(crate) error_code: String,
    pub(crate) body: Option<Value>,
}

type ReplySlot = oneshot::Sender<Result<ResponseEnvelope, CallError>>;

pub(crate) enum DriverMessage {
    /// An outbound call: insert the pending entry, then write the frame.
    Call {
        header: Header,
        body: Option<Value>,
        reply: ReplySlot,
    },
    /// An executor finished; write its response frame.
    Respond {
        request_id: u64,
        error: Option<ServerError>,
        body: Option<Value>,
    },
}

enum Exit {
    CloseRequested,
    /// Read side ended: `None` for clean EOF, `Some` for a transport error.
    ReadEnd(Option<io::Error>),
}

pub(crate) struct Driver<C> {
    codec: C,
    shared: Arc<Shared>,
    rx: mpsc::Receiver<DriverMessage>,
    close_rx: watch::Receiver<bool>,
    pending: HashMap<u64, ReplySlot>,
    in_flight: usize,
}

impl<C: Codec> Driver<C> {
    pub(crate) fn new(
        codec: C,
        shared: Arc<Shared>,
        rx: mpsc::Receiver<DriverMessage>,
        close_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            codec,
            shared,
            rx,
            close_rx,
            pending: HashMap::new(),
            in_flight: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        let exit = self.run_inner().await;
        self.teardown(exit).await;
    }

    async fn run_inner(&mut self) -> Exit {
        loop {
            tokio::select! {
                biased;

                _ = self.close_rx.changed() => {
                    // The sender lives as long as the connection, so any wake
                    // here means close was requested.
                    return Exit::CloseRequested;
                }

                message = self.rx.recv() => {
                    if let Some(message) = message {
                        self.handle_message(message).await;
                    }
                }

                read = self.codec.read_header() => {
                    match read {
                        Ok(Some(header)) => {
                            if let Err(e) = self.handle_inbound(header).await {
                                return Exit::ReadEnd(Some(e));
                            }
                        }
                        Ok(None) => return Exit::ReadEnd(None),
                        Err(e) => return Exit::ReadEnd(Some(e)),
                    }
                }
            }
        }
    }

    /// One inbound message while running: spawn an executor for a request,
    /// complete the pending entry for a response.
    async fn handle_inbound(&mut self, header: Header) -> io::Result<()> {
        let body = self.codec.read_body(header.is_request()).await?;
        if header.is_request() {
            // The active count must rise while the binding is still the
            // installed one, or a concurrent swap could retire (and kill) the
            // root before this request is accounted for.
            let binding = {
                let guard = self.shared.binding.read().unwrap();
                if let Some(binding) = guard.as_ref() {
                    binding.begin_request();
                }
                guard.clone()
            };
            self.in_flight += 1;
            debug!(
                request_id = header.request_id,
                object_type = %header.object_type,
                request = %header.request,
                "dispatching inbound request"
            );
            tokio::spawn(run_request(
                binding,
                header,
                body,
                self.shared.driver_tx.clone(),
            ));
        } else {
            self.deliver_response(header, body);
        }
        Ok(())
    }

    fn deliver_response(&mut self, header: Header, body: Option<Value>) {
        match self.pending.remove(&header.request_id) {
            Some(reply) => {
                let _ = reply.send(Ok(ResponseEnvelope {
                    error: header.error,
                    error_code: header.error_code,
                    body,
                }));
            }
            None => {
                // Body already consumed; nothing left to do but note it.
                debug!(request_id = header.request_id, "orphaned response discarded");
            }
        }
    }

    async fn handle_message(&mut self, message: DriverMessage) {
        match message {
            DriverMessage::Call { header, body, reply } => {
                let request_id = header.request_id;
                self.pending.insert(request_id, reply);
                if let Err(e) = self.codec.write_message(&header, body.as_ref()).await {
                    self.shared.write_broken.store(true, Ordering::Relaxed);
                    if let Some(reply) = self.pending.remove(&request_id) {
                        let _ = reply.send(Err(CallError::Transport(e)));
                    }
                }
            }
            DriverMessage::Respond { request_id, error, body } => {
                self.in_flight = self.in_flight.saturating_sub(1);
                self.write_response(request_id, error, body).await;
            }
        }
    }

    async fn write_response(&mut self, request_id: u64, error: Option<ServerError>, body: Option<Value>) {
        let mut header = Header {
            request_id,
            ..Default::default()
        };
        let body = match error {
            Some(error) => {
                header.error = error.message().to_string();
                header.error_code = error.code().unwrap_or_default().to_string();
                None
            }
            None => body,
        };
        if let Err(e) = self.codec.write_message(&header, body.as_ref()).await {
            warn!(request_id, error = %e, "failed to write response");
            self.shared.write_broken.store(true, Ordering::Relaxed);
        }
    }

    /// One inbound message while draining: responses still complete pending
    /// calls, but new requests are answered with a shutdown error instead of
    /// being dispatched. The body has been consumed either way.
    async fn handle_inbound_closing(&mut self, header: Header) -> io::Result<()> {
        let body = self.codec.read_body(header.is_request()).await?;
        if header.is_request() {
            debug!(
                request_id = header.request_id,
                "rejecting request received while closing"
            );
            let error = ServerError::with_code("connection is shut down", codes::SHUTDOWN);
            self.write_response(header.request_id, Some(error), None).await;
        } else {
            self.deliver_response(header, body);
        }
        Ok(())
    }

    async fn handle_drain_message(&mut self, message: DriverMessage) {
        match message {
            DriverMessage::Call { reply, .. } => {
                let _ = reply.send(Err(CallError::Shutdown));
            }
            respond => self.handle_message(respond).await,
        }
    }

    fn fail_pending(&mut self) {
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(CallError::Shutdown));
        }
    }

    async fn teardown(&mut self, exit: Exit) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if *state == State::Running {
                *state = State::Closing;
            }
        }

        // On a dead read side, pending callers are released immediately; on a
        // requested close, the reader keeps draining so responses already in
        // flight still land, and the rest are released after the handlers.
        let mut reading = match &exit {
            Exit::CloseRequested => {
                debug!(in_flight = self.in_flight, "close requested, draining");
                true
            }
            Exit::ReadEnd(None) => {
                debug!("transport closed by peer");
                self.fail_pending();
                false
            }
            Exit::ReadEnd(Some(e)) => {
                debug!(error = %e, "transport read failed");
                self.fail_pending();
                false
            }
        };

        while self.in_flight > 0 {
            if reading {
                tokio::select! {
                    message = self.rx.recv() => {
                        match message {
                            Some(message) => self.handle_drain_message(message).await,
                            None => break,
                        }
                    }
                    read = self.codec.read_header() => {
                        let stopped = match read {
                            Ok(Some(header)) => self.handle_inbound_closing(header).await.is_err(),
                            Ok(None) => true,
                            Err(_) => true,
                        };
                        if stopped {
                            self.fail_pending();
                            reading = false;
                        }
                    }
                }
            } else {
                match self.rx.recv().await {
                    Some(message) => self.handle_drain_message(message).await,
                    None => break,
                }
            }
        }

        self.fail_pending();

        let binding = self.shared.binding.write().unwrap().take();
        if let Some(binding) = binding {
            binding.retire();
        }

        let outcome = self.codec.close().await;
        if let Err(e) = &outcome {
            warn!(error = %e, "transport close failed");
        }
        self.shared
            .close_outcome
            .lock()
            .unwrap()
            .get_or_insert(outcome.map_err(|e| e.to_string()));

        *self.shared.state.lock().unwrap() = State::Dead;
        self.shared.dead_tx.send_replace(true);
        debug!("connection dead");
    }
}

/// Executor for one inbound request. Always produces exactly one `Respond`
/// message, whatever the handler does, including panicking.
async fn run_request(
    binding: Option<Arc<RootBinding>>,
    header: Header,
    body: Option<Value>,
    tx: mpsc::Sender<DriverMessage>,
) {
    let request_id = header.request_id;
    let outcome = AssertUnwindSafe(dispatch_request(binding.as_deref(), &header, body))
        .catch_unwind()
        .await;
    if let Some(binding) = &binding {
        binding.end_request();
    }
    let (error, body) = match outcome {
        Ok(Ok(body)) => (None, body),
        Ok(Err(error)) => (Some(error), None),
        Err(panic) => (
            Some(ServerError::new(format!(
                "panic in {}.{}: {}",
                header.object_type,
                header.request,
                panic_message(&panic)
            ))),
            None,
        ),
    };
    let _ = tx
        .send(DriverMessage::Respond {
            request_id,
            error,
            body,
        })
        .await;
}

/// Resolve, find, decode, invoke, map. Domain errors (from the finder or the
/// method) go through the binding's transformer; framework failures keep
/// their codes and bypass it.
async fn dispatch_request(
    binding: Option<&RootBinding>,
    header: &Header,
    body: Option<Value>,
) -> Result<Option<Value>, ServerError> {
    let Some(binding) = binding else {
        return Err(ServerError::with_code("no service", codes::NO_SERVICE));
    };
    let (object, method) = binding.lookup(&header.object_type, &header.request)?;
    let receiver = object
        .find(header.object_id.clone())
        .await
        .map_err(|e| binding.transform_error(e))?;
    let body = if method.has_arg { body } else { None };
    match (method.invoke)(receiver, body).await {
        Ok(value) => Ok(if method.has_result { value } else { None }),
        Err(InvokeError::Decode(e)) => Err(ServerError::with_code(
            format!("cannot decode request body: {e}"),
            codes::BAD_REQUEST,
        )),
        Err(InvokeError::Encode(e)) => Err(ServerError::new(format!(
            "cannot encode response body: {e}"
        ))),
        Err(InvokeError::Method(e)) => Err(binding.transform_error(e)),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
