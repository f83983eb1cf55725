//! Control-protocol run loop and dispatch table.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tracing::{debug, info, trace};

use framelink_core::ControlError;
use framelink_proto::control::{Envelope, MessageClass, RequestKind, ResponseKind, ENVELOPE_SIZE};

use crate::actions::{action_channel, ActionReceiver, ActionSender};

// ── Handler trait ─────────────────────────────────────────────────────────────

/// One entry of the dispatch table.
///
/// Handlers receive the envelope's payload and the connection's outbox for
/// queuing replies. A returned error is fatal to the connection — the engine
/// moves to its terminal error state and `run` returns the failure.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, value: &[u8], outbox: &ActionSender) -> Result<(), ControlError>;
}

// ── Dispatcher ────────────────────────────────────────────────────────────────

/// Typed dispatch table: one optional handler per request/response subtype,
/// bounded by the protocol's compile-time subtype counts. An in-range
/// subtype with no registered handler is a protocol error, not a skip.
pub struct Dispatcher {
    requests: Vec<Option<Box<dyn MessageHandler>>>,
    responses: Vec<Option<Box<dyn MessageHandler>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            requests: (0..RequestKind::COUNT).map(|_| None).collect(),
            responses: (0..ResponseKind::COUNT).map(|_| None).collect(),
        }
    }

    pub fn on_request(mut self, kind: RequestKind, handler: Box<dyn MessageHandler>) -> Self {
        self.requests[kind as usize] = Some(handler);
        self
    }

    pub fn on_response(mut self, kind: ResponseKind, handler: Box<dyn MessageHandler>) -> Self {
        self.responses[kind as usize] = Some(handler);
        self
    }

    async fn dispatch(&self, env: &Envelope, outbox: &ActionSender) -> Result<(), ControlError> {
        let (table, class) = match env.class {
            MessageClass::Request => (&self.requests, "request"),
            MessageClass::Response => (&self.responses, "response"),
        };
        let idx = env.subtype as usize;
        if idx >= table.len() {
            return Err(ControlError::UnknownSubtype {
                class,
                subtype: env.subtype,
            });
        }
        match &table[idx] {
            Some(handler) => {
                trace!("Dispatching {} subtype {}", class, env.subtype);
                handler
                    .handle(&env.value, outbox)
                    .await
                    .map_err(|e| ControlError::HandlerFailed {
                        class,
                        subtype: env.subtype,
                        reason: e.to_string(),
                    })
            }
            None => Err(ControlError::UnregisteredHandler {
                class,
                subtype: env.subtype,
            }),
        }
    }
}

// ── StopHandle ────────────────────────────────────────────────────────────────

/// Clean-exit trigger: consuming it moves the engine to its TEARDOWN state
/// and `run` returns `Ok`.
pub struct StopHandle {
    tx: oneshot::Sender<()>,
}

impl StopHandle {
    pub fn teardown(self) {
        let _ = self.tx.send(());
    }
}

// ── ControlProtocol ───────────────────────────────────────────────────────────

/// Per-connection control engine.
///
/// The original design alternated ACTION (drain one queued action) and
/// LISTEN (wait for an inbound envelope) states; this engine folds both into
/// one select-style wait so an empty queue never busy-spins. Semantics are
/// unchanged: queued actions go out as they arrive, every inbound envelope
/// is dispatched, the first protocol violation or handler failure is
/// terminal.
pub struct ControlProtocol {
    inbox: ActionReceiver,
    outbox: ActionSender,
    dispatcher: Dispatcher,
    stop_rx: oneshot::Receiver<()>,
}

impl ControlProtocol {
    /// Build an engine plus its enqueue handle and teardown trigger.
    pub fn new(dispatcher: Dispatcher, queue_depth: usize) -> (Self, ActionSender, StopHandle) {
        let (tx, rx) = action_channel(queue_depth);
        let (stop_tx, stop_rx) = oneshot::channel();
        (
            Self {
                inbox: rx,
                outbox: tx.clone(),
                dispatcher,
                stop_rx,
            },
            tx,
            StopHandle { tx: stop_tx },
        )
    }

    /// Drive the connection until teardown (Ok), connection loss, or the
    /// first protocol violation / handler failure (Err).
    pub async fn run<S>(&mut self, stream: &mut S) -> Result<(), ControlError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (mut rd, mut wr) = tokio::io::split(&mut *stream);
        let mut wire = [0u8; ENVELOPE_SIZE];
        let mut filled = 0usize;

        loop {
            tokio::select! {
                _ = &mut self.stop_rx => {
                    info!("Control engine teardown requested");
                    return Ok(());
                }

                maybe_env = self.inbox.rx.recv() => {
                    // The engine keeps one sender clone alive, so the queue
                    // cannot close underneath us.
                    let Some(env) = maybe_env else {
                        return Ok(());
                    };
                    debug!("Sending {} subtype {}", env.class.name(), env.subtype);
                    wr.write_all(&env.encode()).await?;
                    wr.flush().await?;
                }

                read = rd.read(&mut wire[filled..]) => {
                    let n = read?;
                    if n == 0 {
                        if filled == 0 {
                            return Err(ControlError::ConnectionClosed);
                        }
                        // Peer died mid-envelope — the unit is malformed.
                        return Err(ControlError::BadEnvelope {
                            reason: format!("connection closed after {} of {} bytes", filled, ENVELOPE_SIZE),
                        });
                    }
                    filled += n;
                    if filled == ENVELOPE_SIZE {
                        filled = 0;
                        let env = Envelope::decode(&wire)?;
                        self.dispatcher.dispatch(&env, &self.outbox).await?;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use framelink_core::SessionId;
    use framelink_proto::payload;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl MessageHandler for CountingHandler {
        async fn handle(&self, _value: &[u8], _outbox: &ActionSender) -> Result<(), ControlError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ControlError::HandshakeMismatch { expected: "n/a" });
            }
            Ok(())
        }
    }

    struct AckingHandler;

    #[async_trait]
    impl MessageHandler for AckingHandler {
        async fn handle(&self, value: &[u8], outbox: &ActionSender) -> Result<(), ControlError> {
            let req = payload::StartStream::decode(value)?;
            outbox.stream_ack(req.session_id)
        }
    }

    fn start_stream_wire(id: u64) -> [u8; ENVELOPE_SIZE] {
        Envelope::request(
            RequestKind::StartStream,
            payload::StartStream {
                session_id: SessionId(id),
            }
            .encode(),
        )
        .unwrap()
        .encode()
    }

    #[tokio::test]
    async fn failing_handler_terminates_run_without_further_dispatch() {
        // Scenario 3: handler error → ERROR state, no more dispatching
        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = Dispatcher::new().on_request(
            RequestKind::StartStream,
            Box::new(CountingHandler {
                calls: Arc::clone(&calls),
                fail: true,
            }),
        );
        let (mut engine, _tx, _stop) = ControlProtocol::new(dispatcher, 4);

        let (mut ours, mut theirs) = tokio::io::duplex(4 * ENVELOPE_SIZE);
        theirs.write_all(&start_stream_wire(1)).await.unwrap();
        theirs.write_all(&start_stream_wire(2)).await.unwrap();

        let err = engine.run(&mut ours).await.unwrap_err();
        assert!(matches!(err, ControlError::HandlerFailed { subtype, .. }
            if subtype == RequestKind::StartStream as u8));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unregistered_handler_is_fatal() {
        let (mut engine, _tx, _stop) = ControlProtocol::new(Dispatcher::new(), 4);
        let (mut ours, mut theirs) = tokio::io::duplex(4 * ENVELOPE_SIZE);
        theirs.write_all(&start_stream_wire(1)).await.unwrap();

        let err = engine.run(&mut ours).await.unwrap_err();
        assert!(matches!(err, ControlError::UnregisteredHandler { subtype, .. }
            if subtype == RequestKind::StartStream as u8));
    }

    #[tokio::test]
    async fn out_of_range_subtype_is_fatal() {
        let (mut engine, _tx, _stop) = ControlProtocol::new(Dispatcher::new(), 4);
        let (mut ours, mut theirs) = tokio::io::duplex(4 * ENVELOPE_SIZE);

        let mut wire = Envelope::request(RequestKind::SessionInit, Bytes::new())
            .unwrap()
            .encode();
        wire[1] = RequestKind::COUNT as u8; // first invalid subtype
        theirs.write_all(&wire).await.unwrap();

        let err = engine.run(&mut ours).await.unwrap_err();
        assert!(matches!(err, ControlError::UnknownSubtype { .. }));
    }

    #[tokio::test]
    async fn queued_actions_are_sent_and_replies_dispatched() {
        let dispatcher =
            Dispatcher::new().on_request(RequestKind::StartStream, Box::new(AckingHandler));
        let (mut engine, tx, stop) = ControlProtocol::new(dispatcher, 4);
        tx.session_ping(SessionId(3), framelink_core::Timestamp::ZERO)
            .unwrap();

        let (mut ours, mut theirs) = tokio::io::duplex(8 * ENVELOPE_SIZE);

        let peer = async {
            // Receive the queued ping
            let mut wire = [0u8; ENVELOPE_SIZE];
            theirs.read_exact(&mut wire).await.unwrap();
            let ping = Envelope::decode(&wire).unwrap();
            assert_eq!(ping.subtype, RequestKind::SessionPing as u8);

            // Ask for a stream; expect the handler's ack back
            theirs.write_all(&start_stream_wire(3)).await.unwrap();
            theirs.read_exact(&mut wire).await.unwrap();
            let ack = Envelope::decode(&wire).unwrap();
            assert_eq!(ack.class, MessageClass::Response);
            assert_eq!(ack.subtype, ResponseKind::StreamAck as u8);
            let body = payload::SessionAck::decode(&ack.value).unwrap();
            assert_eq!(body.session_id, SessionId(3));

            stop.teardown();
        };

        let (ran, ()) = tokio::join!(engine.run(&mut ours), peer);
        ran.unwrap();
    }

    #[tokio::test]
    async fn peer_close_is_connection_error() {
        let (mut engine, _tx, _stop) = ControlProtocol::new(Dispatcher::new(), 4);
        let (mut ours, theirs) = tokio::io::duplex(ENVELOPE_SIZE);
        drop(theirs);
        let err = engine.run(&mut ours).await.unwrap_err();
        assert!(matches!(err, ControlError::ConnectionClosed));
    }
}
