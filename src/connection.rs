//! The public face of a BLIP connection.
//!
//! A [`Connection`] owns nothing but the sending half of the engine's
//! mailbox; the engine itself runs as a spawned task for the life of the
//! transport. Requests, handler registration, and close all enqueue work,
//! so every method here is cheap and callable from any task.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use log::debug;
use tokio::sync::{mpsc, oneshot};

use crate::{
    builder::MessageBuilder,
    engine::{Command, CommandSender, Engine},
    error::{ConnectionError, SendError},
    inbound::MessageIn,
    outbound::MessageOut,
    protocol::{MAX_PROPERTIES_SIZE, MessageType},
    transport::{CloseStatus, Transport, TransportEvents},
};

/// Tunable limits of a connection.
///
/// The defaults match the protocol's reference constants; both peers must
/// agree well enough on the ACK thresholds for flow control to make
/// progress, and the receiving side is authoritative.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionConfig {
    /// Frame payload cap while other messages are waiting to send.
    pub default_frame_size: usize,
    /// Frame payload cap for urgent messages or an otherwise idle outbox.
    pub big_frame_size: usize,
    /// Bytes written per writeable signal before the engine pauses.
    pub max_send_bytes: usize,
    /// Unacknowledged bytes after which an outgoing message freezes.
    pub max_unacked_bytes: usize,
    /// Received bytes after which an incoming message owes an ACK.
    pub incoming_ack_interval: usize,
    /// Largest property block accepted from the peer.
    pub max_properties_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            default_frame_size: 4096,
            big_frame_size: 16384,
            max_send_bytes: 50 * 1024,
            max_unacked_bytes: 128_000,
            incoming_ack_interval: 50_000,
            max_properties_size: MAX_PROPERTIES_SIZE,
        }
    }
}

/// Callbacks a connection makes as lifecycle events and messages arrive.
///
/// All methods run on the engine's task and should not block. Every
/// method has a default, so implementations override only what they use;
/// the default for an unhandled request answers `BLIP`/404.
pub trait ConnectionDelegate: Send + 'static {
    /// The transport finished connecting.
    fn on_connect(&mut self) {}

    /// The connection closed. Called exactly once, however many times
    /// `close` was requested.
    fn on_close(&mut self, status: CloseStatus) { let _ = status; }

    /// A request arrived with no matching profile handler.
    fn on_request_received(&mut self, request: Arc<MessageIn>) {
        if let Err(error) = request.not_handled() {
            debug!("could not send default response: {error}");
        }
    }

    /// A reply to a local request arrived. The response future has
    /// already been completed; this is a secondary notification.
    fn on_response_received(&mut self, response: Arc<MessageIn>) { let _ = response; }
}

/// Result of a profile request handler. An `Err` makes the engine answer
/// the request with a `BLIP`/501 error response.
pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// A registered handler for requests carrying a given `Profile`.
pub type RequestHandler = Box<dyn FnMut(Arc<MessageIn>) -> HandlerResult + Send>;

/// Future resolving to the reply of a sent request.
///
/// Resolves to [`ConnectionError::Closed`] when the connection dies with
/// the request outstanding. An error reply from the peer is a success
/// here: a completed [`MessageIn`] whose type is an error. The future
/// keeps the connection open, so awaiting it after dropping every
/// [`Connection`] handle still works.
pub struct ResponseFuture {
    receiver: oneshot::Receiver<Arc<MessageIn>>,
    _guard: Arc<HandleGuard>,
}

impl Future for ResponseFuture {
    type Output = Result<Arc<MessageIn>, ConnectionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.map_err(|_| ConnectionError::Closed))
    }
}

impl std::fmt::Debug for ResponseFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseFuture").finish_non_exhaustive()
    }
}

/// A BLIP connection over a transport.
///
/// Cloning yields another handle to the same connection. When the last
/// handle (and last outstanding [`ResponseFuture`]) is dropped, the
/// connection closes.
///
/// ```no_run
/// use blip::{Connection, ConnectionDelegate, MessageBuilder, transport::loopback_pair};
///
/// struct Quiet;
/// impl ConnectionDelegate for Quiet {}
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let ((north_end, north_events), (south_end, south_events)) = loopback_pair();
/// let north = Connection::new(north_end, north_events, Quiet);
/// let south = Connection::new(south_end, south_events, Quiet);
///
/// south.set_request_handler("ping", |request| {
///     request.respond(MessageBuilder::response_to(&request))?;
///     Ok(())
/// });
///
/// let response = north.send_request(MessageBuilder::request("ping"))?.await?;
/// assert!(!response.is_error());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Connection {
    commands: CommandSender,
    _guard: Arc<HandleGuard>,
}

/// Closes the connection when the last public handle is dropped. The
/// engine keeps its own sender for internal replies, so channel closure
/// alone cannot signal abandonment.
struct HandleGuard {
    commands: CommandSender,
}

impl Drop for HandleGuard {
    fn drop(&mut self) { let _ = self.commands.send(Command::Close); }
}

impl Connection {
    /// Open a connection over `transport` with default limits.
    ///
    /// Spawns the engine task onto the current tokio runtime; callers must
    /// be inside one.
    pub fn new<T, D>(transport: T, events: TransportEvents, delegate: D) -> Self
    where
        T: Transport,
        D: ConnectionDelegate,
    {
        Self::with_config(transport, events, delegate, ConnectionConfig::default())
    }

    /// Open a connection with explicit limits.
    pub fn with_config<T, D>(
        transport: T,
        events: TransportEvents,
        delegate: D,
        config: ConnectionConfig,
    ) -> Self
    where
        T: Transport,
        D: ConnectionDelegate,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let engine = Engine::new(
            Box::new(transport),
            events,
            Box::new(delegate),
            command_tx.clone(),
            command_rx,
            config,
        );
        tokio::spawn(engine.run());
        Self {
            _guard: Arc::new(HandleGuard {
                commands: command_tx.clone(),
            }),
            commands: command_tx,
        }
    }

    /// Send a request and obtain the future for its reply.
    ///
    /// # Errors
    ///
    /// Fails if the builder is not a request, was marked no-reply (use
    /// [`Connection::send`] for those), failed to serialize, or the
    /// connection is already closed.
    pub fn send_request(&self, builder: MessageBuilder) -> Result<ResponseFuture, SendError> {
        if builder.message_type != MessageType::Request {
            return Err(SendError::NotARequest(builder.message_type.name()));
        }
        if builder.no_reply {
            return Err(SendError::NoReply);
        }
        let mut message = MessageOut::from_builder(builder, 0, &self.commands)?;
        let receiver = message.response_receiver().ok_or(SendError::NoReply)?;
        self.commands
            .send(Command::Send(message))
            .map_err(|_| SendError::Closed)?;
        Ok(ResponseFuture {
            receiver,
            _guard: Arc::clone(&self._guard),
        })
    }

    /// Send a request without waiting for a reply. Any response the peer
    /// produces anyway is dropped on its side of the wire.
    ///
    /// # Errors
    ///
    /// Fails if the builder is not a request, fails to serialize, or the
    /// connection is already closed.
    pub fn send(&self, mut builder: MessageBuilder) -> Result<(), SendError> {
        if builder.message_type != MessageType::Request {
            return Err(SendError::NotARequest(builder.message_type.name()));
        }
        builder.no_reply = true;
        let message = MessageOut::from_builder(builder, 0, &self.commands)?;
        self.commands
            .send(Command::Send(message))
            .map_err(|_| SendError::Closed)
    }

    /// Register `handler` for requests whose `Profile` property equals
    /// `profile`, replacing any previous handler. Requests with no
    /// matching handler go to the delegate.
    pub fn set_request_handler<F>(&self, profile: impl Into<String>, handler: F)
    where
        F: FnMut(Arc<MessageIn>) -> HandlerResult + Send + 'static,
    {
        let _ = self
            .commands
            .send(Command::SetHandler(profile.into(), Box::new(handler)));
    }

    /// Remove the handler for `profile`, if any.
    pub fn clear_request_handler(&self, profile: impl Into<String>) {
        let _ = self.commands.send(Command::ClearHandler(profile.into()));
    }

    /// Close the connection. Safe to call more than once; the delegate's
    /// `on_close` still runs exactly once, when the transport reports
    /// closure.
    pub fn close(&self) { let _ = self.commands.send(Command::Close); }
}
