//! The connection engine.
//!
//! All connection state lives here and is touched only by [`Engine::run`],
//! a single task draining two channels through a biased `select!`:
//! commands from the public API first, then transport events. Public
//! methods and transport callbacks never mutate state inline; they enqueue
//! work, which stands in for locks.
//!
//! Outbound scheduling walks the outbox one frame at a time. After a
//! message sends a frame it re-enters the queue through the urgency
//! interleave, so a large message shares the socket instead of
//! monopolising it, and an urgent message overtakes without starving
//! regular traffic. A message whose unacknowledged byte count crosses the
//! configured threshold moves to the icebox until the peer's ACK thaws it.
//! Writing stops when the per-batch byte budget is spent and resumes on
//! the transport's next writeable signal.

use std::{collections::HashMap, sync::Arc};

use bytes::{Bytes, BytesMut};
use log::{debug, info, trace, warn};
use tokio::sync::mpsc;

use crate::{
    builder::{MessageProgress, ProgressState},
    connection::{ConnectionConfig, ConnectionDelegate, RequestHandler},
    frame::FrameHeader,
    inbound::MessageIn,
    outbound::MessageOut,
    protocol::{FrameFlags, MessageNo, MessageType},
    queue::MessageQueue,
    transport::{CloseStatus, Transport, TransportEvent, TransportEvents},
    varint,
};

/// Work enqueued onto the engine by the public API.
pub(crate) enum Command {
    /// Queue an outgoing message (request, response, or ACK).
    Send(MessageOut),
    /// Register a handler for requests with the given `Profile`.
    SetHandler(String, RequestHandler),
    /// Remove the handler for the given `Profile`.
    ClearHandler(String),
    /// Close the connection.
    Close,
}

/// Sending half of the engine's mailbox.
pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;

/// Lifecycle of the connection as the engine sees it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Connecting,
    Connected,
    Closing,
    Closed,
}

pub(crate) struct Engine {
    transport: Box<dyn Transport>,
    events: TransportEvents,
    commands: mpsc::UnboundedReceiver<Command>,
    command_tx: CommandSender,
    delegate: Box<dyn ConnectionDelegate>,
    config: ConnectionConfig,
    state: State,
    /// Messages with frames left to send.
    outbox: MessageQueue,
    /// Messages paused awaiting an ACK.
    icebox: MessageQueue,
    /// Partially received remote requests, by their number.
    pending_requests: HashMap<MessageNo, MessageIn>,
    /// Replies we are owed, by the number of the local request.
    pending_responses: HashMap<MessageNo, MessageIn>,
    handlers: HashMap<String, RequestHandler>,
    /// Number assigned to the most recently queued local request.
    last_message_no: MessageNo,
    /// Highest remote request number accepted so far.
    num_requests_received: MessageNo,
    /// Bytes handed to the transport since the last writeable signal.
    sent_bytes: usize,
    /// Scratch space for assembling one frame.
    frame_buf: BytesMut,
}

impl Engine {
    pub(crate) fn new(
        transport: Box<dyn Transport>,
        events: TransportEvents,
        delegate: Box<dyn ConnectionDelegate>,
        command_tx: CommandSender,
        commands: mpsc::UnboundedReceiver<Command>,
        config: ConnectionConfig,
    ) -> Self {
        let frame_buf =
            BytesMut::with_capacity(FrameHeader::MAX_ENCODED_LEN + config.big_frame_size);
        Self {
            transport,
            events,
            commands,
            command_tx,
            delegate,
            // Nothing is writeable until the transport says so.
            sent_bytes: config.max_send_bytes,
            config,
            state: State::Connecting,
            outbox: MessageQueue::with_capacity(10),
            icebox: MessageQueue::default(),
            pending_requests: HashMap::new(),
            pending_responses: HashMap::new(),
            handlers: HashMap::new(),
            last_message_no: 0,
            num_requests_received: 0,
            frame_buf,
        }
    }

    /// Drive the connection until the transport closes.
    ///
    /// Commands drain ahead of transport events, so work enqueued through
    /// the public API before a frame arrived (handler registrations in
    /// particular) always lands before that frame dispatches.
    pub(crate) async fn run(mut self) {
        let mut commands_open = true;
        loop {
            tokio::select! {
                biased;

                command = self.commands.recv(), if commands_open => match command {
                    Some(command) => self.on_command(command),
                    // Dropping the last `Connection` handle already sent a
                    // close command; nothing further can arrive.
                    None => commands_open = false,
                },

                event = self.events.recv() => match event {
                    Some(event) => {
                        if self.on_transport_event(event) {
                            break;
                        }
                    }
                    None => {
                        // The transport vanished without a close handshake.
                        self.shut_down(CloseStatus::dropped());
                        break;
                    }
                },
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Send(message) => self.queue_message(message),
            Command::SetHandler(profile, handler) => {
                self.handlers.insert(profile, handler);
            }
            Command::ClearHandler(profile) => {
                self.handlers.remove(&profile);
            }
            Command::Close => self.begin_close(),
        }
    }

    /// Returns `true` when the event was terminal and the engine must stop.
    fn on_transport_event(&mut self, event: TransportEvent) -> bool {
        match event {
            TransportEvent::Connected => {
                debug!("transport connected");
                self.state = State::Connected;
                self.delegate.on_connect();
                self.on_writeable();
                false
            }
            TransportEvent::Message { data, binary } => {
                if binary {
                    self.on_frame(&data);
                } else {
                    warn!("ignoring non-binary message");
                }
                false
            }
            TransportEvent::Writeable => {
                self.on_writeable();
                false
            }
            TransportEvent::Closed(status) => {
                self.shut_down(status);
                true
            }
        }
    }

    // Outgoing.

    /// Admit a message to the outbox, assigning its number on first queue.
    fn queue_message(&mut self, mut message: MessageOut) {
        if self.state == State::Closed {
            debug!("dropping message queued after close");
            return;
        }
        if message.number() == 0 {
            self.last_message_no += 1;
            message.set_number(self.last_message_no);
        }
        if message.is_ack() {
            trace!(
                "sending {} #{}, flags={:#04x}",
                message.message_type().name(),
                message.number(),
                message.flags().bits()
            );
        } else {
            info!(
                "sending {} #{}, flags={:#04x}",
                message.message_type().name(),
                message.number(),
                message.flags().bits()
            );
        }
        message.notify_progress(ProgressState::Queued);
        self.outbox.insert(message);
        self.write_frames();
    }

    /// Emit frames while the transport is writeable and the batch budget
    /// lasts, giving each queued message one frame per turn.
    fn write_frames(&mut self) {
        while self.sent_bytes < self.config.max_send_bytes {
            let Some(mut message) = self.outbox.pop() else {
                break;
            };

            // Frames stay small while another message is waiting, unless
            // this message is urgent or only urgent traffic follows.
            let mut max_size = self.config.default_frame_size;
            if message.is_urgent() || self.outbox.front().is_none_or(|next| !next.is_urgent()) {
                max_size = self.config.big_frame_size;
            }
            let payload_cap = max_size.saturating_sub(FrameHeader::RESERVE).max(1);

            self.frame_buf
                .reserve(FrameHeader::MAX_ENCODED_LEN + payload_cap);
            let (frame_flags, frame_len) =
                message.encode_next_frame(&mut self.frame_buf, payload_cap);
            trace!(
                "  sending frame: {} #{}, flags={:#04x}, {} bytes ({} of {} payload sent)",
                message.message_type().name(),
                message.number(),
                frame_flags.bits(),
                frame_len,
                message.bytes_sent(),
                message.payload_len()
            );
            let frame = self.frame_buf.split().freeze();
            self.transport.send(frame);
            self.sent_bytes += frame_len;
            message.notify_progress(ProgressState::Sending);

            if frame_flags.more_coming() {
                if message.needs_ack(self.config.max_unacked_bytes) {
                    trace!(
                        "freezing {} #{}",
                        message.message_type().name(),
                        message.number()
                    );
                    self.icebox.push_back(message);
                } else {
                    self.outbox.insert(message);
                }
            } else {
                self.finish_sending(message);
            }
        }
    }

    /// The last frame of `message` went out.
    fn finish_sending(&mut self, mut message: MessageOut) {
        if message.is_ack() {
            trace!(
                "finished sending {} #{}",
                message.message_type().name(),
                message.number()
            );
        } else {
            info!(
                "finished sending {} #{}, flags={:#04x}",
                message.message_type().name(),
                message.number(),
                message.flags().bits()
            );
        }

        if message.message_type() == MessageType::Request && !message.flags().is_no_reply() {
            message.notify_progress(ProgressState::AwaitingReply);
            if let Some(response) = message.take_pending_response() {
                self.pending_responses.insert(message.number(), response);
            }
        } else {
            message.notify_progress(ProgressState::Complete);
        }
    }

    // Incoming.

    fn on_frame(&mut self, data: &Bytes) {
        let Some((header, consumed)) = FrameHeader::decode(data) else {
            warn!("illegal frame header; dropping frame");
            return;
        };
        let payload = &data[consumed..];
        let Some(kind) = header.flags.message_type() else {
            warn!(
                "unknown frame type {}; dropping frame",
                header.flags.bits() & FrameFlags::TYPE_MASK
            );
            return;
        };
        trace!(
            "received frame: {} #{}, flags={:#04x}, length {}",
            kind.name(),
            header.number,
            header.flags.bits(),
            payload.len()
        );
        match kind {
            MessageType::Request => self.on_request_frame(header, payload),
            MessageType::Response | MessageType::Error => self.on_reply_frame(header, payload),
            MessageType::AckRequest | MessageType::AckResponse => {
                self.on_ack_frame(header.number, kind == MessageType::AckResponse, payload);
            }
        }
    }

    fn on_request_frame(&mut self, header: FrameHeader, payload: &[u8]) {
        let message = if let Some(existing) = self.pending_requests.remove(&header.number) {
            existing
        } else if header.number == self.num_requests_received + 1 {
            self.num_requests_received += 1;
            MessageIn::new(MessageType::Request, header.number, self.command_tx.clone())
        } else {
            warn!(
                "bad incoming request number {} (expected {})",
                header.number,
                self.num_requests_received + 1
            );
            return;
        };
        self.deliver_frame(message, header.flags, payload, true);
    }

    fn on_reply_frame(&mut self, header: FrameHeader, payload: &[u8]) {
        let Some(message) = self.pending_responses.remove(&header.number) else {
            warn!("unexpected response to request #{}", header.number);
            return;
        };
        self.deliver_frame(message, header.flags, payload, false);
    }

    /// Feed one frame to `message`, re-filing it while incomplete and
    /// dispatching it on completion. `is_request` selects the pending map.
    fn deliver_frame(
        &mut self,
        mut message: MessageIn,
        flags: FrameFlags,
        payload: &[u8],
        is_request: bool,
    ) {
        let outcome = match message.received_frame(
            payload,
            flags,
            self.config.max_properties_size,
            self.config.incoming_ack_interval,
        ) {
            Ok(outcome) => outcome,
            Err(violation) => {
                warn!(
                    "dropping malformed {} #{}: {violation}",
                    message.message_type().name(),
                    message.number()
                );
                return;
            }
        };

        if let Some(byte_count) = outcome.ack_due {
            let ack = MessageOut::ack(message.ack_type(), message.number(), byte_count);
            self.queue_message(ack);
        }

        if !outcome.complete {
            let map = if is_request {
                &mut self.pending_requests
            } else {
                &mut self.pending_responses
            };
            map.insert(message.number(), message);
            return;
        }

        let future = message.take_future();
        let mut progress = message.take_progress();
        let bytes_received = message.bytes_received();
        let outgoing_size = message.outgoing_size();
        let message = Arc::new(message);
        if let Some(callback) = progress.as_mut() {
            callback(&MessageProgress {
                state: ProgressState::Complete,
                bytes_sent: outgoing_size,
                bytes_received,
                reply: Some(Arc::clone(&message)),
            });
        }
        if let Some(tx) = future {
            let _ = tx.send(Arc::clone(&message));
        }
        if is_request {
            self.handle_request(message);
        } else {
            self.delegate.on_response_received(message);
        }
    }

    /// Dispatch a completed request to its profile handler, falling back
    /// to the delegate. A failing handler gets answered with `BLIP`/501.
    fn handle_request(&mut self, request: Arc<MessageIn>) {
        let profile = request.property("Profile").map(str::to_owned);
        if let Some(profile) = profile {
            if let Some(handler) = self.handlers.get_mut(&profile) {
                if let Err(error) = handler(Arc::clone(&request)) {
                    warn!("handler for profile {profile:?} failed: {error}");
                    if let Err(send_error) = request.respond_with_error("BLIP", 501, &error.to_string())
                    {
                        debug!("could not send error response: {send_error}");
                    }
                }
                return;
            }
        }
        self.delegate.on_request_received(request);
    }

    /// Apply an ACK to the outgoing message it names, thawing the message
    /// when the acknowledged bytes bring it back under the threshold.
    fn on_ack_frame(&mut self, number: MessageNo, on_reply: bool, payload: &[u8]) {
        let Some((byte_count, _)) = varint::read_uvarint(payload) else {
            warn!("could not parse ACK body for message #{number}");
            return;
        };

        if let Some(message) = self.outbox.find_mut(number, on_reply) {
            message.received_ack(byte_count);
            return;
        }
        let Some(mut message) = self.icebox.remove(number, on_reply) else {
            trace!("ACK of non-current message #{number}");
            return;
        };
        message.received_ack(byte_count);
        if message.needs_ack(self.config.max_unacked_bytes) {
            self.icebox.push_back(message);
        } else {
            trace!(
                "thawing {} #{}",
                message.message_type().name(),
                message.number()
            );
            self.outbox.insert(message);
            self.write_frames();
        }
    }

    // Lifecycle.

    fn on_writeable(&mut self) {
        trace!("transport writeable");
        self.sent_bytes = 0;
        self.write_frames();
    }

    fn begin_close(&mut self) {
        if matches!(self.state, State::Closing | State::Closed) {
            return;
        }
        info!("closing connection");
        self.state = State::Closing;
        self.transport.close();
    }

    /// Tear down all in-flight state. Dropping the pending maps drops the
    /// response placeholders, which fails their futures with a closed
    /// error. Runs at most once.
    fn shut_down(&mut self, status: CloseStatus) {
        if self.state == State::Closed {
            return;
        }
        self.state = State::Closed;
        info!(
            "connection closed: normal={}, code={}, reason={:?}",
            status.normal, status.code, status.reason
        );
        debug!(
            "discarding {} queued and {} frozen outgoing messages, {} partial and {} awaited incoming",
            self.outbox.len(),
            self.icebox.len(),
            self.pending_requests.len(),
            self.pending_responses.len()
        );
        self.outbox.clear();
        self.icebox.clear();
        self.pending_requests.clear();
        self.pending_responses.clear();
        self.handlers.clear();
        self.delegate.on_close(status);
    }
}
