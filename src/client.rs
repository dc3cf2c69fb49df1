//! Client handle and connection event loop.
//!
//! [`Client::connect`] splits the transport and spawns two tasks:
//! 1. The writer task, which owns the write half (see [`crate::writer`])
//! 2. The event loop, which owns the read half, the [`FrameBuffer`] and the
//!    [`Correlator`]
//!
//! The event loop is the only code that touches the pending-request table.
//! [`Client`] handles talk to it over a command channel, so any number of
//! clones can issue requests concurrently without a lock.
//!
//! # Example
//!
//! ```ignore
//! use mup1_client::{Client, SerialConfig};
//!
//! #[tokio::main]
//! async fn main() -> mup1_client::Result<()> {
//!     let client = Client::builder()
//!         .request_timeout(std::time::Duration::from_secs(2))
//!         .open_serial(&SerialConfig::new("/dev/ttyACM0", 115_200))?;
//!
//!     let pong = client.ping(std::time::Duration::from_secs(1)).await?;
//!     println!("device says {:?}", pong);
//!
//!     if let Some(payload) = client.get("/c?d=a").await? {
//!         println!("{}", payload.to_json());
//!     }
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::backpressure::BackpressureController;
use crate::coap::{CoapMessage, Method, Payload};
use crate::config::ClientConfig;
use crate::correlator::{Correlator, OutboundRequest, Request, Response, ResponseReceiver};
use crate::error::{Mup1Error, Result};
use crate::protocol::{Frame, FrameBuffer, FrameType};
use crate::transport::{self, SerialConfig, Transport};
use crate::writer::{spawn_writer_task, OutboundFrame, WriterHandle};

/// Capacity of the command channel between handles and the event loop.
const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Announcements buffered for slow subscribers.
const ANNOUNCEMENT_CAPACITY: usize = 32;

/// Builder for configuring and connecting a [`Client`].
#[derive(Debug, Clone, Default)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Default deadline for requests that do not set their own.
    ///
    /// Default: 5 seconds
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Maximum number of requests awaiting a response.
    ///
    /// Default: 64, at most 4096
    pub fn max_in_flight(mut self, limit: usize) -> Self {
        self.config.max_in_flight = limit;
        self
    }

    /// How long a request waits for an in-flight slot.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.backpressure_timeout = timeout;
        self
    }

    /// Largest frame accepted from the device.
    ///
    /// Default: 64 KiB
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    /// First message ID to allocate.
    pub fn initial_message_id(mut self, id: u16) -> Self {
        self.config.initial_message_id = Some(id);
        self
    }

    /// Capacity of the writer queue.
    ///
    /// Default: 256
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.writer.channel_capacity = capacity;
        self
    }

    /// How long a frame waits for room in the writer queue.
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.config.writer.send_timeout = timeout;
        self
    }

    /// Run the client over an already open transport.
    pub fn connect<T: Transport>(self, transport: T) -> Result<Client> {
        Client::with_config(transport, self.config)
    }

    /// Open a serial port and run the client over it.
    pub fn open_serial(self, serial: &SerialConfig) -> Result<Client> {
        self.config.validate()?;
        let stream = transport::open_serial(serial)?;
        Client::with_config(stream, self.config)
    }
}

/// Messages from [`Client`] handles to the event loop.
enum Command {
    Request {
        request: Request,
        timeout: Duration,
        permit: OwnedSemaphorePermit,
        reply: oneshot::Sender<Result<OutboundRequest>>,
    },
    Cancel {
        message_id: u16,
        reply: oneshot::Sender<bool>,
    },
    /// Register a ping waiter; the loop replies with the receiver for the pong.
    Ping {
        reply: oneshot::Sender<oneshot::Receiver<Bytes>>,
    },
    Close,
}

/// Why the event loop stopped.
enum Exit {
    Closed,
    Lost(String),
}

/// Handle to a connected device.
///
/// Cheaply cloneable; all clones share one connection. The connection closes
/// when [`Client::close`] is called, when the transport fails, or when every
/// clone is dropped.
#[derive(Debug, Clone)]
pub struct Client {
    commands: mpsc::Sender<Command>,
    writer: WriterHandle,
    limiter: BackpressureController,
    announcements: broadcast::Sender<Bytes>,
    closed: watch::Receiver<bool>,
    request_timeout: Duration,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Run a client with default settings over `transport`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect<T: Transport>(transport: T) -> Result<Self> {
        Self::with_config(transport, ClientConfig::default())
    }

    /// Open a serial port with default client settings.
    pub fn open_serial(serial: &SerialConfig) -> Result<Self> {
        ClientBuilder::new().open_serial(serial)
    }

    /// Run a client with `config` over `transport`.
    pub fn with_config<T: Transport>(transport: T, config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let (reader, write_half) = tokio::io::split(transport);
        let (writer, writer_task) = spawn_writer_task(write_half, config.writer.clone());
        let limiter =
            BackpressureController::with_timeout(config.max_in_flight, config.backpressure_timeout);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (announcements, _) = broadcast::channel(ANNOUNCEMENT_CAPACITY);
        let (closed_tx, closed_rx) = watch::channel(false);

        let first_id = config.first_message_id();
        tracing::info!(
            "connection opened (max in flight {}, first message id {})",
            config.max_in_flight,
            first_id
        );

        let event_loop = EventLoop {
            reader,
            commands: commands_rx,
            frames: FrameBuffer::with_max_frame_size(config.max_frame_size),
            correlator: Correlator::with_capacity(config.max_in_flight).starting_at(first_id),
            ping_waiters: VecDeque::new(),
            announcements: announcements.clone(),
            writer_task,
            limiter: limiter.clone(),
            closed: closed_tx,
            read_buffer_size: config.read_buffer_size,
        };
        tokio::spawn(event_loop.run());

        Ok(Self {
            commands: commands_tx,
            writer,
            limiter,
            announcements,
            closed: closed_rx,
            request_timeout: config.request_timeout,
        })
    }

    /// Submit a request and return as soon as its frame is queued.
    ///
    /// Waits for an in-flight slot first. The returned [`PendingResponse`]
    /// resolves when the request settles and exposes its message ID for
    /// [`Client::cancel`].
    pub async fn begin(&self, request: Request) -> Result<PendingResponse> {
        let permit = match self.limiter.try_reserve() {
            Ok(permit) => permit,
            Err(Mup1Error::BackpressureTimeout) => {
                tracing::debug!(
                    "in-flight limit of {} reached, waiting for a slot",
                    self.limiter.max_in_flight()
                );
                self.limiter.reserve().await?
            }
            Err(e) => return Err(e),
        };
        let timeout = request.timeout.unwrap_or(self.request_timeout);

        let (reply, registered) = oneshot::channel();
        self.command(Command::Request {
            request,
            timeout,
            permit,
            reply,
        })
        .await?;
        let outbound = registered.await.map_err(|_| Mup1Error::ConnectionClosed)??;

        if let Err(e) = self.writer.send(OutboundFrame::new(outbound.frame)).await {
            let _ = self.cancel(outbound.message_id).await;
            return Err(e);
        }

        Ok(PendingResponse {
            message_id: outbound.message_id,
            response: outbound.response,
        })
    }

    /// Submit a request and wait for its response.
    pub async fn send(&self, request: Request) -> Result<Response> {
        self.begin(request).await?.await
    }

    /// GET `uri` (path with optional query).
    pub async fn get(&self, uri: &str) -> Result<Option<Payload>> {
        self.call(Method::Get, uri, None).await
    }

    /// POST `body` as CBOR to `uri`.
    pub async fn post<T: Serialize + ?Sized>(&self, uri: &str, body: &T) -> Result<Option<Payload>> {
        self.call(Method::Post, uri, Some(Payload::from_serialize(body)?))
            .await
    }

    pub async fn put<T: Serialize + ?Sized>(&self, uri: &str, body: &T) -> Result<Option<Payload>> {
        self.call(Method::Put, uri, Some(Payload::from_serialize(body)?))
            .await
    }

    pub async fn delete(&self, uri: &str) -> Result<Option<Payload>> {
        self.call(Method::Delete, uri, None).await
    }

    /// FETCH: query by the identifiers in `body`.
    pub async fn fetch<T: Serialize + ?Sized>(&self, uri: &str, body: &T) -> Result<Option<Payload>> {
        self.call(Method::Fetch, uri, Some(Payload::from_serialize(body)?))
            .await
    }

    /// iPATCH: idempotent partial update.
    pub async fn ipatch<T: Serialize + ?Sized>(&self, uri: &str, body: &T) -> Result<Option<Payload>> {
        self.call(Method::IPatch, uri, Some(Payload::from_serialize(body)?))
            .await
    }

    async fn call(&self, method: Method, uri: &str, payload: Option<Payload>) -> Result<Option<Payload>> {
        let mut request = Request::new(method, uri);
        request.payload = payload;
        self.send(request).await.map(Response::into_payload)
    }

    /// Settle the request `message_id` with `Cancelled`.
    ///
    /// Returns false if it had already settled. The frame already written is
    /// not recalled.
    pub async fn cancel(&self, message_id: u16) -> Result<bool> {
        let (reply, done) = oneshot::channel();
        self.command(Command::Cancel { message_id, reply }).await?;
        done.await.map_err(|_| Mup1Error::ConnectionClosed)
    }

    /// Send a keepalive probe and wait for the device's answer.
    ///
    /// A missing answer fails with `Timeout` carrying message ID 0.
    pub async fn ping(&self, timeout: Duration) -> Result<Bytes> {
        let (reply, registered) = oneshot::channel();
        self.command(Command::Ping { reply }).await?;
        let pong = registered.await.map_err(|_| Mup1Error::ConnectionClosed)?;

        let started = Instant::now();
        self.writer
            .send(OutboundFrame::new(Frame::ping_request().encode()))
            .await?;

        match tokio::time::timeout(timeout, pong).await {
            Ok(Ok(payload)) => {
                tracing::debug!("ping answered in {:?}", started.elapsed());
                Ok(payload)
            }
            Ok(Err(_)) => Err(Mup1Error::ConnectionClosed),
            Err(_) => {
                tracing::warn!("ping not answered within {:?}", timeout);
                Err(Mup1Error::Timeout {
                    message_id: 0,
                    after: timeout,
                })
            }
        }
    }

    /// Receive the payload of every announcement frame from now on.
    pub fn subscribe_announcements(&self) -> broadcast::Receiver<Bytes> {
        self.announcements.subscribe()
    }

    /// Requests currently awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.limiter.in_flight()
    }

    /// True once the connection has shut down, or its event loop or writer
    /// is gone.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.closed.has_changed().is_err() || self.writer.is_closed()
    }

    /// Close the connection. Outstanding requests fail with `ConnectionClosed`.
    pub async fn close(&self) {
        let _ = self.commands.send(Command::Close).await;
        self.closed().await;
    }

    /// Wait until the connection has closed, for whatever reason.
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    async fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Mup1Error::ConnectionClosed)
    }
}

/// A submitted request awaiting settlement.
#[derive(Debug)]
pub struct PendingResponse {
    message_id: u16,
    response: ResponseReceiver,
}

impl PendingResponse {
    pub fn message_id(&self) -> u16 {
        self.message_id
    }
}

impl Future for PendingResponse {
    type Output = Result<Response>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.response)
            .poll(cx)
            .map(|settled| settled.unwrap_or_else(|_| Err(Mup1Error::ConnectionClosed)))
    }
}

/// Single owner of the read half, reassembler and pending table.
struct EventLoop<R> {
    reader: R,
    commands: mpsc::Receiver<Command>,
    frames: FrameBuffer,
    correlator: Correlator,
    ping_waiters: VecDeque<oneshot::Sender<Bytes>>,
    announcements: broadcast::Sender<Bytes>,
    writer_task: JoinHandle<Result<()>>,
    limiter: BackpressureController,
    closed: watch::Sender<bool>,
    read_buffer_size: usize,
}

impl<R: AsyncRead + Unpin> EventLoop<R> {
    async fn run(mut self) {
        let mut buf = vec![0u8; self.read_buffer_size];

        let exit = loop {
            let deadline = self.correlator.next_deadline();
            let wake_at = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400));

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Close) | None => break Exit::Closed,
                    Some(command) => self.on_command(command),
                },
                read = self.reader.read(&mut buf) => match read {
                    Ok(0) => break Exit::Lost("transport reached end of stream".into()),
                    Ok(n) => self.on_bytes(&buf[..n]),
                    Err(e) => break Exit::Lost(e.to_string()),
                },
                _ = tokio::time::sleep_until(wake_at), if deadline.is_some() => {
                    self.correlator.expire(Instant::now());
                }
                written = &mut self.writer_task => match written {
                    Ok(Ok(())) => break Exit::Closed,
                    Ok(Err(e)) => break Exit::Lost(e.to_string()),
                    Err(e) => break Exit::Lost(format!("writer task failed: {}", e)),
                },
            }
        };

        self.shutdown(exit);
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Request {
                request,
                timeout,
                permit,
                reply,
            } => {
                let outcome = self
                    .correlator
                    .send(&request, timeout, Some(permit), Instant::now());
                if let Err(Ok(outbound)) = reply.send(outcome) {
                    // Caller gave up before the frame was written.
                    self.correlator.cancel(outbound.message_id);
                }
            }
            Command::Cancel { message_id, reply } => {
                let _ = reply.send(self.correlator.cancel(message_id));
            }
            Command::Ping { reply } => {
                // Callers whose ping timed out have dropped their receiver.
                self.ping_waiters.retain(|waiter| !waiter.is_closed());
                let (tx, rx) = oneshot::channel();
                if reply.send(rx).is_ok() {
                    self.ping_waiters.push_back(tx);
                }
            }
            Command::Close => {}
        }
    }

    fn on_bytes(&mut self, data: &[u8]) {
        for frame in self.frames.push(data) {
            self.dispatch(frame);
        }
    }

    fn dispatch(&mut self, frame: Frame) {
        match frame.frame_type {
            frame_type if frame_type.is_coap() => {
                match CoapMessage::parse(frame.payload()) {
                    Ok(message) => {
                        self.correlator.on_coap_message(message);
                    }
                    Err(e) => tracing::warn!("dropping unparsable CoAP message: {}", e),
                }
            }
            FrameType::PingResponse => self.on_pong(frame.payload_bytes()),
            FrameType::Announce => {
                tracing::info!(
                    "device announcement: {}",
                    String::from_utf8_lossy(frame.payload())
                );
                let _ = self.announcements.send(frame.payload_bytes());
            }
            FrameType::Trace => {
                tracing::debug!("device trace: {}", String::from_utf8_lossy(frame.payload()));
            }
            other => {
                tracing::debug!("ignoring {:?} frame ({} bytes)", other, frame.payload().len());
            }
        }
    }

    /// Hand a ping answer to the oldest waiter still listening.
    fn on_pong(&mut self, payload: Bytes) {
        while let Some(waiter) = self.ping_waiters.pop_front() {
            if waiter.send(payload.clone()).is_ok() {
                return;
            }
        }
        tracing::debug!("unsolicited ping response ({} bytes)", payload.len());
    }

    fn shutdown(mut self, exit: Exit) {
        self.commands.close();
        self.limiter.close();
        self.writer_task.abort();

        let failed = match exit {
            Exit::Closed => {
                tracing::info!("connection closed");
                self.correlator.close_all()
            }
            Exit::Lost(reason) => {
                tracing::error!("connection lost: {}", reason);
                self.correlator.fail_all(&reason)
            }
        };
        if failed > 0 {
            tracing::debug!("{} outstanding request(s) failed on shutdown", failed);
        }
        if self.frames.dropped_frames() > 0 {
            tracing::info!("{} corrupt frame(s) dropped during session", self.frames.dropped_frames());
        }

        self.ping_waiters.clear();
        let _ = self.closed.send(true);
    }
}
