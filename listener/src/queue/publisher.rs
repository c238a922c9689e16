//! RabbitMQ publisher for webhook jobs.
//!
//! Every publish opens its own connection, declares the durable queue,
//! publishes one persistent message with publisher confirms enabled, and
//! closes the connection again. Nothing is pooled between calls, so a broken
//! connection can only ever affect the request that opened it.
//!
//! The TCP socket under each connection is opened here rather than by lapin,
//! and a clone of it is kept. lapin's I/O loop outlives a dropped connect
//! future, so shutting that clone down is the only way to guarantee the
//! socket is released after a timeout.

use std::io;
use std::net::{Shutdown, TcpStream as StdTcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions, QueueDeclareOptions},
    tcp::{HandshakeResult, TLSConfig, TcpStream},
    types::FieldTable,
    uri::{AMQPScheme, AMQPUri},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{error, info, warn};

use super::types::Job;

/// AMQP delivery mode asking the broker to write the message to disk.
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// The job was not enqueued. The cause is logged by the publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("PublishFailed")]
pub struct PublishFailed;

/// Destination for authenticated webhook jobs.
#[async_trait]
pub trait JobSink: Send + Sync {
    async fn enqueue(&self, job: Job) -> Result<(), PublishFailed>;
}

/// Broker-level failure, kept inside this module.
#[derive(Debug, Error)]
enum PublishError {
    #[error("invalid broker URL: {0}")]
    InvalidUri(String),

    #[error("failed to connect to RabbitMQ: {0}")]
    Connect(#[source] lapin::Error),

    #[error("session has no open connection")]
    NotConnected,

    #[error("failed to open channel: {0}")]
    Channel(#[source] lapin::Error),

    #[error("failed to declare durable queue: {0}")]
    Declare(#[source] lapin::Error),

    #[error("failed to publish: {0}")]
    Publish(#[source] lapin::Error),

    #[error("broker did not confirm the message: {0}")]
    Unconfirmed(&'static str),

    #[error("timed out after {1:?} during {0}")]
    Timeout(&'static str, Duration),
}

impl PublishError {
    fn stage(&self) -> &'static str {
        match self {
            PublishError::InvalidUri(_) | PublishError::Connect(_) => "connect",
            PublishError::NotConnected | PublishError::Channel(_) => "channel",
            PublishError::Declare(_) => "declare",
            PublishError::Publish(_) => "publish",
            PublishError::Unconfirmed(_) => "confirm",
            PublishError::Timeout(..) => "timeout",
        }
    }
}

#[derive(Default)]
struct SocketSlot {
    stream: Option<StdTcpStream>,
    abandoned: bool,
}

/// Shared handle on the broker socket of one session.
///
/// `track` runs on lapin's blocking connect thread; `shutdown` runs on ours.
/// Once shut down, a socket tracked later is closed immediately, which covers
/// a timeout that fires while the TCP connect is still in progress.
#[derive(Clone)]
struct SocketHandle {
    slot: Arc<Mutex<SocketSlot>>,
    open_sockets: Arc<AtomicUsize>,
}

impl SocketHandle {
    fn new(open_sockets: Arc<AtomicUsize>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(SocketSlot::default())),
            open_sockets,
        }
    }

    fn track(&self, stream: &StdTcpStream) -> io::Result<()> {
        let clone = stream.try_clone()?;
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "socket slot poisoned"))?;

        if slot.abandoned {
            let _ = clone.shutdown(Shutdown::Both);
            return Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connect abandoned after timeout",
            ));
        }

        slot.stream = Some(clone);
        self.open_sockets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Close the socket for every holder, lapin's I/O loop included.
    fn shutdown(&self) {
        let mut slot = match self.slot.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.abandoned = true;

        if let Some(stream) = slot.stream.take() {
            self.open_sockets.fetch_sub(1, Ordering::SeqCst);
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                if e.kind() != io::ErrorKind::NotConnected {
                    warn!(error = %e, "rabbitmq_socket_shutdown_error");
                }
            }
        }
    }
}

/// Open the TCP (and TLS) stream for `uri`, registering it with `socket`.
fn dial(uri: &AMQPUri, limit: Duration, socket: &SocketHandle) -> HandshakeResult {
    let addr = format!("{}:{}", uri.authority.host, uri.authority.port);
    let stream = TcpStream::connect_timeout(addr, limit)?;
    socket.track(&stream)?;

    let stream = match uri.scheme {
        AMQPScheme::AMQP => stream,
        AMQPScheme::AMQPS => stream.into_tls(&uri.authority.host, TLSConfig::default())?,
    };
    stream.set_nonblocking(true)?;
    Ok(stream)
}

/// A broker connection scoped to one publish call.
///
/// Must be finished with [`BrokerSession::close`]. If the session is dropped
/// first (panic or cancelled future) the socket is shut down in `Drop`.
struct BrokerSession {
    connection: Option<Connection>,
    socket: SocketHandle,
}

impl BrokerSession {
    async fn open(
        url: &str,
        limit: Duration,
        open_sockets: &Arc<AtomicUsize>,
    ) -> Result<BrokerSession, PublishError> {
        let uri: AMQPUri = url.parse().map_err(PublishError::InvalidUri)?;
        let socket = SocketHandle::new(Arc::clone(open_sockets));

        let connect: Box<dyn FnOnce(&AMQPUri) -> HandshakeResult + Send + Sync> = {
            let socket = socket.clone();
            Box::new(move |uri: &AMQPUri| dial(uri, limit, &socket))
        };

        match timeout(
            limit,
            Connection::connector(uri, connect, ConnectionProperties::default()),
        )
        .await
        {
            Ok(Ok(connection)) => Ok(BrokerSession {
                connection: Some(connection),
                socket,
            }),
            Ok(Err(e)) => {
                socket.shutdown();
                Err(PublishError::Connect(e))
            }
            Err(_) => {
                socket.shutdown();
                Err(PublishError::Timeout("connect", limit))
            }
        }
    }

    async fn channel(&self) -> Result<Channel, PublishError> {
        let connection = self.connection.as_ref().ok_or(PublishError::NotConnected)?;

        let channel = connection
            .create_channel()
            .await
            .map_err(PublishError::Channel)?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(PublishError::Channel)?;

        Ok(channel)
    }

    /// Declare `queue` durable and publish `job` to it as a persistent message.
    async fn send(&self, queue: &str, job: &Job) -> Result<(), PublishError> {
        let channel = self.channel().await?;

        // Idempotent when the queue already exists as durable
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(PublishError::Declare)?;

        let confirmation = channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions {
                    mandatory: true,
                    ..Default::default()
                },
                job.body(),
                BasicProperties::default().with_delivery_mode(PERSISTENT_DELIVERY_MODE),
            )
            .await
            .map_err(PublishError::Publish)?
            .await
            .map_err(PublishError::Publish)?;

        if confirmation.is_nack() {
            return Err(PublishError::Unconfirmed("nacked"));
        }
        if !confirmation.is_ack() {
            return Err(PublishError::Unconfirmed("confirm mode not active"));
        }
        if confirmation.take_message().is_some() {
            return Err(PublishError::Unconfirmed("returned as unroutable"));
        }

        Ok(())
    }

    async fn close(mut self, limit: Duration) {
        if let Some(connection) = self.connection.take() {
            match timeout(limit, connection.close(200, "Normal shutdown")).await {
                Ok(Ok(())) => info!("rabbitmq_connection_closed"),
                Ok(Err(e)) => warn!(error = %e, "rabbitmq_connection_close_error"),
                Err(_) => warn!(
                    timeout_ms = limit.as_millis() as u64,
                    "rabbitmq_connection_close_timeout"
                ),
            }
        }
        self.socket.shutdown();
    }
}

impl Drop for BrokerSession {
    fn drop(&mut self) {
        if self.connection.take().is_some() {
            warn!("rabbitmq_session_dropped_before_close");
        }
        self.socket.shutdown();
    }
}

/// Publishes jobs to one durable queue, one short-lived connection per job.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

struct PublisherInner {
    url: String,
    queue_name: String,
    timeout: Duration,
    open_sockets: Arc<AtomicUsize>,
}

impl Publisher {
    /// Create a publisher. No connection is made until the first publish.
    ///
    /// `timeout` bounds each broker step (connect, declare + publish, close).
    pub fn new(url: String, queue_name: String, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                url,
                queue_name,
                timeout,
                open_sockets: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.inner.queue_name
    }

    /// Broker sockets currently held by in-flight publishes, counted from
    /// TCP connect, before the AMQP handshake.
    pub fn open_connections(&self) -> usize {
        self.inner.open_sockets.load(Ordering::SeqCst)
    }

    /// Publish `job` to the configured queue and wait for the broker's confirm.
    ///
    /// The connection opened for this call is closed before returning, on
    /// success and on every failure.
    pub async fn publish(&self, job: Job) -> Result<(), PublishFailed> {
        let inner = &self.inner;

        info!("rabbitmq_connecting");
        let session =
            match BrokerSession::open(&inner.url, inner.timeout, &inner.open_sockets).await {
                Ok(session) => session,
                Err(e) => return Err(self.failed(e, &job)),
            };
        info!("rabbitmq_connected");

        let outcome = match timeout(inner.timeout, session.send(&inner.queue_name, &job)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(PublishError::Timeout("publish", inner.timeout)),
        };

        session.close(inner.timeout).await;

        match outcome {
            Ok(()) => {
                info!(
                    queue = %inner.queue_name,
                    body_length = job.len(),
                    "job_enqueued"
                );
                Ok(())
            }
            Err(e) => Err(self.failed(e, &job)),
        }
    }

    fn failed(&self, cause: PublishError, job: &Job) -> PublishFailed {
        error!(
            queue = %self.inner.queue_name,
            stage = cause.stage(),
            cause = %cause,
            body_length = job.len(),
            "PublishFailed"
        );
        PublishFailed
    }
}

#[async_trait]
impl JobSink for Publisher {
    async fn enqueue(&self, job: Job) -> Result<(), PublishFailed> {
        self.publish(job).await
    }
}
