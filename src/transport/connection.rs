//! The connection actor: owns the socket, the pending-request table, and
//! the connect/reconnect/auth state machine described by
//! `IDLE → CONNECTING → GREETING → AUTH? → READY → (BROKEN → CONNECTING …)`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::defaults;
use crate::error::{ClientError, ServerError, TransportError};
use crate::transport::pending::{DecodeMode, PendingRequest, PendingTable, Reply};
use crate::wire::auth;
use crate::wire::codec::{
    self, GenericResponseBody, RequestBody, RequestHeader, ResponseBody, ResponseHeader,
};
use crate::wire::request_type;

/// A cheap, `Clone`-able handle to a connection actor. All state lives in
/// the actor's task; this struct only holds a channel to it plus the bits
/// needed to fail fast client-side (`max_pending_requests`,
/// `request_timeout`) without round-tripping to the actor.
#[derive(Clone)]
pub struct Connection {
    tx: mpsc::UnboundedSender<ActorMessage>,
    pending_count: Arc<AtomicUsize>,
    max_pending_requests: Option<usize>,
    request_timeout: Option<Duration>,
    /// `true` whenever the actor is outside `READY` (reconnecting or never
    /// yet connected). Checked synchronously by [`Connection::request`] so
    /// that ids issued while `BROKEN` are rejected immediately rather than
    /// silently queued until the socket comes back (`spec.md` §4.1).
    broken: Arc<AtomicBool>,
}

/// The result of a successful `ping`, used by schema discovery to harvest
/// the current `schema_id`.
#[derive(Debug, Clone, Copy)]
pub struct PingReply {
    pub schema_id: Option<u64>,
}

enum ActorMessage {
    Request {
        request_type: u8,
        schema_id: Option<u64>,
        body: RequestBody,
        decode: DecodeMode,
        respond: oneshot::Sender<Result<(ResponseHeader, Reply), TransportError>>,
    },
    Close,
}

impl Connection {
    /// Perform the initial connect (respecting `connect_attempts` and
    /// `connect_timeout`) and spawn the actor task that owns the socket for
    /// the rest of the connection's life, including any later reconnects.
    pub async fn connect(config: Config) -> Result<Connection, ClientError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let max_pending_requests = config.max_pending_requests;
        let request_timeout = config.request_timeout;
        let pending_count = Arc::new(AtomicUsize::new(0));
        let broken = Arc::new(AtomicBool::new(true));

        tokio::spawn(run(config, rx, pending_count.clone(), broken.clone(), ready_tx));

        ready_rx
            .await
            .map_err(|_| TransportError::Closed)?
            .map_err(ClientError::Transport)?;

        Ok(Connection {
            tx,
            pending_count,
            max_pending_requests,
            request_timeout,
            broken,
        })
    }

    /// Close the connection: the actor's task exits, draining the pending
    /// table with [`TransportError::Closed`].
    pub fn close(&self) {
        let _ = self.tx.send(ActorMessage::Close);
    }

    async fn request(
        &self,
        request_type: u8,
        schema_id: Option<u64>,
        body: RequestBody,
        decode: DecodeMode,
    ) -> Result<(ResponseHeader, Reply), TransportError> {
        if self.broken.load(Ordering::Relaxed) {
            return Err(TransportError::ConnectionLost(
                "connection is not ready (reconnecting)".into(),
            ));
        }

        if let Some(max) = self.max_pending_requests {
            if self.pending_count.load(Ordering::Relaxed) >= max {
                return Err(TransportError::TooManyPendingRequests(max));
            }
        }

        let (respond, receiver) = oneshot::channel();
        self.tx
            .send(ActorMessage::Request {
                request_type,
                schema_id,
                body,
                decode,
                respond,
            })
            .map_err(|_| TransportError::Closed)?;

        let receive = async {
            receiver
                .await
                .map_err(|_| TransportError::ConnectionLost("connection actor exited".into()))?
        };

        match self.request_timeout {
            Some(duration) => match timeout(duration, receive).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::RequestTimeout),
            },
            None => receive.await,
        }
    }

    pub(crate) async fn execute_typed(
        &self,
        request_type: u8,
        schema_id: Option<u64>,
        body: RequestBody,
    ) -> Result<(ResponseHeader, ResponseBody), ClientError> {
        let (header, reply) = self
            .request(request_type, schema_id, body, DecodeMode::Typed)
            .await?;
        match reply {
            Reply::Typed(body) => Ok((header, body)),
            Reply::Generic(_) => unreachable!("a typed request always decodes a typed reply"),
        }
    }

    pub(crate) async fn execute_generic(
        &self,
        request_type: u8,
        schema_id: Option<u64>,
        body: RequestBody,
    ) -> Result<(ResponseHeader, GenericResponseBody), ClientError> {
        let (header, reply) = self
            .request(request_type, schema_id, body, DecodeMode::Generic)
            .await?;
        match reply {
            Reply::Generic(body) => Ok((header, body)),
            Reply::Typed(_) => unreachable!("a generic request always decodes a generic reply"),
        }
    }

    /// A raw select against `space_id`/`index_id`, decoded generically.
    /// Used by schema discovery against the metadata spaces.
    pub async fn select_generic(
        &self,
        space_id: u32,
        index_id: u32,
        limit: u32,
        offset: u32,
        iterator: crate::wire::Iterator,
        key: crate::wire::WireTuple,
    ) -> Result<Vec<rmpv::Value>, ClientError> {
        let (header, body) = self
            .execute_generic(
                request_type::SELECT,
                None,
                RequestBody::Select {
                    space_id,
                    index_id,
                    limit,
                    offset,
                    iterator,
                    key,
                },
            )
            .await?;
        match body {
            GenericResponseBody::Data(rows) => Ok(rows),
            GenericResponseBody::Error(message) => {
                Err(ClientError::Server(ServerError::new(header.code, message)))
            }
        }
    }

    pub async fn ping(&self) -> Result<PingReply, ClientError> {
        let (header, body) = self
            .execute_typed(request_type::PING, None, RequestBody::Ping)
            .await?;
        match body {
            ResponseBody::Data(_) => Ok(PingReply {
                schema_id: header.schema_id,
            }),
            ResponseBody::Error(message) => {
                Err(ClientError::Server(ServerError::new(header.code, message)))
            }
        }
    }
}

type Socket = (ReadHalf<TcpStream>, WriteHalf<TcpStream>);

async fn run(
    config: Config,
    mut rx: mpsc::UnboundedReceiver<ActorMessage>,
    pending_count: Arc<AtomicUsize>,
    broken: Arc<AtomicBool>,
    ready: oneshot::Sender<Result<(), TransportError>>,
) {
    // `PendingTable` mirrors its entry count into `pending_count`, the same
    // `Arc` the `Connection` handle holds, so sends can fail fast against
    // `max_pending_requests` without a round trip through the actor.
    let mut pending = PendingTable::new(pending_count);

    let mut sync_counter: u32 = 0;
    let mut ready = Some(ready);

    let socket = match initial_connect(&config).await {
        Ok(socket) => socket,
        Err(err) if config.reconnect_always => {
            // `reconnect_always` asks for a handle now and a connection
            // later: hand the caller a `Connection` immediately and keep
            // retrying in the background instead of failing the initial
            // callback (`spec.md` §6 `reconnect_always`).
            warn!(%err, "initial connect failed, retrying in background (reconnect_always)");
            if let Some(ready) = ready.take() {
                let _ = ready.send(Ok(()));
            }
            reconnect_until_success(&config, &broken).await
        }
        Err(err) => {
            if let Some(ready) = ready.take() {
                let _ = ready.send(Err(err));
            }
            return;
        }
    };

    let (mut read_half, mut write_half) = socket;
    broken.store(false, Ordering::Relaxed);

    if let Some(ready) = ready.take() {
        let _ = ready.send(Ok(()));
    }
    if let Some(callback) = &config.on.connected {
        callback();
    }

    'reconnect: loop {
        loop {
            tokio::select! {
                incoming = codec::read_frame(&mut read_half) => {
                    match incoming {
                        Ok(payload) => dispatch_reply(&payload, &mut pending),
                        Err(err) => {
                            warn!(%err, "connection lost while reading");
                            break;
                        }
                    }
                }
                message = rx.recv() => {
                    match message {
                        Some(ActorMessage::Request { request_type, schema_id, body, decode, respond }) => {
                            sync_counter = next_sync(sync_counter, &pending);
                            let sync = sync_counter;
                            let header = RequestHeader { request_type, sync, schema_id };
                            if let Err(err) = codec::write_frame(&mut write_half, &header, &body).await {
                                let _ = respond.send(Err(err));
                                break;
                            }
                            pending.insert(sync, PendingRequest { decode, respond });
                        }
                        Some(ActorMessage::Close) | None => {
                            broken.store(true, Ordering::Relaxed);
                            pending.drain_with_error(|| TransportError::Closed);
                            return;
                        }
                    }
                }
            }
        }

        // Entering `BROKEN`: flip the shared flag before anything else so
        // `Connection::request` starts rejecting new sends synchronously
        // instead of letting them queue silently until the next reconnect
        // (`spec.md` §4.1 "Ids issued while BROKEN are rejected with
        // transport error synchronously").
        broken.store(true, Ordering::Relaxed);
        pending.drain_with_error(|| TransportError::ConnectionLost("connection lost".into()));
        if let Some(callback) = &config.on.disconnected {
            callback();
        }

        if config.reconnect_period.is_zero() && !config.reconnect_always {
            return;
        }

        let (r, w) = reconnect_until_success(&config, &broken).await;
        read_half = r;
        write_half = w;
        if let Some(callback) = &config.on.connected {
            callback();
        }
        continue 'reconnect;
    }
}

/// Retry `connect_once` on `config.reconnect_period` until one succeeds,
/// clearing `broken` the moment it does. Used both for the background
/// retry loop after a mid-session disconnect and for the `reconnect_always`
/// path when the very first connect attempt never got a socket at all.
async fn reconnect_until_success(config: &Config, broken: &Arc<AtomicBool>) -> Socket {
    loop {
        if !config.reconnect_period.is_zero() {
            tokio::time::sleep(config.reconnect_period).await;
        }
        match connect_once(config).await {
            Ok(socket) => {
                broken.store(false, Ordering::Relaxed);
                return socket;
            }
            Err(err) => {
                debug!(%err, "reconnect attempt failed");
                continue;
            }
        }
    }
}

fn next_sync(mut sync: u32, pending: &PendingTable) -> u32 {
    loop {
        sync = sync.wrapping_add(1);
        if !pending.contains(sync) {
            return sync;
        }
    }
}

fn dispatch_reply(payload: &[u8], pending: &mut PendingTable) {
    let header = match codec::peek_header(payload) {
        Ok(header) => header,
        Err(err) => {
            warn!(%err, "dropping malformed frame");
            return;
        }
    };

    let entry = match pending.remove(header.sync) {
        Some(entry) => entry,
        None => {
            debug!(sync = header.sync, "reply for unknown request id, dropping");
            return;
        }
    };

    let result = match entry.decode {
        DecodeMode::Typed => codec::decode_response(payload).map(|(h, b)| (h, Reply::Typed(b))),
        DecodeMode::Generic => {
            codec::decode_generic_response(payload).map(|(h, b)| (h, Reply::Generic(b)))
        }
    };
    let _ = entry.respond.send(result);
}

#[instrument(skip(config))]
async fn initial_connect(config: &Config) -> Result<Socket, TransportError> {
    let mut attempts_remaining = config.connect_attempts.max(1);
    let mut last_error = None;

    while attempts_remaining > 0 {
        match connect_once(config).await {
            Ok(socket) => return Ok(socket),
            // Auth failure is terminal: the credentials are wrong, so
            // retrying the same handshake again would only waste attempts.
            Err(err @ TransportError::AuthFailed(_)) => return Err(err),
            Err(err) => {
                last_error = Some(err);
                attempts_remaining -= 1;
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        TransportError::ConnectFailed(
            config.host.clone(),
            std::io::Error::new(std::io::ErrorKind::Other, "no connection attempts made"),
        )
    }))
}

async fn connect_once(config: &Config) -> Result<Socket, TransportError> {
    let address = (config.host.as_str(), config.port);
    let connect = TcpStream::connect(address);

    let stream = match config.connect_timeout {
        Some(duration) => timeout(duration, connect)
            .await
            .map_err(|_| {
                TransportError::ConnectFailed(
                    config.host.clone(),
                    std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
                )
            })?
            .map_err(|e| TransportError::ConnectFailed(config.host.clone(), e))?,
        None => connect
            .await
            .map_err(|e| TransportError::ConnectFailed(config.host.clone(), e))?,
    };

    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let salt = read_greeting(&mut read_half).await?;

    if let Some(credentials) = &config.credentials {
        authenticate(&mut read_half, &mut write_half, credentials, &salt).await?;
    }

    info!(host = %config.host, port = config.port, "connected");
    Ok((read_half, write_half))
}

async fn read_greeting<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<String, TransportError> {
    let mut buffer = vec![0u8; defaults::GREETING_LENGTH];
    reader
        .read_exact(&mut buffer)
        .await
        .map_err(|e| TransportError::ConnectFailed("greeting".into(), e))?;

    let salt_line = &buffer[defaults::GREETING_LINE_LENGTH..];
    let salt = String::from_utf8_lossy(salt_line)
        .trim_end_matches('\0')
        .trim()
        .to_owned();
    Ok(salt)
}

async fn authenticate(
    read_half: &mut ReadHalf<TcpStream>,
    write_half: &mut WriteHalf<TcpStream>,
    credentials: &crate::config::Credentials,
    salt: &str,
) -> Result<(), TransportError> {
    let scramble = auth::scramble(salt, &credentials.password)
        .map_err(|e| TransportError::AuthFailed(e.to_string()))?;

    let header = RequestHeader {
        request_type: request_type::AUTH,
        sync: 0,
        schema_id: None,
    };
    let body = RequestBody::Auth {
        user: credentials.user.clone(),
        scramble,
    };
    codec::write_frame(write_half, &header, &body).await?;

    let payload = codec::read_frame(read_half).await?;
    let (response_header, response_body) = codec::decode_response(&payload)?;
    match response_body {
        ResponseBody::Data(_) => Ok(()),
        ResponseBody::Error(message) => Err(TransportError::AuthFailed(format!(
            "{} ({:#06x})",
            message, response_header.code
        ))),
    }
}
