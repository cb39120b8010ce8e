use super::{Backend, Interrupt, QueryResult, Row};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::protocol::backend::{self, AuthRequest, MessageCode};
use crate::protocol::{frontend, Frame, FrameParser, ServerError};
use crate::pubsub::Notification;
use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use scram::ScramClient;
use std::collections::{HashMap, VecDeque};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

const WAKER: Token = Token(0);
const SOCKET: Token = Token(1);

const READ_CHUNK: usize = 8 * 1024;

/// A PostgreSQL session over one non-blocking TCP socket
///
/// The socket is registered with a private `Poll` together with a `Waker`,
/// so a thread blocked in `wait_for_activity` can be interrupted from
/// outside. Every readiness event drains the socket into the frame parser;
/// notifications are queued whenever they are seen, including in the middle
/// of a command's response.
pub struct Connection {
    stream: TcpStream,
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,

    // Protocol parser fed from the socket
    parser: FrameParser,
    read_chunk: Vec<u8>,

    // Outgoing frames not yet written
    write_buffer: BytesMut,

    // Asynchronous traffic
    pending_notifications: VecDeque<Notification>,
    notices: Vec<ServerError>,

    // Session metadata
    parameters: HashMap<String, String>,
    process_id: i32,
    secret_key: i32,

    // Connection state
    eof: bool,
    closed: bool,
}

impl Connection {
    /// Open a TCP connection and run the startup handshake
    pub fn connect(config: &Config) -> Result<Self> {
        let addrs = (config.host.as_str(), config.port).to_socket_addrs()?;

        let mut last_err = None;
        let mut std_stream = None;
        for addr in addrs {
            match std::net::TcpStream::connect_timeout(&addr, config.connect_timeout()) {
                Ok(stream) => {
                    std_stream = Some(stream);
                    break;
                }
                Err(e) => {
                    debug!("Connecting to {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }
        let std_stream = match (std_stream, last_err) {
            (Some(stream), _) => stream,
            (None, Some(e)) => return Err(e.into()),
            (None, None) => {
                return Err(Error::Config(format!(
                    "{} did not resolve to any address",
                    config.host
                )))
            }
        };

        std_stream.set_nodelay(config.tcp_nodelay)?;
        std_stream.set_nonblocking(true)?;

        let mut conn = Self::from_std(std_stream)?;
        conn.startup(config)?;

        info!(
            "Connected to {}:{}/{} as {} (backend pid {})",
            config.host,
            config.port,
            config.database_name(),
            config.user,
            conn.process_id
        );
        Ok(conn)
    }

    fn from_std(std_stream: std::net::TcpStream) -> Result<Self> {
        let mut stream = TcpStream::from_std(std_stream);
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut stream, SOCKET, Interest::READABLE | Interest::WRITABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        Ok(Self {
            stream,
            poll,
            events: Events::with_capacity(16),
            waker,
            parser: FrameParser::new(),
            read_chunk: vec![0u8; READ_CHUNK],
            write_buffer: BytesMut::with_capacity(1024),
            pending_notifications: VecDeque::new(),
            notices: Vec::new(),
            parameters: HashMap::new(),
            process_id: 0,
            secret_key: 0,
            eof: false,
            closed: false,
        })
    }

    /// Server parameter reported at startup or later via ParameterStatus
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    pub fn server_version(&self) -> Option<&str> {
        self.parameter("server_version")
    }

    /// Backend process ID serving this session
    pub fn process_id(&self) -> i32 {
        self.process_id
    }

    /// Secret key for cancel requests
    pub fn secret_key(&self) -> i32 {
        self.secret_key
    }

    fn startup(&mut self, config: &Config) -> Result<()> {
        let deadline = Some(Instant::now() + config.connect_timeout());

        frontend::put_startup(
            &mut self.write_buffer,
            &[
                ("user", config.user.as_str()),
                ("database", config.database_name()),
                ("application_name", config.application_name.as_str()),
                ("client_encoding", "UTF8"),
            ],
        );
        self.flush()?;

        self.authenticate(config, deadline)?;

        loop {
            let frame = self.next_frame(deadline)?;
            match frame.code {
                MessageCode::PARAMETER_STATUS => {
                    let (key, val) = backend::decode_parameter_status(frame.body)?;
                    self.parameters.insert(key, val);
                }
                MessageCode::BACKEND_KEY_DATA => {
                    let (pid, key) = backend::decode_backend_key_data(frame.body)?;
                    self.process_id = pid;
                    self.secret_key = key;
                }
                MessageCode::NOTICE_RESPONSE => self.push_notice(ServerError::parse(&frame.body)),
                MessageCode::NEGOTIATE_PROTOCOL_VERSION => {
                    debug!("Server negotiated protocol options down");
                }
                MessageCode::READY_FOR_QUERY => break,
                MessageCode::ERROR_RESPONSE => {
                    return Err(Error::Server(ServerError::parse(&frame.body)))
                }
                code => return Err(Error::protocol(format!("unexpected {code} during startup"))),
            }
        }

        Ok(())
    }

    fn authenticate(&mut self, config: &Config, deadline: Option<Instant>) -> Result<()> {
        loop {
            match self.read_auth(deadline)? {
                AuthRequest::Ok => return Ok(()),
                AuthRequest::CleartextPassword => {
                    let password = config.password.as_deref().ok_or(Error::PasswordRequired)?;
                    frontend::put_password(&mut self.write_buffer, password);
                    self.flush()?;
                }
                AuthRequest::Sasl(mechanisms) => {
                    if !mechanisms.iter().any(|m| m == "SCRAM-SHA-256") {
                        return Err(Error::UnsupportedAuth(format!(
                            "SASL mechanisms {mechanisms:?}"
                        )));
                    }
                    let password = config.password.as_deref().ok_or(Error::PasswordRequired)?;
                    self.authenticate_scram(&config.user, password, deadline)?;
                }
                AuthRequest::Md5Password => {
                    return Err(Error::UnsupportedAuth(
                        "md5, configure the role for scram-sha-256".to_string(),
                    ))
                }
                req @ (AuthRequest::SaslContinue(_) | AuthRequest::SaslFinal(_)) => {
                    return Err(Error::protocol(format!("unexpected {req:?}")))
                }
                AuthRequest::Other(code) => {
                    return Err(Error::UnsupportedAuth(format!("authentication request {code}")))
                }
            }
        }
    }

    fn authenticate_scram(
        &mut self,
        user: &str,
        password: &str,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let scram = ScramClient::new(user, password, None);
        let (scram, client_first) = scram.client_first();

        frontend::put_sasl_initial_response(
            &mut self.write_buffer,
            "SCRAM-SHA-256",
            client_first.as_bytes(),
        );
        self.flush()?;

        let AuthRequest::SaslContinue(server_first) = self.read_auth(deadline)? else {
            return Err(Error::Auth("expected SASL continue".to_string()));
        };
        let scram = scram
            .handle_server_first(&server_first)
            .map_err(|e| Error::Auth(format!("scram handshake failed: {e}")))?;
        let (scram, client_final) = scram.client_final();

        frontend::put_sasl_response(&mut self.write_buffer, client_final.as_bytes());
        self.flush()?;

        let AuthRequest::SaslFinal(server_final) = self.read_auth(deadline)? else {
            return Err(Error::Auth("expected SASL final".to_string()));
        };
        scram
            .handle_server_final(&server_final)
            .map_err(|e| Error::Auth(format!("scram handshake failed: {e}")))?;

        Ok(())
    }

    fn read_auth(&mut self, deadline: Option<Instant>) -> Result<AuthRequest> {
        let frame = self.next_frame(deadline)?;
        match frame.code {
            MessageCode::AUTHENTICATION => backend::decode_authentication(frame.body),
            MessageCode::ERROR_RESPONSE => Err(Error::Server(ServerError::parse(&frame.body))),
            code => Err(Error::protocol(format!(
                "unexpected {code} during authentication"
            ))),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    /// Write the whole outgoing buffer, waiting for writability as needed
    fn flush(&mut self) -> Result<()> {
        while !self.write_buffer.is_empty() {
            match self.stream.write(&self.write_buffer) {
                Ok(0) => return Err(self.lost(ErrorKind::WriteZero.into())),
                Ok(n) => self.write_buffer.advance(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.poll_once(None)?;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(self.lost(e)),
            }
        }
        Ok(())
    }

    /// Read everything the socket has into the parser.
    ///
    /// The socket is edge-triggered, so this must run until `WouldBlock`
    /// after every readiness event.
    fn fill(&mut self) -> Result<usize> {
        let mut total = 0;
        loop {
            match self.stream.read(&mut self.read_chunk) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => {
                    self.parser.feed(&self.read_chunk[..n]);
                    total += n;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(self.lost(e)),
            }
        }
        trace!("Read {} bytes ({} buffered)", total, self.parser.buffered());
        Ok(total)
    }

    /// Wait for one batch of events. Returns whether the socket was readable.
    fn poll_once(&mut self, timeout: Option<Duration>) -> Result<bool> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        let mut readable = false;
        for event in self.events.iter() {
            match event.token() {
                SOCKET => {
                    if event.is_readable() || event.is_read_closed() || event.is_error() {
                        readable = true;
                    }
                }
                WAKER => trace!("Wait interrupted"),
                _ => {}
            }
        }

        if readable {
            self.fill()?;
        }
        Ok(readable)
    }

    fn next_frame(&mut self, deadline: Option<Instant>) -> Result<Frame> {
        loop {
            if let Some(frame) = self.parser.parse_next()? {
                return Ok(frame);
            }
            if self.eof {
                self.closed = true;
                return Err(Error::ConnectionClosed);
            }

            let timeout = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Io(ErrorKind::TimedOut.into()));
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            self.poll_once(timeout)?;
        }
    }

    /// Handle a frame that may arrive outside of any command
    fn handle_async(&mut self, frame: Frame) -> Result<()> {
        match frame.code {
            MessageCode::NOTIFICATION_RESPONSE => {
                let notification = backend::decode_notification(frame.body)?;
                trace!("Received notification on {:?}", notification.channel());
                self.pending_notifications.push_back(notification);
            }
            MessageCode::NOTICE_RESPONSE => self.push_notice(ServerError::parse(&frame.body)),
            MessageCode::PARAMETER_STATUS => {
                let (key, val) = backend::decode_parameter_status(frame.body)?;
                self.parameters.insert(key, val);
            }
            MessageCode::ERROR_RESPONSE => {
                // Outside a command this is FATAL, e.g. an admin shutdown.
                let err = ServerError::parse(&frame.body);
                warn!("Server terminated the session: {}", err);
                self.closed = true;
                return Err(Error::Server(err));
            }
            code => {
                return Err(Error::protocol(format!(
                    "unexpected {code} outside of a command"
                )))
            }
        }
        Ok(())
    }

    /// Move every complete asynchronous frame out of the parser
    fn absorb_async(&mut self) -> Result<()> {
        while let Some(frame) = self.parser.parse_next()? {
            self.handle_async(frame)?;
        }
        Ok(())
    }

    fn push_notice(&mut self, notice: ServerError) {
        debug!("Server notice: {}", notice);
        self.notices.push(notice);
    }

    fn lost(&mut self, e: std::io::Error) -> Error {
        warn!("Connection lost: {}", e);
        self.closed = true;
        Error::Io(e)
    }

    /// Mark the session unusable when `result` is a connection-level
    /// failure. After a protocol error the rest of the response is still
    /// buffered, so nothing later can be parsed reliably.
    fn check<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_connection_error() && !self.closed {
                warn!("Closing session after {}", e);
                self.closed = true;
            }
        }
        result
    }

    fn run_query(&mut self, command: &str) -> Result<QueryResult> {
        frontend::put_query(&mut self.write_buffer, command);
        self.flush()?;

        let mut result = QueryResult::default();
        let mut columns: Option<Arc<[String]>> = None;
        let mut error = None;

        loop {
            let frame = match self.next_frame(None) {
                Ok(frame) => frame,
                // A FATAL error precedes the server closing the socket
                Err(e) => return Err(error.map(Error::Server).unwrap_or(e)),
            };

            match frame.code {
                MessageCode::ROW_DESCRIPTION => {
                    columns = Some(backend::decode_row_description(frame.body)?.into());
                }
                MessageCode::DATA_ROW => {
                    let values = backend::decode_data_row(frame.body)?;
                    let columns = columns
                        .clone()
                        .ok_or_else(|| Error::protocol("DataRow before RowDescription"))?;
                    result.rows.push(Row::new(columns, values));
                }
                MessageCode::COMMAND_COMPLETE => {
                    let tag = backend::decode_command_complete(frame.body)?;
                    result.rows_affected = backend::rows_affected(&tag);
                    result.tag = tag;
                }
                MessageCode::EMPTY_QUERY_RESPONSE => {}
                MessageCode::ERROR_RESPONSE => error = Some(ServerError::parse(&frame.body)),
                MessageCode::COPY_IN_RESPONSE => {
                    frontend::put_copy_fail(&mut self.write_buffer, "COPY is not supported");
                    self.flush()?;
                }
                MessageCode::COPY_OUT_RESPONSE
                | MessageCode::COPY_DATA
                | MessageCode::COPY_DONE => {}
                MessageCode::READY_FOR_QUERY => break,
                _ => self.handle_async(frame)?,
            }
        }

        match error {
            Some(err) => Err(Error::Server(err)),
            None => Ok(result),
        }
    }
}

impl Backend for Connection {
    fn execute(&mut self, command: &str) -> Result<QueryResult> {
        self.ensure_open()?;
        if command.contains('\0') {
            return Err(Error::InvalidLiteral(
                "commands cannot contain NUL bytes".to_string(),
            ));
        }

        // Keep notifications that arrived earlier ahead of the command's own
        let absorbed = self.absorb_async();
        self.check(absorbed)?;
        let result = self.run_query(command);
        self.check(result)
    }

    fn wait_for_activity(&mut self, timeout: Duration) -> Result<bool> {
        self.ensure_open()?;
        if self.has_pending_notifications() {
            return Ok(true);
        }
        if self.eof {
            self.closed = true;
            return Err(Error::ConnectionClosed);
        }
        let ready = self.poll_once(Some(timeout));
        self.check(ready)
    }

    fn drain_notifications(&mut self) -> Result<Vec<Notification>> {
        self.ensure_open()?;
        let absorbed = self.absorb_async();
        self.check(absorbed)?;
        Ok(self.pending_notifications.drain(..).collect())
    }

    fn has_pending_notifications(&self) -> bool {
        !self.pending_notifications.is_empty() || self.parser.has_frame()
    }

    fn interrupter(&self) -> Arc<dyn Interrupt> {
        self.waker.clone()
    }

    fn take_notices(&mut self) -> Vec<ServerError> {
        std::mem::take(&mut self.notices)
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }

        frontend::put_terminate(&mut self.write_buffer);
        if let Err(e) = self.flush() {
            debug!("Terminate not delivered: {}", e);
        }
        self.closed = true;

        let _ = self.poll.registry().deregister(&mut self.stream);
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotConnected => {}
            Err(e) => return Err(e.into()),
        }
        debug!("Connection to backend pid {} closed", self.process_id);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = Backend::close(self);
    }
}
