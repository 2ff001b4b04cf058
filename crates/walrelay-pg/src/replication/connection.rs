//! Replication-mode connection speaking the frontend/backend protocol directly.

use std::io;

use bytes::{Buf, BytesMut};
use fallible_iterator::FallibleIterator;
use postgres_protocol::authentication::md5_hash;
use postgres_protocol::authentication::sasl::{ChannelBinding, ScramSha256, SCRAM_SHA_256};
use postgres_protocol::escape::escape_identifier;
use postgres_protocol::message::backend::{ErrorFields, Message};
use postgres_protocol::message::frontend;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::conninfo::{parse_connection_string, ConnectionParams};
use super::transport::{CopyRead, ReplicationTransport};
use crate::error::{PgError, PgResult};

/// Backend tag of CopyBothResponse.
const COPY_BOTH_RESPONSE_TAG: u8 = b'W';

/// A `replication=database` connection streaming from a logical slot.
pub struct ReplicationConnection {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    /// Set once either side has sent CopyDone.
    copy_done: bool,
}

impl ReplicationConnection {
    /// Connect to the origin and start streaming from `slot`.
    pub async fn start(
        connection_string: &str,
        slot: &str,
        application_name: &str,
    ) -> PgResult<Self> {
        let mut params = parse_connection_string(connection_string)?;
        if params.application_name.is_none() {
            params.application_name = Some(application_name.to_string());
        }

        let mut conn = Self::connect(&params).await?;
        conn.start_replication(slot).await?;
        Ok(conn)
    }

    /// Open the socket, send the startup packet and authenticate.
    pub async fn connect(params: &ConnectionParams) -> PgResult<Self> {
        if params.requires_tls() {
            return Err(PgError::Connection(format!(
                "sslmode={} is not supported on the replication connection",
                params.sslmode.as_deref().unwrap_or_default()
            )));
        }
        if params.host.starts_with('/') {
            return Err(PgError::Connection(format!(
                "unix socket host '{}' is not supported on the replication connection",
                params.host
            )));
        }

        debug!(
            host = %params.host,
            port = params.port,
            user = %params.user,
            database = %params.database,
            "Connecting to origin in replication mode"
        );

        let stream = TcpStream::connect((params.host.as_str(), params.port))
            .await
            .map_err(|e| PgError::Connection(e.to_string()))?;
        stream.set_nodelay(true)?;

        let mut conn = Self {
            stream,
            read_buf: BytesMut::with_capacity(8192),
            write_buf: BytesMut::new(),
            copy_done: false,
        };

        let application_name = params.application_name.as_deref().unwrap_or("walrelay");
        frontend::startup_message(
            [
                ("user", params.user.as_str()),
                ("database", params.database.as_str()),
                ("replication", "database"),
                ("application_name", application_name),
            ],
            &mut conn.write_buf,
        )?;
        conn.flush_out().await?;

        conn.authenticate(params).await?;
        info!(host = %params.host, port = params.port, "Connected to origin");
        Ok(conn)
    }

    async fn authenticate(&mut self, params: &ConnectionParams) -> PgResult<()> {
        let mut scram: Option<ScramSha256> = None;

        loop {
            match self.read_message().await? {
                Message::AuthenticationOk => debug!("Authenticated"),
                Message::AuthenticationCleartextPassword => {
                    frontend::password_message(params.password.as_bytes(), &mut self.write_buf)?;
                    self.flush_out().await?;
                }
                Message::AuthenticationMd5Password(body) => {
                    let hash = md5_hash(
                        params.user.as_bytes(),
                        params.password.as_bytes(),
                        body.salt(),
                    );
                    frontend::password_message(hash.as_bytes(), &mut self.write_buf)?;
                    self.flush_out().await?;
                }
                Message::AuthenticationSasl(body) => {
                    let mut mechanisms = body.mechanisms();
                    let mut supported = false;
                    while let Some(mechanism) = mechanisms.next()? {
                        supported |= mechanism == SCRAM_SHA_256;
                    }
                    if !supported {
                        return Err(PgError::Connection(
                            "server offered no supported SASL mechanism".into(),
                        ));
                    }

                    let state =
                        ScramSha256::new(params.password.as_bytes(), ChannelBinding::unsupported());
                    frontend::sasl_initial_response(
                        SCRAM_SHA_256,
                        state.message(),
                        &mut self.write_buf,
                    )?;
                    self.flush_out().await?;
                    scram = Some(state);
                }
                Message::AuthenticationSaslContinue(body) => {
                    let state = scram.as_mut().ok_or_else(|| {
                        PgError::Protocol("unexpected SASL continue message".into())
                    })?;
                    state.update(body.data())?;
                    frontend::sasl_response(state.message(), &mut self.write_buf)?;
                    self.flush_out().await?;
                }
                Message::AuthenticationSaslFinal(body) => {
                    let state = scram.as_mut().ok_or_else(|| {
                        PgError::Protocol("unexpected SASL final message".into())
                    })?;
                    state.finish(body.data())?;
                }
                Message::ErrorResponse(body) => {
                    return Err(PgError::Connection(error_text(body.fields())));
                }
                Message::ReadyForQuery(_) => return Ok(()),
                Message::ParameterStatus(_) | Message::BackendKeyData(_) => {}
                Message::NoticeResponse(body) => {
                    info!(notice = %error_text(body.fields()), "Origin notice");
                }
                _ => {
                    return Err(PgError::Protocol(
                        "unexpected message during authentication".into(),
                    ))
                }
            }
        }
    }

    /// Issue START_REPLICATION and wait for the server to enter COPY BOTH mode.
    pub async fn start_replication(&mut self, slot: &str) -> PgResult<()> {
        let query = start_replication_query(slot);
        info!(slot = %slot, "Starting logical replication");

        frontend::query(&query, &mut self.write_buf)?;
        self.flush_out().await?;

        loop {
            // postgres-protocol has no CopyBothResponse; it is consumed here by hand.
            match self.read_buf.first().copied() {
                None => self.fill_read_buf().await?,
                Some(COPY_BOTH_RESPONSE_TAG) => match buffered_message_len(&self.read_buf) {
                    Some(len) => {
                        self.read_buf.advance(len);
                        debug!("Entered COPY BOTH mode");
                        return Ok(());
                    }
                    None => self.fill_read_buf().await?,
                },
                Some(_) => match self.read_message().await? {
                    Message::NoticeResponse(body) => {
                        info!(notice = %error_text(body.fields()), "Origin notice");
                    }
                    Message::ParameterStatus(_) => {}
                    Message::ErrorResponse(body) => {
                        return Err(PgError::StartReplication(error_text(body.fields())));
                    }
                    _ => {
                        return Err(PgError::StartReplication(
                            "server did not enter COPY BOTH mode".into(),
                        ))
                    }
                },
            }
        }
    }

    /// Block until one full message is buffered.
    async fn read_message(&mut self) -> PgResult<Message> {
        loop {
            if let Some(message) = Message::parse(&mut self.read_buf)? {
                return Ok(message);
            }
            self.fill_read_buf().await?;
        }
    }

    async fn fill_read_buf(&mut self) -> PgResult<()> {
        let n = self.stream.read_buf(&mut self.read_buf).await?;
        if n == 0 {
            return Err(closed_by_server());
        }
        Ok(())
    }

    async fn flush_out(&mut self) -> io::Result<()> {
        self.stream.write_all(&self.write_buf).await?;
        self.write_buf.clear();
        self.stream.flush().await
    }

    /// True if the receive buffer holds at least one complete message.
    fn has_buffered_message(&self) -> bool {
        buffered_message_len(&self.read_buf).is_some()
    }
}

impl ReplicationTransport for ReplicationConnection {
    fn try_next_frame(&mut self) -> PgResult<CopyRead> {
        loop {
            if let Some(message) = Message::parse(&mut self.read_buf)? {
                match message {
                    Message::CopyData(body) => return Ok(CopyRead::Data(body.into_bytes())),
                    Message::CopyDone => {
                        self.copy_done = true;
                        return Ok(CopyRead::Done);
                    }
                    Message::NoticeResponse(body) => {
                        warn!(notice = %error_text(body.fields()), "Origin notice");
                        continue;
                    }
                    Message::ParameterStatus(_) => continue,
                    Message::ErrorResponse(body) => {
                        return Err(PgError::Server(error_text(body.fields())));
                    }
                    _ => {
                        return Err(PgError::Protocol(
                            "unexpected message on the COPY stream".into(),
                        ))
                    }
                }
            }

            match self.stream.try_read_buf(&mut self.read_buf) {
                Ok(0) => return Err(closed_by_server()),
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(CopyRead::WouldBlock),
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn wait_readable(&mut self) -> PgResult<()> {
        if self.has_buffered_message() {
            return Ok(());
        }
        self.stream.readable().await?;
        Ok(())
    }

    fn consume_input(&mut self) -> PgResult<()> {
        loop {
            match self.stream.try_read_buf(&mut self.read_buf) {
                Ok(0) => return Err(closed_by_server()),
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn send_copy_data(&mut self, data: &[u8]) -> PgResult<()> {
        frontend::CopyData::new(data)?.write(&mut self.write_buf);
        self.flush_out().await?;
        Ok(())
    }

    async fn close(&mut self) {
        if !self.copy_done {
            frontend::copy_done(&mut self.write_buf);
            self.copy_done = true;
        }
        frontend::terminate(&mut self.write_buf);
        if let Err(e) = self.flush_out().await {
            debug!(error = %e, "Failed to send terminate to origin");
        }
        let _ = self.stream.shutdown().await;
    }
}

fn start_replication_query(slot: &str) -> String {
    format!(
        "START_REPLICATION SLOT {} LOGICAL 0/0 (\"include_transaction\" 'off')",
        escape_identifier(slot)
    )
}

/// Total length of the first message in `buf`, tag included, once it is complete.
fn buffered_message_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < 5 {
        return None;
    }
    let len = 1 + u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    (buf.len() >= len).then_some(len)
}

fn closed_by_server() -> PgError {
    PgError::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "server closed the connection unexpectedly",
    ))
}

/// Render the severity and message fields of an error or notice.
fn error_text(mut fields: ErrorFields<'_>) -> String {
    let mut severity = None;
    let mut message = None;
    while let Ok(Some(field)) = fields.next() {
        let value = String::from_utf8_lossy(field.value_bytes()).into_owned();
        match field.type_() {
            b'S' => severity = Some(value),
            b'M' => message = Some(value),
            _ => {}
        }
    }
    match (severity, message) {
        (Some(severity), Some(message)) => format!("{}: {}", severity, message),
        (None, Some(message)) => message,
        _ => "unknown server error".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_replication_query_quotes_slot() {
        assert_eq!(
            start_replication_query("slot"),
            "START_REPLICATION SLOT \"slot\" LOGICAL 0/0 (\"include_transaction\" 'off')"
        );
        assert_eq!(
            start_replication_query("we\"ird"),
            "START_REPLICATION SLOT \"we\"\"ird\" LOGICAL 0/0 (\"include_transaction\" 'off')"
        );
    }

    #[tokio::test]
    async fn test_connect_rejects_tls() {
        let params = parse_connection_string("host=origin sslmode=require").unwrap();
        let result = ReplicationConnection::connect(&params).await;
        assert!(matches!(result, Err(PgError::Connection(_))));
    }

    #[tokio::test]
    async fn test_connect_rejects_unix_socket() {
        let params = parse_connection_string("host=/var/run/postgresql").unwrap();
        let result = ReplicationConnection::connect(&params).await;
        assert!(matches!(result, Err(PgError::Connection(_))));
    }

    #[test]
    fn test_buffered_message_len() {
        assert_eq!(buffered_message_len(b""), None);
        assert_eq!(buffered_message_len(b"d\0\0"), None);
        assert_eq!(buffered_message_len(b"d\0\0\0\x06a"), None);
        assert_eq!(buffered_message_len(b"d\0\0\0\x06ab"), Some(7));
        assert_eq!(buffered_message_len(b"c\0\0\0\x04d\0"), Some(5));
    }

    mod fake_server {
        use bytes::{BufMut, BytesMut};
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::{TcpListener, TcpStream};

        pub async fn listen() -> (TcpListener, String) {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let conn_str = format!(
                "host=127.0.0.1 port={} user=repl password=secret dbname=origin",
                port
            );
            (listener, conn_str)
        }

        pub fn message(tag: u8, body: &[u8]) -> Vec<u8> {
            let mut buf = BytesMut::new();
            buf.put_u8(tag);
            buf.put_u32(4 + body.len() as u32);
            buf.put_slice(body);
            buf.to_vec()
        }

        pub fn auth(code: u32) -> Vec<u8> {
            message(b'R', &code.to_be_bytes())
        }

        pub fn ready_for_query() -> Vec<u8> {
            message(b'Z', b"I")
        }

        pub fn copy_both_response() -> Vec<u8> {
            // Text format, no columns.
            message(b'W', &[0, 0, 0])
        }

        pub fn error_response(text: &str) -> Vec<u8> {
            let mut body = Vec::new();
            body.push(b'S');
            body.extend_from_slice(b"ERROR\0");
            body.push(b'M');
            body.extend_from_slice(text.as_bytes());
            body.extend_from_slice(b"\0\0");
            message(b'E', &body)
        }

        /// Startup packet parameters as (key, value) pairs.
        pub async fn read_startup(sock: &mut TcpStream) -> Vec<(String, String)> {
            let len = sock.read_u32().await.unwrap() as usize;
            let mut body = vec![0; len - 4];
            sock.read_exact(&mut body).await.unwrap();
            let fields: Vec<String> = body[4..]
                .split(|b| *b == 0)
                .filter(|f| !f.is_empty())
                .map(|f| String::from_utf8_lossy(f).into_owned())
                .collect();
            fields
                .chunks(2)
                .map(|pair| (pair[0].clone(), pair[1].clone()))
                .collect()
        }

        pub async fn read_message(sock: &mut TcpStream) -> (u8, Vec<u8>) {
            let tag = sock.read_u8().await.unwrap();
            let len = sock.read_u32().await.unwrap() as usize;
            let mut body = vec![0; len - 4];
            sock.read_exact(&mut body).await.unwrap();
            (tag, body)
        }

        /// Trust authentication, then wait for the START_REPLICATION query.
        pub async fn accept_until_query(listener: &TcpListener) -> (TcpStream, String) {
            let (mut sock, _) = listener.accept().await.unwrap();
            read_startup(&mut sock).await;
            sock.write_all(&auth(0)).await.unwrap();
            sock.write_all(&ready_for_query()).await.unwrap();

            let (tag, body) = read_message(&mut sock).await;
            assert_eq!(tag, b'Q');
            let query = String::from_utf8_lossy(&body[..body.len() - 1]).into_owned();
            (sock, query)
        }
    }

    async fn next_read(conn: &mut ReplicationConnection) -> PgResult<CopyRead> {
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                match conn.try_next_frame()? {
                    CopyRead::WouldBlock => conn.wait_readable().await?,
                    other => return Ok(other),
                }
            }
        })
        .await
        .expect("no frame within timeout")
    }

    #[tokio::test]
    async fn test_start_replication_and_stream_frames() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use walrelay_core::{Keepalive, Lsn};

        let (listener, conn_str) = fake_server::listen().await;
        let keepalive = Keepalive {
            server_position: Lsn(500),
            send_time: 7,
            reply_requested: true,
        }
        .encode();
        let copy_data = fake_server::message(b'd', &keepalive);

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let startup = fake_server::read_startup(&mut sock).await;
            assert!(startup.contains(&("replication".to_string(), "database".to_string())));
            assert!(startup.contains(&("user".to_string(), "repl".to_string())));
            assert!(startup.contains(&("database".to_string(), "origin".to_string())));
            assert!(startup.contains(&("application_name".to_string(), "relay_test".to_string())));

            sock.write_all(&fake_server::auth(3)).await.unwrap();
            let (tag, body) = fake_server::read_message(&mut sock).await;
            assert_eq!(tag, b'p');
            assert_eq!(body, b"secret\0");
            sock.write_all(&fake_server::auth(0)).await.unwrap();
            sock.write_all(&fake_server::ready_for_query()).await.unwrap();

            let (tag, body) = fake_server::read_message(&mut sock).await;
            assert_eq!(tag, b'Q');
            assert!(String::from_utf8_lossy(&body).starts_with("START_REPLICATION SLOT \"slot\""));

            // CopyBothResponse arrives together with the first half of a frame.
            let mut first = fake_server::copy_both_response();
            first.extend_from_slice(&copy_data[..10]);
            sock.write_all(&first).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            sock.write_all(&copy_data[10..]).await.unwrap();

            let (tag, body) = fake_server::read_message(&mut sock).await;
            assert_eq!(tag, b'd');
            assert_eq!(body, b"feedback");

            sock.write_all(&fake_server::message(b'c', &[])).await.unwrap();

            let (tag, _) = fake_server::read_message(&mut sock).await;
            assert_eq!(tag, b'X');
            assert_eq!(sock.read_u8().await.ok(), None);
        });

        let mut conn = ReplicationConnection::start(&conn_str, "slot", "relay_test")
            .await
            .unwrap();

        assert_eq!(next_read(&mut conn).await.unwrap(), CopyRead::Data(keepalive));
        conn.send_copy_data(b"feedback").await.unwrap();
        assert_eq!(next_read(&mut conn).await.unwrap(), CopyRead::Done);
        conn.close().await;

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_start_replication_error_response() {
        use tokio::io::AsyncWriteExt;

        let (listener, conn_str) = fake_server::listen().await;
        let server = tokio::spawn(async move {
            let (mut sock, _) = fake_server::accept_until_query(&listener).await;
            sock.write_all(&fake_server::error_response(
                "replication slot \"slot\" does not exist",
            ))
            .await
            .unwrap();
            sock.write_all(&fake_server::ready_for_query()).await.unwrap();
            sock
        });

        let result = ReplicationConnection::start(&conn_str, "slot", "relay_test").await;
        match result {
            Err(PgError::StartReplication(message)) => {
                assert_eq!(message, "ERROR: replication slot \"slot\" does not exist");
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_start_replication_rejects_other_result_mode() {
        use tokio::io::AsyncWriteExt;

        let (listener, conn_str) = fake_server::listen().await;
        let server = tokio::spawn(async move {
            let (mut sock, _) = fake_server::accept_until_query(&listener).await;
            // CommandComplete instead of CopyBothResponse.
            sock.write_all(&fake_server::message(b'C', b"SELECT 0\0"))
                .await
                .unwrap();
            sock
        });

        let result = ReplicationConnection::start(&conn_str, "slot", "relay_test").await;
        assert!(matches!(result, Err(PgError::StartReplication(_))));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_authentication_failure() {
        use tokio::io::AsyncWriteExt;

        let (listener, conn_str) = fake_server::listen().await;
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            fake_server::read_startup(&mut sock).await;
            sock.write_all(&fake_server::error_response(
                "password authentication failed for user \"repl\"",
            ))
            .await
            .unwrap();
            sock
        });

        let result = ReplicationConnection::start(&conn_str, "slot", "relay_test").await;
        match result {
            Err(PgError::Connection(message)) => {
                assert!(message.contains("password authentication failed"));
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_closing_stream_is_io_error() {
        use tokio::io::AsyncWriteExt;

        let (listener, conn_str) = fake_server::listen().await;
        let server = tokio::spawn(async move {
            let (mut sock, _) = fake_server::accept_until_query(&listener).await;
            sock.write_all(&fake_server::copy_both_response())
                .await
                .unwrap();
            // Half a CopyData message, then the socket goes away.
            sock.write_all(&fake_server::message(b'd', b"w-truncated")[..6])
                .await
                .unwrap();
        });

        let mut conn = ReplicationConnection::start(&conn_str, "slot", "relay_test")
            .await
            .unwrap();
        server.await.unwrap();

        let result = next_read(&mut conn).await;
        assert!(matches!(result, Err(PgError::Io(_))));
    }

    #[tokio::test]
    async fn test_server_error_during_streaming() {
        use tokio::io::AsyncWriteExt;

        let (listener, conn_str) = fake_server::listen().await;
        let server = tokio::spawn(async move {
            let (mut sock, _) = fake_server::accept_until_query(&listener).await;
            sock.write_all(&fake_server::copy_both_response())
                .await
                .unwrap();
            sock.write_all(&fake_server::error_response("terminating connection"))
                .await
                .unwrap();
            sock
        });

        let mut conn = ReplicationConnection::start(&conn_str, "slot", "relay_test")
            .await
            .unwrap();
        let _sock = server.await.unwrap();

        let result = next_read(&mut conn).await;
        assert!(matches!(result, Err(PgError::Server(_))));
    }
}
