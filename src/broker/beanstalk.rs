use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Broker, BrokerError, Job, PutOptions, Reservation};
use crate::config::{DEFAULT_TUBE, RESERVE_GRACE_SECS};

/// Single beanstalkd connection speaking the text protocol. A stream that
/// failed or fell out of step is dropped; the next call re-dials and replays
/// the tube selection before sending its command.
pub struct BeanstalkClient {
    addr: String,
    reserve_grace: Duration,
    conn: Mutex<Session>,
}

/// Live stream plus the tube state the server holds for it.
struct Session {
    stream: Option<BufStream<TcpStream>>,
    using: String,
    watched: Vec<String>,
    ignored: Vec<String>,
}

impl Session {
    fn remember_watch(&mut self, tube: &str) {
        self.ignored.retain(|t| t != tube);
        if !self.watched.iter().any(|t| t == tube) {
            self.watched.push(tube.to_string());
        }
    }

    fn remember_ignore(&mut self, tube: &str) {
        self.watched.retain(|t| t != tube);
        if !self.ignored.iter().any(|t| t == tube) {
            self.ignored.push(tube.to_string());
        }
    }

    /// Drops the stream when `result` shows it can no longer be trusted.
    fn check<T>(&mut self, result: Result<T, BrokerError>) -> Result<T, BrokerError> {
        if let Err(e) = &result {
            if e.needs_reconnect() && self.stream.take().is_some() {
                warn!("Broker stream dropped: {e}");
            }
        }
        result
    }
}

/// One parsed response line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Response {
    Using(String),
    Watching(u32),
    NotIgnored,
    Inserted(u64),
    Buried(u64),
    Reserved { id: u64, bytes: usize },
    TimedOut,
    DeadlineSoon,
    Deleted,
    NotFound,
    Error(String),
}

pub(crate) fn parse_response(line: &str) -> Option<Response> {
    let mut parts = line.split_ascii_whitespace();
    let word = parts.next()?;
    let mut num = || parts.next().and_then(|s| s.parse::<u64>().ok());
    let resp = match word {
        "USING" => Response::Using(line[word.len()..].trim().to_string()),
        "WATCHING" => Response::Watching(u32::try_from(num()?).ok()?),
        "NOT_IGNORED" => Response::NotIgnored,
        "INSERTED" => Response::Inserted(num()?),
        "BURIED" => Response::Buried(num()?),
        "RESERVED" => {
            let id = num()?;
            let bytes = usize::try_from(num()?).ok()?;
            Response::Reserved { id, bytes }
        }
        "TIMED_OUT" => Response::TimedOut,
        "DEADLINE_SOON" => Response::DeadlineSoon,
        "DELETED" => Response::Deleted,
        "NOT_FOUND" => Response::NotFound,
        "OUT_OF_MEMORY" | "INTERNAL_ERROR" | "BAD_FORMAT" | "UNKNOWN_COMMAND"
        | "EXPECTED_CRLF" | "JOB_TOO_BIG" | "DRAINING" => Response::Error(word.to_string()),
        _ => return None,
    };
    Some(resp)
}

impl BeanstalkClient {
    pub async fn connect(addr: &str) -> Result<Self, BrokerError> {
        let stream = Self::dial(addr).await?;
        Ok(Self {
            addr: addr.to_string(),
            reserve_grace: Duration::from_secs(RESERVE_GRACE_SECS),
            conn: Mutex::new(Session {
                stream: Some(stream),
                using: DEFAULT_TUBE.to_string(),
                watched: Vec::new(),
                ignored: Vec::new(),
            }),
        })
    }

    /// Connects with a fixed backoff between attempts.
    pub async fn connect_with_retry(
        addr: &str,
        attempts: u32,
        backoff: Duration,
    ) -> Result<Self, BrokerError> {
        let mut attempt = 1;
        loop {
            match Self::connect(addr).await {
                Ok(client) => {
                    info!("Broker connected at {addr}");
                    return Ok(client);
                }
                Err(e) if attempt < attempts => {
                    warn!(attempt, "Broker connect to {addr} failed: {e}, retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    #[cfg(test)]
    fn with_reserve_grace(mut self, grace: Duration) -> Self {
        self.reserve_grace = grace;
        self
    }

    async fn dial(addr: &str) -> Result<BufStream<TcpStream>, BrokerError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(BufStream::new(stream))
    }

    /// Returns the live stream, re-dialing and replaying watch/ignore/use
    /// when the previous one was dropped.
    async fn stream<'a>(&self, session: &'a mut Session) -> Result<&'a mut BufStream<TcpStream>, BrokerError> {
        if session.stream.is_none() {
            let mut stream = Self::dial(&self.addr).await?;
            for tube in &session.watched {
                match Self::exchange(&mut stream, "watch", &format!("watch {tube}"), None).await? {
                    Response::Watching(_) => {}
                    other => return Err(unexpected("watch", other)),
                }
            }
            for tube in &session.ignored {
                match Self::exchange(&mut stream, "ignore", &format!("ignore {tube}"), None).await? {
                    Response::Watching(_) | Response::NotIgnored => {}
                    other => return Err(unexpected("ignore", other)),
                }
            }
            if session.using != DEFAULT_TUBE {
                let line = format!("use {}", session.using);
                match Self::exchange(&mut stream, "use", &line, None).await? {
                    Response::Using(_) => {}
                    other => return Err(unexpected("use", other)),
                }
            }
            info!(addr = %self.addr, "Broker reconnected");
            session.stream = Some(stream);
        }
        session.stream.as_mut().ok_or(BrokerError::Closed)
    }

    async fn send(
        stream: &mut BufStream<TcpStream>,
        line: &str,
        body: Option<&[u8]>,
    ) -> Result<(), BrokerError> {
        stream.write_all(line.as_bytes()).await?;
        stream.write_all(b"\r\n").await?;
        if let Some(body) = body {
            stream.write_all(body).await?;
            stream.write_all(b"\r\n").await?;
        }
        stream.flush().await?;
        Ok(())
    }

    async fn recv(
        stream: &mut BufStream<TcpStream>,
        command: &'static str,
    ) -> Result<Response, BrokerError> {
        let mut line = String::new();
        if stream.read_line(&mut line).await? == 0 {
            return Err(BrokerError::Closed);
        }
        let line = line.trim_end_matches(['\r', '\n']);
        match parse_response(line) {
            Some(Response::Error(code)) => Err(BrokerError::Server(code)),
            Some(resp) => Ok(resp),
            None => Err(BrokerError::Unexpected {
                command,
                response: line.to_string(),
            }),
        }
    }

    async fn exchange(
        stream: &mut BufStream<TcpStream>,
        command: &'static str,
        line: &str,
        body: Option<&[u8]>,
    ) -> Result<Response, BrokerError> {
        Self::send(stream, line, body).await?;
        Self::recv(stream, command).await
    }

    /// Sends one command and maps its reply with `expect`. A reply `expect`
    /// maps to `Unexpected` drops the stream.
    async fn round_trip<T>(
        &self,
        command: &'static str,
        line: &str,
        body: Option<&[u8]>,
        expect: impl FnOnce(Response, &mut Session) -> Result<T, BrokerError>,
    ) -> Result<T, BrokerError> {
        let mut session = self.conn.lock().await;
        let result = match self.stream(&mut *session).await {
            Ok(stream) => Self::exchange(stream, command, line, body).await,
            Err(e) => Err(e),
        };
        let result = result.and_then(|resp| expect(resp, &mut *session));
        session.check(result)
    }
}

fn unexpected(command: &'static str, resp: Response) -> BrokerError {
    BrokerError::Unexpected {
        command,
        response: format!("{resp:?}"),
    }
}

#[async_trait]
impl Broker for BeanstalkClient {
    async fn watch(&self, tube: &str) -> Result<u32, BrokerError> {
        self.round_trip("watch", &format!("watch {tube}"), None, |resp, session| match resp {
            Response::Watching(n) => {
                session.remember_watch(tube);
                Ok(n)
            }
            other => Err(unexpected("watch", other)),
        })
        .await
    }

    async fn ignore(&self, tube: &str) -> Result<u32, BrokerError> {
        self.round_trip("ignore", &format!("ignore {tube}"), None, |resp, session| match resp {
            Response::Watching(n) => {
                session.remember_ignore(tube);
                Ok(n)
            }
            // Refusing to drop the last watched tube leaves exactly one.
            Response::NotIgnored => Ok(1),
            other => Err(unexpected("ignore", other)),
        })
        .await
    }

    async fn use_tube(&self, tube: &str) -> Result<(), BrokerError> {
        self.round_trip("use", &format!("use {tube}"), None, |resp, session| match resp {
            Response::Using(_) => {
                session.using = tube.to_string();
                Ok(())
            }
            other => Err(unexpected("use", other)),
        })
        .await
    }

    async fn put(&self, opts: PutOptions, body: &[u8]) -> Result<u64, BrokerError> {
        let line = format!(
            "put {} {} {} {}",
            opts.priority,
            opts.delay.as_secs(),
            opts.ttr.as_secs().max(1),
            body.len()
        );
        self.round_trip("put", &line, Some(body), |resp, _| match resp {
            Response::Inserted(id) => Ok(id),
            Response::Buried(id) => Err(BrokerError::Buried(id)),
            other => Err(unexpected("put", other)),
        })
        .await
    }

    async fn reserve_with_timeout(&self, timeout: Duration) -> Result<Reservation, BrokerError> {
        let mut session = self.conn.lock().await;
        let limit = timeout + self.reserve_grace;
        let result = match self.stream(&mut *session).await {
            Ok(stream) => Self::reserve_on(stream, timeout, limit).await,
            Err(e) => Err(e),
        };
        session.check(result)
    }

    async fn delete(&self, id: u64) -> Result<(), BrokerError> {
        self.round_trip("delete", &format!("delete {id}"), None, |resp, _| match resp {
            Response::Deleted => Ok(()),
            Response::NotFound => Err(BrokerError::NotFound(id)),
            other => Err(unexpected("delete", other)),
        })
        .await
    }
}

impl BeanstalkClient {
    async fn reserve_on(
        stream: &mut BufStream<TcpStream>,
        timeout: Duration,
        limit: Duration,
    ) -> Result<Reservation, BrokerError> {
        let line = format!("reserve-with-timeout {}", timeout.as_secs());
        Self::send(stream, &line, None).await?;

        let resp = tokio::time::timeout(limit, Self::recv(stream, "reserve"))
            .await
            .map_err(|_| BrokerError::Hung(limit))??;

        match resp {
            Response::Reserved { id, bytes } => {
                let mut body = vec![0u8; bytes + 2];
                stream.read_exact(&mut body).await?;
                body.truncate(bytes);
                debug!(job_id = id, bytes, "reserved job");
                Ok(Reservation::Job(Job { id, body }))
            }
            Response::TimedOut => Ok(Reservation::TimedOut),
            Response::DeadlineSoon => Ok(Reservation::DeadlineSoon),
            other => Err(unexpected("reserve", other)),
        }
    }
}
