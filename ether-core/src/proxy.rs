//! Client side of the proxy transport.
//!
//! `ProxyEther` forwards each Ether operation to an `ether-proxy` server with strict
//! request/reply discipline. For `recv` the client drives the polling loop itself: every
//! round trip asks the server for one non-blocking poll at the client's watermark.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use futures::SinkExt;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::config::DEFAULT_POLL_INTERVAL_MS;
use crate::error::{EtherError, Result};
use crate::ether::{Ether, MessageStream, RecvQuery};
use crate::ipc::{self, EtherReply, EtherRequest, ReturnValue};
use crate::models::{AsyncMessage, Posting, Trace};

struct Connection {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    /// Set while a request is awaiting its reply. Still set on the next call means the
    /// previous caller gave up mid round trip and the stream holds a stale reply.
    in_flight: bool,
}

impl Connection {
    async fn dial(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            framed: Framed::new(stream, ipc::frame_codec()),
            in_flight: false,
        })
    }
}

#[derive(Clone)]
pub struct ProxyEther {
    addr: String,
    conn: Arc<Mutex<Connection>>,
    poll_interval: Duration,
}

async fn round_trip(
    addr: &str,
    conn: &Mutex<Connection>,
    request: &EtherRequest,
) -> Result<ReturnValue> {
    let frame = ipc::encode(request)?;
    let mut conn = conn.lock().await;

    if conn.in_flight {
        tracing::warn!("Abandoned request on proxy connection, redialling {}", addr);
        *conn = Connection::dial(addr).await?;
    }

    conn.in_flight = true;
    conn.framed.send(frame).await?;
    let reply = match conn.framed.next().await {
        Some(frame) => frame?,
        None => return Err(EtherError::transport("proxy closed the connection")),
    };
    conn.in_flight = false;

    let reply: EtherReply = ipc::decode(&reply)?;
    reply.into_result()
}

fn unexpected(command: &str, payload: &ReturnValue) -> EtherError {
    EtherError::transport(format!(
        "malformed return value for {}: {:?}",
        command, payload
    ))
}

impl ProxyEther {
    pub async fn connect(addr: &str) -> Result<Self> {
        let conn = Connection::dial(addr).await?;
        tracing::info!("Connected to ether proxy at {}", addr);
        Ok(Self {
            addr: addr.to_string(),
            conn: Arc::new(Mutex::new(conn)),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn call(&self, request: &EtherRequest) -> Result<ReturnValue> {
        round_trip(&self.addr, &self.conn, request).await
    }
}

/// Cursor state owned by a single proxied `recv` stream.
struct RemotePoll {
    addr: String,
    conn: Arc<Mutex<Connection>>,
    query: RecvQuery,
    watermark: DateTime<Utc>,
    interval: Duration,
    pending: VecDeque<AsyncMessage>,
    polled: bool,
}

impl RemotePoll {
    async fn poll(&mut self) -> Result<()> {
        let request = EtherRequest::Recv {
            query: self.query.clone(),
            start: self.watermark,
        };
        match round_trip(&self.addr, &self.conn, &request).await? {
            ReturnValue::Messages(msgs) => {
                if let Some(sent) = msgs.last().and_then(|m| m.sent_at) {
                    self.watermark = sent;
                }
                self.pending.extend(msgs);
                Ok(())
            }
            other => Err(unexpected("recv", &other)),
        }
    }
}

#[async_trait]
impl Ether for ProxyEther {
    async fn send(&self, msg: &mut AsyncMessage) -> Result<i64> {
        msg.check_sendable()?;
        let request = EtherRequest::Send {
            message: msg.clone(),
        };
        match self.call(&request).await? {
            ReturnValue::Sent {
                message_id,
                sent_at,
            } => {
                msg.id = Some(message_id);
                msg.sent_at = Some(sent_at);
                Ok(message_id)
            }
            other => Err(unexpected("send", &other)),
        }
    }

    async fn begin_trace(
        &self,
        name: &str,
        msg: &mut AsyncMessage,
        duration: Duration,
    ) -> Result<Trace> {
        msg.check_can_begin_trace()?;
        let request = EtherRequest::BeginTrace {
            name: name.to_string(),
            message: msg.clone(),
            duration,
        };
        match self.call(&request).await? {
            ReturnValue::TraceBegun {
                trace,
                message_id,
                sent_at,
            } => {
                msg.trace = Some(trace.clone());
                msg.id = Some(message_id);
                msg.sent_at = Some(sent_at);
                msg.starts_trace = true;
                Ok(trace)
            }
            other => Err(unexpected("begin_trace", &other)),
        }
    }

    async fn end_trace(&self, trace: &mut Trace) -> Result<()> {
        trace.check_can_end()?;
        let request = EtherRequest::EndTrace {
            trace: trace.clone(),
        };
        match self.call(&request).await? {
            ReturnValue::Nil => {
                trace.active = false;
                Ok(())
            }
            other => Err(unexpected("end_trace", &other)),
        }
    }

    fn recv(&self, query: RecvQuery) -> MessageStream {
        let state = RemotePoll {
            addr: self.addr.clone(),
            conn: Arc::clone(&self.conn),
            watermark: query.start_or_now(),
            query,
            interval: self.poll_interval,
            pending: VecDeque::new(),
            polled: false,
        };

        stream::unfold(state, |mut st| async move {
            loop {
                if let Some(msg) = st.pending.pop_front() {
                    return Some((Ok(msg), st));
                }
                if st.polled {
                    if !st.query.blocking {
                        return None;
                    }
                    tokio::time::sleep(st.interval).await;
                }
                st.polled = true;

                match st.poll().await {
                    Ok(()) => {}
                    Err(e) if e.is_contract() => {
                        // Retrying the same query cannot succeed.
                        st.query.blocking = false;
                        return Some((Err(e), st));
                    }
                    Err(e) => {
                        tracing::warn!("recv from proxy {} failed, retrying: {}", st.addr, e);
                    }
                }
            }
        })
        .boxed()
    }

    async fn post(&self, _posting: &Posting) -> Result<()> {
        Err(EtherError::unsupported("post over the proxy transport"))
    }
}
