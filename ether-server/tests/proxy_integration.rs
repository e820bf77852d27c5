use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use ether_core::config::DatabaseConfig;
use ether_core::ipc::{self, EtherReply, EtherRequest, ReturnValue};
use ether_core::{
    AsyncMessage, Channel, Ether, EtherError, FaultKind, Posting, ProxyEther, RecvQuery,
    SqliteEther, Trace,
};
use ether_server::server;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::codec::Framed;

const FIVE_MIN: Duration = Duration::from_secs(300);
const POLL: Duration = Duration::from_millis(20);

struct Harness {
    _dir: TempDir,
    local: SqliteEther,
    addr: SocketAddr,
    shutdown: broadcast::Sender<()>,
    server: tokio::task::JoinHandle<anyhow::Result<()>>,
}

async fn start_proxy() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("ether.db").display());
    let local = SqliteEther::open(&DatabaseConfig::new(url))
        .await
        .unwrap()
        .with_poll_interval(POLL);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, rx) = broadcast::channel(1);
    let server = tokio::spawn(server::serve(listener, local.clone(), rx));

    Harness {
        _dir: dir,
        local,
        addr,
        shutdown,
        server,
    }
}

async fn client(addr: SocketAddr) -> ProxyEther {
    ProxyEther::connect(&addr.to_string())
        .await
        .unwrap()
        .with_poll_interval(POLL)
}

fn ping(contents: &str) -> AsyncMessage {
    AsyncMessage::new(Channel::prod(), "Ping", "kza-ping", Some(contents.to_string()))
}

#[tokio::test]
async fn test_ping_pong_through_proxy() {
    let h = start_proxy().await;
    let agent_a = client(h.addr).await;
    let agent_b = client(h.addr).await;
    let channel = Channel::prod();

    let mut b_inbox = agent_b.recv(RecvQuery::new(channel.clone()).of_types(["Ping"]));

    let mut msg = ping("ping 0");
    let mut trace = agent_a.begin_trace("ping-pong", &mut msg, FIVE_MIN).await.unwrap();
    let trace_id = trace.id.expect("trace id from server");
    assert_eq!(msg.trace.as_ref().and_then(|t| t.id), Some(trace_id));
    assert!(msg.id.is_some());
    assert!(msg.sent_at.is_some());

    let received = tokio::time::timeout(Duration::from_secs(5), b_inbox.next())
        .await
        .expect("ping before timeout")
        .unwrap()
        .unwrap();
    assert_eq!(received.id, msg.id);
    assert_eq!(received.sent_at, msg.sent_at);

    let mut a_inbox = agent_a.recv(
        RecvQuery::new(channel.clone())
            .for_trace(trace_id)
            .of_types(["Echo"])
            .since(msg.sent_at.unwrap()),
    );

    let mut reply = AsyncMessage::new(
        channel.clone(),
        "Echo",
        "kza-echo",
        Some(format!("Echo {}", received.contents_or_empty())),
    )
    .in_trace(received.trace.clone().unwrap());
    let reply_id = agent_b.send(&mut reply).await.unwrap();
    assert_eq!(reply.id, Some(reply_id));

    let echoed = tokio::time::timeout(Duration::from_secs(5), a_inbox.next())
        .await
        .expect("echo before timeout")
        .unwrap()
        .unwrap();
    assert_eq!(echoed.contents_or_empty(), "Echo ping 0");

    agent_a.end_trace(&mut trace).await.unwrap();
    assert!(!trace.active);

    let history = Utc::now() - ChronoDuration::hours(1);
    let unscoped: Vec<_> = agent_a
        .recv(RecvQuery::new(channel.clone()).since(history).non_blocking())
        .collect()
        .await;
    assert!(unscoped.is_empty());

    let pinned: Vec<_> = agent_a
        .recv(RecvQuery::new(channel).for_trace(trace_id).since(history).non_blocking())
        .collect()
        .await;
    assert_eq!(pinned.len(), 2);

    let stored = h.local.trace(trace_id).await.unwrap().unwrap();
    assert!(!stored.active);

    let _ = h.shutdown.send(());
}

#[tokio::test]
async fn test_server_errors_arrive_typed() {
    let h = start_proxy().await;
    let proxy = client(h.addr).await;

    let mut trace = proxy.begin_trace("t", &mut ping("ping 0"), FIVE_MIN).await.unwrap();
    let mut stale = trace.clone();
    proxy.end_trace(&mut trace).await.unwrap();

    // The client copy still claims active; the server's store knows better.
    let err = proxy.end_trace(&mut stale).await.unwrap_err();
    assert!(matches!(err, EtherError::PreconditionViolation(_)));
    assert!(stale.active);

    let mut traced = ping("ping 1").in_trace(trace.clone());
    proxy.send(&mut traced).await.unwrap();
    let err = proxy.send(&mut traced).await.unwrap_err();
    assert!(matches!(err, EtherError::PreconditionViolation(_)));

    let err = proxy
        .post(&Posting::new("status", "text", b"up".to_vec()))
        .await
        .unwrap_err();
    assert!(matches!(err, EtherError::UnsupportedFeature(_)));

    let _ = h.shutdown.send(());
}

#[tokio::test]
async fn test_malformed_request_gets_fault_and_connection_survives() {
    let h = start_proxy().await;
    let stream = TcpStream::connect(h.addr).await.unwrap();
    let mut framed = Framed::new(stream, ipc::frame_codec());

    framed.send(Bytes::from_static(b"\xc1 not a command")).await.unwrap();
    let frame = framed.next().await.unwrap().unwrap();
    let reply: EtherReply = ipc::decode(&frame).unwrap();
    assert!(matches!(
        reply,
        EtherReply::Fault {
            kind: FaultKind::Transport,
            ..
        }
    ));

    let request = EtherRequest::BeginTrace {
        name: "after-garbage".to_string(),
        message: ping("ping 0"),
        duration: FIVE_MIN,
    };
    framed.send(ipc::encode(&request).unwrap()).await.unwrap();
    let frame = framed.next().await.unwrap().unwrap();
    let reply: EtherReply = ipc::decode(&frame).unwrap();
    assert!(matches!(
        reply.into_result().unwrap(),
        ReturnValue::TraceBegun { .. }
    ));

    let _ = h.shutdown.send(());
}

#[tokio::test]
async fn test_non_blocking_recv_is_one_round_trip() {
    let h = start_proxy().await;
    let proxy = client(h.addr).await;

    let got = tokio::time::timeout(
        Duration::from_secs(2),
        proxy
            .recv(RecvQuery::new(Channel::prod()).non_blocking())
            .collect::<Vec<_>>(),
    )
    .await
    .expect("non-blocking recv returns");
    assert!(got.is_empty());

    let _ = h.shutdown.send(());
}

#[tokio::test]
async fn test_recv_retries_when_proxy_is_gone() {
    let h = start_proxy().await;
    let proxy = client(h.addr).await;

    let mut inbox = proxy.recv(RecvQuery::new(Channel::prod()));
    let _ = h.shutdown.send(());
    h.server.await.unwrap().unwrap();

    // Transport faults are logged and retried, never surfaced as stream items.
    let next = tokio::time::timeout(Duration::from_millis(200), inbox.next()).await;
    assert!(next.is_err(), "recv should keep retrying, got {:?}", next);
}

#[tokio::test]
async fn test_shutdown_stops_server() {
    let h = start_proxy().await;
    h.shutdown.send(()).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), h.server)
        .await
        .expect("server stops on shutdown")
        .unwrap();
    assert!(result.is_ok());
}

/// A stand-in proxy that answers the n-th request it sees (across all connections) with
/// `respond(n, request)`: a delay and the raw reply frame.
async fn scripted_proxy<F>(respond: F) -> (SocketAddr, Arc<AtomicUsize>)
where
    F: Fn(usize, EtherRequest) -> (Duration, Bytes) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(AtomicUsize::new(0));
    let respond = Arc::new(respond);

    let counter = Arc::clone(&seen);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let respond = Arc::clone(&respond);
            let counter = Arc::clone(&counter);
            tokio::spawn(async move {
                let mut framed = Framed::new(stream, ipc::frame_codec());
                while let Some(Ok(frame)) = framed.next().await {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    let request: EtherRequest = ipc::decode(&frame).unwrap();
                    let (delay, reply) = respond(n, request);
                    tokio::time::sleep(delay).await;
                    if framed.send(reply).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    (addr, seen)
}

fn traced_ping(contents: &str) -> AsyncMessage {
    let trace = Trace::new(Some(1), "t", Utc::now(), ChronoDuration::minutes(5)).unwrap();
    ping(contents).in_trace(trace)
}

fn reply(payload: ReturnValue) -> Bytes {
    ipc::encode(&EtherReply::ret(payload)).unwrap()
}

#[tokio::test]
async fn test_undecodable_reply_fails_call_and_recv_keeps_polling() {
    let (addr, seen) =
        scripted_proxy(|_, _| (Duration::ZERO, Bytes::from_static(b"\xc1\xc1"))).await;
    let proxy = client(addr).await;

    let mut msg = traced_ping("ping 0");
    let err = proxy.send(&mut msg).await.unwrap_err();
    assert!(matches!(err, EtherError::Transport(_)), "got {:?}", err);
    assert!(msg.id.is_none());
    assert!(msg.sent_at.is_none());

    let before = seen.load(Ordering::SeqCst);
    let mut inbox = proxy.recv(RecvQuery::new(Channel::prod()));
    let next = tokio::time::timeout(Duration::from_millis(150), inbox.next()).await;
    assert!(next.is_err(), "recv should keep retrying, got {:?}", next);
    assert!(seen.load(Ordering::SeqCst) >= before + 2);
}

#[tokio::test]
async fn test_wrong_return_value_leaves_caller_objects_untouched() {
    let (addr, _) = scripted_proxy(|_, request| {
        let payload = match request {
            EtherRequest::EndTrace { .. } => ReturnValue::Messages(Vec::new()),
            _ => ReturnValue::Nil,
        };
        (Duration::ZERO, reply(payload))
    })
    .await;
    let proxy = client(addr).await;

    let mut msg = traced_ping("ping 0");
    let err = proxy.send(&mut msg).await.unwrap_err();
    assert!(matches!(err, EtherError::Transport(_)));
    assert!(msg.id.is_none());

    let mut first = ping("ping 1");
    let err = proxy.begin_trace("t", &mut first, FIVE_MIN).await.unwrap_err();
    assert!(matches!(err, EtherError::Transport(_)));
    assert!(first.trace.is_none());
    assert!(first.id.is_none());
    assert!(!first.starts_trace);

    let mut trace = msg.trace.clone().unwrap();
    let err = proxy.end_trace(&mut trace).await.unwrap_err();
    assert!(matches!(err, EtherError::Transport(_)));
    assert!(trace.active);

    let mut inbox = proxy.recv(RecvQuery::new(Channel::prod()));
    let next = tokio::time::timeout(Duration::from_millis(100), inbox.next()).await;
    assert!(next.is_err(), "recv should keep retrying, got {:?}", next);
}

#[tokio::test]
async fn test_abandoned_call_does_not_leak_its_reply() {
    let (addr, _) = scripted_proxy(|n, _| {
        let delay = if n == 0 {
            Duration::from_millis(300)
        } else {
            Duration::ZERO
        };
        let payload = ReturnValue::Sent {
            message_id: 100 + n as i64,
            sent_at: Utc::now(),
        };
        (delay, reply(payload))
    })
    .await;
    let proxy = client(addr).await;

    let mut abandoned = traced_ping("ping 0");
    let gave_up = tokio::time::timeout(Duration::from_millis(50), proxy.send(&mut abandoned)).await;
    assert!(gave_up.is_err());
    assert!(abandoned.id.is_none());

    let mut next = traced_ping("ping 1");
    let id = proxy.send(&mut next).await.unwrap();
    assert_eq!(id, 101);
    assert_eq!(next.id, Some(101));
}
