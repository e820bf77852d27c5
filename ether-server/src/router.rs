use ether_core::ipc::{EtherReply, EtherRequest, ReturnValue};
use ether_core::{Ether, EtherError, SqliteEther};

/// Dispatch one decoded request against the local store and build its reply.
///
/// Failures become `fault` replies so the client always gets exactly one answer.
pub async fn handle_request(request: EtherRequest, ether: &SqliteEther) -> EtherReply {
    let command = request.command();
    tracing::debug!("Dispatching {}", command);

    match dispatch(request, ether).await {
        Ok(payload) => EtherReply::ret(payload),
        Err(e) => {
            if e.is_contract() {
                tracing::debug!("{} rejected: {}", command, e);
            } else {
                tracing::error!("{} failed: {}", command, e);
            }
            EtherReply::fault(&e)
        }
    }
}

async fn dispatch(request: EtherRequest, ether: &SqliteEther) -> Result<ReturnValue, EtherError> {
    match request {
        EtherRequest::Send { mut message } => {
            let message_id = ether.send(&mut message).await?;
            let sent_at = message
                .sent_at
                .ok_or_else(|| EtherError::InvalidRow("sent message has no timestamp".to_string()))?;
            Ok(ReturnValue::Sent {
                message_id,
                sent_at,
            })
        }
        EtherRequest::BeginTrace {
            name,
            mut message,
            duration,
        } => {
            let trace = ether.begin_trace(&name, &mut message, duration).await?;
            let message_id = message
                .id
                .ok_or_else(|| EtherError::InvalidRow("begun trace has no first message".to_string()))?;
            let sent_at = message
                .sent_at
                .ok_or_else(|| EtherError::InvalidRow("sent message has no timestamp".to_string()))?;
            Ok(ReturnValue::TraceBegun {
                trace,
                message_id,
                sent_at,
            })
        }
        EtherRequest::EndTrace { mut trace } => {
            ether.end_trace(&mut trace).await?;
            Ok(ReturnValue::Nil)
        }
        // The server never loops: one poll per request, the client owns the cadence.
        EtherRequest::Recv { query, start } => {
            let messages = ether.poll(&query, start).await?;
            Ok(ReturnValue::Messages(messages))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use ether_core::config::DatabaseConfig;
    use ether_core::{AsyncMessage, Channel, FaultKind, RecvQuery};
    use std::time::Duration;

    async fn open_ether() -> (tempfile::TempDir, SqliteEther) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("ether.db").display());
        let ether = SqliteEther::open(&DatabaseConfig::new(url)).await.unwrap();
        (dir, ether)
    }

    fn ping() -> AsyncMessage {
        AsyncMessage::new(Channel::prod(), "Ping", "kza-ping", Some("ping 0".to_string()))
    }

    async fn begin(ether: &SqliteEther) -> ReturnValue {
        let request = EtherRequest::BeginTrace {
            name: "ping-pong".to_string(),
            message: ping(),
            duration: Duration::from_secs(300),
        };
        handle_request(request, ether).await.into_result().unwrap()
    }

    #[tokio::test]
    async fn test_begin_trace_then_recv() {
        let (_dir, ether) = open_ether().await;
        let (trace, message_id) = match begin(&ether).await {
            ReturnValue::TraceBegun { trace, message_id, .. } => (trace, message_id),
            other => panic!("unexpected payload: {:?}", other),
        };
        assert!(trace.active);

        let request = EtherRequest::Recv {
            query: RecvQuery::new(Channel::prod()).for_trace(trace.id.unwrap()),
            start: Utc::now() - ChronoDuration::minutes(1),
        };
        match handle_request(request, &ether).await.into_result().unwrap() {
            ReturnValue::Messages(msgs) => {
                assert_eq!(msgs.len(), 1);
                assert_eq!(msgs[0].id, Some(message_id));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_blocking_recv_request_returns_after_one_poll() {
        let (_dir, ether) = open_ether().await;
        let request = EtherRequest::Recv {
            query: RecvQuery::new(Channel::prod()),
            start: Utc::now(),
        };
        let reply = tokio::time::timeout(Duration::from_secs(2), handle_request(request, &ether))
            .await
            .expect("server must not block on recv");
        assert_eq!(reply, EtherReply::ret(ReturnValue::Messages(Vec::new())));
    }

    #[tokio::test]
    async fn test_resend_becomes_precondition_fault() {
        let (_dir, ether) = open_ether().await;
        let trace = match begin(&ether).await {
            ReturnValue::TraceBegun { trace, .. } => trace,
            other => panic!("unexpected payload: {:?}", other),
        };

        let mut message = ping().in_trace(trace);
        message.id = Some(1);
        let reply = handle_request(EtherRequest::Send { message }, &ether).await;
        match reply {
            EtherReply::Fault { kind, .. } => assert_eq!(kind, FaultKind::Precondition),
            other => panic!("expected fault, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_end_trace_replies_nil_then_fault() {
        let (_dir, ether) = open_ether().await;
        let trace = match begin(&ether).await {
            ReturnValue::TraceBegun { trace, .. } => trace,
            other => panic!("unexpected payload: {:?}", other),
        };

        let first = handle_request(EtherRequest::EndTrace { trace: trace.clone() }, &ether).await;
        assert_eq!(first, EtherReply::ret(ReturnValue::Nil));

        let second = handle_request(EtherRequest::EndTrace { trace }, &ether).await;
        assert!(matches!(
            second,
            EtherReply::Fault {
                kind: FaultKind::Precondition,
                ..
            }
        ));
    }
}
