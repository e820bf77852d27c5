//! SQLite-backed Ether.
//!
//! Every write is a single transaction. Reads are a polling "tail -f": each poll selects the
//! rows sent after the consumer's watermark, ordered by `(sent, id)`, then moves the
//! watermark to the last row's timestamp.
//!
//! Known limitation: timestamps are the only cursor and the comparison is strict, so a
//! message committed later with exactly the watermark's timestamp is never yielded.

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use futures::stream::{self, StreamExt};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::config::{DatabaseConfig, DEFAULT_POLL_INTERVAL_MS};
use crate::db;
use crate::error::{EtherError, Result};
use crate::ether::{Ether, MessageStream, RecvQuery};
use crate::models::{AsyncMessage, Channel, Posting, Trace};

#[derive(Clone)]
pub struct SqliteEther {
    pool: SqlitePool,
    poll_interval: Duration,
}

/// A `messages` row joined with its trace.
#[derive(Debug, sqlx::FromRow)]
struct MessageRow {
    id: i64,
    channel: String,
    message_type: String,
    sender: String,
    contents: Option<String>,
    sent: i64,
    starts_trace: bool,
    trace_id: i64,
    trace_name: String,
    trace_start: i64,
    trace_expiry: i64,
    trace_active: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct TraceRow {
    id: i64,
    name: String,
    start: i64,
    expiry: i64,
    active: bool,
}

impl TraceRow {
    fn into_trace(self) -> Result<Trace> {
        Ok(Trace {
            id: Some(self.id),
            name: self.name,
            start: from_micros(self.start)?,
            expiry: from_micros(self.expiry)?,
            active: self.active,
        })
    }
}

impl MessageRow {
    fn trace_row(&self) -> TraceRow {
        TraceRow {
            id: self.trace_id,
            name: self.trace_name.clone(),
            start: self.trace_start,
            expiry: self.trace_expiry,
            active: self.trace_active,
        }
    }

    /// Project the row, reusing trace projections already seen by this consumer.
    fn into_message(self, traces: &mut HashMap<i64, Trace>) -> Result<AsyncMessage> {
        let trace = match traces.get(&self.trace_id) {
            Some(t) => t.clone(),
            None => {
                let t = self.trace_row().into_trace()?;
                traces.insert(self.trace_id, t.clone());
                t
            }
        };

        Ok(AsyncMessage {
            channel: Channel::new(self.channel),
            message_type: self.message_type,
            sender: self.sender,
            contents: self.contents,
            sources: Vec::new(),
            trace: Some(trace),
            attachments: Vec::new(),
            id: Some(self.id),
            sent_at: Some(from_micros(self.sent)?),
            starts_trace: self.starts_trace,
        })
    }
}

/// Current time at the store's resolution, so callers see what a later read returns.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| EtherError::InvalidRow(format!("timestamp out of range: {}", micros)))
}

impl SqliteEther {
    /// Connect to the database at `config.url`, creating it and its schema if needed.
    pub async fn open(config: &DatabaseConfig) -> Result<Self> {
        let pool = db::create_pool(config).await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        db::init_schema(&pool).await?;
        Ok(Self {
            pool,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub async fn trace(&self, id: i64) -> Result<Option<Trace>> {
        let row: Option<TraceRow> =
            sqlx::query_as("SELECT id, name, start, expiry, active FROM traces WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(TraceRow::into_trace).transpose()
    }

    pub async fn posting(&self, name: &str) -> Result<Option<Posting>> {
        let posting: Option<Posting> = sqlx::query_as("SELECT name, type, contents FROM postings WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(posting)
    }

    /// Every channel a message has ever been sent on.
    pub async fn channels(&self) -> Result<Vec<Channel>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT name FROM channels ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(name,)| Channel::new(name)).collect())
    }

    /// Run a single non-blocking poll and collect the result.
    pub async fn poll(&self, query: &RecvQuery, watermark: DateTime<Utc>) -> Result<Vec<AsyncMessage>> {
        let mut traces = HashMap::new();
        fetch_batch(&self.pool, query, watermark)
            .await?
            .into_iter()
            .map(|row| row.into_message(&mut traces))
            .collect()
    }
}

/// Insert `msg` inside an open transaction. Returns `(id, sent)`.
async fn insert_message(
    conn: &mut SqliteConnection,
    msg: &AsyncMessage,
    trace_id: i64,
    starts_trace: bool,
) -> Result<(i64, DateTime<Utc>)> {
    // The first write takes SQLite's write lock; stamping after it keeps `sent` in commit order.
    sqlx::query("INSERT OR IGNORE INTO channels (name) VALUES (?)")
        .bind(msg.channel.name())
        .execute(&mut *conn)
        .await?;
    let sent = now();

    let id = sqlx::query(
        r#"
        INSERT INTO messages (channel, type, sender, contents, has_attachments, sent, trace_id, starts_trace)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(msg.channel.name())
    .bind(&msg.message_type)
    .bind(&msg.sender)
    .bind(&msg.contents)
    .bind(!msg.attachments.is_empty())
    .bind(to_micros(sent))
    .bind(trace_id)
    .bind(starts_trace)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    Ok((id, sent))
}

fn push_in_filter(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, values: &[String]) {
    if values.is_empty() {
        qb.push(" AND 0");
        return;
    }
    qb.push(" AND ").push(column).push(" IN (");
    let mut list = qb.separated(", ");
    for value in values {
        list.push_bind(value.clone());
    }
    list.push_unseparated(")");
}

async fn fetch_batch(
    pool: &SqlitePool,
    query: &RecvQuery,
    watermark: DateTime<Utc>,
) -> Result<Vec<MessageRow>> {
    let mut qb = QueryBuilder::<Sqlite>::new(
        r#"
        SELECT m.id, m.channel, m.type AS message_type, m.sender, m.contents, m.sent,
               m.starts_trace, m.trace_id,
               t.name AS trace_name, t.start AS trace_start, t.expiry AS trace_expiry,
               t.active AS trace_active
        FROM messages m
        JOIN traces t ON m.trace_id = t.id
        WHERE m.channel = "#,
    );
    qb.push_bind(query.channel.name().to_string());
    qb.push(" AND m.sent > ").push_bind(to_micros(watermark));

    match query.trace_id {
        Some(trace_id) => {
            qb.push(" AND m.trace_id = ").push_bind(trace_id);
        }
        // Ended traces drop out of unscoped reads for good.
        None => {
            qb.push(" AND t.active = 1");
        }
    }

    if let Some(types) = &query.message_types {
        push_in_filter(&mut qb, "m.type", types);
    }
    if let Some(senders) = &query.senders {
        push_in_filter(&mut qb, "m.sender", senders);
    }

    qb.push(" ORDER BY m.sent, m.id");

    let rows = qb.build_query_as::<MessageRow>().fetch_all(pool).await?;
    Ok(rows)
}

/// Cursor state owned by a single `recv` stream.
struct PollState {
    pool: SqlitePool,
    query: RecvQuery,
    watermark: DateTime<Utc>,
    interval: Duration,
    pending: VecDeque<AsyncMessage>,
    traces: HashMap<i64, Trace>,
    polled: bool,
    finished: bool,
}

impl PollState {
    async fn poll(&mut self) -> Result<()> {
        let rows = fetch_batch(&self.pool, &self.query, self.watermark).await?;
        tracing::debug!(
            "Polled {} for {} new messages after {}",
            self.query.channel,
            rows.len(),
            self.watermark
        );

        if let Some(last) = rows.last() {
            self.watermark = from_micros(last.sent)?;
        }
        for row in rows {
            let msg = row.into_message(&mut self.traces)?;
            self.pending.push_back(msg);
        }
        Ok(())
    }
}

fn poll_stream(state: PollState) -> MessageStream {
    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(msg) = st.pending.pop_front() {
                return Some((Ok(msg), st));
            }
            if st.finished {
                return None;
            }
            if st.polled {
                if !st.query.blocking {
                    return None;
                }
                tokio::time::sleep(st.interval).await;
            }
            st.polled = true;

            if let Err(e) = st.poll().await {
                tracing::error!("recv poll on {} failed: {}", st.query.channel, e);
                st.finished = true;
                return Some((Err(e), st));
            }
        }
    })
    .boxed()
}

#[async_trait]
impl Ether for SqliteEther {
    async fn send(&self, msg: &mut AsyncMessage) -> Result<i64> {
        let trace_id = msg.check_sendable()?;

        let mut tx = self.pool.begin().await?;
        let (id, sent) = insert_message(&mut *tx, msg, trace_id, false).await?;
        tx.commit().await?;

        msg.id = Some(id);
        msg.sent_at = Some(sent);
        tracing::debug!("Sent {}", msg);
        Ok(id)
    }

    async fn begin_trace(
        &self,
        name: &str,
        msg: &mut AsyncMessage,
        duration: Duration,
    ) -> Result<Trace> {
        msg.check_can_begin_trace()?;
        let duration = chrono::Duration::from_std(duration)
            .map_err(|e| EtherError::precondition(format!("invalid trace duration: {}", e)))?;

        let mut trace = Trace::new(None, name, now(), duration)?;
        trace.expiry = trace.expiry.trunc_subsecs(6);

        let mut tx = self.pool.begin().await?;
        let trace_id = sqlx::query(
            "INSERT INTO traces (name, start, expiry, active) VALUES (?, ?, ?, ?)",
        )
        .bind(&trace.name)
        .bind(to_micros(trace.start))
        .bind(to_micros(trace.expiry))
        .bind(true)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        let (id, sent) = insert_message(&mut *tx, msg, trace_id, true).await?;
        tx.commit().await?;

        trace.id = Some(trace_id);
        msg.trace = Some(trace.clone());
        msg.id = Some(id);
        msg.sent_at = Some(sent);
        msg.starts_trace = true;

        tracing::info!("Began {} with message {}", trace, id);
        Ok(trace)
    }

    async fn end_trace(&self, trace: &mut Trace) -> Result<()> {
        let id = trace.check_can_end()?;

        let mut tx = self.pool.begin().await?;
        let affected = sqlx::query("UPDATE traces SET active = 0 WHERE id = ? AND active = 1")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        if affected == 0 {
            return Err(EtherError::precondition(format!(
                "trace {} is unknown or already ended",
                id
            )));
        }

        trace.active = false;
        tracing::info!("Ended trace {}", id);
        Ok(())
    }

    fn recv(&self, query: RecvQuery) -> MessageStream {
        let watermark = query.start_or_now();
        poll_stream(PollState {
            pool: self.pool.clone(),
            query,
            watermark,
            interval: self.poll_interval,
            pending: VecDeque::new(),
            traces: HashMap::new(),
            polled: false,
            finished: false,
        })
    }

    async fn post(&self, posting: &Posting) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO postings (name, type, contents) VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET type = excluded.type, contents = excluded.contents
            "#,
        )
        .bind(&posting.name)
        .bind(&posting.kind)
        .bind(&posting.contents)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::debug!("Posted {}", posting.name);
        Ok(())
    }
}
