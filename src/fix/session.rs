// =============================================================================
// FIX Session Actor — one long-lived session per liquidity provider
// =============================================================================
//
// Lifecycle:
//   Disconnected → Connecting → LogonSent → LoggedOn ⇄ ResendPending
//                → LogoutSent → Disconnected (reconnect with backoff)
//
// The actor owns the socket, the sequence store and the session state machine.
// Everything else talks to it through `FixSessionHandle`:
//   - app messages go in via an mpsc channel (sequence number persisted and
//     fsync'd for critical types before the bytes hit the wire),
//   - MarketData goes out on `md_tx`, ExecutionReport / OrderCancelReject on
//     `exec_tx`, both in strict wire order,
//   - connection state is observable through a watch channel.
//
// Reconnection runs indefinitely with exponential backoff (1 s base, ×2,
// 60 s cap, ±20% jitter) until the handle is dropped. Parse errors are never
// fatal to the process: three consecutive malformed frames drop the
// connection, a lone one is NAKed with a Reject (3).
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::errors::TradeError;
use crate::fix::message::{self, decode, msg_type, tags, FixEncoder, FixMessage};
use crate::fix::store::{Direction, SessionStore};
use crate::runtime_config::FixSessionConfig;
use crate::types::new_cl_ord_id;

/// Connection state of a FIX session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    LogonSent,
    LoggedOn,
    ResendPending,
    LogoutSent,
}

impl SessionStatus {
    pub fn is_logged_on(self) -> bool {
        matches!(self, Self::LoggedOn | Self::ResendPending)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::LogonSent => "LOGON_SENT",
            Self::LoggedOn => "LOGGED_ON",
            Self::ResendPending => "RESEND_PENDING",
            Self::LogoutSent => "LOGOUT_SENT",
        };
        write!(f, "{s}")
    }
}

/// An application message handed to the session for transmission.
#[derive(Debug)]
struct OutboundApp {
    msg_type: &'static str,
    fields: Vec<(u32, String)>,
    /// Persist + fsync the sequence record before the bytes hit the wire.
    critical: bool,
}

/// Inbound application message forwarded to the rest of the engine.
pub type InboundApp = (String, FixMessage);

/// Cloneable handle to a running session actor.
#[derive(Clone)]
pub struct FixSessionHandle {
    pub lp_id: String,
    outbound_tx: mpsc::Sender<OutboundApp>,
    status_rx: watch::Receiver<SessionStatus>,
}

impl FixSessionHandle {
    pub fn status(&self) -> SessionStatus {
        *self.status_rx.borrow()
    }

    pub fn is_logged_on(&self) -> bool {
        self.status().is_logged_on()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx.clone()
    }

    /// Queue an application message. Fails fast with `SessionDown` when the
    /// session is not logged on — callers handle failover; nothing is queued
    /// for a dead session.
    pub async fn send(
        &self,
        msg_type: &'static str,
        fields: Vec<(u32, String)>,
        critical: bool,
    ) -> Result<(), TradeError> {
        if !self.is_logged_on() {
            return Err(TradeError::SessionDown(format!(
                "{} is {}",
                self.lp_id,
                self.status()
            )));
        }
        self.outbound_tx
            .send(OutboundApp {
                msg_type,
                fields,
                critical,
            })
            .await
            .map_err(|_| TradeError::SessionDown(format!("{} actor stopped", self.lp_id)))
    }
}

impl std::fmt::Debug for FixSessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixSessionHandle")
            .field("lp_id", &self.lp_id)
            .field("status", &self.status())
            .finish()
    }
}

// =============================================================================
// Inbound sequencing
// =============================================================================

/// What to do with an inbound message after sequence-number accounting.
#[derive(Debug, PartialEq)]
enum Accepted {
    /// Messages now deliverable in order (the new one and/or drained queue).
    Process(Vec<FixMessage>),
    /// A gap opened: request resend of `begin..=end`; nothing deliverable yet.
    Gap { begin: u64, end: u64 },
    /// Duplicate with PossDupFlag — drop silently.
    Duplicate,
    /// Sequence below expected without PossDupFlag — hard session error.
    Desync { got: u64, expected: u64 },
}

/// Pure inbound-sequence state machine: detects gaps, queues out-of-order
/// messages, releases them in order once the gap fills.
struct InboundSequencer {
    next_expected: u64,
    pending: BTreeMap<u64, FixMessage>,
    gap_requested: bool,
}

impl InboundSequencer {
    fn new(next_expected: u64) -> Self {
        Self {
            next_expected,
            pending: BTreeMap::new(),
            gap_requested: false,
        }
    }

    fn on_message(&mut self, seq: u64, msg: FixMessage) -> Accepted {
        if seq == self.next_expected {
            let mut ready = vec![msg];
            self.next_expected += 1;
            while let Some(next) = self.pending.remove(&self.next_expected) {
                ready.push(next);
                self.next_expected += 1;
            }
            if self.pending.is_empty() {
                self.gap_requested = false;
            }
            return Accepted::Process(ready);
        }

        if seq > self.next_expected {
            self.pending.insert(seq, msg);
            if self.gap_requested {
                // Already asked; keep queueing.
                return Accepted::Process(Vec::new());
            }
            self.gap_requested = true;
            return Accepted::Gap {
                begin: self.next_expected,
                end: seq - 1,
            };
        }

        if msg.poss_dup() {
            Accepted::Duplicate
        } else {
            Accepted::Desync {
                got: seq,
                expected: self.next_expected,
            }
        }
    }

    /// SequenceReset / GapFill: jump the expectation to `new_seq_no` and
    /// release anything now in order.
    fn apply_gap_fill(&mut self, new_seq_no: u64) -> Vec<FixMessage> {
        if new_seq_no > self.next_expected {
            self.next_expected = new_seq_no;
        }
        self.pending = self.pending.split_off(&self.next_expected);
        let mut ready = Vec::new();
        while let Some(next) = self.pending.remove(&self.next_expected) {
            ready.push(next);
            self.next_expected += 1;
        }
        if self.pending.is_empty() {
            self.gap_requested = false;
        }
        ready
    }

    fn in_gap(&self) -> bool {
        self.gap_requested
    }
}

// =============================================================================
// Spawning
// =============================================================================

/// Spawn the session actor and return its handle. The actor reconnects
/// forever; dropping every handle clone stops it.
pub fn spawn(
    config: FixSessionConfig,
    store: Arc<SessionStore>,
    md_tx: mpsc::Sender<InboundApp>,
    exec_tx: mpsc::Sender<InboundApp>,
) -> FixSessionHandle {
    let (outbound_tx, outbound_rx) = mpsc::channel(256);
    let (status_tx, status_rx) = watch::channel(SessionStatus::Disconnected);

    let handle = FixSessionHandle {
        lp_id: config.id.clone(),
        outbound_tx,
        status_rx,
    };

    tokio::spawn(session_task(config, store, status_tx, md_tx, exec_tx, outbound_rx));

    handle
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const LOGON_TIMEOUT: Duration = Duration::from_secs(10);
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
const MAX_CONSECUTIVE_MALFORMED: u32 = 3;

/// Exponential backoff with ±20% jitter.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE
        .checked_mul(1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX))
        .unwrap_or(BACKOFF_CAP)
        .min(BACKOFF_CAP);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    exp.mul_f64(jitter)
}

async fn session_task(
    config: FixSessionConfig,
    store: Arc<SessionStore>,
    status_tx: watch::Sender<SessionStatus>,
    md_tx: mpsc::Sender<InboundApp>,
    exec_tx: mpsc::Sender<InboundApp>,
    mut outbound_rx: mpsc::Receiver<OutboundApp>,
) {
    let mut attempt: u32 = 0;
    loop {
        let _ = status_tx.send(SessionStatus::Connecting);
        let mut reached_logon = false;

        let result = connect_and_run(
            &config,
            &store,
            &status_tx,
            &md_tx,
            &exec_tx,
            &mut outbound_rx,
            &mut reached_logon,
        )
        .await;

        let _ = status_tx.send(SessionStatus::Disconnected);

        match result {
            Ok(()) => {
                info!(session = %config.id, "session stopped (handle dropped)");
                return;
            }
            Err(e) => {
                error!(session = %config.id, error = %e, "session dropped — will reconnect");
            }
        }

        if reached_logon {
            attempt = 0;
        }
        let delay = backoff_delay(attempt);
        attempt = attempt.saturating_add(1);
        debug!(session = %config.id, delay_ms = delay.as_millis() as u64, "reconnect backoff");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            msg = outbound_rx.recv() => {
                if msg.is_none() {
                    info!(session = %config.id, "session stopped during backoff");
                    return;
                }
                warn!(session = %config.id, "app message dropped while disconnected");
            }
        }
    }
}

async fn connect_and_run(
    config: &FixSessionConfig,
    store: &Arc<SessionStore>,
    status_tx: &watch::Sender<SessionStatus>,
    md_tx: &mpsc::Sender<InboundApp>,
    exec_tx: &mpsc::Sender<InboundApp>,
    outbound_rx: &mut mpsc::Receiver<OutboundApp>,
    reached_logon: &mut bool,
) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    info!(session = %config.id, addr = %addr, tls = config.tls, "connecting");

    let tcp = timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
        .await
        .context("connect timed out")?
        .with_context(|| format!("failed to connect to {addr}"))?;
    tcp.set_nodelay(true).ok();

    if config.tls {
        let connector = native_tls::TlsConnector::new().context("TLS connector init failed")?;
        let connector = tokio_native_tls::TlsConnector::from(connector);
        let stream = connector
            .connect(&config.host, tcp)
            .await
            .context("TLS handshake failed")?;
        run_established(stream, config, store, status_tx, md_tx, exec_tx, outbound_rx, reached_logon)
            .await
    } else {
        run_established(tcp, config, store, status_tx, md_tx, exec_tx, outbound_rx, reached_logon)
            .await
    }
}

// =============================================================================
// The established-connection loop
// =============================================================================

#[allow(clippy::too_many_arguments)]
async fn run_established<S>(
    stream: S,
    config: &FixSessionConfig,
    store: &Arc<SessionStore>,
    status_tx: &watch::Sender<SessionStatus>,
    md_tx: &mpsc::Sender<InboundApp>,
    exec_tx: &mpsc::Sender<InboundApp>,
    outbound_rx: &mut mpsc::Receiver<OutboundApp>,
    reached_logon: &mut bool,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let encoder = FixEncoder::new(&config.sender_comp_id, &config.target_comp_id);
    let hbi = Duration::from_secs(config.heart_bt_int);

    if config.reset_on_logon {
        store.reset()?;
    }

    // Logon (A): 98=0 (no encryption), 108=HeartBtInt, 141=reset flag.
    send_message(
        &mut writer,
        store,
        &encoder,
        msg_type::LOGON,
        vec![
            (tags::ENCRYPT_METHOD, "0".to_string()),
            (tags::HEART_BT_INT, config.heart_bt_int.to_string()),
            (
                tags::RESET_SEQ_NUM_FLAG,
                if config.reset_on_logon { "Y" } else { "N" }.to_string(),
            ),
        ],
        false,
    )
    .await?;
    let _ = status_tx.send(SessionStatus::LogonSent);

    let mut sequencer = InboundSequencer::new(store.in_seq() + 1);
    let mut buf: Vec<u8> = Vec::with_capacity(16 * 1024);
    let mut chunk = [0u8; 8 * 1024];
    let mut logged_on = false;
    let logon_sent_at = Instant::now();
    let mut last_sent = Instant::now();
    let mut last_received = Instant::now();
    let mut pending_test_req: Option<Instant> = None;
    let mut consecutive_malformed: u32 = 0;

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            // ── Socket reads: frame, sequence, dispatch ─────────────────
            read = reader.read(&mut chunk) => {
                let n = read.context("socket read failed")?;
                if n == 0 {
                    bail!("peer closed the connection");
                }
                buf.extend_from_slice(&chunk[..n]);
                last_received = Instant::now();
                pending_test_req = None;

                loop {
                    match decode(&buf) {
                        Ok(None) => break,
                        Ok(Some((msg, used))) => {
                            buf.drain(..used);
                            consecutive_malformed = 0;
                            handle_inbound(
                                msg,
                                config,
                                store,
                                &encoder,
                                &mut writer,
                                status_tx,
                                md_tx,
                                exec_tx,
                                &mut sequencer,
                                &mut logged_on,
                                &mut last_sent,
                                reached_logon,
                            )
                            .await?;
                        }
                        Err(e) => {
                            consecutive_malformed += 1;
                            warn!(
                                session = %config.id,
                                error = %e,
                                strikes = consecutive_malformed,
                                "malformed inbound frame"
                            );
                            // NAK the frame and drop the unparsable buffer.
                            buf.clear();
                            let _ = send_message(
                                &mut writer,
                                store,
                                &encoder,
                                msg_type::REJECT,
                                vec![
                                    (tags::REF_SEQ_NUM, sequencer.next_expected.to_string()),
                                    (tags::TEXT, format!("parse error: {e}")),
                                ],
                                false,
                            )
                            .await;
                            last_sent = Instant::now();
                            if consecutive_malformed >= MAX_CONSECUTIVE_MALFORMED {
                                bail!("{MAX_CONSECUTIVE_MALFORMED} consecutive malformed messages");
                            }
                            break;
                        }
                    }
                }
            }

            // ── Application messages from the engine ────────────────────
            outbound = outbound_rx.recv() => {
                match outbound {
                    None => {
                        // Every handle dropped: orderly logout and stop.
                        let _ = status_tx.send(SessionStatus::LogoutSent);
                        let _ = send_message(
                            &mut writer, store, &encoder, msg_type::LOGOUT, vec![], false,
                        ).await;
                        return Ok(());
                    }
                    Some(app) => {
                        if !logged_on {
                            warn!(
                                session = %config.id,
                                msg_type = app.msg_type,
                                "dropping app message — session not logged on"
                            );
                            continue;
                        }
                        send_message(
                            &mut writer, store, &encoder, app.msg_type, app.fields, app.critical,
                        ).await?;
                        last_sent = Instant::now();
                    }
                }
            }

            // ── Timers: heartbeats, test requests, logon deadline ───────
            _ = tick.tick() => {
                if !logged_on {
                    if logon_sent_at.elapsed() > LOGON_TIMEOUT {
                        bail!("no Logon reply within {LOGON_TIMEOUT:?}");
                    }
                    continue;
                }
                if let Some(sent_at) = pending_test_req {
                    if sent_at.elapsed() >= hbi {
                        bail!("TestRequest unanswered for {hbi:?}");
                    }
                } else if last_received.elapsed() >= hbi + hbi / 2 {
                    send_message(
                        &mut writer,
                        store,
                        &encoder,
                        msg_type::TEST_REQUEST,
                        vec![(tags::TEST_REQ_ID, new_cl_ord_id())],
                        false,
                    )
                    .await?;
                    pending_test_req = Some(Instant::now());
                    last_sent = Instant::now();
                }
                if last_sent.elapsed() >= hbi {
                    send_message(
                        &mut writer, store, &encoder, msg_type::HEARTBEAT, vec![], false,
                    ).await?;
                    last_sent = Instant::now();
                }
            }
        }
    }
}

/// Sequence-number accounting and dispatch for one inbound message.
#[allow(clippy::too_many_arguments)]
async fn handle_inbound<W>(
    msg: FixMessage,
    config: &FixSessionConfig,
    store: &Arc<SessionStore>,
    encoder: &FixEncoder,
    writer: &mut WriteHalf<W>,
    status_tx: &watch::Sender<SessionStatus>,
    md_tx: &mpsc::Sender<InboundApp>,
    exec_tx: &mpsc::Sender<InboundApp>,
    sequencer: &mut InboundSequencer,
    logged_on: &mut bool,
    last_sent: &mut Instant,
    reached_logon: &mut bool,
) -> Result<()>
where
    W: AsyncRead + AsyncWrite + Send + 'static,
{
    let seq = msg
        .seq_num()
        .ok_or_else(|| anyhow!("inbound message without MsgSeqNum"))?;

    // Inbound Logon with ResetSeqNumFlag=Y restarts inbound numbering.
    if msg.msg_type == msg_type::LOGON && msg.get(tags::RESET_SEQ_NUM_FLAG) == Some("Y") {
        *sequencer = InboundSequencer::new(seq);
    }

    // SequenceReset may legitimately arrive inside a gap; apply it directly.
    if msg.msg_type == msg_type::SEQUENCE_RESET {
        let new_seq_no = msg
            .get_u64(tags::NEW_SEQ_NO)
            .ok_or_else(|| anyhow!("SequenceReset without NewSeqNo"))?;
        debug!(session = %config.id, new_seq_no, gap_fill = msg.get(tags::GAP_FILL_FLAG) == Some("Y"), "sequence reset");
        let released = sequencer.apply_gap_fill(new_seq_no);
        store.set_in_seq(sequencer.next_expected - 1)?;
        if !sequencer.in_gap() && *logged_on {
            let _ = status_tx.send(SessionStatus::LoggedOn);
        }
        for ready in released {
            process_message(ready, config, store, encoder, writer, status_tx, md_tx, exec_tx, logged_on, last_sent, reached_logon).await?;
        }
        return Ok(());
    }

    match sequencer.on_message(seq, msg) {
        Accepted::Process(ready) => {
            for ready_msg in ready {
                let ready_seq = ready_msg.seq_num().unwrap_or(seq);
                store.set_in_seq(ready_seq)?;
                process_message(
                    ready_msg, config, store, encoder, writer, status_tx, md_tx, exec_tx,
                    logged_on, last_sent, reached_logon,
                )
                .await?;
            }
            if !sequencer.in_gap() && *logged_on {
                let _ = status_tx.send(SessionStatus::LoggedOn);
            }
        }
        Accepted::Gap { begin, end } => {
            warn!(session = %config.id, begin, end, "inbound sequence gap — requesting resend");
            send_message(
                writer,
                store,
                encoder,
                msg_type::RESEND_REQUEST,
                vec![
                    (tags::BEGIN_SEQ_NO, begin.to_string()),
                    (tags::END_SEQ_NO, end.to_string()),
                ],
                false,
            )
            .await?;
            *last_sent = Instant::now();
            let _ = status_tx.send(SessionStatus::ResendPending);
        }
        Accepted::Duplicate => {
            debug!(session = %config.id, seq, "dropping PossDup duplicate");
        }
        Accepted::Desync { got, expected } => {
            let _ = status_tx.send(SessionStatus::LogoutSent);
            let _ = send_message(
                writer,
                store,
                encoder,
                msg_type::LOGOUT,
                vec![(
                    tags::TEXT,
                    format!("MsgSeqNum {got} below expected {expected}"),
                )],
                false,
            )
            .await;
            bail!("inbound sequence desync: got {got}, expected {expected}");
        }
    }

    Ok(())
}

/// Act on one in-order inbound message.
#[allow(clippy::too_many_arguments)]
async fn process_message<W>(
    msg: FixMessage,
    config: &FixSessionConfig,
    store: &Arc<SessionStore>,
    encoder: &FixEncoder,
    writer: &mut WriteHalf<W>,
    status_tx: &watch::Sender<SessionStatus>,
    md_tx: &mpsc::Sender<InboundApp>,
    exec_tx: &mpsc::Sender<InboundApp>,
    logged_on: &mut bool,
    last_sent: &mut Instant,
    reached_logon: &mut bool,
) -> Result<()>
where
    W: AsyncRead + AsyncWrite + Send + 'static,
{
    match msg.msg_type.as_str() {
        msg_type::LOGON => {
            *logged_on = true;
            *reached_logon = true;
            store.record_logon()?;
            let _ = status_tx.send(SessionStatus::LoggedOn);
            info!(session = %config.id, "logged on");
        }
        msg_type::HEARTBEAT => {
            // Receipt alone refreshes liveness.
        }
        msg_type::TEST_REQUEST => {
            let req_id = msg.get(tags::TEST_REQ_ID).unwrap_or_default().to_string();
            send_message(
                writer,
                store,
                encoder,
                msg_type::HEARTBEAT,
                vec![(tags::TEST_REQ_ID, req_id)],
                false,
            )
            .await?;
            *last_sent = Instant::now();
        }
        msg_type::RESEND_REQUEST => {
            let begin = msg.get_u64(tags::BEGIN_SEQ_NO).unwrap_or(1);
            let end = msg.get_u64(tags::END_SEQ_NO).unwrap_or(0);
            info!(session = %config.id, begin, end, "peer requested resend");
            replay_range(writer, store, encoder, begin, end).await?;
            *last_sent = Instant::now();
        }
        msg_type::REJECT => {
            warn!(
                session = %config.id,
                ref_seq = msg.get(tags::REF_SEQ_NUM).unwrap_or("?"),
                reason = msg.get(tags::SESSION_REJECT_REASON).unwrap_or("?"),
                text = msg.get(tags::TEXT).unwrap_or(""),
                "session-level reject received"
            );
        }
        msg_type::LOGOUT => {
            bail!("peer sent Logout");
        }
        msg_type::MARKET_DATA_SNAPSHOT | msg_type::MARKET_DATA_INCREMENTAL => {
            if md_tx.send((config.id.clone(), msg)).await.is_err() {
                bail!("market-data consumer gone");
            }
        }
        msg_type::EXECUTION_REPORT | msg_type::ORDER_CANCEL_REJECT => {
            if exec_tx.send((config.id.clone(), msg)).await.is_err() {
                bail!("execution-report consumer gone");
            }
        }
        other => {
            debug!(session = %config.id, msg_type = other, "ignoring unsupported message type");
        }
    }
    Ok(())
}

/// Replay stored outbound messages for a peer's ResendRequest. Administrative
/// messages are replaced by SequenceReset-GapFill; application messages go out
/// again with PossDupFlag=Y and OrigSendingTime.
async fn replay_range<W>(
    writer: &mut WriteHalf<W>,
    store: &Arc<SessionStore>,
    encoder: &FixEncoder,
    begin: u64,
    end: u64,
) -> Result<()>
where
    W: AsyncRead + AsyncWrite + Send + 'static,
{
    let stored = store.outbound_range(begin, end)?;
    let mut gap_start: Option<u64> = None;

    for (seq, payload) in &stored {
        let decoded = match decode(payload) {
            Ok(Some((msg, _))) => msg,
            _ => {
                warn!(seq, "stored outbound message undecodable — gap-filling");
                gap_start = gap_start.or(Some(*seq));
                continue;
            }
        };

        if message::is_admin(&decoded.msg_type) {
            gap_start = gap_start.or(Some(*seq));
            continue;
        }

        if let Some(from) = gap_start.take() {
            write_gap_fill(writer, encoder, from, *seq).await?;
        }

        // Re-send the app message under its original sequence number.
        let orig_sending_time = decoded
            .get(tags::SENDING_TIME)
            .unwrap_or_default()
            .to_string();
        let mut fields: Vec<(u32, String)> = vec![
            (tags::POSS_DUP_FLAG, "Y".to_string()),
            (tags::ORIG_SENDING_TIME, orig_sending_time),
        ];
        fields.extend(decoded.fields.iter().filter_map(|(tag, value)| {
            let header = matches!(
                *tag,
                tags::MSG_TYPE
                    | tags::SENDER_COMP_ID
                    | tags::TARGET_COMP_ID
                    | tags::MSG_SEQ_NUM
                    | tags::SENDING_TIME
                    | tags::POSS_DUP_FLAG
                    | tags::ORIG_SENDING_TIME
            );
            (!header).then(|| (*tag, value.clone()))
        }));

        let wire = encoder.encode(&decoded.msg_type, *seq, &fields);
        timeout(WRITE_TIMEOUT, writer.write_all(&wire))
            .await
            .context("resend write timed out")?
            .context("resend write failed")?;
    }

    // Trailing admin run: gap-fill through to the next fresh sequence number.
    if let Some(from) = gap_start {
        write_gap_fill(writer, encoder, from, store.out_seq() + 1).await?;
    }

    timeout(WRITE_TIMEOUT, writer.flush())
        .await
        .context("resend flush timed out")?
        .context("resend flush failed")?;
    Ok(())
}

async fn write_gap_fill<W>(
    writer: &mut WriteHalf<W>,
    encoder: &FixEncoder,
    seq: u64,
    new_seq_no: u64,
) -> Result<()>
where
    W: AsyncRead + AsyncWrite + Send + 'static,
{
    let wire = encoder.encode(
        msg_type::SEQUENCE_RESET,
        seq,
        &[
            (tags::POSS_DUP_FLAG, "Y".to_string()),
            (tags::GAP_FILL_FLAG, "Y".to_string()),
            (tags::NEW_SEQ_NO, new_seq_no.to_string()),
        ],
    );
    timeout(WRITE_TIMEOUT, writer.write_all(&wire))
        .await
        .context("gap-fill write timed out")?
        .context("gap-fill write failed")?;
    Ok(())
}

/// Allocate the next sequence number, persist the message (fsync when
/// critical), then put it on the wire. The persist-before-send ordering is
/// what makes ResendRequest recovery possible.
async fn send_message<W>(
    writer: &mut WriteHalf<W>,
    store: &Arc<SessionStore>,
    encoder: &FixEncoder,
    msg_type: &str,
    fields: Vec<(u32, String)>,
    critical: bool,
) -> Result<()>
where
    W: AsyncRead + AsyncWrite + Send + 'static,
{
    let seq = store.next_out_seq()?;
    let wire = encoder.encode(msg_type, seq, &fields);
    store.append(Direction::Outbound, seq, &wire, critical)?;
    timeout(WRITE_TIMEOUT, writer.write_all(&wire))
        .await
        .context("socket write timed out")?
        .context("socket write failed")?;
    timeout(WRITE_TIMEOUT, writer.flush())
        .await
        .context("socket flush timed out")?
        .context("socket flush failed")?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn sample(seq_hint: &str) -> FixMessage {
        FixMessage {
            msg_type: "8".to_string(),
            fields: vec![(tags::EXEC_ID, seq_hint.to_string())],
        }
    }

    fn dup(mut msg: FixMessage) -> FixMessage {
        msg.fields.push((tags::POSS_DUP_FLAG, "Y".to_string()));
        msg
    }

    #[test]
    fn sequencer_in_order() {
        let mut seq = InboundSequencer::new(1);
        match seq.on_message(1, sample("a")) {
            Accepted::Process(ready) => assert_eq!(ready.len(), 1),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(seq.next_expected, 2);
    }

    #[test]
    fn sequencer_gap_then_fill_releases_in_order() {
        let mut seq = InboundSequencer::new(42);

        // 45 arrives while 42 is expected: gap 42..=44.
        match seq.on_message(45, sample("e45")) {
            Accepted::Gap { begin, end } => {
                assert_eq!(begin, 42);
                assert_eq!(end, 44);
            }
            other => panic!("unexpected: {other:?}"),
        }
        // 46 queues silently; the gap was already requested.
        assert_eq!(seq.on_message(46, sample("e46")), Accepted::Process(vec![]));

        // Resent 42, 43, 44 arrive: 44 releases the whole queue.
        match seq.on_message(42, sample("e42")) {
            Accepted::Process(ready) => assert_eq!(ready.len(), 1),
            other => panic!("unexpected: {other:?}"),
        }
        match seq.on_message(43, sample("e43")) {
            Accepted::Process(ready) => assert_eq!(ready.len(), 1),
            other => panic!("unexpected: {other:?}"),
        }
        match seq.on_message(44, sample("e44")) {
            Accepted::Process(ready) => {
                let ids: Vec<_> = ready
                    .iter()
                    .map(|m| m.get(tags::EXEC_ID).unwrap().to_string())
                    .collect();
                assert_eq!(ids, vec!["e44", "e45", "e46"]);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(!seq.in_gap());
        assert_eq!(seq.next_expected, 47);
    }

    #[test]
    fn sequencer_poss_dup_below_expected_is_dropped() {
        let mut seq = InboundSequencer::new(10);
        assert_eq!(seq.on_message(5, dup(sample("old"))), Accepted::Duplicate);
    }

    #[test]
    fn sequencer_below_expected_without_poss_dup_is_desync() {
        let mut seq = InboundSequencer::new(10);
        match seq.on_message(5, sample("bad")) {
            Accepted::Desync { got, expected } => {
                assert_eq!(got, 5);
                assert_eq!(expected, 10);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn sequencer_gap_fill_jumps_expectation() {
        let mut seq = InboundSequencer::new(42);
        let _ = seq.on_message(45, sample("e45"));
        // GapFill says: next is 45.
        let released = seq.apply_gap_fill(45);
        let ids: Vec<_> = released
            .iter()
            .map(|m| m.get(tags::EXEC_ID).unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["e45"]);
        assert_eq!(seq.next_expected, 46);
        assert!(!seq.in_gap());
    }

    #[test]
    fn backoff_respects_cap_and_jitter() {
        for attempt in 0..20 {
            let d = backoff_delay(attempt);
            assert!(d <= BACKOFF_CAP.mul_f64(1.2), "attempt {attempt}: {d:?}");
        }
        let first = backoff_delay(0);
        assert!(first >= Duration::from_millis(800));
        assert!(first <= Duration::from_millis(1200));
    }

    // -----------------------------------------------------------------------
    // Scripted-counterparty integration: logon, forward, heartbeat reply
    // -----------------------------------------------------------------------

    struct ScriptedLp {
        stream: DuplexStream,
        encoder: FixEncoder,
        seq: u64,
        buf: Vec<u8>,
    }

    impl ScriptedLp {
        fn new(stream: DuplexStream) -> Self {
            Self {
                stream,
                encoder: FixEncoder::new("LPX", "MERIDIAN"),
                seq: 0,
                buf: Vec::new(),
            }
        }

        async fn read_message(&mut self) -> FixMessage {
            let mut chunk = [0u8; 4096];
            loop {
                if let Some((msg, used)) = decode(&self.buf).unwrap() {
                    self.buf.drain(..used);
                    return msg;
                }
                let n = self.stream.read(&mut chunk).await.unwrap();
                assert!(n > 0, "session closed unexpectedly");
                self.buf.extend_from_slice(&chunk[..n]);
            }
        }

        async fn send(&mut self, msg_type: &str, fields: &[(u32, String)]) {
            self.seq += 1;
            let wire = self.encoder.encode(msg_type, self.seq, fields);
            self.stream.write_all(&wire).await.unwrap();
        }
    }

    fn test_config() -> FixSessionConfig {
        FixSessionConfig {
            id: "LPX".into(),
            host: "unused".into(),
            port: 0,
            tls: false,
            sender_comp_id: "MERIDIAN".into(),
            target_comp_id: "LPX".into(),
            heart_bt_int: 30,
            reset_on_logon: false,
            store_path: "unused".into(),
        }
    }

    #[tokio::test]
    async fn session_logs_on_and_forwards_execution_reports() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::open(dir.path(), "LPX").unwrap());
        let config = test_config();

        let (engine_side, lp_side) = tokio::io::duplex(64 * 1024);
        let (status_tx, status_rx) = watch::channel(SessionStatus::Connecting);
        let (md_tx, _md_rx) = mpsc::channel(64);
        let (exec_tx, mut exec_rx) = mpsc::channel(64);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundApp>(64);

        let session_store = store.clone();
        let session = tokio::spawn(async move {
            let mut reached = false;
            let _ = run_established(
                engine_side,
                &config,
                &session_store,
                &status_tx,
                &md_tx,
                &exec_tx,
                &mut outbound_rx,
                &mut reached,
            )
            .await;
        });

        let mut lp = ScriptedLp::new(lp_side);

        // 1. Session sends Logon first.
        let logon = lp.read_message().await;
        assert_eq!(logon.msg_type, msg_type::LOGON);
        assert_eq!(logon.get(tags::HEART_BT_INT), Some("30"));

        // 2. LP confirms the logon.
        lp.send(msg_type::LOGON, &[
            (tags::ENCRYPT_METHOD, "0".to_string()),
            (tags::HEART_BT_INT, "30".to_string()),
        ])
        .await;

        // 3. Engine queues a NewOrderSingle once logged on.
        let mut status = status_rx.clone();
        status
            .wait_for(|s| *s == SessionStatus::LoggedOn)
            .await
            .unwrap();
        outbound_tx
            .send(OutboundApp {
                msg_type: msg_type::NEW_ORDER_SINGLE,
                fields: vec![
                    (tags::CL_ORD_ID, "c1".to_string()),
                    (tags::SYMBOL, "EURUSD".to_string()),
                    (tags::SIDE, "1".to_string()),
                    (tags::ORDER_QTY, "1".to_string()),
                    (tags::ORD_TYPE, "1".to_string()),
                ],
                critical: true,
            })
            .await
            .unwrap();

        let nos = lp.read_message().await;
        assert_eq!(nos.msg_type, msg_type::NEW_ORDER_SINGLE);
        assert_eq!(nos.get(tags::CL_ORD_ID), Some("c1"));

        // Critical send was persisted before hitting the wire.
        let logged = store.outbound_range(1, 0).unwrap();
        assert!(logged
            .iter()
            .any(|(_, payload)| payload.windows(4).any(|w| w == b"35=D")));

        // 4. LP replies with an ExecutionReport; it must be forwarded.
        lp.send(msg_type::EXECUTION_REPORT, &[
            (tags::ORDER_ID, "X-1".to_string()),
            (tags::CL_ORD_ID, "c1".to_string()),
            (tags::EXEC_ID, "e1".to_string()),
            (tags::EXEC_TYPE, "0".to_string()),
            (tags::ORD_STATUS, "0".to_string()),
        ])
        .await;

        let (lp_id, report) = exec_rx.recv().await.unwrap();
        assert_eq!(lp_id, "LPX");
        assert_eq!(report.get(tags::CL_ORD_ID), Some("c1"));

        // 5. TestRequest gets a Heartbeat echoing the id.
        lp.send(msg_type::TEST_REQUEST, &[(tags::TEST_REQ_ID, "ping-1".to_string())])
            .await;
        let reply = lp.read_message().await;
        assert_eq!(reply.msg_type, msg_type::HEARTBEAT);
        assert_eq!(reply.get(tags::TEST_REQ_ID), Some("ping-1"));

        // 6. Dropping the outbound channel stops the session cleanly.
        drop(outbound_tx);
        let logout = lp.read_message().await;
        assert_eq!(logout.msg_type, msg_type::LOGOUT);
        session.await.unwrap();
    }

    #[tokio::test]
    async fn session_requests_resend_on_gap() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::open(dir.path(), "LPX").unwrap());
        let config = test_config();

        let (engine_side, lp_side) = tokio::io::duplex(64 * 1024);
        let (status_tx, _status_rx) = watch::channel(SessionStatus::Connecting);
        let (md_tx, _md_rx) = mpsc::channel(64);
        let (exec_tx, mut exec_rx) = mpsc::channel(64);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundApp>(64);

        let session_store = store.clone();
        tokio::spawn(async move {
            let mut reached = false;
            let _ = run_established(
                engine_side,
                &config,
                &session_store,
                &status_tx,
                &md_tx,
                &exec_tx,
                &mut outbound_rx,
                &mut reached,
            )
            .await;
        });

        let mut lp = ScriptedLp::new(lp_side);
        let _logon = lp.read_message().await;
        lp.send(msg_type::LOGON, &[(tags::HEART_BT_INT, "30".to_string())])
            .await;

        // Skip seq 2-3: jump straight to 4.
        lp.seq = 3;
        lp.send(msg_type::EXECUTION_REPORT, &[
            (tags::CL_ORD_ID, "c9".to_string()),
            (tags::EXEC_ID, "late".to_string()),
            (tags::EXEC_TYPE, "0".to_string()),
        ])
        .await;

        // Session must ask for 2..=3.
        let resend = lp.read_message().await;
        assert_eq!(resend.msg_type, msg_type::RESEND_REQUEST);
        assert_eq!(resend.get(tags::BEGIN_SEQ_NO), Some("2"));
        assert_eq!(resend.get(tags::END_SEQ_NO), Some("3"));

        // Gap-fill 2..=3; the queued report is then released.
        lp.seq = 1;
        lp.send(msg_type::SEQUENCE_RESET, &[
            (tags::GAP_FILL_FLAG, "Y".to_string()),
            (tags::NEW_SEQ_NO, "4".to_string()),
        ])
        .await;

        let (_, report) = exec_rx.recv().await.unwrap();
        assert_eq!(report.get(tags::EXEC_ID), Some("late"));

        drop(outbound_tx);
    }
}
