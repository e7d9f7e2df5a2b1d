/*! Transport engine.

One worker thread per transport does all wire I/O: it feeds bytes
through the receive state machine, drains service outboxes into the
global transmit queue, keeps the sliding window of unacknowledged
frames, and applies the peer's responses to it.

Receive states:

```text
RESET -> WAIT -> HEADER -> DATA -> FOOTER
                   |                  |
                   +----> RESEND <----+
                             |
                           ERROR
         WAIT -> RESPONSE
```

WAIT hunts for the two byte start token, discarding noise one byte at
a time. HEADER checks the CRC-8 and the sequence number; a duplicate of
the last accepted frame gets its ACK repeated, anything else out of
order is NACKed while the retry budget lasts. DATA accumulates the
payload with a rolling CRC-16 which FOOTER compares against the frame
footer.

The transmit window holds at most 255 frames. Responses acknowledge
cumulatively: answering sync `s` retires every window entry ahead of
`s`. A NACK (or the reserved NYET) pulls the whole window back onto the
front of the transmit queue for retransmission in original order.
Fire-and-forget frames bypass the window and sequence numbering
entirely.
*/
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};

use crate::channel::ByteChannel;
use crate::checksum::crc16;
use crate::control::{self, ControlService};
use crate::frame::{self, FrameType, Header, ResponseFrame, ResponseKind, Status};
use crate::service::{Inbound, Service, TxTicket};
use crate::{Error, Result};

/// Most frames allowed in flight at once.
const WINDOW_CAP: usize = 255;

const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Transport tuning knobs.
#[derive(Clone, Debug)]
pub struct Config {
    /// Payload ceiling offered in the sync handshake. The negotiated
    /// value is the smaller of this and the peer's advertisement.
    pub max_block_size: usize,
    /// How many NACKs the receiver sends before declaring the stream
    /// broken and resetting its connection state.
    pub rx_retry_budget: u8,
    /// Reopen attempts after a byte channel error before giving up.
    pub reconnect_attempts: u32,
    /// Pause between reopen attempts.
    pub reconnect_backoff: Duration,
    /// How often `connect` repeats the sync request until answered.
    pub sync_interval: Duration,
    /// When set, raw wire traffic is appended to `serial_in.log` and
    /// `serial_out.log` in this directory.
    pub wire_log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            max_block_size: 512,
            rx_retry_budget: 16,
            reconnect_attempts: 5,
            reconnect_backoff: Duration::from_secs(2),
            sync_interval: Duration::from_secs(1),
            wire_log_dir: None,
        }
    }
}

/// State shared between the worker thread and API callers.
pub(crate) struct Shared {
    active: AtomicBool,
    synchronised: AtomicBool,
    sync_requested: AtomicBool,
    reconnect_requested: AtomicBool,
    fatal: Mutex<Option<String>>,
    services: Mutex<HashMap<u8, Service>>,
    sync_max_block_size: AtomicUsize,
    default_max_block_size: usize,
}

impl Shared {
    pub(crate) fn new(default_max_block_size: usize) -> Shared {
        Shared {
            active: AtomicBool::new(true),
            synchronised: AtomicBool::new(false),
            sync_requested: AtomicBool::new(false),
            reconnect_requested: AtomicBool::new(false),
            fatal: Mutex::new(None),
            services: Mutex::new(HashMap::new()),
            sync_max_block_size: AtomicUsize::new(0),
            default_max_block_size,
        }
    }

    pub(crate) fn is_synchronised(&self) -> bool {
        self.synchronised.load(Ordering::SeqCst)
    }

    pub(crate) fn set_synchronised(&self, v: bool) {
        self.synchronised.store(v, Ordering::SeqCst);
    }

    pub(crate) fn negotiated_block_size(&self) -> usize {
        self.sync_max_block_size.load(Ordering::SeqCst)
    }

    pub(crate) fn set_negotiated_block_size(&self, n: usize) {
        self.sync_max_block_size.store(n, Ordering::SeqCst);
    }

    pub(crate) fn default_block_size(&self) -> usize {
        self.default_max_block_size
    }
}

enum TxEntry {
    Data(DataEntry),
    Response(ResponseFrame),
}

struct DataEntry {
    header: Header,
    payload: Vec<u8>,
    ticket: TxTicket,
    /// Set once a sync has been assigned; retransmissions keep theirs.
    assigned: bool,
}

impl DataEntry {
    fn encode(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(frame::HEADER_SIZE + self.payload.len() + frame::FOOTER_SIZE);
        out.extend_from_slice(&self.header.encode());
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&crc16(0, &self.payload).to_le_bytes());
        out
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RxState {
    Reset,
    Wait,
    Header,
    Data,
    Footer,
    Resend,
    Error,
    Response,
}

struct RxStream {
    expected_sync: u8,
    retries: u8,
    state: RxState,
    buf: Vec<u8>,
    header: Option<Header>,
    payload: Vec<u8>,
    crc: u16,
}

impl RxStream {
    fn new() -> RxStream {
        RxStream {
            expected_sync: 0,
            retries: 0,
            state: RxState::Reset,
            buf: Vec::new(),
            header: None,
            payload: Vec::new(),
            crc: 0,
        }
    }

    fn reset_packet(&mut self) {
        self.buf.clear();
        self.header = None;
        self.payload.clear();
        self.crc = 0;
    }

    fn reset_connection(&mut self) {
        self.expected_sync = 0;
        self.retries = 0;
        self.reset_packet();
        self.state = RxState::Reset;
    }
}

struct TxStream {
    sync: Option<u8>,
    sync_last: Option<u8>,
    window: VecDeque<DataEntry>,
}

impl TxStream {
    fn new() -> TxStream {
        TxStream {
            sync: None,
            sync_last: None,
            window: VecDeque::new(),
        }
    }

    fn next_sync(&mut self) -> u8 {
        let n = match self.sync {
            None => 0,
            Some(s) => s.wrapping_add(1),
        };
        self.sync = Some(n);
        n
    }

    fn reset_connection(&mut self) -> Vec<DataEntry> {
        self.sync = None;
        self.sync_last = None;
        self.window.drain(..).collect()
    }
}

struct Worker {
    shared: Arc<Shared>,
    config: Config,
    channel: Box<dyn ByteChannel>,
    control: ControlService,
    rx: RxStream,
    tx: TxStream,
    tx_queue: VecDeque<TxEntry>,
    in_log: Option<File>,
    out_log: Option<File>,
}

impl Worker {
    fn new(
        shared: Arc<Shared>,
        config: Config,
        channel: Box<dyn ByteChannel>,
        control: ControlService,
    ) -> Result<Worker> {
        let (in_log, out_log) = match &config.wire_log_dir {
            Some(dir) => {
                let open = |name: &str| {
                    File::options()
                        .create(true)
                        .append(true)
                        .open(dir.join(name))
                };
                (Some(open("serial_in.log")?), Some(open("serial_out.log")?))
            }
            None => (None, None),
        };
        Ok(Worker {
            shared,
            config,
            channel,
            control,
            rx: RxStream::new(),
            tx: TxStream::new(),
            tx_queue: VecDeque::new(),
            in_log,
            out_log,
        })
    }

    fn run(&mut self) {
        debug!("transport worker started");
        while self.shared.active.load(Ordering::SeqCst) {
            match self.tick() {
                Ok(true) => thread::sleep(IDLE_SLEEP),
                Ok(false) => {}
                Err(Error::Io(e)) => {
                    error!("byte channel error: {e}");
                    if let Err(f) = self.reconnect() {
                        self.fail(&f);
                        break;
                    }
                }
                Err(e @ Error::Fatal(_)) => {
                    self.fail(&e);
                    break;
                }
                Err(e) => error!("transport worker error: {e}"),
            }
        }
        self.fail_inflight("transport shut down");
        debug!("transport worker finished");
    }

    fn tick(&mut self) -> Result<bool> {
        if self.shared.reconnect_requested.swap(false, Ordering::SeqCst) {
            self.reconnect()?;
        }
        if self.shared.sync_requested.swap(false, Ordering::SeqCst) {
            self.synchronise()?;
        }
        self.control.update(&self.shared);
        self.process_receive()?;
        self.process_transmit()?;
        Ok(self.rx.header.is_none() && self.rx.buf.is_empty() && self.tx_queue.is_empty())
    }

    fn fail(&mut self, e: &Error) {
        error!("transport failed: {e}");
        *self.shared.fatal.lock().unwrap() = Some(e.to_string());
        self.shared.set_synchronised(false);
        self.shared.active.store(false, Ordering::SeqCst);
        self.fail_inflight("transport failed");
    }

    fn fail_inflight(&mut self, why: &str) {
        for e in self.tx.window.drain(..) {
            e.ticket.set(Status::Failed, None);
        }
        let mut dropped = 0;
        for e in self.tx_queue.drain(..) {
            if let TxEntry::Data(d) = e {
                d.ticket.set(Status::Failed, None);
                dropped += 1;
            }
        }
        if dropped > 0 {
            debug!("{why}: dropped {dropped} queued frames");
        }
    }

    // Raw byte I/O, mirrored into the wire logs.

    fn stream_read(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        let got = self.channel.read(&mut buf)?;
        buf.truncate(got);
        if got > 0 {
            if let Some(f) = &mut self.in_log {
                let _ = f.write_all(&buf);
                let _ = f.flush();
            }
        }
        Ok(buf)
    }

    fn stream_write(&mut self, bytes: &[u8]) -> Result<usize> {
        let mut off = 0;
        while off < bytes.len() {
            let n = self.channel.write(&bytes[off..])?;
            if n == 0 {
                thread::sleep(Duration::from_micros(100));
                continue;
            }
            off += n;
        }
        if let Some(f) = &mut self.out_log {
            let _ = f.write_all(bytes);
            let _ = f.flush();
        }
        Ok(bytes.len())
    }

    // Receive state machine. One state step per invocation.

    fn process_receive(&mut self) -> Result<()> {
        match self.rx.state {
            RxState::Reset => {
                self.rx.reset_packet();
                self.rx.state = RxState::Wait;
                self.state_wait()
            }
            RxState::Wait => self.state_wait(),
            RxState::Header => self.state_header(),
            RxState::Data => self.state_data(),
            RxState::Footer => self.state_footer(),
            RxState::Resend => {
                self.state_resend();
                Ok(())
            }
            RxState::Error => {
                self.state_error();
                Ok(())
            }
            RxState::Response => self.state_response(),
        }
    }

    fn state_wait(&mut self) -> Result<()> {
        if self.channel.bytes_available()? == 0 {
            return Ok(());
        }
        let chunk = self.stream_read(1)?;
        self.rx.buf.extend_from_slice(&chunk);
        if self.rx.buf.len() == 2 {
            match frame::classify_token([self.rx.buf[0], self.rx.buf[1]]) {
                Some(FrameType::Response) => self.rx.state = RxState::Response,
                Some(_) => self.rx.state = RxState::Header,
                None => {
                    // Noise on the bus; resynchronise one byte at a time.
                    self.rx.buf.remove(0);
                }
            }
        }
        Ok(())
    }

    fn state_header(&mut self) -> Result<()> {
        let need = frame::HEADER_SIZE - self.rx.buf.len();
        if need > 0 {
            let chunk = self.stream_read(need)?;
            self.rx.buf.extend_from_slice(&chunk);
        }
        if self.rx.buf.len() < frame::HEADER_SIZE {
            return Ok(());
        }
        let (header, crc_ok) = match Header::parse(&self.rx.buf) {
            Ok(v) => v,
            Err(e) => {
                warn!("unparseable header: {e}");
                self.rx.state = RxState::Reset;
                return Ok(());
            }
        };
        if crc_ok {
            if header.sync == self.rx.expected_sync || header.frame_type == FrameType::DataFaf {
                if header.payload_size == 0 {
                    self.dispatch_frame(header, Vec::new());
                    self.rx.state = RxState::Reset;
                } else {
                    self.rx.header = Some(header);
                    self.rx.payload.clear();
                    self.rx.crc = 0;
                    self.rx.buf.clear();
                    self.rx.state = RxState::Data;
                }
            } else if header.sync == self.rx.expected_sync.wrapping_sub(1) {
                // The peer is resending a frame we already accepted, so
                // our ACK was lost. Repeat it, drop the duplicate.
                debug!("duplicate frame sync {}, repeating ack", header.sync);
                self.send_response(ResponseKind::Ack, self.rx.expected_sync.wrapping_sub(1));
                self.rx.state = RxState::Reset;
            } else if self.rx.retries == 0 {
                debug!(
                    "frame sync {} does not match expected {}",
                    header.sync, self.rx.expected_sync
                );
                self.rx.state = RxState::Resend;
            } else {
                // Already in retry; drop everything until the stream
                // comes back around to the expected frame.
                self.rx.state = RxState::Reset;
            }
        } else if header.frame_type == FrameType::DataFaf {
            // The header is corrupt but the type bits are assumed good.
            // Fire-and-forget is best effort; drop it.
            self.rx.state = RxState::Reset;
        } else if self.rx.retries > 0 {
            self.rx.state = RxState::Reset;
        } else {
            debug!("header checksum mismatch");
            self.rx.state = RxState::Resend;
        }
        Ok(())
    }

    fn state_data(&mut self) -> Result<()> {
        let Some(header) = self.rx.header else {
            self.rx.state = RxState::Reset;
            return Ok(());
        };
        let need = usize::from(header.payload_size) - self.rx.payload.len();
        if need > 0 {
            let chunk = self.stream_read(need)?;
            self.rx.crc = crc16(self.rx.crc, &chunk);
            self.rx.payload.extend_from_slice(&chunk);
        }
        if self.rx.payload.len() == usize::from(header.payload_size) {
            self.rx.buf.clear();
            self.rx.state = RxState::Footer;
        }
        Ok(())
    }

    fn state_footer(&mut self) -> Result<()> {
        let need = frame::FOOTER_SIZE - self.rx.buf.len();
        if need > 0 {
            let chunk = self.stream_read(need)?;
            self.rx.buf.extend_from_slice(&chunk);
        }
        if self.rx.buf.len() < frame::FOOTER_SIZE {
            return Ok(());
        }
        let footer = u16::from_le_bytes([self.rx.buf[0], self.rx.buf[1]]);
        if footer == self.rx.crc {
            if let Some(header) = self.rx.header.take() {
                let payload = std::mem::take(&mut self.rx.payload);
                self.dispatch_frame(header, payload);
            }
            self.rx.state = RxState::Reset;
        } else {
            debug!("payload checksum mismatch");
            self.rx.state = RxState::Resend;
        }
        Ok(())
    }

    fn state_resend(&mut self) {
        if self.rx.retries < self.config.rx_retry_budget {
            self.rx.retries += 1;
            self.send_response(ResponseKind::Nack, self.rx.expected_sync);
            self.rx.state = RxState::Reset;
        } else {
            self.rx.state = RxState::Error;
        }
    }

    fn state_error(&mut self) {
        error!("data stream error, resetting receive state");
        self.rx.reset_connection();
    }

    fn state_response(&mut self) -> Result<()> {
        let need = frame::RESPONSE_SIZE - self.rx.buf.len();
        if need > 0 {
            let chunk = self.stream_read(need)?;
            self.rx.buf.extend_from_slice(&chunk);
        }
        if self.rx.buf.len() < frame::RESPONSE_SIZE {
            return Ok(());
        }
        match ResponseFrame::parse(&self.rx.buf) {
            Ok(resp) => self.process_response(resp),
            // There is no NACK path for responses; drop and resync.
            Err(e) => warn!("dropping damaged response frame: {e}"),
        }
        self.rx.state = RxState::Reset;
        Ok(())
    }

    /// Hand a validated frame to its service and answer the peer.
    ///
    /// Fire-and-forget frames take no sequence number and get no
    /// response, in either direction.
    fn dispatch_frame(&mut self, header: Header, payload: Vec<u8>) {
        let faf = header.frame_type == FrameType::DataFaf;
        let service = self
            .shared
            .services
            .lock()
            .unwrap()
            .get(&header.channel)
            .cloned();
        let decoded = match &service {
            Some(service) => match service.schema(header.packet_id) {
                Some(schema) => match schema.decode(&payload) {
                    Ok(record) => Some(record),
                    Err(e) => {
                        warn!(
                            "packet id {} on channel {} failed to decode: {e}",
                            header.packet_id, header.channel
                        );
                        None
                    }
                },
                None => None,
            },
            None => None,
        };
        match (service, decoded) {
            (Some(service), Some(record)) => {
                trace!(
                    "dispatching packet id {} to {}",
                    header.packet_id,
                    service.name()
                );
                service.dispatch(Inbound {
                    packet_id: header.packet_id,
                    record,
                    frame_type: header.frame_type,
                    channel: header.channel,
                    sync: header.sync,
                });
                if !faf {
                    self.send_response(ResponseKind::Ack, header.sync);
                    self.rx.expected_sync = self.rx.expected_sync.wrapping_add(1);
                    self.rx.retries = 0;
                }
            }
            _ => {
                debug!(
                    "rejected packet id {} on channel {}",
                    header.packet_id, header.channel
                );
                if !faf {
                    // The expected sync does not advance for a rejected
                    // frame.
                    self.send_response(ResponseKind::Reject, header.sync);
                }
            }
        }
    }

    fn send_response(&mut self, kind: ResponseKind, sync_id: u8) {
        self.tx_queue
            .push_back(TxEntry::Response(ResponseFrame { kind, sync_id }));
    }

    // Transmit side.

    fn process_transmit(&mut self) -> Result<()> {
        // Service outboxes feed the global queue only once synchronised.
        if self.shared.is_synchronised() {
            let services: Vec<(u8, Service)> = self
                .shared
                .services
                .lock()
                .unwrap()
                .iter()
                .map(|(c, s)| (*c, s.clone()))
                .collect();
            for (channel, service) in services {
                if let Some(out) = service.pop_outbound() {
                    out.ticket.set(Status::Buffered, None);
                    self.tx_queue.push_back(TxEntry::Data(DataEntry {
                        header: Header {
                            frame_type: out.frame_type,
                            sync: 0,
                            channel,
                            packet_id: out.packet_id,
                            payload_size: out.payload.len() as u16,
                        },
                        payload: out.payload,
                        ticket: out.ticket,
                        assigned: false,
                    }));
                }
            }
        }

        if self.tx.window.len() >= WINDOW_CAP {
            // Data frames stay queued until the window drains, but an
            // ACK of ours must still get out or both sides stall.
            if let Some(resp) = self.pop_next_response() {
                let bytes = resp.encode();
                self.stream_write(&bytes)?;
            }
            return Ok(());
        }

        match self.tx_queue.pop_front() {
            None => {}
            Some(TxEntry::Response(resp)) => {
                let bytes = resp.encode();
                self.stream_write(&bytes)?;
            }
            Some(TxEntry::Data(mut entry)) => {
                if entry.header.frame_type == FrameType::DataFaf {
                    entry.ticket.set(Status::Complete, None);
                    let bytes = entry.encode();
                    self.stream_write(&bytes)?;
                } else {
                    if !entry.assigned {
                        if self.tx.window.len() == WINDOW_CAP - 1
                            && entry.header.frame_type == FrameType::DataNack
                        {
                            // The frame that fills the window must
                            // demand an acknowledgement.
                            entry.header.frame_type = FrameType::Data;
                        }
                        entry.header.sync = self.tx.next_sync();
                        entry.assigned = true;
                    }
                    entry.ticket.set(Status::InTransit, None);
                    let bytes = entry.encode();
                    self.stream_write(&bytes)?;
                    self.tx.window.push_back(entry);
                }
            }
        }
        Ok(())
    }

    fn pop_next_response(&mut self) -> Option<ResponseFrame> {
        let pos = self
            .tx_queue
            .iter()
            .position(|e| matches!(e, TxEntry::Response(_)))?;
        match self.tx_queue.remove(pos) {
            Some(TxEntry::Response(r)) => Some(r),
            _ => None,
        }
    }

    fn process_response(&mut self, resp: ResponseFrame) {
        trace!("response {:?} for sync {}", resp.kind, resp.sync_id);
        if !self
            .tx
            .window
            .iter()
            .any(|e| e.header.sync == resp.sync_id)
        {
            // Potential stream desync; there is no automatic recovery.
            error!(
                "response {:?} for sync {} matches nothing in flight",
                resp.kind, resp.sync_id
            );
            return;
        }

        // A response acknowledges cumulatively: everything transmitted
        // before the answered frame is complete.
        while self
            .tx
            .window
            .front()
            .is_some_and(|e| e.header.sync != resp.sync_id)
        {
            if let Some(e) = self.tx.window.pop_front() {
                e.ticket.set(Status::Complete, Some(ResponseKind::Ack));
            }
        }

        match resp.kind {
            ResponseKind::Ack => {
                if let Some(e) = self.tx.window.pop_front() {
                    e.ticket.set(Status::Complete, Some(ResponseKind::Ack));
                }
                self.tx.sync_last = Some(resp.sync_id);
            }
            ResponseKind::Reject => {
                // The remote will never accept this frame; retrying it
                // is pointless.
                warn!("remote rejected frame sync {}", resp.sync_id);
                if let Some(e) = self.tx.window.pop_front() {
                    e.ticket.set(Status::Failed, Some(ResponseKind::Reject));
                }
                self.tx.sync_last = Some(resp.sync_id);
            }
            kind => {
                if kind == ResponseKind::Nyet {
                    warn!("reserved NYET response, treating as NACK");
                }
                // Pull the window back onto the front of the queue in
                // reverse, so retransmission preserves original order.
                while let Some(e) = self.tx.window.pop_back() {
                    e.ticket.set(Status::Retry, Some(kind));
                    self.tx_queue.push_front(TxEntry::Data(e));
                }
            }
        }
    }

    // Connection management.

    fn synchronise(&mut self) -> Result<()> {
        info!("switching remote to binary protocol");
        self.stream_write(control::PROLOGUE)?;
        info!("attempting binary stream synchronisation");
        let payload = self.control.sync_payload(self.config.max_block_size)?;
        self.tx_queue.push_back(TxEntry::Data(DataEntry {
            header: Header {
                frame_type: FrameType::DataFaf,
                sync: 0,
                channel: control::CONTROL_CHANNEL,
                packet_id: control::SYNC_PACKET_ID,
                payload_size: payload.len() as u16,
            },
            payload,
            ticket: TxTicket::new(),
            assigned: false,
        }));
        Ok(())
    }

    fn reconnect(&mut self) -> Result<()> {
        self.shared.set_synchronised(false);
        let _ = self.channel.close();
        self.fail_inflight("connection reset");
        self.rx.reset_connection();
        for e in self.tx.reset_connection() {
            e.ticket.set(Status::Failed, None);
        }
        warn!("attempting reconnection to the byte channel");
        for attempt in 1..=self.config.reconnect_attempts {
            let _ = self.channel.close();
            thread::sleep(Duration::from_millis(100));
            match self.channel.open() {
                Ok(()) => {
                    info!("byte channel reopened on attempt {attempt}");
                    return self.synchronise();
                }
                Err(e) => {
                    error!("reconnect attempt {attempt} failed: {e}");
                    thread::sleep(self.config.reconnect_backoff);
                }
            }
        }
        Err(Error::Fatal("unable to reopen the byte channel".into()))
    }
}

/// A framed, reliable, multiplexed transport over one byte channel.
///
/// Dropping the transport stops the worker. [`TransportLayer::shutdown`]
/// does the same but surfaces any fatal error the worker died with.
pub struct TransportLayer {
    shared: Arc<Shared>,
    control: ControlService,
    sync_interval: Duration,
    worker: Option<thread::JoinHandle<()>>,
}

impl TransportLayer {
    /// Create a transport over `channel` and start its worker thread.
    ///
    /// The channel should already be open; the worker only reopens it
    /// after an I/O error.
    pub fn new(channel: Box<dyn ByteChannel>, config: Config) -> Result<TransportLayer> {
        let shared = Arc::new(Shared::new(config.max_block_size));
        let control = ControlService::new()?;
        control.service().attach_transport(&shared);
        info!("{} listening on channel 0", control.service().name());
        shared
            .services
            .lock()
            .unwrap()
            .insert(control::CONTROL_CHANNEL, control.service().clone());
        let sync_interval = config.sync_interval;
        let mut worker = Worker::new(shared.clone(), config, channel, control.clone())?;
        let handle = thread::Builder::new()
            .name("packetstream worker".to_string())
            .spawn(move || worker.run())?;
        Ok(TransportLayer {
            shared,
            control,
            sync_interval,
            worker: Some(handle),
        })
    }

    /// Attach a service to a channel. Channel 0 belongs to the built-in
    /// control service; attaching twice to one channel is an error.
    pub fn attach(&self, channel: u8, service: Service) -> Result<()> {
        if channel == control::CONTROL_CHANNEL {
            return Err(Error::InvalidArgument(
                "channel 0 is reserved for the control service".into(),
            ));
        }
        let mut services = self.shared.services.lock().unwrap();
        if let Some(existing) = services.get(&channel) {
            return Err(Error::InvalidArgument(format!(
                "{} is already attached to channel {channel}",
                existing.name()
            )));
        }
        info!("{} listening on channel {channel}", service.name());
        service.attach_transport(&self.shared);
        services.insert(channel, service);
        Ok(())
    }

    /// Run the sync handshake until the transport is synchronised.
    ///
    /// The request is repeated at the configured sync interval; a peer
    /// that stays silent past `timeout` fails the call.
    pub fn connect(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut next_sync = Instant::now();
        while !self.shared.is_synchronised() {
            self.check_fatal()?;
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(timeout));
            }
            if now >= next_sync {
                self.shared.sync_requested.store(true, Ordering::SeqCst);
                next_sync = now + self.sync_interval;
            }
            thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }

    /// Gracefully close the session with the peer.
    pub fn disconnect(&self, timeout: Duration) -> Result<()> {
        self.control.disconnect(timeout)?;
        self.shared.set_synchronised(false);
        Ok(())
    }

    /// Ask the worker to close and reopen the byte channel and redo the
    /// sync handshake. In-flight packets are failed.
    pub fn reconnect(&self) {
        self.shared.reconnect_requested.store(true, Ordering::SeqCst);
    }

    /// Ask the remote device to reboot. Anything it had buffered is
    /// lost.
    pub fn reset_remote(&self) -> Result<()> {
        self.control.reset_remote()
    }

    /// Whether the sync handshake has completed.
    #[must_use]
    pub fn is_synchronised(&self) -> bool {
        self.shared.is_synchronised()
    }

    /// Negotiated payload ceiling; zero before the first sync.
    #[must_use]
    pub fn max_block_size(&self) -> usize {
        self.shared.negotiated_block_size()
    }

    /// Stop the worker thread and surface any fatal transport error.
    pub fn shutdown(mut self) -> Result<()> {
        self.shared.active.store(false, Ordering::SeqCst);
        if let Some(h) = self.worker.take() {
            let _ = h.join();
        }
        self.check_fatal()
    }

    fn check_fatal(&self) -> Result<()> {
        match self.shared.fatal.lock().unwrap().as_ref() {
            Some(msg) => Err(Error::Fatal(msg.clone())),
            None => Ok(()),
        }
    }
}

impl Drop for TransportLayer {
    fn drop(&mut self) {
        self.shared.active.store(false, Ordering::SeqCst);
        if let Some(h) = self.worker.take() {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Field, Record, Schema};
    use crate::frame::DataFrame;

    #[derive(Default)]
    struct ScriptInner {
        rx: VecDeque<u8>,
        tx: Vec<u8>,
        fail_next_read: bool,
        opens: usize,
    }

    /// Scripted channel: tests feed bytes in and inspect what the
    /// worker wrote out.
    #[derive(Clone, Default)]
    struct ScriptChannel(Arc<Mutex<ScriptInner>>);

    impl ScriptChannel {
        fn feed(&self, bytes: &[u8]) {
            self.0.lock().unwrap().rx.extend(bytes);
        }
        fn written(&self) -> Vec<u8> {
            self.0.lock().unwrap().tx.clone()
        }
        fn clear_written(&self) {
            self.0.lock().unwrap().tx.clear();
        }
        fn fail_next_read(&self) {
            self.0.lock().unwrap().fail_next_read = true;
        }
        fn opens(&self) -> usize {
            self.0.lock().unwrap().opens
        }
    }

    impl ByteChannel for ScriptChannel {
        fn open(&mut self) -> Result<()> {
            self.0.lock().unwrap().opens += 1;
            Ok(())
        }
        fn close(&mut self) -> Result<()> {
            Ok(())
        }
        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            let mut inner = self.0.lock().unwrap();
            if inner.fail_next_read {
                inner.fail_next_read = false;
                return Err(Error::Io(std::io::ErrorKind::BrokenPipe.into()));
            }
            let n = buf.len().min(inner.rx.len());
            for b in buf.iter_mut().take(n) {
                *b = inner.rx.pop_front().unwrap_or_default();
            }
            Ok(n)
        }
        fn write(&mut self, buf: &[u8]) -> Result<usize> {
            self.0.lock().unwrap().tx.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn bytes_available(&mut self) -> Result<usize> {
            let mut inner = self.0.lock().unwrap();
            if inner.fail_next_read {
                inner.fail_next_read = false;
                return Err(Error::Io(std::io::ErrorKind::BrokenPipe.into()));
            }
            Ok(inner.rx.len())
        }
    }

    fn pair_schema(id: u8) -> Arc<Schema> {
        Arc::new(
            Schema::new("Pair", Some(id), vec![Field::u16("a"), Field::u16("b")]).unwrap(),
        )
    }

    fn test_config() -> Config {
        Config {
            reconnect_attempts: 1,
            reconnect_backoff: Duration::from_millis(0),
            ..Config::default()
        }
    }

    fn worker_with_service(channel_no: u8) -> (Worker, ScriptChannel, Service) {
        let chan = ScriptChannel::default();
        let shared = Arc::new(Shared::new(512));
        let control = ControlService::new().unwrap();
        control.service().attach_transport(&shared);
        shared
            .services
            .lock()
            .unwrap()
            .insert(control::CONTROL_CHANNEL, control.service().clone());
        let svc = Service::new("test");
        svc.register_packet(pair_schema(7)).unwrap();
        svc.attach_transport(&shared);
        shared.services.lock().unwrap().insert(channel_no, svc.clone());
        let w = Worker::new(shared, test_config(), Box::new(chan.clone()), control).unwrap();
        (w, chan, svc)
    }

    fn pump(w: &mut Worker, rounds: usize) {
        for _ in 0..rounds {
            w.control.update(&w.shared);
            w.process_receive().unwrap();
            w.process_transmit().unwrap();
        }
    }

    fn data_frame(sync: u8, channel: u8, packet_id: u8, payload: &[u8]) -> Vec<u8> {
        let mut f = DataFrame::new(FrameType::Data, channel, packet_id, payload.to_vec());
        f.header.sync = sync;
        f.encode()
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    fn count(haystack: &[u8], needle: &[u8]) -> usize {
        haystack.windows(needle.len()).filter(|w| *w == needle).count()
    }

    fn ack(sync: u8) -> Vec<u8> {
        ResponseFrame {
            kind: ResponseKind::Ack,
            sync_id: sync,
        }
        .encode()
        .to_vec()
    }

    #[test]
    fn accepts_frame_and_acks() {
        let (mut w, chan, svc) = worker_with_service(1);
        chan.feed(&data_frame(0, 1, 7, &[0x34, 0x12, 0xcd, 0xab]));
        pump(&mut w, 30);
        let got = svc.wait_packet(7, Duration::from_millis(10)).unwrap();
        assert_eq!(got.record.uint("a").unwrap(), 0x1234);
        assert_eq!(got.record.uint("b").unwrap(), 0xabcd);
        assert_eq!(got.sync, 0);
        assert!(contains(&chan.written(), &ack(0)));
        assert_eq!(w.rx.expected_sync, 1);
    }

    #[test]
    fn zero_payload_frame_dispatches() {
        let (mut w, chan, svc) = worker_with_service(1);
        let empty = Arc::new(Schema::new("Empty", Some(9), vec![]).unwrap());
        svc.register_packet(empty).unwrap();
        chan.feed(&data_frame(0, 1, 9, &[]));
        pump(&mut w, 30);
        assert!(svc.wait_packet(9, Duration::from_millis(10)).is_ok());
        assert!(contains(&chan.written(), &ack(0)));
    }

    #[test]
    fn duplicate_frame_reacked_once_dispatched() {
        // The ACK for a frame is lost; the peer resends. The receiver
        // repeats the ACK but must not deliver the packet twice.
        let (mut w, chan, svc) = worker_with_service(1);
        let frame = data_frame(0, 1, 7, &[1, 0, 2, 0]);
        chan.feed(&frame);
        pump(&mut w, 30);
        chan.feed(&frame);
        pump(&mut w, 40);
        assert_eq!(count(&chan.written(), &ack(0)), 2);
        assert!(svc.wait_packet(7, Duration::from_millis(10)).is_ok());
        assert!(svc.wait_packet(7, Duration::from_millis(20)).is_err());
        assert_eq!(w.rx.expected_sync, 1);
    }

    #[test]
    fn unknown_packet_id_rejected_sync_unchanged() {
        let (mut w, chan, svc) = worker_with_service(1);
        chan.feed(&data_frame(0, 1, 99, &[1, 2]));
        pump(&mut w, 30);
        let reject = ResponseFrame {
            kind: ResponseKind::Reject,
            sync_id: 0,
        }
        .encode();
        assert!(contains(&chan.written(), &reject));
        assert_eq!(w.rx.expected_sync, 0);
        // The next valid frame still uses sync 0 and goes through.
        chan.feed(&data_frame(0, 1, 7, &[5, 0, 6, 0]));
        pump(&mut w, 30);
        assert!(svc.wait_packet(7, Duration::from_millis(10)).is_ok());
        assert_eq!(w.rx.expected_sync, 1);
    }

    #[test]
    fn unknown_channel_rejected() {
        let (mut w, chan, _svc) = worker_with_service(1);
        chan.feed(&data_frame(0, 42, 7, &[1, 0, 2, 0]));
        pump(&mut w, 30);
        let reject = ResponseFrame {
            kind: ResponseKind::Reject,
            sync_id: 0,
        }
        .encode();
        assert!(contains(&chan.written(), &reject));
        assert_eq!(w.rx.expected_sync, 0);
    }

    #[test]
    fn boundary_noise_is_discarded() {
        let (mut w, chan, svc) = worker_with_service(1);
        // 17 bytes that never form the token pattern.
        chan.feed(&[0u8; 17]);
        chan.feed(&data_frame(0, 1, 7, &[9, 0, 9, 0]));
        pump(&mut w, 80);
        assert!(svc.wait_packet(7, Duration::from_millis(10)).is_ok());
        assert!(svc.wait_packet(7, Duration::from_millis(10)).is_err());
    }

    #[test]
    fn corrupt_payload_nacks_then_recovers() {
        let (mut w, chan, svc) = worker_with_service(1);
        let mut bytes = data_frame(0, 1, 7, &[1, 0, 2, 0]);
        bytes[frame::HEADER_SIZE] ^= 0x01;
        chan.feed(&bytes);
        pump(&mut w, 30);
        let nack = ResponseFrame {
            kind: ResponseKind::Nack,
            sync_id: 0,
        }
        .encode();
        assert!(contains(&chan.written(), &nack));
        assert_eq!(w.rx.retries, 1);
        assert!(svc.wait_packet(7, Duration::from_millis(10)).is_err());
        // The retransmission succeeds and clears the retry counter.
        chan.feed(&data_frame(0, 1, 7, &[1, 0, 2, 0]));
        pump(&mut w, 30);
        assert!(svc.wait_packet(7, Duration::from_millis(10)).is_ok());
        assert_eq!(w.rx.retries, 0);
    }

    #[test]
    fn corrupt_header_faf_dropped_silently() {
        let (mut w, chan, _svc) = worker_with_service(1);
        let mut f = DataFrame::new(FrameType::DataFaf, 1, 7, vec![1, 0, 2, 0]);
        f.header.sync = 0;
        let mut bytes = f.encode();
        bytes[4] ^= 0xff; // damage packet_id, invalidating the CRC-8
        chan.feed(&bytes);
        pump(&mut w, 40);
        // No NACK for fire-and-forget.
        let nack = ResponseFrame {
            kind: ResponseKind::Nack,
            sync_id: 0,
        }
        .encode();
        assert!(!contains(&chan.written(), &nack));
    }

    #[test]
    fn retry_budget_exhaustion_resets_connection() {
        let mut cfg = test_config();
        cfg.rx_retry_budget = 2;
        let chan = ScriptChannel::default();
        let shared = Arc::new(Shared::new(512));
        let control = ControlService::new().unwrap();
        shared
            .services
            .lock()
            .unwrap()
            .insert(control::CONTROL_CHANNEL, control.service().clone());
        let mut w = Worker::new(shared, cfg, Box::new(chan.clone()), control).unwrap();
        for _ in 0..3 {
            let mut bytes = data_frame(0, 1, 7, &[1, 0, 2, 0]);
            bytes[frame::HEADER_SIZE] ^= 0x01;
            chan.feed(&bytes);
            pump(&mut w, 40);
        }
        // Two NACKs spent, then the stream was declared broken.
        assert_eq!(w.rx.retries, 0);
        assert_eq!(w.rx.state, RxState::Reset);
    }

    fn send_n(svc: &Service, n: usize, frame_type: FrameType) -> Vec<TxTicket> {
        let schema = pair_schema(7);
        (0..n)
            .map(|i| {
                let mut r = Record::new(&schema);
                r.set("a", i as u16).unwrap();
                svc.send_packet(&r, frame_type).unwrap()
            })
            .collect()
    }

    #[test]
    fn window_fills_and_cumulative_ack_retires() {
        let (mut w, chan, svc) = worker_with_service(1);
        w.shared.set_synchronised(true);
        let tickets = send_n(&svc, 3, FrameType::Data);
        pump(&mut w, 10);
        assert_eq!(w.tx.window.len(), 3);
        let syncs: Vec<u8> = w.tx.window.iter().map(|e| e.header.sync).collect();
        assert_eq!(syncs, vec![0, 1, 2]);
        for t in &tickets {
            assert_eq!(t.status(), Status::InTransit);
        }
        // ACK for sync 1 retires 0 and 1.
        chan.feed(&ack(1));
        pump(&mut w, 30);
        assert_eq!(w.tx.window.len(), 1);
        assert_eq!(w.tx.sync_last, Some(1));
        assert_eq!(tickets[0].status(), Status::Complete);
        assert_eq!(tickets[1].status(), Status::Complete);
        assert_eq!(tickets[2].status(), Status::InTransit);
        chan.feed(&ack(2));
        pump(&mut w, 30);
        assert_eq!(tickets[2].status(), Status::Complete);
        assert!(w.tx.window.is_empty());
        assert_eq!(w.tx.sync_last, Some(2));
    }

    #[test]
    fn nack_retransmits_window_in_order() {
        let (mut w, chan, svc) = worker_with_service(1);
        w.shared.set_synchronised(true);
        let tickets = send_n(&svc, 3, FrameType::Data);
        pump(&mut w, 10);
        let first_pass = chan.written();
        chan.clear_written();
        chan.feed(
            &ResponseFrame {
                kind: ResponseKind::Nack,
                sync_id: 0,
            }
            .encode(),
        );
        pump(&mut w, 30);
        // Same frames, same syncs, same order.
        assert_eq!(chan.written(), first_pass);
        assert_eq!(w.tx.window.len(), 3);
        let syncs: Vec<u8> = w.tx.window.iter().map(|e| e.header.sync).collect();
        assert_eq!(syncs, vec![0, 1, 2]);
        for t in &tickets {
            assert_eq!(t.status(), Status::InTransit);
        }
    }

    #[test]
    fn nyet_treated_as_nack() {
        let (mut w, chan, svc) = worker_with_service(1);
        w.shared.set_synchronised(true);
        send_n(&svc, 2, FrameType::Data);
        pump(&mut w, 10);
        chan.clear_written();
        chan.feed(
            &ResponseFrame {
                kind: ResponseKind::Nyet,
                sync_id: 0,
            }
            .encode(),
        );
        pump(&mut w, 30);
        assert_eq!(w.tx.window.len(), 2);
        let syncs: Vec<u8> = w.tx.window.iter().map(|e| e.header.sync).collect();
        assert_eq!(syncs, vec![0, 1]);
    }

    #[test]
    fn reject_fails_packet_permanently() {
        let (mut w, chan, svc) = worker_with_service(1);
        w.shared.set_synchronised(true);
        let tickets = send_n(&svc, 1, FrameType::Data);
        pump(&mut w, 10);
        chan.feed(
            &ResponseFrame {
                kind: ResponseKind::Reject,
                sync_id: 0,
            }
            .encode(),
        );
        pump(&mut w, 30);
        assert_eq!(tickets[0].status(), Status::Failed);
        assert_eq!(tickets[0].response(), Some(ResponseKind::Reject));
        assert!(w.tx.window.is_empty());
        assert_eq!(w.tx.sync_last, Some(0));
    }

    #[test]
    fn response_for_unknown_sync_is_dropped() {
        let (mut w, chan, svc) = worker_with_service(1);
        w.shared.set_synchronised(true);
        send_n(&svc, 1, FrameType::Data);
        pump(&mut w, 10);
        chan.feed(&ack(9));
        pump(&mut w, 30);
        // Nothing moved.
        assert_eq!(w.tx.window.len(), 1);
        assert_eq!(w.tx.sync_last, None);
    }

    #[test]
    fn faf_bypasses_window_and_syncs() {
        let (mut w, _chan, svc) = worker_with_service(1);
        w.shared.set_synchronised(true);
        let faf = send_n(&svc, 1, FrameType::DataFaf);
        let data = send_n(&svc, 1, FrameType::Data);
        pump(&mut w, 10);
        assert_eq!(faf[0].status(), Status::Complete);
        assert_eq!(w.tx.window.len(), 1);
        // The data frame took sync 0; fire-and-forget consumed nothing.
        assert_eq!(w.tx.window[0].header.sync, 0);
        assert_eq!(data[0].status(), Status::InTransit);
    }

    #[test]
    fn window_cap_upgrades_data_nack() {
        let (mut w, _chan, svc) = worker_with_service(1);
        w.shared.set_synchronised(true);
        send_n(&svc, 260, FrameType::DataNack);
        pump(&mut w, 600);
        assert_eq!(w.tx.window.len(), WINDOW_CAP);
        // The frame that filled the window was upgraded to demand an
        // acknowledgement; the ones before it were not.
        assert_eq!(w.tx.window[WINDOW_CAP - 1].header.frame_type, FrameType::Data);
        assert_eq!(w.tx.window[0].header.frame_type, FrameType::DataNack);
        // The rest are still queued.
        assert_eq!(w.tx_queue.len() + w.tx.window.len(), 260);
    }

    #[test]
    fn sync_handshake() {
        let (mut w, chan, _svc) = worker_with_service(1);
        w.synchronise().unwrap();
        pump(&mut w, 10);
        let out = chan.written();
        assert!(out.starts_with(control::PROLOGUE));
        // Prologue is followed by the fire-and-forget sync frame.
        let frame_bytes = &out[control::PROLOGUE.len()..];
        let parsed = DataFrame::parse(frame_bytes).unwrap();
        assert_eq!(parsed.header.frame_type, FrameType::DataFaf);
        assert_eq!(parsed.header.channel, 0);
        assert_eq!(parsed.header.packet_id, control::SYNC_PACKET_ID);
        // version 0.2.0, then 512 byte buffers.
        assert_eq!(
            parsed.payload,
            vec![0, 0, 2, 0, 0, 0, 0, 2, 0, 2]
        );
        assert!(!w.shared.is_synchronised());

        // Peer answers with smaller buffers; we adopt the minimum.
        let reply: Vec<u8> = [0u16, 2, 0, 256, 256]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        chan.feed(&data_frame(0, 0, control::SYNC_PACKET_ID, &reply));
        pump(&mut w, 30);
        assert!(w.shared.is_synchronised());
        assert_eq!(w.shared.negotiated_block_size(), 256);
        assert!(contains(&chan.written(), &ack(0)));
    }

    #[test]
    fn remote_initiated_sync_gets_a_reply() {
        let (mut w, chan, _svc) = worker_with_service(1);
        let advert: Vec<u8> = [0u16, 2, 0, 128, 128]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let mut f = DataFrame::new(FrameType::DataFaf, 0, control::SYNC_PACKET_ID, advert);
        f.header.sync = 0;
        chan.feed(&f.encode());
        pump(&mut w, 40);
        assert!(w.shared.is_synchronised());
        assert_eq!(w.shared.negotiated_block_size(), 128);
        // Our own sync went out as an ordinary data frame.
        let out = chan.written();
        let reply = DataFrame::parse(&out).unwrap();
        assert_eq!(reply.header.channel, 0);
        assert_eq!(reply.header.packet_id, control::SYNC_PACKET_ID);
        assert_eq!(reply.header.frame_type, FrameType::Data);
    }

    #[test]
    fn io_error_triggers_reconnect_and_resync() {
        let (mut w, chan, svc) = worker_with_service(1);
        w.shared.set_synchronised(true);
        let tickets = send_n(&svc, 1, FrameType::Data);
        pump(&mut w, 10);
        chan.clear_written();
        chan.fail_next_read();
        let err = w.tick().unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        w.reconnect().unwrap();
        assert_eq!(chan.opens(), 1);
        assert!(!w.shared.is_synchronised());
        assert_eq!(tickets[0].status(), Status::Failed);
        assert!(w.tx.window.is_empty());
        // Reconnect ends with a fresh sync attempt.
        pump(&mut w, 10);
        assert!(chan.written().starts_with(control::PROLOGUE));
    }

    #[test]
    fn reconnect_gives_up_after_budget() {
        struct DeadChannel;
        impl ByteChannel for DeadChannel {
            fn open(&mut self) -> Result<()> {
                Err(Error::Io(std::io::ErrorKind::ConnectionRefused.into()))
            }
            fn close(&mut self) -> Result<()> {
                Ok(())
            }
            fn read(&mut self, _buf: &mut [u8]) -> Result<usize> {
                Err(Error::Io(std::io::ErrorKind::BrokenPipe.into()))
            }
            fn write(&mut self, _buf: &[u8]) -> Result<usize> {
                Err(Error::Io(std::io::ErrorKind::BrokenPipe.into()))
            }
            fn bytes_available(&mut self) -> Result<usize> {
                Err(Error::Io(std::io::ErrorKind::BrokenPipe.into()))
            }
        }
        let shared = Arc::new(Shared::new(512));
        let control = ControlService::new().unwrap();
        shared
            .services
            .lock()
            .unwrap()
            .insert(control::CONTROL_CHANNEL, control.service().clone());
        let mut w = Worker::new(shared, test_config(), Box::new(DeadChannel), control).unwrap();
        assert!(matches!(w.reconnect(), Err(Error::Fatal(_))));
    }
}
