/*! Services: the per-channel consumers of the transport.

A service owns a table of packet schemas keyed by packet id, an inbox
of decoded packets, and an outbox the transport worker drains. Callers
block in [`Service::wait_packet`] or on a [`TxTicket`], with explicit
deadlines. A scoped [`Listener`] can siphon one packet type away from
the inbox for the duration of an operation.

All queues are shared by exactly two parties, a caller thread and the
transport worker, and are plain mutex + condvar FIFOs.
*/
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use log::debug;

use crate::codec::{Record, Schema};
use crate::frame::{FrameType, ResponseKind, Status};
use crate::transport;
use crate::{Error, Result};

struct QueueInner<T> {
    queue: Mutex<VecDeque<T>>,
    cv: Condvar,
}

/// Unbounded FIFO shared between one producer and one consumer.
pub(crate) struct PacketQueue<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for PacketQueue<T> {
    fn clone(&self) -> Self {
        PacketQueue {
            inner: self.inner.clone(),
        }
    }
}

impl<T> PacketQueue<T> {
    pub(crate) fn new() -> PacketQueue<T> {
        PacketQueue {
            inner: Arc::new(QueueInner {
                queue: Mutex::new(VecDeque::new()),
                cv: Condvar::new(),
            }),
        }
    }

    pub(crate) fn push(&self, v: T) {
        self.inner.queue.lock().unwrap().push_back(v);
        self.inner.cv.notify_all();
    }

    pub(crate) fn pop(&self) -> Option<T> {
        self.inner.queue.lock().unwrap().pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }

    /// Remove and return the first entry matching `pred`, waiting up to
    /// `timeout` for one to arrive. Non-matching entries stay queued.
    pub(crate) fn take_match(
        &self,
        timeout: Duration,
        pred: impl Fn(&T) -> bool,
    ) -> Result<T> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.queue.lock().unwrap();
        loop {
            if let Some(pos) = guard.iter().position(&pred) {
                if let Some(v) = guard.remove(pos) {
                    return Ok(v);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(timeout));
            }
            let (g, _) = self.inner.cv.wait_timeout(guard, deadline - now).unwrap();
            guard = g;
        }
    }
}

/// A decoded packet delivered to a service, with the frame context it
/// arrived in.
#[derive(Clone, Debug)]
pub struct Inbound {
    /// Packet id the frame carried.
    pub packet_id: u8,
    /// The decoded record.
    pub record: Record,
    /// Frame type the packet arrived as.
    pub frame_type: FrameType,
    /// Channel the frame arrived on.
    pub channel: u8,
    /// Sequence number of the carrying frame.
    pub sync: u8,
}

struct StatusCell {
    state: Mutex<(Status, Option<ResponseKind>)>,
    cv: Condvar,
}

/// Delivery status handle for a sent packet.
///
/// The worker updates it as the packet moves through the transmit
/// queue, the window, and finally completes or fails.
#[derive(Clone)]
pub struct TxTicket {
    cell: Arc<StatusCell>,
}

impl TxTicket {
    pub(crate) fn new() -> TxTicket {
        TxTicket {
            cell: Arc::new(StatusCell {
                state: Mutex::new((Status::Pending, None)),
                cv: Condvar::new(),
            }),
        }
    }

    /// Current delivery status.
    #[must_use]
    pub fn status(&self) -> Status {
        self.cell.state.lock().unwrap().0
    }

    /// The last response the peer gave for this packet, if any.
    #[must_use]
    pub fn response(&self) -> Option<ResponseKind> {
        self.cell.state.lock().unwrap().1
    }

    pub(crate) fn set(&self, status: Status, response: Option<ResponseKind>) {
        let mut guard = self.cell.state.lock().unwrap();
        guard.0 = status;
        if response.is_some() {
            guard.1 = response;
        }
        self.cell.cv.notify_all();
    }

    /// Block until the packet reaches a terminal status, `Complete` or
    /// `Failed`.
    pub fn wait_terminal(&self, timeout: Duration) -> Result<Status> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.cell.state.lock().unwrap();
        loop {
            if matches!(guard.0, Status::Complete | Status::Failed) {
                return Ok(guard.0);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(timeout));
            }
            let (g, _) = self.cell.cv.wait_timeout(guard, deadline - now).unwrap();
            guard = g;
        }
    }
}

/// An encoded packet waiting in a service outbox.
pub(crate) struct Outbound {
    pub(crate) frame_type: FrameType,
    pub(crate) packet_id: u8,
    pub(crate) payload: Vec<u8>,
    pub(crate) ticket: TxTicket,
}

struct ServiceInner {
    name: String,
    packets: Mutex<HashMap<u8, Arc<Schema>>>,
    inbox: PacketQueue<Inbound>,
    outbox: PacketQueue<Outbound>,
    listeners: Mutex<HashMap<u8, PacketQueue<Inbound>>>,
    transport: Mutex<Weak<transport::Shared>>,
}

/// A consumer of decoded packets on one transport channel.
///
/// Cheap to clone; clones share the same queues and schema table.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl Service {
    /// Create a detached service. Attach it with
    /// [`TransportLayer::attach`](crate::transport::TransportLayer::attach).
    #[must_use]
    pub fn new(name: impl Into<String>) -> Service {
        Service {
            inner: Arc::new(ServiceInner {
                name: name.into(),
                packets: Mutex::new(HashMap::new()),
                inbox: PacketQueue::new(),
                outbox: PacketQueue::new(),
                listeners: Mutex::new(HashMap::new()),
                transport: Mutex::new(Weak::new()),
            }),
        }
    }

    /// Service name, used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Bind a schema under its own declared packet id.
    pub fn register_packet(&self, schema: Arc<Schema>) -> Result<()> {
        let id = schema.packet_id().ok_or_else(|| {
            Error::InvalidArgument(format!(
                "schema {} declares no packet id",
                schema.name()
            ))
        })?;
        self.register_packet_as(schema, id)
    }

    /// Bind a schema under an explicit packet id.
    pub fn register_packet_as(&self, schema: Arc<Schema>, packet_id: u8) -> Result<()> {
        debug!(
            "{}: registered packet id {packet_id} ({})",
            self.inner.name,
            schema.name()
        );
        self.inner.packets.lock().unwrap().insert(packet_id, schema);
        Ok(())
    }

    /// Enqueue a packet for transmission, returning its status handle.
    ///
    /// The packet id is taken from the record's schema. The outbox is
    /// drained once the transport is synchronised.
    pub fn send_packet(&self, record: &Record, frame_type: FrameType) -> Result<TxTicket> {
        let id = record.schema().packet_id().ok_or_else(|| {
            Error::InvalidArgument(format!(
                "schema {} declares no packet id",
                record.schema().name()
            ))
        })?;
        self.send_packet_as(id, record, frame_type)
    }

    /// Enqueue a packet under an explicit packet id.
    pub fn send_packet_as(
        &self,
        packet_id: u8,
        record: &Record,
        frame_type: FrameType,
    ) -> Result<TxTicket> {
        if frame_type == FrameType::Response {
            return Err(Error::InvalidArgument(
                "services cannot send response frames".into(),
            ));
        }
        let payload = record.encode()?;
        if payload.len() > usize::from(u16::MAX) {
            return Err(Error::InvalidArgument(format!(
                "payload of {} bytes exceeds the frame limit",
                payload.len()
            )));
        }
        let ticket = TxTicket::new();
        self.inner.outbox.push(Outbound {
            frame_type,
            packet_id,
            payload,
            ticket: ticket.clone(),
        });
        Ok(ticket)
    }

    /// Send and wait for confirmed delivery.
    ///
    /// Only `Data` frames have confirmed delivery; for other types this
    /// returns as soon as the packet is queued. A packet the remote
    /// rejects, or that is lost to a connection reset, fails here.
    pub fn send_packet_blocking(
        &self,
        record: &Record,
        frame_type: FrameType,
        timeout: Duration,
    ) -> Result<()> {
        let ticket = self.send_packet(record, frame_type)?;
        if frame_type != FrameType::Data {
            return Ok(());
        }
        match ticket.wait_terminal(timeout)? {
            Status::Failed => match ticket.response() {
                Some(ResponseKind::Reject) => {
                    Err(Error::Remote("packet rejected by remote".into()))
                }
                _ => Err(Error::Remote("packet lost to connection reset".into())),
            },
            _ => Ok(()),
        }
    }

    /// Block until a packet with `packet_id` arrives in the inbox.
    ///
    /// Packets of other types are skipped over and stay queued.
    pub fn wait_packet(&self, packet_id: u8, timeout: Duration) -> Result<Inbound> {
        self.inner
            .inbox
            .take_match(timeout, |p| p.packet_id == packet_id)
    }

    /// Block until any packet arrives in the inbox.
    ///
    /// For server-style consumers that switch on the packet id instead
    /// of waiting for one type.
    pub fn recv_packet(&self, timeout: Duration) -> Result<Inbound> {
        self.inner.inbox.take_match(timeout, |_| true)
    }

    /// Install a scoped listener for `packet_id`.
    ///
    /// While the listener lives, matching packets bypass the inbox and
    /// queue on the listener instead. At most one listener per packet
    /// id; the registration is removed when the listener drops.
    pub fn listen(&self, packet_id: u8) -> Result<Listener> {
        let mut listeners = self.inner.listeners.lock().unwrap();
        if listeners.contains_key(&packet_id) {
            return Err(Error::InvalidArgument(format!(
                "{}: listener for packet id {packet_id} already installed",
                self.inner.name
            )));
        }
        let queue = PacketQueue::new();
        listeners.insert(packet_id, queue.clone());
        Ok(Listener {
            service: self.clone(),
            packet_id,
            queue,
        })
    }

    /// Negotiated payload ceiling, available once the transport this
    /// service is attached to has synchronised.
    pub fn max_block_size(&self) -> Result<usize> {
        let shared = self.inner.transport.lock().unwrap().upgrade();
        shared
            .map(|s| s.negotiated_block_size())
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "{}: service not attached to a transport",
                    self.inner.name
                ))
            })
    }

    /// Number of packets waiting in the outbox.
    #[must_use]
    pub fn pending_tx(&self) -> usize {
        self.inner.outbox.len()
    }

    pub(crate) fn attach_transport(&self, shared: &Arc<transport::Shared>) {
        *self.inner.transport.lock().unwrap() = Arc::downgrade(shared);
    }

    pub(crate) fn schema(&self, packet_id: u8) -> Option<Arc<Schema>> {
        self.inner.packets.lock().unwrap().get(&packet_id).cloned()
    }

    /// Deliver a decoded packet to the listener for its type, or to the
    /// inbox.
    pub(crate) fn dispatch(&self, packet: Inbound) {
        let listeners = self.inner.listeners.lock().unwrap();
        match listeners.get(&packet.packet_id) {
            Some(q) => q.push(packet),
            None => self.inner.inbox.push(packet),
        }
    }

    pub(crate) fn pop_outbound(&self) -> Option<Outbound> {
        self.inner.outbox.pop()
    }

    pub(crate) fn try_pop_inbox(&self) -> Option<Inbound> {
        self.inner.inbox.pop()
    }
}

/// Scoped typed listener returned by [`Service::listen`].
pub struct Listener {
    service: Service,
    packet_id: u8,
    queue: PacketQueue<Inbound>,
}

impl Listener {
    /// Wait for the next packet of the listened type.
    pub fn recv(&self, timeout: Duration) -> Result<Inbound> {
        self.queue.take_match(timeout, |_| true)
    }

    /// Non-blocking variant of [`recv`](Listener::recv).
    #[must_use]
    pub fn try_recv(&self) -> Option<Inbound> {
        self.queue.pop()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.service
            .inner
            .listeners
            .lock()
            .unwrap()
            .remove(&self.packet_id);
    }
}
