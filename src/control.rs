/*! Built-in control service on channel 0.

Owns the session lifecycle packets: the sync handshake that negotiates
the payload ceiling, the graceful close, and the remote reset request.

The first sync attempt is preceded by a short plaintext prologue that
tells a Marlin peer to leave G-code mode and start talking the binary
protocol. That prologue is the only plaintext the transport ever emits.
*/
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::codec::{Field, Record, Schema};
use crate::frame::FrameType;
use crate::service::{Inbound, Service};
use crate::transport::Shared;
use crate::{Result, VERSION};

/// The channel reserved for the control service.
pub const CONTROL_CHANNEL: u8 = 0;
/// Packet id of the sync handshake packet.
pub const SYNC_PACKET_ID: u8 = 5;
/// Packet id of the graceful close packet.
pub const CLOSE_PACKET_ID: u8 = 7;
/// Packet id of the remote reset packet.
pub const RESET_PACKET_ID: u8 = 8;
/// Plaintext emitted before the first sync to switch the peer into
/// binary mode.
pub const PROLOGUE: &[u8] = b"\nM28B1\n";

/// The control service and its packet schemas.
#[derive(Clone)]
pub struct ControlService {
    service: Service,
    sync_schema: Arc<Schema>,
    close_schema: Arc<Schema>,
    reset_schema: Arc<Schema>,
}

impl ControlService {
    pub(crate) fn new() -> Result<ControlService> {
        let sync_schema = Arc::new(Schema::new(
            "Sync",
            Some(SYNC_PACKET_ID),
            vec![
                Field::u16("version_major"),
                Field::u16("version_minor"),
                Field::u16("version_patch"),
                Field::u16("serial_buffer_size"),
                Field::u16("payload_buffer_size"),
            ],
        )?);
        let close_schema = Arc::new(Schema::new("Close", Some(CLOSE_PACKET_ID), vec![])?);
        let reset_schema = Arc::new(Schema::new("Reset", Some(RESET_PACKET_ID), vec![])?);
        let service = Service::new("control");
        service.register_packet(sync_schema.clone())?;
        service.register_packet(close_schema.clone())?;
        Ok(ControlService {
            service,
            sync_schema,
            close_schema,
            reset_schema,
        })
    }

    pub(crate) fn service(&self) -> &Service {
        &self.service
    }

    fn sync_record(&self, block_size: usize) -> Result<Record> {
        let advertised = u16::try_from(block_size).unwrap_or(u16::MAX);
        let mut r = Record::new(&self.sync_schema);
        r.set("version_major", VERSION.0)?;
        r.set("version_minor", VERSION.1)?;
        r.set("version_patch", VERSION.2)?;
        r.set("serial_buffer_size", advertised)?;
        r.set("payload_buffer_size", advertised)?;
        Ok(r)
    }

    /// Encoded sync packet advertising `block_size` buffers.
    pub(crate) fn sync_payload(&self, block_size: usize) -> Result<Vec<u8>> {
        self.sync_record(block_size)?.encode()
    }

    /// Process control packets the worker has dispatched to channel 0.
    pub(crate) fn update(&self, shared: &Shared) {
        while let Some(packet) = self.service.try_pop_inbox() {
            match packet.packet_id {
                SYNC_PACKET_ID => self.handle_sync(shared, &packet),
                CLOSE_PACKET_ID => info!("remote closed the session"),
                other => debug!("ignoring control packet id {other}"),
            }
        }
    }

    fn handle_sync(&self, shared: &Shared, packet: &Inbound) {
        let Ok(payload_buffer) = packet.record.uint("payload_buffer_size") else {
            warn!("sync packet without a payload buffer size");
            return;
        };
        let negotiated = (payload_buffer as usize).min(shared.default_block_size());
        shared.set_negotiated_block_size(negotiated);
        shared.set_synchronised(true);
        info!(
            "transport synchronised (version {}.{}.{}, {}B serial buffer, {}B payload buffer)",
            packet.record.uint("version_major").unwrap_or(0),
            packet.record.uint("version_minor").unwrap_or(0),
            packet.record.uint("version_patch").unwrap_or(0),
            packet.record.uint("serial_buffer_size").unwrap_or(0),
            payload_buffer,
        );
        if packet.frame_type == FrameType::DataFaf {
            // The remote started the handshake; answer with our own
            // advertisement, this time with delivery confirmation.
            info!("remote sync request accepted");
            match self.sync_record(shared.default_block_size()) {
                Ok(r) => {
                    if let Err(e) = self.service.send_packet(&r, FrameType::Data) {
                        warn!("failed to queue sync reply: {e}");
                    }
                }
                Err(e) => warn!("failed to build sync reply: {e}"),
            }
        }
    }

    /// Graceful close, confirmed by the peer.
    pub(crate) fn disconnect(&self, timeout: Duration) -> Result<()> {
        let rec = Record::new(&self.close_schema);
        self.service
            .send_packet_blocking(&rec, FrameType::Data, timeout)
    }

    /// Request a remote reboot. Not confirmed.
    pub(crate) fn reset_remote(&self) -> Result<()> {
        warn!("resetting the remote device drops everything it had buffered");
        let rec = Record::new(&self.reset_schema);
        self.service.send_packet(&rec, FrameType::Data).map(|_| ())
    }
}
