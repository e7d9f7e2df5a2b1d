#![warn(missing_docs)]
/*! Reliable, framed, multi-channel packet transport over an unreliable
byte stream.

This crate speaks the binary packet protocol used by serial-attached
devices such as a 3D printer running Marlin in binary transfer mode. It
takes any lossy duplex byte channel (USB CDC, a TCP serial bridge, an
in-memory loopback) and provides ordered, acknowledged delivery of typed
packets multiplexed over up to 256 logical channels.

# Architecture overview

A transport owns one background worker thread which does all wire I/O:
parsing frames out of the byte stream, maintaining the sliding window of
in-flight transmissions, and answering with ACK/NACK/REJECT responses.
Caller threads talk to *services*, one per channel, each with its own
table of packet schemas and its own inbox of decoded packets.

```text
          caller threads                      worker thread
  [ Service (channel 1) inbox/outbox ]  ┐
  [ Service (channel 2) inbox/outbox ]  ├─ [ TransportLayer ] ── [ ByteChannel ]
  [ Control service (channel 0)      ]  ┘    frame parser,
                                             transmit window,
                                             responses
```

Receive path: raw bytes are parsed into frames, the frame's channel and
packet id select a schema from the service registry, the payload is
decoded by the declarative [codec](codec), and the packet lands in the
service's inbox (or a scoped listener queue). Transmit path: a service
encodes a packet, the worker wraps it in a frame, assigns the next
sequence number, appends it to the window and writes it out. Responses
from the peer retire or retransmit window entries.

# Example

```no_run
use std::sync::Arc;
use std::time::Duration;

use packetstream::channel::TcpChannel;
use packetstream::codec::{Field, Record, Schema};
use packetstream::frame::FrameType;
use packetstream::service::Service;
use packetstream::transport::{Config, TransportLayer};

let chan = TcpChannel::new("localhost:7000");
let transport = TransportLayer::new(Box::new(chan), Config::default())?;

let probe = Arc::new(Schema::new(
    "Probe",
    Some(1),
    vec![Field::u16("x"), Field::u16("y")],
)?);
let svc = Service::new("probe");
svc.register_packet(probe.clone())?;
transport.attach(1, svc.clone())?;

transport.connect(Duration::from_secs(10))?;
let mut p = Record::new(&probe);
p.set("x", 3u16)?;
p.set("y", 7u16)?;
svc.send_packet_blocking(&p, FrameType::Data, Duration::from_secs(5))?;
transport.shutdown()?;
# Ok::<(), packetstream::Error>(())
```
*/

pub mod channel;
pub mod checksum;
pub mod codec;
pub mod control;
pub mod file_service;
pub mod frame;
pub mod service;
pub mod transport;

/// Protocol version advertised in the sync handshake.
pub const VERSION: (u16, u16, u16) = (0, 2, 0);

/// Crate error type.
///
/// Transient wire faults (bad CRCs, out-of-order frames) never show up
/// here; the worker absorbs those and retries. These are the errors that
/// reach API call sites.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed frame data where a whole frame was expected.
    #[error("framing error: {0}")]
    Framing(String),

    /// A record could not be encoded or decoded against its schema.
    #[error("codec error: {0}")]
    Codec(String),

    /// The remote end reported an operation failure.
    #[error("remote error: {0}")]
    Remote(String),

    /// A bounded wait elapsed.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Caller error: bad argument, duplicate channel, unregistered id.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The transport gave up, typically after repeated reconnect
    /// failures. Requires a new transport to recover.
    #[error("transport failed: {0}")]
    Fatal(String),

    /// Byte channel I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Crate result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
