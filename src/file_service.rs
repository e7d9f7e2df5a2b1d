/*! File transfer service.

A consumer of the transport, conventionally attached to channel 1,
speaking the remote's file protocol: query, mount, directory listing,
chdir, and chunked uploads and downloads.

Uploads stream interior chunks as `DataNack` frames while the outbox is
shallow, so the wire stays busy without waiting for each ACK, and drop
to plain `Data` frames (confirmed delivery) for the final chunk and
whenever too much is in flight.
*/
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use crate::codec::{Field, Record, Schema};
use crate::frame::FrameType;
use crate::service::{Inbound, Service};
use crate::{Error, Result};

/// Packet ids understood by the remote file service.
#[allow(missing_docs)]
pub mod packet_id {
    pub const QUERY: u8 = 0;
    pub const ACTION: u8 = 1;
    pub const ACTION_RESPONSE: u8 = 2;
    pub const OPEN: u8 = 3;
    pub const CLOSE: u8 = 4;
    pub const WRITE: u8 = 5;
    pub const ABORT: u8 = 6;
    pub const REQUEST: u8 = 7;
    pub const LIST: u8 = 8;
    pub const CD: u8 = 9;
    pub const PWD: u8 = 10;
    pub const FILE: u8 = 11;
    pub const MOUNT: u8 = 12;
    pub const UNMOUNT: u8 = 13;
}

/// Outcome code in an action response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ActionOutcome {
    Success = 0,
    Busy = 1,
    Fail = 2,
    IoError = 3,
    Invalid = 4,
}

impl ActionOutcome {
    fn from_code(code: u64) -> ActionOutcome {
        match code {
            0 => ActionOutcome::Success,
            1 => ActionOutcome::Busy,
            2 => ActionOutcome::Fail,
            3 => ActionOutcome::IoError,
            _ => ActionOutcome::Invalid,
        }
    }
}

/// Kind of a directory entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileMeta {
    /// A directory.
    Folder,
    /// A regular file.
    File,
    /// End-of-listing marker; never surfaced to callers.
    Eol,
}

impl FileMeta {
    fn from_code(code: u64) -> Option<FileMeta> {
        match code {
            0 => Some(FileMeta::Folder),
            1 => Some(FileMeta::File),
            2 => Some(FileMeta::Eol),
            _ => None,
        }
    }
}

/// One entry of a directory listing.
#[derive(Clone, Debug)]
pub struct FileEntry {
    /// Position in the listing.
    pub index: u8,
    /// File or folder.
    pub meta: FileMeta,
    /// Size in bytes; zero for folders.
    pub size: u32,
    /// Name relative to the remote working directory.
    pub filename: String,
}

/// Keep streaming unconfirmed chunks only while fewer than this many
/// are queued locally.
const STREAM_DEPTH: usize = 64;

/// Client for the remote file service.
pub struct FileService {
    service: Service,
    query: Arc<Schema>,
    open: Arc<Schema>,
    info: Arc<Schema>,
    action: Arc<Schema>,
    data: Arc<Schema>,
    command: Arc<Schema>,
    timeout: Duration,
}

impl FileService {
    /// Create the service. Attach [`FileService::service`] to a channel
    /// before use.
    pub fn new() -> Result<FileService> {
        let query = Arc::new(Schema::new(
            "FileQuery",
            Some(packet_id::QUERY),
            vec![
                Field::u16("version_major"),
                Field::u16("version_minor"),
                Field::u16("version_patch"),
                Field::u8("compression_support"),
                Field::u8("compression_lookahead"),
                Field::u8("compression_window"),
            ],
        )?);
        let action_response = Arc::new(Schema::new(
            "ActionResponse",
            Some(packet_id::ACTION_RESPONSE),
            vec![Field::u8("code")],
        )?);
        let open = Arc::new(Schema::new(
            "FileOpen",
            Some(packet_id::OPEN),
            vec![
                Field::u8("dummy"),
                Field::u8("compression"),
                Field::cstring("filename"),
            ],
        )?);
        let info = Arc::new(Schema::new(
            "FileInfo",
            Some(packet_id::FILE),
            vec![
                Field::u8("index"),
                Field::u8("meta"),
                Field::u32("size"),
                Field::cstring("filename"),
            ],
        )?);
        let action = Arc::new(Schema::new(
            "FileAction",
            None,
            vec![Field::u8("action"), Field::cstring("filename")],
        )?);
        let data = Arc::new(Schema::new(
            "FileData",
            Some(packet_id::WRITE),
            vec![Field::bytes("data")],
        )?);
        let command = Arc::new(Schema::new("FileCommand", None, vec![])?);

        let service = Service::new("file");
        service.register_packet(query.clone())?;
        service.register_packet(action_response)?;
        service.register_packet(info.clone())?;
        service.register_packet(data.clone())?;

        Ok(FileService {
            service,
            query,
            open,
            info,
            action,
            data,
            command,
            timeout: Duration::from_secs(10),
        })
    }

    /// The underlying transport service, for
    /// [`TransportLayer::attach`](crate::transport::TransportLayer::attach).
    #[must_use]
    pub fn service(&self) -> &Service {
        &self.service
    }

    /// Change the per-operation deadline.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Exchange version and compression capabilities with the remote.
    pub fn query_remote(&self) -> Result<(u16, u16, u16)> {
        let mut r = Record::new(&self.query);
        r.set("version_minor", 1u16)?;
        r.set("compression_support", 1u8)?;
        r.set("compression_lookahead", 4u8)?;
        r.set("compression_window", 8u8)?;
        self.service.send_packet(&r, FrameType::Data)?;
        let reply = self.service.wait_packet(packet_id::QUERY, self.timeout)?;
        let version = (
            reply.record.uint("version_major")? as u16,
            reply.record.uint("version_minor")? as u16,
            reply.record.uint("version_patch")? as u16,
        );
        info!(
            "remote file service version {}.{}.{}",
            version.0, version.1, version.2
        );
        Ok(version)
    }

    fn expect_success(&self, what: &str) -> Result<()> {
        let reply = self
            .service
            .wait_packet(packet_id::ACTION_RESPONSE, self.timeout)?;
        match ActionOutcome::from_code(reply.record.uint("code")?) {
            ActionOutcome::Success => Ok(()),
            outcome => Err(Error::Remote(format!("{what} failed: {outcome:?}"))),
        }
    }

    fn command(&self, id: u8, what: &str) -> Result<()> {
        let rec = Record::new(&self.command);
        self.service.send_packet_as(id, &rec, FrameType::Data)?;
        self.expect_success(what)
    }

    /// Mount the remote storage medium.
    pub fn mount(&self) -> Result<()> {
        self.command(packet_id::MOUNT, "mount")
    }

    /// Unmount the remote storage medium.
    pub fn unmount(&self) -> Result<()> {
        self.command(packet_id::UNMOUNT, "unmount")
    }

    /// Close the currently open remote file.
    pub fn close(&self) -> Result<()> {
        self.command(packet_id::CLOSE, "close")
    }

    /// Abort the transfer in progress.
    pub fn abort(&self) -> Result<()> {
        self.command(packet_id::ABORT, "abort")
    }

    /// Open `filename` for writing on the remote.
    ///
    /// `dummy` asks the remote to discard the data, which is useful for
    /// throughput testing.
    pub fn open(&self, filename: &str, compression: bool, dummy: bool) -> Result<()> {
        let mut r = Record::new(&self.open);
        r.set("dummy", u8::from(dummy))?;
        r.set("compression", u8::from(compression))?;
        r.set("filename", filename)?;
        self.service.send_packet(&r, FrameType::Data)?;
        self.expect_success("open")?;
        info!("file {filename:?} opened");
        Ok(())
    }

    /// Change the remote working directory.
    pub fn cd(&self, path: &str) -> Result<()> {
        let mut r = Record::new(&self.action);
        r.set("filename", path)?;
        self.service
            .send_packet_as(packet_id::CD, &r, FrameType::Data)?;
        self.expect_success("cd")
    }

    /// Remote working directory.
    pub fn pwd(&self) -> Result<String> {
        let rec = Record::new(&self.command);
        self.service
            .send_packet_as(packet_id::PWD, &rec, FrameType::Data)?;
        let reply = self.service.wait_packet(packet_id::FILE, self.timeout)?;
        Ok(reply.record.text("filename")?.to_string())
    }

    /// List the remote working directory.
    pub fn ls(&self) -> Result<Vec<FileEntry>> {
        let mut listing = Vec::new();
        let listener = self.service.listen(packet_id::FILE)?;
        let rec = Record::new(&self.command);
        self.service
            .send_packet_as(packet_id::LIST, &rec, FrameType::Data)?;
        loop {
            let packet = listener.recv(self.timeout)?;
            match entry_from(&packet) {
                Some(entry) if entry.meta == FileMeta::Eol => break,
                Some(entry) => listing.push(entry),
                None => warn!("skipping malformed listing entry"),
            }
        }
        Ok(listing)
    }

    /// Stream `data` to the currently open remote file.
    ///
    /// Chunked by the negotiated block size. Interior chunks go out as
    /// `DataNack` while the outbox is shallow; the final chunk always
    /// demands confirmation, so a successful return means the remote
    /// has the bytes.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let block = self.service.max_block_size()?;
        if block == 0 {
            return Err(Error::InvalidArgument(
                "transport not synchronised, block size unknown".into(),
            ));
        }
        let mut sent = 0;
        for chunk in data.chunks(block) {
            let frame_type = if chunk.len() == block && self.service.pending_tx() < STREAM_DEPTH
            {
                FrameType::DataNack
            } else {
                FrameType::Data
            };
            let mut r = Record::new(&self.data);
            r.set("data", chunk)?;
            self.service
                .send_packet_blocking(&r, frame_type, self.timeout)?;
            sent += chunk.len();
        }
        Ok(sent)
    }

    /// Upload a local file.
    pub fn put(&self, src: &Path, dst: Option<&str>, dummy: bool) -> Result<usize> {
        let dst = match dst {
            Some(d) => d.to_string(),
            None => src
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    Error::InvalidArgument(format!("{} has no file name", src.display()))
                })?,
        };
        let data = std::fs::read(src)?;
        self.open(&dst, false, dummy)?;
        let sent = self.write(&data)?;
        self.close()?;
        Ok(sent)
    }

    /// Download a remote file.
    ///
    /// The remote streams chunks of the negotiated block size; the
    /// first short chunk ends the file.
    pub fn get(&self, src: &str, dst: &Path) -> Result<usize> {
        let block = self.service.max_block_size()?;
        if block == 0 {
            return Err(Error::InvalidArgument(
                "transport not synchronised, block size unknown".into(),
            ));
        }
        let mut r = Record::new(&self.open);
        r.set("filename", src)?;
        self.service
            .send_packet_as(packet_id::REQUEST, &r, FrameType::Data)?;
        self.expect_success("request")?;
        let mut out = Vec::new();
        loop {
            let packet = self.service.wait_packet(packet_id::WRITE, self.timeout)?;
            let chunk = packet.record.bytes("data")?;
            out.extend_from_slice(chunk);
            if chunk.len() < block {
                break;
            }
        }
        std::fs::write(dst, &out)?;
        Ok(out.len())
    }
}

fn entry_from(packet: &Inbound) -> Option<FileEntry> {
    Some(FileEntry {
        index: packet.record.uint("index").ok()? as u8,
        meta: FileMeta::from_code(packet.record.uint("meta").ok()?)?,
        size: packet.record.uint("size").ok()? as u32,
        filename: packet.record.text("filename").ok()?.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_packet_layout() -> Result<()> {
        let fs = FileService::new()?;
        let mut r = Record::new(&fs.query);
        r.set("version_minor", 1u16)?;
        r.set("compression_support", 1u8)?;
        r.set("compression_lookahead", 4u8)?;
        r.set("compression_window", 8u8)?;
        assert_eq!(r.encode()?, vec![0, 0, 1, 0, 0, 0, 1, 4, 8]);
        Ok(())
    }

    #[test]
    fn file_info_decodes() -> Result<()> {
        let fs = FileService::new()?;
        let mut bytes = vec![3, 1];
        bytes.extend_from_slice(&1024u32.to_le_bytes());
        bytes.extend_from_slice(b"part.g\0");
        let rec = Schema::decode(&fs.info, &bytes)?;
        let packet = Inbound {
            packet_id: packet_id::FILE,
            record: rec,
            frame_type: FrameType::Data,
            channel: 1,
            sync: 0,
        };
        let entry = entry_from(&packet).unwrap();
        assert_eq!(entry.index, 3);
        assert_eq!(entry.meta, FileMeta::File);
        assert_eq!(entry.size, 1024);
        assert_eq!(entry.filename, "part.g");
        Ok(())
    }

    #[test]
    fn meta_codes() {
        assert_eq!(FileMeta::from_code(0), Some(FileMeta::Folder));
        assert_eq!(FileMeta::from_code(2), Some(FileMeta::Eol));
        assert_eq!(FileMeta::from_code(9), None);
    }

    #[test]
    fn action_outcomes() {
        assert_eq!(ActionOutcome::from_code(0), ActionOutcome::Success);
        assert_eq!(ActionOutcome::from_code(3), ActionOutcome::IoError);
        assert_eq!(ActionOutcome::from_code(77), ActionOutcome::Invalid);
    }

    #[test]
    fn write_requires_synchronised_transport() {
        let fs = FileService::new().unwrap();
        // Not attached to any transport at all.
        assert!(fs.write(b"data").is_err());
    }
}
