/*! File transfer demo.

Connects to a device speaking the binary packet protocol over a TCP
serial bridge (for example `ser2net` in raw mode in front of a
printer's USB CDC port), or to a small in-process fake with
`--selftest`, and drives the file service.

```no_run
$ cargo run --example transfer -- --selftest --ls
$ cargo run --example transfer -- -a 192.168.1.50:7000 --ls -v 2
$ cargo run --example transfer -- -a 192.168.1.50:7000 --put cube.g
```
*/
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::{info, warn};

use packetstream::channel::{ByteChannel, TcpChannel, loopback_pair};
use packetstream::codec::{Field, Record, Schema};
use packetstream::file_service::{FileMeta, FileService, packet_id};
use packetstream::frame::FrameType;
use packetstream::service::Service;
use packetstream::transport::{Config, TransportLayer};

#[derive(clap::Parser, Debug)]
#[command(version, about)]
struct Opt {
    #[arg(long = "addr", short, help = "TCP serial bridge (host:port)")]
    addr: Option<String>,

    #[arg(long, help = "Talk to an in-process fake device instead")]
    selftest: bool,

    #[arg(short = 'v', default_value = "0")]
    verbose: usize,

    #[arg(long, default_value = "512", help = "Offered payload block size")]
    block_size: usize,

    #[arg(long, default_value = "10s", help = "Per-operation deadline")]
    timeout: humantime::Duration,

    #[arg(long, help = "List the remote working directory")]
    ls: bool,

    #[arg(long, help = "Upload a file")]
    put: Option<PathBuf>,

    #[arg(long, help = "Remote name for --put (defaults to the file name)")]
    dest: Option<String>,

    #[arg(long, help = "Download a remote file")]
    get: Option<String>,

    #[arg(long, help = "Local path for --get")]
    out: Option<PathBuf>,

    #[arg(long, help = "Stay connected until Ctrl-C")]
    stay: bool,
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    stderrlog::new()
        .module(module_path!())
        .module("packetstream")
        .verbosity(opt.verbose)
        .init()?;

    let timeout: Duration = opt.timeout.into();
    let config = Config {
        max_block_size: opt.block_size,
        ..Config::default()
    };

    let channel: Box<dyn ByteChannel> = if opt.selftest {
        let (near, far) = loopback_pair();
        spawn_fake_printer(far, config.clone())?;
        Box::new(near)
    } else {
        let addr = opt
            .addr
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("either --addr or --selftest is required"))?;
        let mut chan = TcpChannel::new(addr);
        chan.open()?;
        Box::new(chan)
    };

    let transport = TransportLayer::new(channel, config)?;
    let mut files = FileService::new()?;
    files.set_timeout(timeout);
    transport.attach(1, files.service().clone())?;

    transport.connect(timeout)?;
    info!("synchronised, block size {}", transport.max_block_size());
    files.query_remote()?;

    if opt.ls {
        files.mount()?;
        for entry in files.ls()? {
            match entry.meta {
                FileMeta::Folder => println!("*\t{}/", entry.filename),
                _ => println!("{}\t{}", entry.size, entry.filename),
            }
        }
        files.unmount()?;
    }

    if let Some(src) = &opt.put {
        files.mount()?;
        let sent = files.put(src, opt.dest.as_deref(), false)?;
        println!("uploaded {sent} bytes from {}", src.display());
        files.unmount()?;
    }

    if let Some(src) = &opt.get {
        let out = opt
            .out
            .clone()
            .unwrap_or_else(|| PathBuf::from(src.rsplit('/').next().unwrap_or(src)));
        files.mount()?;
        let got = files.get(src, &out)?;
        println!("downloaded {got} bytes to {}", out.display());
        files.unmount()?;
    }

    if opt.stay {
        let (tx, rx) = std::sync::mpsc::channel();
        ctrlc::set_handler(move || {
            let _ = tx.send(());
        })?;
        println!("connected; press Ctrl-C to disconnect");
        let _ = rx.recv();
    }

    transport.disconnect(timeout)?;
    transport.shutdown()?;
    Ok(())
}

/// A fake printer on the far end of the loopback: its own transport
/// plus a file service remote that approves everything and serves a
/// canned directory listing.
fn spawn_fake_printer(channel: packetstream::channel::LoopbackChannel, config: Config) -> Result<()> {
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
    let response = Arc::new(Schema::new(
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

    let service = Service::new("fake-printer");
    service.register_packet(query.clone())?;
    service.register_packet(open)?;
    service.register_packet(data)?;
    service.register_packet_as(action, packet_id::CD)?;
    for id in [
        packet_id::LIST,
        packet_id::MOUNT,
        packet_id::UNMOUNT,
        packet_id::CLOSE,
        packet_id::ABORT,
        packet_id::PWD,
    ] {
        service.register_packet_as(command.clone(), id)?;
    }

    let transport = TransportLayer::new(Box::new(channel), config)?;
    transport.attach(1, service.clone())?;

    std::thread::Builder::new()
        .name("fake printer".to_string())
        .spawn(move || {
            // The transport must outlive the demo session.
            let _transport = transport;
            let reply_success = || {
                let rec = Record::new(&response);
                service.send_packet(&rec, FrameType::Data).map(|_| ())
            };
            loop {
                let packet = match service.recv_packet(Duration::from_secs(60)) {
                    Ok(p) => p,
                    Err(_) => break,
                };
                let result = match packet.packet_id {
                    packet_id::QUERY => {
                        let mut rec = Record::new(&query);
                        rec.set("version_minor", 1u16)
                            .and_then(|()| service.send_packet(&rec, FrameType::Data).map(|_| ()))
                    }
                    packet_id::LIST => {
                        let entries =
                            [(0u8, 0u8, 0u32, "gcodes"), (1, 1, 4096, "benchy.g"), (2, 2, 0, "")];
                        entries.iter().try_for_each(|(index, meta, size, name)| {
                            let mut rec = Record::new(&info);
                            rec.set("index", *index)?;
                            rec.set("meta", *meta)?;
                            rec.set("size", *size)?;
                            rec.set("filename", *name)?;
                            service.send_packet(&rec, FrameType::Data).map(|_| ())
                        })
                    }
                    packet_id::PWD => {
                        let mut rec = Record::new(&info);
                        rec.set("meta", 0u8)
                            .and_then(|()| rec.set("filename", "/"))
                            .and_then(|()| service.send_packet(&rec, FrameType::Data).map(|_| ()))
                    }
                    packet_id::WRITE => Ok(()),
                    _ => reply_success(),
                };
                if let Err(e) = result {
                    warn!("fake printer failed to answer: {e}");
                }
            }
        })?;
    Ok(())
}
