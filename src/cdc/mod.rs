//! On-the-wire compression translator.
//!
//! Deployed in pairs: the server-side instance compresses read replies and
//! decompresses incoming writes; the client-side instance mirrors that.
//! Compressed payloads are flagged by a canary key in the side-channel
//! metadata; payloads without the canary pass through untouched, so mixed
//! deployments degrade to plain transfer instead of corrupting data.

pub mod codec;

use std::sync::Arc;

use log::{debug, warn};

use crate::errno::Errno;
use crate::fdtable::Fd;
use crate::fop::{Payload, ReadReply, WriteReply};
use crate::options::{OptSpec, OptType, Options};
use crate::stack::{Frame, Unwinder};
use crate::xdata::{XKey, Xdata};
use crate::xlator::{XlCore, Xlator};

use codec::CodecConfig;

const OPTIONS: &[OptSpec] = &[
    OptSpec { key: "mode", typ: OptType::Str, default: "client", desc: "client or server" },
    OptSpec {
        key: "algorithm",
        typ: OptType::Str,
        default: "deflate",
        desc: "deflate or zstd (zstd requires the cargo feature)",
    },
    OptSpec {
        key: "compression-level",
        typ: OptType::Int { min: -1, max: 9 },
        default: "-1",
        desc: "deflate level, -1 for the library default",
    },
    OptSpec {
        key: "window-size",
        typ: OptType::Int { min: 9, max: 15 },
        default: "15",
        desc: "raw deflate window bits",
    },
    OptSpec {
        key: "min-size",
        typ: OptType::Size,
        default: "128",
        desc: "payloads smaller than this are not compressed",
    },
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CdcMode {
    Client,
    Server,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Algo {
    Deflate,
    #[cfg(feature = "zstd")]
    Zstd,
}

/// The codec state proper; small and copyable so reply-path closures can
/// carry it across the wind.
#[derive(Clone, Copy, Debug)]
struct Engine {
    algo: Algo,
    config: CodecConfig,
    min_size: usize,
}

impl Engine {
    fn canary(&self) -> XKey {
        match self.algo {
            Algo::Deflate => XKey::DeflateCanary,
            #[cfg(feature = "zstd")]
            Algo::Zstd => XKey::ZstdCanary,
        }
    }

    /// Compress `payload`, stamping the canary into `xdata`. Payloads under
    /// the threshold pass through unmarked.
    fn pack(&self, payload: Payload, xdata: &mut Xdata) -> Result<Payload, Errno> {
        if payload.len() < self.min_size {
            return Ok(payload);
        }
        let packed = match self.algo {
            Algo::Deflate => codec::deflate_compress(&payload, &self.config)?,
            #[cfg(feature = "zstd")]
            Algo::Zstd => codec::zstd_compress(&payload, self.config.level)?,
        };
        xdata.set_flag(self.canary());
        Ok(Payload::from_vec(packed))
    }

    /// Reverse of `pack`: decode if a canary is present, removing it.
    fn unpack(&self, payload: Payload, xdata: &mut Xdata) -> Result<Payload, Errno> {
        let key = if xdata.contains(XKey::DeflateCanary) {
            XKey::DeflateCanary
        } else if xdata.contains(XKey::ZstdCanary) {
            XKey::ZstdCanary
        } else {
            return Ok(payload);
        };
        // Single-vector only: scattered compressed input is not reassembled
        // here. See the codec notes in DESIGN.md.
        if payload.buffer_count() > 1 {
            warn!("cdc: multi-vector compressed payload not supported");
            return Err(Errno::EOPNOTSUPP);
        }
        let buf = payload.contiguous();
        let plain = match key {
            XKey::DeflateCanary => codec::deflate_decompress(&buf)?,
            #[cfg(feature = "zstd")]
            XKey::ZstdCanary => codec::zstd_decompress(&buf)?,
            #[cfg(not(feature = "zstd"))]
            XKey::ZstdCanary => {
                warn!("cdc: zstd payload but zstd support not compiled in");
                return Err(Errno::EOPNOTSUPP);
            }
            _ => unreachable!("canary keys only"),
        };
        xdata.remove(key);
        debug!("cdc: unpacked {} -> {} bytes", buf.len(), plain.len());
        Ok(Payload::from_vec(plain))
    }
}

/// Bidirectional codec translator.
#[derive(Debug)]
pub struct Cdc {
    core: XlCore,
    mode: CdcMode,
    engine: Engine,
}

impl Cdc {
    pub fn new(name: &str, options: &Options, child: Arc<dyn Xlator>) -> Arc<Cdc> {
        let mode = if options.get_str("mode") == "server" { CdcMode::Server } else { CdcMode::Client };
        let algo = match options.get_str("algorithm") {
            #[cfg(feature = "zstd")]
            "zstd" => Algo::Zstd,
            other => {
                if other != "deflate" {
                    warn!("cdc: algorithm {other:?} unavailable, using deflate");
                }
                Algo::Deflate
            }
        };
        Arc::new(Cdc {
            core: XlCore::new(name, vec![child]),
            mode,
            engine: Engine {
                algo,
                config: CodecConfig {
                    level: options.get_int("compression-level") as i32,
                    window_bits: options.get_int("window-size") as u8,
                },
                min_size: options.get_size("min-size") as usize,
            },
        })
    }

    pub fn option_table() -> &'static [OptSpec] {
        OPTIONS
    }
}

impl Xlator for Cdc {
    fn core(&self) -> &XlCore {
        &self.core
    }

    fn option_specs(&self) -> &'static [OptSpec] {
        OPTIONS
    }

    fn readv(
        &self,
        frame: Frame,
        fd: Arc<Fd>,
        size: usize,
        offset: u64,
        flags: u32,
        xdata: Xdata,
        unw: Unwinder<ReadReply>,
    ) {
        let child = self.core.first_child().expect("has child").clone();
        let engine = self.engine;
        let unw = match self.mode {
            // Server: compress the reply on its way to the wire.
            CdcMode::Server => unw.map(move |res: crate::stack::FopResult<ReadReply>| {
                let mut reply = res?;
                reply.payload = engine.pack(reply.payload, &mut reply.xdata)?;
                Ok(reply)
            }),
            // Client: decompress a canaried reply coming back up.
            CdcMode::Client => unw.map(move |res: crate::stack::FopResult<ReadReply>| {
                let mut reply = res?;
                reply.payload = engine.unpack(reply.payload, &mut reply.xdata)?;
                Ok(reply)
            }),
        };
        child.readv(frame, fd, size, offset, flags, xdata, unw);
    }

    fn writev(
        &self,
        frame: Frame,
        fd: Arc<Fd>,
        payload: Payload,
        offset: u64,
        flags: u32,
        mut xdata: Xdata,
        unw: Unwinder<WriteReply>,
    ) {
        let child = self.core.first_child().expect("has child").clone();
        let caller_len = payload.len();
        let result = match self.mode {
            // Client: compress on the way down.
            CdcMode::Client => self.engine.pack(payload, &mut xdata),
            // Server: restore plaintext before it reaches storage.
            CdcMode::Server => self.engine.unpack(payload, &mut xdata),
        };
        match result {
            Ok(payload) => {
                // The count reported upward must reflect what the writer
                // handed in, not the transformed length.
                let report = match self.mode {
                    CdcMode::Client => caller_len,
                    CdcMode::Server => payload.len(),
                };
                let unw = unw.map(move |res: crate::stack::FopResult<WriteReply>| {
                    let mut reply = res?;
                    reply.count = report;
                    Ok(reply)
                });
                child.writev(frame, fd, payload, offset, flags, xdata, unw);
            }
            Err(errno) => unw.errno(errno),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fop::{Attr, FopKind, OpenFlags};
    use crate::gfid::Gfid;
    use crate::itable::InodeTable;
    use crate::stack::SyncCall;
    use crate::xlator::Graph;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Stores the last written payload and serves it back on readv.
    struct WireEnd {
        core: XlCore,
        stored: Mutex<(Payload, Xdata)>,
    }

    impl Xlator for WireEnd {
        fn core(&self) -> &XlCore {
            &self.core
        }

        fn readv(
            &self,
            _frame: Frame,
            _fd: Arc<Fd>,
            _size: usize,
            _offset: u64,
            _flags: u32,
            _xdata: Xdata,
            unw: Unwinder<ReadReply>,
        ) {
            let (payload, xdata) = self.stored.lock().clone();
            unw.okay(ReadReply { payload, attr: Attr::synthetic_dir(Gfid::ROOT), xdata });
        }

        fn writev(
            &self,
            _frame: Frame,
            _fd: Arc<Fd>,
            payload: Payload,
            _offset: u64,
            _flags: u32,
            xdata: Xdata,
            unw: Unwinder<WriteReply>,
        ) {
            let count = payload.len();
            *self.stored.lock() = (payload, xdata);
            let attr = Attr::synthetic_dir(Gfid::ROOT);
            unw.okay(WriteReply { count, pre: attr, post: attr, xdata: Xdata::new() });
        }
    }

    fn cdc_over_wire(mode: &str, min_size: &str) -> (Graph, Arc<WireEnd>) {
        let wire = Arc::new(WireEnd {
            core: XlCore::new("wire", vec![]),
            stored: Mutex::new((Payload::new(), Xdata::new())),
        });
        let mut raw = HashMap::new();
        raw.insert("mode".to_string(), mode.to_string());
        raw.insert("min-size".to_string(), min_size.to_string());
        let opts = Options::validate(Cdc::option_table(), &raw).unwrap();
        let graph = Graph::assemble(Cdc::new("cdc", &opts, wire.clone())).unwrap();
        (graph, wire)
    }

    fn fd() -> Arc<Fd> {
        Fd::new(InodeTable::new().root(), OpenFlags::RDWR, 1)
    }

    #[test]
    fn client_write_compresses_and_read_restores() {
        let (graph, wire) = cdc_over_wire("client", "16");
        let plain: Vec<u8> = (0..32 * 1024u32).map(|i| (i % 13) as u8).collect();

        let call = SyncCall::<WriteReply>::new();
        graph.root().writev(
            Frame::internal(),
            fd(),
            Payload::from_vec(plain.clone()),
            0,
            0,
            Xdata::new(),
            call.unwinder(Frame::internal(), FopKind::Writev),
        );
        assert_eq!(call.wait().unwrap().count, plain.len());

        // What hit the wire is compressed and canaried.
        {
            let (stored, xdata) = wire.stored.lock().clone();
            assert!(xdata.contains(XKey::DeflateCanary));
            assert!(stored.len() < plain.len());
            assert_ne!(&*stored.contiguous(), plain.as_slice());
        }

        // Reading back through the client decompresses transparently.
        let call = SyncCall::<ReadReply>::new();
        graph.root().readv(
            Frame::internal(),
            fd(),
            plain.len(),
            0,
            0,
            Xdata::new(),
            call.unwinder(Frame::internal(), FopKind::Readv),
        );
        let reply = call.wait().unwrap();
        assert_eq!(&*reply.payload.contiguous(), plain.as_slice());
        assert!(!reply.xdata.contains(XKey::DeflateCanary));
    }

    #[test]
    fn small_payload_passes_through_unmarked() {
        let (graph, wire) = cdc_over_wire("client", "1024");
        let call = SyncCall::<WriteReply>::new();
        graph.root().writev(
            Frame::internal(),
            fd(),
            Payload::from_vec(b"tiny".to_vec()),
            0,
            0,
            Xdata::new(),
            call.unwinder(Frame::internal(), FopKind::Writev),
        );
        call.wait().unwrap();
        let (stored, xdata) = wire.stored.lock().clone();
        assert!(!xdata.contains(XKey::DeflateCanary));
        assert_eq!(&*stored.contiguous(), b"tiny");
    }

    #[test]
    fn server_decompresses_canaried_write() {
        let (graph, wire) = cdc_over_wire("server", "16");
        let plain = vec![42u8; 4096];
        let packed =
            codec::deflate_compress(&Payload::from_vec(plain.clone()), &CodecConfig::default())
                .unwrap();
        let mut xdata = Xdata::new();
        xdata.set_flag(XKey::DeflateCanary);

        let call = SyncCall::<WriteReply>::new();
        graph.root().writev(
            Frame::internal(),
            fd(),
            Payload::from_vec(packed),
            0,
            0,
            xdata,
            call.unwinder(Frame::internal(), FopKind::Writev),
        );
        let reply = call.wait().unwrap();
        assert_eq!(reply.count, plain.len());
        let (stored, xdata) = wire.stored.lock().clone();
        assert_eq!(&*stored.contiguous(), plain.as_slice());
        assert!(!xdata.contains(XKey::DeflateCanary));
    }

    #[test]
    fn multi_vector_compressed_input_is_a_hard_error() {
        let (graph, _wire) = cdc_over_wire("server", "16");
        let mut scattered = Payload::new();
        scattered.push(Arc::from(&[1u8; 32][..]));
        scattered.push(Arc::from(&[2u8; 32][..]));
        let mut xdata = Xdata::new();
        xdata.set_flag(XKey::DeflateCanary);

        let call = SyncCall::<WriteReply>::new();
        graph.root().writev(
            Frame::internal(),
            fd(),
            scattered,
            0,
            0,
            xdata,
            call.unwinder(Frame::internal(), FopKind::Writev),
        );
        assert_eq!(call.wait().unwrap_err(), Errno::EOPNOTSUPP);
    }

    #[test]
    fn server_read_reply_carries_canary_and_trailer() {
        let (graph, wire) = cdc_over_wire("server", "16");
        let block: Vec<u8> = (0..1024 * 1024u32).map(|i| (i / 512) as u8).collect();
        *wire.stored.lock() = (Payload::from_vec(block.clone()), Xdata::new());

        let call = SyncCall::<ReadReply>::new();
        graph.root().readv(
            Frame::internal(),
            fd(),
            block.len(),
            0,
            0,
            Xdata::new(),
            call.unwinder(Frame::internal(), FopKind::Readv),
        );
        let reply = call.wait().unwrap();
        assert!(reply.xdata.contains(XKey::DeflateCanary));
        let packed = reply.payload.contiguous();
        assert!(packed.len() >= codec::TRAILER_SIZE);
        // Client-side decode validates crc and length.
        let plain = codec::deflate_decompress(&packed).unwrap();
        assert_eq!(plain, block);
    }
}
