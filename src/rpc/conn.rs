//! Client-side RPC connection: framing, outstanding-call table, keepalive
//! and reconnect.
//!
//! A connection owns two background threads: the connector (dial, handshake,
//! then the read loop until the transport dies, then a rate-limited retry)
//! and the pinger (a keepalive on the handshake program; two consecutive
//! missed replies declare the connection broken). Outstanding calls are
//! failed with ENOTCONN when the transport drops, never silently dropped.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use zerocopy::{FromBytes, IntoBytes};

use crate::errno::Errno;
use crate::rpc::{
    CallbackProc, HANDSHAKE_VERSION, HandshakeProc, PROG_HANDSHAKE, RpcHeader,
};

/// Largest frame either side will accept.
const MAX_FRAME: usize = 64 * 1024 * 1024;
/// Consecutive missed pings before the transport is declared broken.
const PING_MISS_LIMIT: u32 = 2;

/// Connection lifecycle notifications delivered to the owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnEvent {
    Connected,
    Disconnected,
}

pub type ReplyHandler = Box<dyn FnOnce(Result<Vec<u8>, Errno>) + Send>;
pub type EventHandler = Box<dyn Fn(ConnEvent) + Send + Sync>;
pub type CallbackHandler = Box<dyn Fn(CallbackProc, Vec<u8>) + Send + Sync>;

/// Connection tuning.
#[derive(Clone, Debug)]
pub struct ConnConfig {
    pub addr: String,
    pub volume: String,
    pub ping_interval: Duration,
    pub reconnect_delay: Duration,
}

pub(crate) fn write_frame(
    stream: &mut TcpStream,
    header: &RpcHeader,
    payload: &[u8],
) -> io::Result<()> {
    let header_bytes = header.as_bytes();
    let len = (header_bytes.len() + payload.len()) as u32;
    stream.write_all(&len.to_le_bytes())?;
    stream.write_all(header_bytes)?;
    stream.write_all(payload)?;
    Ok(())
}

pub(crate) fn read_frame(stream: &mut TcpStream) -> io::Result<(RpcHeader, Vec<u8>)> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len < size_of::<RpcHeader>() || len > MAX_FRAME {
        return Err(io::Error::new(io::ErrorKind::InvalidData, format!("bad frame length {len}")));
    }
    let mut frame = vec![0u8; len];
    stream.read_exact(&mut frame)?;
    let (header, payload) = RpcHeader::read_from_prefix(&frame)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "short header"))?;
    Ok((header, payload.to_vec()))
}

/// One logical connection to a server, surviving transport drops.
pub struct RpcConn {
    config: ConnConfig,
    writer: Mutex<Option<TcpStream>>,
    pending: Mutex<HashMap<u64, ReplyHandler>>,
    next_unique: AtomicU64,
    connected: AtomicBool,
    ping_missed: AtomicU32,
    stop: Arc<AtomicBool>,
    events: EventHandler,
    callbacks: Mutex<Option<CallbackHandler>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl RpcConn {
    /// Start the connection machinery; `events` observes up/down edges.
    pub fn start(config: ConnConfig, events: EventHandler) -> Arc<RpcConn> {
        let conn = Arc::new(RpcConn {
            config,
            writer: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_unique: AtomicU64::new(1),
            connected: AtomicBool::new(false),
            ping_missed: AtomicU32::new(0),
            stop: Arc::new(AtomicBool::new(false)),
            events,
            callbacks: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
        });
        let connector = {
            let conn = conn.clone();
            thread::Builder::new()
                .name("rpc-connector".into())
                .spawn(move || conn.connector_loop())
                .expect("spawn connector")
        };
        let pinger = {
            let conn = conn.clone();
            thread::Builder::new()
                .name("rpc-ping".into())
                .spawn(move || conn.ping_loop())
                .expect("spawn pinger")
        };
        conn.threads.lock().extend([connector, pinger]);
        conn
    }

    /// Register the handler for server-initiated callback-program requests.
    pub fn set_callback_handler(&self, handler: CallbackHandler) {
        *self.callbacks.lock() = Some(handler);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Stop reconnecting and drop the transport.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.force_disconnect();
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            let _ = handle.join();
        }
    }

    /// Issue one call; `cbk` fires exactly once, with the reply payload or
    /// the transport error.
    pub fn call(
        &self,
        program: u32,
        version: u32,
        procedure: u32,
        payload: Vec<u8>,
        cbk: ReplyHandler,
    ) {
        let unique = self.next_unique.fetch_add(1, Ordering::SeqCst);
        let header = RpcHeader::request(unique, program, version, procedure);
        {
            let mut writer = self.writer.lock();
            let Some(stream) = writer.as_mut() else {
                drop(writer);
                cbk(Err(Errno::ENOTCONN));
                return;
            };
            self.pending.lock().insert(unique, cbk);
            if let Err(err) = write_frame(stream, &header, &payload) {
                warn!("rpc send failed: {err}");
                drop(writer);
                if let Some(cbk) = self.pending.lock().remove(&unique) {
                    cbk(Err(Errno::ENOTCONN));
                }
                self.force_disconnect();
            }
        }
    }

    fn fail_pending(&self, errno: Errno) {
        let drained: Vec<ReplyHandler> =
            self.pending.lock().drain().map(|(_, cbk)| cbk).collect();
        for cbk in drained {
            cbk(Err(errno));
        }
    }

    fn force_disconnect(&self) {
        if let Some(stream) = self.writer.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn connector_loop(self: Arc<Self>) {
        while !self.stop.load(Ordering::SeqCst) {
            match TcpStream::connect(&self.config.addr) {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    let reader = match stream.try_clone() {
                        Ok(reader) => reader,
                        Err(err) => {
                            warn!("rpc clone failed: {err}");
                            continue;
                        }
                    };
                    *self.writer.lock() = Some(stream);
                    self.ping_missed.store(0, Ordering::SeqCst);
                    self.handshake();
                    self.read_loop(reader);
                    // Transport gone: fail everything in flight, tell the
                    // owner, then rate-limited retry.
                    let was_connected = self.connected.swap(false, Ordering::SeqCst);
                    *self.writer.lock() = None;
                    self.fail_pending(Errno::ENOTCONN);
                    if was_connected {
                        (self.events)(ConnEvent::Disconnected);
                    }
                }
                Err(err) => {
                    debug!("connect to {} failed: {err}", self.config.addr);
                }
            }
            thread::sleep(self.config.reconnect_delay);
        }
    }

    fn handshake(self: &Arc<Self>) {
        let mut enc = crate::rpc::codec::Enc::new();
        enc.put_str(&self.config.volume);
        enc.put_u32(crate::rpc::FOPS_VERSION);
        let this = self.clone();
        self.call(
            PROG_HANDSHAKE,
            HANDSHAKE_VERSION,
            HandshakeProc::SetVolume as u32,
            enc.finish(),
            Box::new(move |res| match res {
                Ok(payload) => {
                    let mut dec = crate::rpc::codec::Dec::new(&payload);
                    let version = dec.get_u32().unwrap_or(0);
                    info!("setvolume accepted (fops version {version})");
                    this.connected.store(true, Ordering::SeqCst);
                    (this.events)(ConnEvent::Connected);
                }
                Err(errno) => {
                    warn!("setvolume rejected: {errno}");
                    this.force_disconnect();
                }
            }),
        );
    }

    fn read_loop(&self, mut stream: TcpStream) {
        loop {
            let (header, payload) = match read_frame(&mut stream) {
                Ok(frame) => frame,
                Err(err) => {
                    debug!("rpc read loop ended: {err}");
                    return;
                }
            };
            if header.is_reply() {
                let Some(cbk) = self.pending.lock().remove(&header.unique.get()) else {
                    warn!("reply for unknown call {}", header.unique.get());
                    continue;
                };
                if header.op_ret.get() < 0 {
                    cbk(Err(Errno::from_raw(header.op_errno.get())));
                } else {
                    cbk(Ok(payload));
                }
            } else if header.program.get() == crate::rpc::PROG_CALLBACK {
                let proc = CallbackProc::try_from(header.procedure.get());
                match proc {
                    Ok(proc) => {
                        if let Some(handler) = self.callbacks.lock().as_ref() {
                            handler(proc, payload);
                        }
                    }
                    Err(_) => warn!("unknown callback procedure {}", header.procedure.get()),
                }
            } else {
                warn!("unexpected request frame on client connection");
            }
        }
    }

    fn ping_loop(self: Arc<Self>) {
        // Sleep in short slices so shutdown never waits out a full interval.
        let slice = Duration::from_millis(100);
        while !self.stop.load(Ordering::SeqCst) {
            let mut slept = Duration::ZERO;
            while slept < self.config.ping_interval && !self.stop.load(Ordering::SeqCst) {
                thread::sleep(slice);
                slept += slice;
            }
            if self.stop.load(Ordering::SeqCst) {
                return;
            }
            if !self.is_connected() {
                continue;
            }
            let missed = self.ping_missed.fetch_add(1, Ordering::SeqCst) + 1;
            if missed > PING_MISS_LIMIT {
                warn!("{missed} pings unanswered, declaring connection broken");
                self.ping_missed.store(0, Ordering::SeqCst);
                self.force_disconnect();
                continue;
            }
            let this = self.clone();
            self.call(
                PROG_HANDSHAKE,
                HANDSHAKE_VERSION,
                HandshakeProc::Ping as u32,
                Vec::new(),
                Box::new(move |res| {
                    if res.is_ok() {
                        this.ping_missed.store(0, Ordering::SeqCst);
                    }
                }),
            );
        }
    }
}

impl std::fmt::Debug for RpcConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcConn")
            .field("addr", &self.config.addr)
            .field("connected", &self.is_connected())
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}
