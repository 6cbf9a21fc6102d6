//! stackfs: a distributed userspace filesystem built from a stack of
//! request-translating layers.
//!
//! Every filesystem operation enters through the FUSE bridge, descends a tree
//! of translators (caching, compression, replication, RPC), and unwinds back
//! up carrying the reply. The runtime contract lives in [`stack`]; the
//! translator ABI in [`xlator`]; the individual layers in their own modules.

#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]

pub mod cdc;
pub mod client;
pub mod errno;
pub mod errorgen;
pub mod fdtable;
pub mod fop;
pub mod fscache;
pub mod fuse;
pub mod gfid;
pub mod itable;
pub mod jbr;
pub mod mountbroker;
pub mod options;
pub mod readahead;
pub mod rpc;
pub mod stack;
pub mod storage;
pub mod xdata;
pub mod xlator;

pub use crate::errno::Errno;
pub use crate::fdtable::{Fd, FdTable};
pub use crate::fop::{Attr, FopKind, Loc, OpenFlags, Payload};
pub use crate::gfid::Gfid;
pub use crate::itable::{Inode, InodeTable};
pub use crate::stack::{Caller, FanOut, FopResult, Frame, LockOwner, Stub, SyncCall, Unwinder};
pub use crate::xdata::{XKey, XVal, Xdata};
pub use crate::xlator::{Event, Graph, XlCore, Xlator, XlatorId};
