//! Resolution of kernel-addressed objects into locations.
//!
//! A request names its target by nodeid plus, for entry operations, a child
//! name. Resolution produces the `Loc` a fop descends with. The fast path is
//! a table hit under the table lock; a missing entry synthesizes a
//! placeholder inode and discovers it with a LOOKUP before the fop is
//! allowed to continue; a parent that has dropped out of the dentry graph is
//! re-discovered by gfid first and the entry resolution retried. The
//! continuation (`done`) is the fop's resume point.

use std::ffi::OsString;
use std::sync::Arc;

use log::debug;

use crate::errno::Errno;
use crate::fop::{EntryReply, Loc};
use crate::itable::{Inode, InodeTable};
use crate::stack::{FopResult, Frame, Unwinder};
use crate::xdata::{XKey, Xdata};
use crate::xlator::Xlator;

pub(super) struct Resolver {
    itable: Arc<InodeTable>,
    child: Arc<dyn Xlator>,
}

pub(super) type ResolveDone = Box<dyn FnOnce(Result<Loc, Errno>) + Send>;

impl Resolver {
    pub(super) fn new(itable: Arc<InodeTable>, child: Arc<dyn Xlator>) -> Resolver {
        Resolver { itable, child }
    }

    /// Location of an already-identified inode (nodeid-addressed fops).
    pub(super) fn loc_of(&self, inode: &Arc<Inode>) -> Result<Loc, Errno> {
        let gfid = inode.gfid().ok_or(Errno::ESTALE)?;
        let path = self.itable.path_of(inode).ok_or(Errno::ESTALE)?;
        Ok(Loc { parent: None, inode: Some(inode.clone()), name: None, path, gfid, pargfid: crate::gfid::Gfid::NULL })
    }

    /// Location for creating or naming `name` under `parent`; the child slot
    /// carries the cached inode when one exists, otherwise a placeholder.
    pub(super) fn entry_loc(&self, parent: &Arc<Inode>, name: &OsString) -> Result<Loc, Errno> {
        let pargfid = parent.gfid().ok_or(Errno::ESTALE)?;
        let mut path = self.itable.path_of(parent).ok_or(Errno::ESTALE)?;
        path.push(name);
        let cached = self.itable.lookup_child(pargfid, name);
        let gfid = cached.as_ref().and_then(|i| i.gfid()).unwrap_or_default();
        Ok(Loc {
            parent: Some(parent.clone()),
            inode: Some(cached.unwrap_or_else(|| self.itable.new_unlinked())),
            name: Some(name.clone()),
            path,
            gfid,
            pargfid,
        })
    }

    /// Full resolution of an existing entry: the continuation receives a loc
    /// whose inode carries a gfid, or the discovery error.
    pub(super) fn resolve_entry(
        &self,
        frame: &Frame,
        parent: Arc<Inode>,
        name: OsString,
        done: ResolveDone,
    ) {
        // Re-discover a parent that fell out of the dentry graph before
        // retrying the entry itself.
        if parent.gfid().is_some() && self.itable.path_of(&parent).is_none() {
            self.resolve_parent_by_gfid(frame, parent, name, done);
            return;
        }
        let loc = match self.entry_loc(&parent, &name) {
            Ok(loc) => loc,
            Err(errno) => {
                done(Err(errno));
                return;
            }
        };
        if !loc.gfid.is_null() {
            done(Ok(loc));
            return;
        }
        // Missing entry: discover it, link the placeholder, then resume.
        debug!("resolver: discovering {name:?} under {:?}", loc.pargfid);
        let itable = self.itable.clone();
        let unw = Unwinder::new(
            frame.child(),
            crate::fop::FopKind::Lookup,
            move |res: FopResult<EntryReply>| match res {
                Ok(reply) => {
                    let canonical =
                        itable.link(reply.inode.clone(), reply.attr.gfid, &parent, &name);
                    canonical.set_attr(reply.attr);
                    let mut path = itable.path_of(&parent).unwrap_or_default();
                    path.push(&name);
                    done(Ok(Loc {
                        pargfid: parent.gfid().unwrap_or_default(),
                        parent: Some(parent),
                        gfid: reply.attr.gfid,
                        inode: Some(canonical),
                        name: Some(name),
                        path,
                    }));
                }
                Err(errno) => done(Err(errno)),
            },
        );
        self.child.lookup(frame.child(), loc, Xdata::new(), unw);
    }

    fn resolve_parent_by_gfid(
        &self,
        frame: &Frame,
        parent: Arc<Inode>,
        name: OsString,
        done: ResolveDone,
    ) {
        let pargfid = parent.gfid().expect("checked by caller");
        debug!("resolver: re-discovering parent {pargfid}");
        let mut loc = Loc::from_gfid(pargfid);
        loc.inode = Some(parent.clone());
        let mut xdata = Xdata::new();
        xdata.set_flag(XKey::GfidRequest);
        let itable = self.itable.clone();
        let child = self.child.clone();
        let frame2 = frame.clone();
        let this_child = self.child.clone();
        let unw = Unwinder::new(
            frame.child(),
            crate::fop::FopKind::Lookup,
            move |res: FopResult<EntryReply>| match res {
                Ok(reply) => {
                    let canonical = itable.link_by_gfid(reply.inode.clone(), reply.attr.gfid);
                    canonical.set_attr(reply.attr);
                    // Retry the entry now that the parent is known again.
                    let retry = Resolver { itable, child: this_child };
                    retry.resolve_entry(&frame2, canonical, name, done);
                }
                Err(errno) => done(Err(errno)),
            },
        );
        child.lookup(frame.child(), loc, xdata, unw);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fop::{Attr, FileType};
    use crate::gfid::Gfid;
    use crate::xlator::{XlCore, Graph};
    use parking_lot::Mutex;

    /// Serves lookups from a fixed (name -> gfid) namespace.
    struct NameStore {
        core: XlCore,
        lookups: Mutex<Vec<OsString>>,
    }

    impl Xlator for NameStore {
        fn core(&self) -> &XlCore {
            &self.core
        }

        fn lookup(&self, _frame: Frame, loc: Loc, _xdata: Xdata, unw: Unwinder<EntryReply>) {
            let name = loc.name.clone().unwrap_or_default();
            self.lookups.lock().push(name.clone());
            if name == "missing" {
                unw.errno(Errno::ENOENT);
                return;
            }
            let gfid = if loc.gfid.is_null() { Gfid::from_parts(5, 5) } else { loc.gfid };
            let mut attr = Attr::synthetic_dir(gfid);
            attr.kind = FileType::RegularFile;
            let inode = loc.inode.unwrap_or_else(crate::itable::Inode::detached);
            inode.set_gfid(gfid);
            unw.okay(EntryReply { inode, attr, postparent: None, xdata: Xdata::new() });
        }
    }

    fn setup() -> (Arc<InodeTable>, Resolver, Arc<NameStore>, Graph) {
        let store = Arc::new(NameStore {
            core: XlCore::new("names", vec![]),
            lookups: Mutex::new(Vec::new()),
        });
        let graph = Graph::assemble(store.clone()).unwrap();
        let itable = InodeTable::new();
        let resolver = Resolver::new(itable.clone(), graph.root().clone());
        (itable, resolver, store, graph)
    }

    #[test]
    fn cached_entry_resolves_without_winding() {
        let (itable, resolver, store, _graph) = setup();
        let root = itable.root();
        let cached = itable.link(itable.new_unlinked(), Gfid::from_parts(2, 2), &root, "seen".as_ref());
        cached.set_attr(Attr::synthetic_dir(Gfid::from_parts(2, 2)));

        let got: Arc<Mutex<Option<Result<Loc, Errno>>>> = Arc::new(Mutex::new(None));
        let got2 = got.clone();
        resolver.resolve_entry(
            &Frame::internal(),
            root,
            "seen".into(),
            Box::new(move |res| *got2.lock() = Some(res)),
        );
        let loc = got.lock().take().unwrap().unwrap();
        assert_eq!(loc.gfid, Gfid::from_parts(2, 2));
        assert_eq!(loc.path, std::path::PathBuf::from("/seen"));
        assert!(store.lookups.lock().is_empty(), "fast path must not wind");
    }

    #[test]
    fn missing_entry_discovers_and_links() {
        let (itable, resolver, store, _graph) = setup();
        let root = itable.root();
        let got: Arc<Mutex<Option<Result<Loc, Errno>>>> = Arc::new(Mutex::new(None));
        let got2 = got.clone();
        resolver.resolve_entry(
            &Frame::internal(),
            root,
            "fresh".into(),
            Box::new(move |res| *got2.lock() = Some(res)),
        );
        let loc = got.lock().take().unwrap().unwrap();
        assert_eq!(loc.gfid, Gfid::from_parts(5, 5));
        assert_eq!(store.lookups.lock().len(), 1);
        // The discovered entry is now in the dentry hash.
        assert!(itable.lookup_child(Gfid::ROOT, "fresh".as_ref()).is_some());
    }

    #[test]
    fn discovery_failure_propagates() {
        let (itable, resolver, _store, _graph) = setup();
        let got: Arc<Mutex<Option<Result<Loc, Errno>>>> = Arc::new(Mutex::new(None));
        let got2 = got.clone();
        resolver.resolve_entry(
            &Frame::internal(),
            itable.root(),
            "missing".into(),
            Box::new(move |res| *got2.lock() = Some(res)),
        );
        assert_eq!(got.lock().take().unwrap().unwrap_err(), Errno::ENOENT);
    }
}
