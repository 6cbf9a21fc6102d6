//! In-memory inode and dentry tables.
//!
//! The table is the identity map of the filesystem: gfid → inode, plus a
//! name-indexed dentry map for O(1) child lookup within a parent. Structural
//! mutations take the single table lock; per-inode content (attr snapshot,
//! context slots) is guarded by per-inode locks, honoring the global lock
//! order table < inode < fd.
//!
//! Lifetime rules: an inode leaves the table once its kernel lookup count has
//! dropped to zero and no dentry names it. The root is pinned forever.

use std::any::Any;
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use log::{error, warn};
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::fop::{Attr, FileType};
use crate::gfid::Gfid;
use crate::xlator::XlatorId;

/// One filesystem object's in-memory identity.
pub struct Inode {
    gfid: OnceLock<Gfid>,
    nlookup: AtomicU64,
    attr: Mutex<Option<Attr>>,
    /// (parent gfid, name) back-references for path reconstruction.
    parents: Mutex<SmallVec<[(Gfid, OsString); 1]>>,
    /// Per-translator context slots, dropped on forget.
    ctx: Mutex<HashMap<u32, Box<dyn Any + Send>>>,
}

impl Inode {
    /// A standalone inode not linked to any table; replies synthesized by a
    /// bottom translator without a resolver-supplied placeholder use these.
    pub fn detached() -> Arc<Inode> {
        Inode::new()
    }

    fn new() -> Arc<Inode> {
        Arc::new(Inode {
            gfid: OnceLock::new(),
            nlookup: AtomicU64::new(0),
            attr: Mutex::new(None),
            parents: Mutex::new(SmallVec::new()),
            ctx: Mutex::new(HashMap::new()),
        })
    }

    /// The identifier, if discovery has assigned one yet.
    pub fn gfid(&self) -> Option<Gfid> {
        self.gfid.get().copied()
    }

    /// Set the identifier. Immutable once set: a later conflicting value is
    /// ignored and logged as a table-corruption symptom.
    pub fn set_gfid(&self, gfid: Gfid) {
        if gfid.is_null() {
            return;
        }
        let prev = *self.gfid.get_or_init(|| gfid);
        if prev != gfid {
            error!("inode gfid conflict: kept {prev}, ignored {gfid}");
        }
    }

    pub fn nlookup(&self) -> u64 {
        self.nlookup.load(Ordering::SeqCst)
    }

    pub fn nlookup_inc(&self) {
        self.nlookup.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrement by `count`, saturating at zero: the kernel may report more
    /// forgets than lookups and that must not underflow.
    pub fn nlookup_sub(&self, count: u64) -> u64 {
        let mut current = self.nlookup.load(Ordering::SeqCst);
        loop {
            let next = current.saturating_sub(count);
            match self.nlookup.compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return next,
                Err(seen) => current = seen,
            }
        }
    }

    pub fn attr(&self) -> Option<Attr> {
        *self.attr.lock()
    }

    pub fn set_attr(&self, attr: Attr) {
        *self.attr.lock() = Some(attr);
    }

    pub fn kind(&self) -> Option<FileType> {
        self.attr.lock().map(|a| a.kind)
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == Some(FileType::Directory)
    }

    fn add_parent(&self, pargfid: Gfid, name: &OsStr) {
        let mut parents = self.parents.lock();
        if !parents.iter().any(|(g, n)| *g == pargfid && n == name) {
            parents.push((pargfid, name.to_os_string()));
        }
    }

    fn drop_parent(&self, pargfid: Gfid, name: &OsStr) {
        let mut parents = self.parents.lock();
        parents.retain(|(g, n)| !(*g == pargfid && n == name));
    }

    fn has_parents(&self) -> bool {
        !self.parents.lock().is_empty()
    }

    /// First (parent, name) back-reference, if any.
    pub fn parent_entry(&self) -> Option<(Gfid, OsString)> {
        self.parents.lock().first().cloned()
    }

    /// Store a per-translator context value, replacing any previous one.
    pub fn ctx_insert<T: Any + Send>(&self, id: XlatorId, value: T) {
        self.ctx.lock().insert(id.0, Box::new(value));
    }

    /// Clone out a context value. Translators keep `Arc`s here, so the clone
    /// is a refcount bump.
    pub fn ctx_get<T: Any + Send + Clone>(&self, id: XlatorId) -> Option<T> {
        self.ctx.lock().get(&id.0).and_then(|b| b.downcast_ref::<T>()).cloned()
    }

    pub fn ctx_remove(&self, id: XlatorId) -> Option<Box<dyn Any + Send>> {
        self.ctx.lock().remove(&id.0)
    }

    /// Drop every translator's context; used at forget time after the
    /// per-translator callbacks ran.
    pub fn ctx_clear(&self) {
        self.ctx.lock().clear();
    }
}

impl fmt::Debug for Inode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inode")
            .field("gfid", &self.gfid())
            .field("nlookup", &self.nlookup())
            .finish()
    }
}

struct TableInner {
    by_gfid: HashMap<Gfid, Arc<Inode>>,
    dentries: HashMap<(Gfid, OsString), Arc<Inode>>,
    /// Number of dentries naming children under each parent gfid; a parent
    /// with children cannot be purged (a dentry cannot outlive its parent).
    child_counts: HashMap<Gfid, usize>,
}

/// The table of inodes and dentries rooted at a single anchor.
pub struct InodeTable {
    inner: Mutex<TableInner>,
    root: Arc<Inode>,
}

impl InodeTable {
    pub fn new() -> Arc<InodeTable> {
        let root = Inode::new();
        root.set_gfid(Gfid::ROOT);
        root.set_attr(Attr::synthetic_dir(Gfid::ROOT));
        let mut by_gfid = HashMap::new();
        by_gfid.insert(Gfid::ROOT, root.clone());
        Arc::new(InodeTable {
            inner: Mutex::new(TableInner {
                by_gfid,
                dentries: HashMap::new(),
                child_counts: HashMap::new(),
            }),
            root,
        })
    }

    pub fn root(&self) -> Arc<Inode> {
        self.root.clone()
    }

    pub fn find(&self, gfid: Gfid) -> Option<Arc<Inode>> {
        self.inner.lock().by_gfid.get(&gfid).cloned()
    }

    /// O(1) average name lookup within a parent.
    pub fn lookup_child(&self, pargfid: Gfid, name: &OsStr) -> Option<Arc<Inode>> {
        self.inner.lock().dentries.get(&(pargfid, name.to_os_string())).cloned()
    }

    /// A placeholder inode not yet linked anywhere; the resolver uses these
    /// while discovery is in flight.
    pub fn new_unlinked(&self) -> Arc<Inode> {
        Inode::new()
    }

    /// Link `inode` into the table under (parent, name) with identity `gfid`.
    ///
    /// If an inode with this gfid already exists the existing one wins and
    /// the candidate is discarded; the returned inode is always the canonical
    /// one. Replacing an existing dentry under the same (parent, name)
    /// unhooks the previously named child first.
    pub fn link(
        &self,
        inode: Arc<Inode>,
        gfid: Gfid,
        parent: &Arc<Inode>,
        name: &OsStr,
    ) -> Arc<Inode> {
        let pargfid = match parent.gfid() {
            Some(g) => g,
            None => {
                warn!("link under an unresolved parent, dropping dentry {name:?}");
                inode.set_gfid(gfid);
                return inode;
            }
        };
        let mut inner = self.inner.lock();
        let canonical = match inner.by_gfid.get(&gfid) {
            Some(existing) => existing.clone(),
            None => {
                inode.set_gfid(gfid);
                inner.by_gfid.insert(gfid, inode.clone());
                inode
            }
        };
        let key = (pargfid, name.to_os_string());
        if let Some(old) = inner.dentries.get(&key).cloned() {
            if Arc::ptr_eq(&old, &canonical) {
                return canonical;
            }
            old.drop_parent(pargfid, name);
            inner.dentries.remove(&key);
            Self::dec_child_count(&mut inner, pargfid);
            Self::maybe_purge_locked(&mut inner, &old, &self.root);
        }
        inner.dentries.insert(key, canonical.clone());
        *inner.child_counts.entry(pargfid).or_insert(0) += 1;
        canonical.add_parent(pargfid, name);
        canonical
    }

    /// Link an inode discovered by gfid alone (no dentry).
    pub fn link_by_gfid(&self, inode: Arc<Inode>, gfid: Gfid) -> Arc<Inode> {
        let mut inner = self.inner.lock();
        match inner.by_gfid.get(&gfid) {
            Some(existing) => existing.clone(),
            None => {
                inode.set_gfid(gfid);
                inner.by_gfid.insert(gfid, inode.clone());
                inode
            }
        }
    }

    /// Remove the dentry (parent, name), purging the child if nothing keeps
    /// it alive.
    pub fn unlink(&self, parent: &Arc<Inode>, name: &OsStr) {
        let Some(pargfid) = parent.gfid() else { return };
        let mut inner = self.inner.lock();
        if let Some(child) = inner.dentries.remove(&(pargfid, name.to_os_string())) {
            Self::dec_child_count(&mut inner, pargfid);
            child.drop_parent(pargfid, name);
            Self::maybe_purge_locked(&mut inner, &child, &self.root);
        }
    }

    /// Move a dentry, as rename does.
    pub fn rename(
        &self,
        oldparent: &Arc<Inode>,
        oldname: &OsStr,
        newparent: &Arc<Inode>,
        newname: &OsStr,
    ) {
        let (Some(oldpargfid), Some(newpargfid)) = (oldparent.gfid(), newparent.gfid()) else {
            return;
        };
        let mut inner = self.inner.lock();
        let Some(child) = inner.dentries.remove(&(oldpargfid, oldname.to_os_string())) else {
            return;
        };
        Self::dec_child_count(&mut inner, oldpargfid);
        child.drop_parent(oldpargfid, oldname);
        // The displaced target, if any, loses its name.
        let newkey = (newpargfid, newname.to_os_string());
        if let Some(displaced) = inner.dentries.remove(&newkey) {
            Self::dec_child_count(&mut inner, newpargfid);
            displaced.drop_parent(newpargfid, newname);
            Self::maybe_purge_locked(&mut inner, &displaced, &self.root);
        }
        inner.dentries.insert(newkey, child.clone());
        *inner.child_counts.entry(newpargfid).or_insert(0) += 1;
        child.add_parent(newpargfid, newname);
    }

    /// Apply a FORGET of `count` lookups; returns the inode if it was purged
    /// from the table (so the caller can fan the forget callbacks).
    pub fn forget(&self, inode: &Arc<Inode>, count: u64) -> Option<Arc<Inode>> {
        let remaining = inode.nlookup_sub(count);
        if remaining > 0 {
            return None;
        }
        let mut inner = self.inner.lock();
        Self::maybe_purge_locked(&mut inner, inode, &self.root)
    }

    /// Reconstruct the `/`-joined path from the root to `inode` by walking
    /// parent back-references through the dentry graph.
    pub fn path_of(&self, inode: &Arc<Inode>) -> Option<PathBuf> {
        if Arc::ptr_eq(inode, &self.root) {
            return Some(PathBuf::from("/"));
        }
        let inner = self.inner.lock();
        let mut segments: Vec<OsString> = Vec::new();
        let mut current = inode.clone();
        // Bounded walk; a cycle here would mean dentry corruption.
        for _ in 0..4096 {
            let Some((pargfid, name)) = current.parent_entry() else { return None };
            segments.push(name);
            if pargfid == Gfid::ROOT {
                let mut path = PathBuf::from("/");
                for seg in segments.iter().rev() {
                    path.push(seg);
                }
                return Some(path);
            }
            current = inner.by_gfid.get(&pargfid)?.clone();
        }
        error!("path walk exceeded depth bound, dentry graph corrupt");
        None
    }

    /// Number of live inodes, root included.
    pub fn len(&self) -> usize {
        self.inner.lock().by_gfid.len()
    }

    pub fn is_empty(&self) -> bool {
        false // the root is pinned
    }

    fn dec_child_count(inner: &mut TableInner, pargfid: Gfid) {
        if let Some(count) = inner.child_counts.get_mut(&pargfid) {
            *count -= 1;
            if *count == 0 {
                inner.child_counts.remove(&pargfid);
            }
        }
    }

    fn maybe_purge_locked(
        inner: &mut TableInner,
        inode: &Arc<Inode>,
        root: &Arc<Inode>,
    ) -> Option<Arc<Inode>> {
        if Arc::ptr_eq(inode, root) {
            return None;
        }
        let gfid = inode.gfid()?;
        if inode.nlookup() > 0 || inode.has_parents() {
            return None;
        }
        if inner.child_counts.contains_key(&gfid) {
            // Children still name this inode as parent; keep it.
            return None;
        }
        inner.by_gfid.remove(&gfid)
    }
}

impl fmt::Debug for InodeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        write!(f, "InodeTable({} inodes, {} dentries)", inner.by_gfid.len(), inner.dentries.len())
    }
}
