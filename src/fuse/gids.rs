//! Supplementary-group resolution for incoming requests.
//!
//! The kernel header carries only (uid, gid, pid); the full group list is
//! fetched from the OS and cached per (pid, uid, gid) with a TTL. The
//! "off" mode skips resolution entirely and requests run with the primary
//! gid alone.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use smallvec::SmallVec;

pub(super) type Groups = SmallVec<[u32; 8]>;

/// Timed cache of resolved group lists.
pub(super) struct GidCache {
    resolve: bool,
    ttl: Duration,
    map: Mutex<HashMap<(u32, u32, u32), (Instant, Groups)>>,
}

impl GidCache {
    pub(super) fn new(resolve: bool, ttl: Duration) -> GidCache {
        GidCache { resolve, ttl, map: Mutex::new(HashMap::new()) }
    }

    pub(super) fn lookup(&self, pid: u32, uid: u32, gid: u32) -> Groups {
        if !self.resolve {
            return SmallVec::from_slice(&[gid]);
        }
        let key = (pid, uid, gid);
        {
            let map = self.map.lock();
            if let Some((stamp, groups)) = map.get(&key) {
                if stamp.elapsed() < self.ttl {
                    return groups.clone();
                }
            }
        }
        let groups = resolve_groups(uid, gid);
        let mut map = self.map.lock();
        // Opportunistic expiry so the map stays bounded by live traffic.
        map.retain(|_, (stamp, _)| stamp.elapsed() < self.ttl);
        map.insert(key, (Instant::now(), groups.clone()));
        groups
    }

    #[cfg(test)]
    fn cached_len(&self) -> usize {
        self.map.lock().len()
    }
}

fn resolve_groups(uid: u32, gid: u32) -> Groups {
    let mut fallback = SmallVec::new();
    fallback.push(gid);

    // uid -> name, then name -> group list.
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buf = vec![0u8; 4096];
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let rc = unsafe {
        libc::getpwuid_r(uid, &mut pwd, buf.as_mut_ptr().cast(), buf.len(), &mut result)
    };
    if rc != 0 || result.is_null() {
        return fallback;
    }

    let mut count: libc::c_int = 32;
    let mut gids = vec![0 as libc::gid_t; count as usize];
    let rc = unsafe {
        libc::getgrouplist(pwd.pw_name, gid as libc::gid_t, gids.as_mut_ptr(), &mut count)
    };
    if rc < 0 {
        // The list was larger than our guess; retry once at the real size.
        gids.resize(count as usize, 0);
        let rc = unsafe {
            libc::getgrouplist(pwd.pw_name, gid as libc::gid_t, gids.as_mut_ptr(), &mut count)
        };
        if rc < 0 {
            return fallback;
        }
    }
    gids.truncate(count as usize);
    gids.iter().map(|&g| g as u32).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn off_mode_returns_primary_gid_only() {
        let cache = GidCache::new(false, Duration::from_secs(30));
        let groups = cache.lookup(1, 2, 3);
        assert_eq!(groups.as_slice(), &[3]);
        assert_eq!(cache.cached_len(), 0, "off mode never caches");
    }

    #[test]
    fn resolution_caches_by_pid_uid_gid() {
        let cache = GidCache::new(true, Duration::from_secs(30));
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };
        let first = cache.lookup(100, uid, gid);
        assert!(first.contains(&gid));
        assert_eq!(cache.cached_len(), 1);
        let second = cache.lookup(100, uid, gid);
        assert_eq!(first, second);
        assert_eq!(cache.cached_len(), 1);

        // Another pid is a distinct cache entry.
        cache.lookup(101, uid, gid);
        assert_eq!(cache.cached_len(), 2);
    }
}
