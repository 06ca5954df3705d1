//! Open namespace handles
//!
//! A [`NetContext`] bundles the namespace descriptor with the ioctl and netlink
//! sockets created inside it. [`ContextCache`] keeps a bounded number of node
//! contexts open and evicts the oldest creation first.

use crate::ioctl::IoctlSocket;
use crate::netlink::NetlinkSocket;
use crate::netns::{self, NamespaceDir};
use crate::Result;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use tracing::{debug, trace};

/// Kernel-side memory held per context beyond the struct itself, dominated by
/// the netlink receive buffer.
pub const CONTEXT_OVERHEAD: usize = 64 * 1024 + 4 * 1024;

/// Caches never shrink below this many entries
pub const MIN_CAPACITY: usize = 100;

/// Name of the root namespace under the instance prefix
pub const ROOT_NAMESPACE: &str = "root";

/// Handles for one namespace
#[derive(Debug)]
pub struct NetContext {
    fd: OwnedFd,
    pub ioctl: IoctlSocket,
    pub netlink: NetlinkSocket,
}

impl NetContext {
    /// Bind sockets to `fd`'s namespace. The calling thread is left inside it.
    fn open(fd: OwnedFd) -> Result<Self> {
        netns::enter(fd.as_fd())?;
        Ok(Self {
            ioctl: IoctlSocket::open()?,
            netlink: NetlinkSocket::open()?,
            fd,
        })
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn enter(&self) -> Result<()> {
        netns::enter(self.fd.as_fd())?;
        Ok(())
    }
}

/// A map bounded by `capacity` that evicts in creation order
#[derive(Debug)]
pub struct CreationOrderCache<K, V> {
    capacity: usize,
    entries: HashMap<K, V>,
    order: VecDeque<K>,
}

impl<K: Eq + Hash + Clone, V> CreationOrderCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entries.get_mut(key)
    }

    /// Insert `value`, returning the entry evicted to make room
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        if self.entries.contains_key(&key) {
            self.entries.insert(key, value);
            return None;
        }
        let mut evicted = None;
        if self.entries.len() >= self.capacity {
            while let Some(oldest) = self.order.pop_front() {
                if let Some(value) = self.entries.remove(&oldest) {
                    evicted = Some((oldest, value));
                    break;
                }
            }
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, value);
        evicted
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let value = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        Some(value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

/// Which namespace the worker thread currently sits in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Active {
    Unknown,
    Default,
    Root,
    Node(u32),
}

/// Contexts of the default namespace, the root namespace, and a bounded set
/// of node namespaces
#[derive(Debug)]
pub struct ContextCache {
    dir: NamespaceDir,
    nodes: CreationOrderCache<u32, NetContext>,
    root: Option<NetContext>,
    default: Option<NetContext>,
    active: Active,
}

impl ContextCache {
    /// Size the cache so that open contexts stay within `budget` bytes
    pub fn new(dir: NamespaceDir, budget: usize) -> Self {
        let capacity = Self::capacity_for(budget);
        debug!("Namespace context cache holds up to {} entries", capacity);
        Self {
            dir,
            nodes: CreationOrderCache::new(capacity),
            root: None,
            default: None,
            active: Active::Unknown,
        }
    }

    pub fn capacity_for(budget: usize) -> usize {
        (budget / (std::mem::size_of::<NetContext>() + CONTEXT_OVERHEAD)).max(MIN_CAPACITY)
    }

    pub fn dir(&self) -> &NamespaceDir {
        &self.dir
    }

    pub fn dir_mut(&mut self) -> &mut NamespaceDir {
        &mut self.dir
    }

    /// Switch to node `id`'s namespace, opening it on first use
    pub fn node(&mut self, id: u32, create: bool, exclusive: bool) -> Result<&mut NetContext> {
        if self.nodes.contains(&id) {
            if self.active != Active::Node(id) {
                if let Some(ctx) = self.nodes.get_mut(&id) {
                    ctx.enter()?;
                }
                self.active = Active::Node(id);
            }
        } else {
            self.active = Active::Unknown;
            let fd = self.dir.open(&id.to_string(), create, exclusive)?;
            let ctx = NetContext::open(fd)?;
            if let Some((evicted, _)) = self.nodes.insert(id, ctx) {
                trace!("Evicted namespace context {}", evicted);
            }
            self.active = Active::Node(id);
        }
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| crate::Error::Internal(format!("context {} vanished", id)))
    }

    /// Switch to the root namespace, opening it on first use
    pub fn root(&mut self, create: bool, exclusive: bool) -> Result<&mut NetContext> {
        match self.root {
            Some(ref ctx) if self.active != Active::Root => ctx.enter()?,
            Some(_) => {}
            None => {
                self.active = Active::Unknown;
                let fd = self.dir.open(ROOT_NAMESPACE, create, exclusive)?;
                self.root = Some(NetContext::open(fd)?);
            }
        }
        self.active = Active::Root;
        self.root
            .as_mut()
            .ok_or_else(|| crate::Error::Internal("root context vanished".into()))
    }

    /// Switch to the init process's namespace
    pub fn default_ns(&mut self) -> Result<&mut NetContext> {
        match self.default {
            Some(ref ctx) if self.active != Active::Default => ctx.enter()?,
            Some(_) => {}
            None => {
                self.active = Active::Unknown;
                self.default = Some(NetContext::open(netns::open_default()?)?);
            }
        }
        self.active = Active::Default;
        self.default
            .as_mut()
            .ok_or_else(|| crate::Error::Internal("default context vanished".into()))
    }

    /// Close every context except the default one
    pub fn close_all(&mut self) {
        self.nodes.clear();
        self.root = None;
        if self.active != Active::Default {
            self.active = Active::Unknown;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_oldest_creation() {
        let mut cache = CreationOrderCache::new(3);
        for id in 0..3u32 {
            assert!(cache.insert(id, id * 10).is_none());
        }
        // Access does not refresh position
        assert_eq!(cache.get_mut(&0), Some(&mut 0));
        assert_eq!(cache.insert(3, 30), Some((0, 0)));
        assert_eq!(cache.insert(4, 40), Some((1, 10)));
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(&0));
        assert!(cache.contains(&2));
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let mut cache = CreationOrderCache::new(5);
        for id in 0..100u32 {
            cache.insert(id % 17, id);
            assert!(cache.len() <= cache.capacity());
        }
    }

    #[test]
    fn test_remove_frees_slot() {
        let mut cache = CreationOrderCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        assert_eq!(cache.remove(&"a"), Some(1));
        assert!(cache.insert("c", 3).is_none());
        assert_eq!(cache.insert("d", 4), Some(("b", 2)));
    }

    #[test]
    fn test_capacity_from_budget() {
        assert_eq!(ContextCache::capacity_for(0), MIN_CAPACITY);
        let per_entry = std::mem::size_of::<NetContext>() + CONTEXT_OVERHEAD;
        assert_eq!(ContextCache::capacity_for(per_entry * 500 + 1), 500);
        assert_eq!(ContextCache::capacity_for(2048 * 1024 * 1024), 2048 * 1024 * 1024 / per_entry);
    }
}
