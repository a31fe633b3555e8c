//! Concurrent registry of module instances.
//!
//! Instances are indexed by numeric id and by `address:name`. Both indexes
//! live behind one lock that is held only while a map is read or updated,
//! never across I/O.

use crate::host::Host;
use crate::instance::{internal_name, ModuleInstance};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Indexes {
    by_id: HashMap<i32, Arc<ModuleInstance>>,
    by_name: HashMap<String, Arc<ModuleInstance>>,
}

#[derive(Default)]
pub struct InstanceTable {
    // ---
    indexes: Mutex<Indexes>,
    next_id: AtomicI32,
}

impl InstanceTable {
    // ---

    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, instance: Arc<ModuleInstance>) {
        // ---
        let key = instance.internal_name();
        let mut indexes = crate::lock_ignore_poison(&self.indexes);
        indexes.by_id.insert(instance.id(), instance.clone());
        indexes.by_name.insert(key, instance);
    }

    /// Remove both index entries of `instance`.
    ///
    /// The name entry is only removed if it still points at this instance, so
    /// a newer instance with the same name survives a late removal.
    pub fn remove(&self, instance: &ModuleInstance) -> bool {
        // ---
        let key = instance.internal_name();
        let mut indexes = crate::lock_ignore_poison(&self.indexes);
        let removed = match indexes.by_id.get(&instance.id()) {
            Some(found) if std::ptr::eq(found.as_ref(), instance) => {
                indexes.by_id.remove(&instance.id());
                true
            }
            _ => false,
        };
        if indexes
            .by_name
            .get(&key)
            .is_some_and(|found| std::ptr::eq(found.as_ref(), instance))
        {
            indexes.by_name.remove(&key);
        }
        removed
    }

    pub fn remove_id(&self, id: i32) -> Option<Arc<ModuleInstance>> {
        // ---
        let instance = self.get(id)?;
        self.remove(&instance);
        Some(instance)
    }

    pub fn get(&self, id: i32) -> Option<Arc<ModuleInstance>> {
        crate::lock_ignore_poison(&self.indexes).by_id.get(&id).cloned()
    }

    /// Look up by host and module name; an empty name finds nothing.
    pub fn get_by_name(&self, host: &Host, name: &str) -> Option<Arc<ModuleInstance>> {
        // ---
        if name.is_empty() || host.address().is_empty() {
            return None;
        }
        let key = internal_name(host.address(), name);
        crate::lock_ignore_poison(&self.indexes).by_name.get(&key).cloned()
    }

    /// Snapshot of every instance, ordered by id.
    pub fn get_all(&self) -> Vec<Arc<ModuleInstance>> {
        // ---
        let mut all: Vec<_> = crate::lock_ignore_poison(&self.indexes)
            .by_id
            .values()
            .cloned()
            .collect();
        all.sort_by_key(|i| i.id());
        all
    }

    /// Snapshot of the instances owned by `broker_id`.
    pub fn get_all_for_broker(&self, broker_id: i32) -> Vec<Arc<ModuleInstance>> {
        // ---
        let mut all = self.get_all();
        all.retain(|i| i.broker_id() == broker_id);
        all
    }

    pub fn len(&self) -> usize {
        crate::lock_ignore_poison(&self.indexes).by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Next module instance id; never reused within this table's lifetime.
    pub fn next_id(&self) -> i32 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::protocol::BROKER_MODULE;
    use std::collections::HashSet;
    use std::thread;

    fn instance(id: i32, name: &str) -> Arc<ModuleInstance> {
        Arc::new(ModuleInstance::detached(id, name, Host::local(-1), BROKER_MODULE))
    }

    #[test]
    fn test_add_then_remove_clears_both_indexes() {
        // ---
        let table = InstanceTable::new();
        let inst = instance(3, "solver");
        table.add(inst.clone());

        assert!(table.get(3).is_some());
        assert!(table.get_by_name(&Host::local(-1), "solver").is_some());

        assert!(table.remove(&inst));
        assert!(table.get(3).is_none());
        assert!(table.get_by_name(&Host::local(-1), "solver").is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_remove_id() {
        // ---
        let table = InstanceTable::new();
        table.add(instance(8, "plot"));
        assert_eq!(table.remove_id(8).map(|i| i.id()), Some(8));
        assert!(table.remove_id(8).is_none());
    }

    #[test]
    fn test_empty_name_finds_nothing() {
        // ---
        let table = InstanceTable::new();
        table.add(instance(1, ""));
        assert!(table.get_by_name(&Host::local(-1), "").is_none());
    }

    #[test]
    fn test_get_all_filters_by_broker() {
        // ---
        let table = InstanceTable::new();
        table.add(instance(1, "a"));
        table.add(Arc::new(ModuleInstance::detached(2, "b", Host::local(-1), 17)));
        table.add(instance(3, "c"));

        assert_eq!(table.get_all().len(), 3);
        let local: Vec<_> = table.get_all_for_broker(BROKER_MODULE).iter().map(|i| i.id()).collect();
        assert_eq!(local, vec![1, 3]);
        assert_eq!(table.get_all_for_broker(17).len(), 1);
    }

    #[test]
    fn test_next_id_strictly_increasing() {
        // ---
        let table = InstanceTable::new();
        let ids: Vec<i32> = (0..100).map(|_| table.next_id()).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_stale_remove_keeps_newer_name_entry() {
        // ---
        let table = InstanceTable::new();
        let old = instance(1, "solver");
        let new = instance(2, "solver");
        table.add(old.clone());
        table.add(new.clone());

        table.remove(&old);
        assert_eq!(table.get_by_name(&Host::local(-1), "solver").map(|i| i.id()), Some(2));
    }

    #[test]
    fn test_concurrent_add_remove() {
        // ---
        let table = Arc::new(InstanceTable::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let table = table.clone();
                thread::spawn(move || {
                    let mut kept = Vec::new();
                    for i in 0..200 {
                        let id = table.next_id();
                        let inst = instance(id, &format!("m{t}-{i}"));
                        table.add(inst.clone());
                        if i % 2 == 0 {
                            assert!(table.remove(&inst));
                        } else {
                            kept.push(id);
                        }
                    }
                    kept
                })
            })
            .collect();

        let kept: Vec<i32> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        let unique: HashSet<_> = kept.iter().collect();
        assert_eq!(unique.len(), kept.len());
        assert_eq!(table.len(), kept.len());
        for id in kept {
            let inst = table.get(id).unwrap();
            assert!(table.get_by_name(inst.host(), inst.name()).is_some());
        }
    }
}
