//! Wrapper identity cache: native pointer -> weak wrapper
//!
//! The cache never keeps a wrapper (or its native object) alive. Entries
//! are removed when the wrapper drops; an entry whose wrapper is already
//! gone counts as a miss.

use super::handle::ObjectInner;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

thread_local! {
    static IDENTITY: RefCell<HashMap<usize, Weak<ObjectInner>>> = RefCell::new(HashMap::new());
}

pub(crate) fn lookup(address: usize) -> Option<Rc<ObjectInner>> {
    IDENTITY.with(|cache| cache.borrow().get(&address).and_then(Weak::upgrade))
}

pub(crate) fn insert(inner: &Rc<ObjectInner>) {
    IDENTITY.with(|cache| {
        cache
            .borrow_mut()
            .insert(inner.address, Rc::downgrade(inner));
    });
}

/// Drop the entry for `address` if it still belongs to `owner`
pub(crate) fn forget(address: usize, owner: *const ObjectInner) {
    // A wrapper may drop during thread teardown or while the map is busy
    let _ = IDENTITY.try_with(|cache| {
        if let Ok(mut map) = cache.try_borrow_mut() {
            if map
                .get(&address)
                .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), owner))
            {
                map.remove(&address);
            }
        }
    });
}

/// Wrappers currently alive
pub fn live_wrappers() -> usize {
    IDENTITY.with(|cache| {
        cache
            .borrow()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    })
}

pub(crate) fn clear() {
    let drained: Vec<_> = IDENTITY.with(|cache| cache.borrow_mut().drain().collect());
    drop(drained);
}
