//! Reference-counted immutable byte regions.
//!
//! A `Blob` is the unit of ownership for bytes that cross queues, threads
//! and callback boundaries. Cloning bumps the count; the last drop runs the
//! free hook exactly once and only then releases the parent, so a chain of
//! derived blobs keeps its root alive until every view is gone.

use std::sync::Arc;

type FreeFn = Box<dyn FnOnce(&[u8]) + Send + Sync>;

enum Mem {
    Owned(Box<[u8]>),
    /// Borrows the parent's bytes; `parent` below keeps them alive.
    Shared,
}

struct Inner {
    mem: Mem,
    on_free: Option<FreeFn>,
    // dropped after on_free runs
    parent: Option<Blob>,
}

#[derive(Clone)]
pub struct Blob(Arc<Inner>);

impl Blob {
    pub fn new(data: impl Into<Box<[u8]>>) -> Blob {
        Blob(Arc::new(Inner {
            mem: Mem::Owned(data.into()),
            on_free: None,
            parent: None,
        }))
    }

    /// Owned bytes with a hook that runs once when the last reference drops.
    pub fn with_free_fn(
        data: impl Into<Box<[u8]>>,
        on_free: impl FnOnce(&[u8]) + Send + Sync + 'static,
    ) -> Blob {
        Blob(Arc::new(Inner {
            mem: Mem::Owned(data.into()),
            on_free: Some(Box::new(on_free)),
            parent: None,
        }))
    }

    /// A view over `parent`'s bytes holding its own reference to the parent.
    pub fn share(parent: &Blob) -> Blob {
        Blob(Arc::new(Inner {
            mem: Mem::Shared,
            on_free: None,
            parent: Some(parent.clone()),
        }))
    }

    /// [`share`] plus a free hook, for transports that must acknowledge
    /// consumption back to the producer.
    ///
    /// [`share`]: Blob::share
    pub fn share_with_free_fn(
        parent: &Blob,
        on_free: impl FnOnce(&[u8]) + Send + Sync + 'static,
    ) -> Blob {
        Blob(Arc::new(Inner {
            mem: Mem::Shared,
            on_free: Some(Box::new(on_free)),
            parent: Some(parent.clone()),
        }))
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.0.mem {
            Mem::Owned(data) => data,
            Mem::Shared => match &self.0.parent {
                Some(parent) => parent.as_slice(),
                None => &[],
            },
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }

    pub fn parent(&self) -> Option<&Blob> {
        self.0.parent.as_ref()
    }

    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Identity comparison; two blobs are the same object, not merely equal
    /// bytes.
    pub fn ptr_eq(a: &Blob, b: &Blob) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }
}

impl std::fmt::Debug for Blob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blob")
            .field("len", &self.len())
            .field("refcount", &self.refcount())
            .field("shared", &matches!(self.0.mem, Mem::Shared))
            .finish()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(on_free) = self.on_free.take() {
            let bytes = match &self.mem {
                Mem::Owned(data) => &data[..],
                Mem::Shared => self.parent.as_ref().map(|p| p.as_slice()).unwrap_or(&[]),
            };
            on_free(bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn free_fn_runs_exactly_once() {
        static FREED: AtomicUsize = AtomicUsize::new(0);
        let blob = Blob::with_free_fn(&b"data"[..], |bytes| {
            assert_eq!(bytes, b"data");
            FREED.fetch_add(1, Ordering::SeqCst);
        });
        let clone = blob.clone();
        drop(blob);
        assert_eq!(FREED.load(Ordering::SeqCst), 0);
        drop(clone);
        assert_eq!(FREED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn share_keeps_parent_alive() {
        static FREED: AtomicUsize = AtomicUsize::new(0);
        let parent = Blob::with_free_fn(&b"root"[..], |_| {
            FREED.fetch_add(1, Ordering::SeqCst);
        });
        let view = Blob::share(&parent);
        assert_eq!(view.as_slice(), b"root");
        drop(parent);
        assert_eq!(FREED.load(Ordering::SeqCst), 0);
        drop(view);
        assert_eq!(FREED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn view_hook_runs_before_parent_release() {
        static ORDER: AtomicUsize = AtomicUsize::new(0);
        let parent = Blob::with_free_fn(&b"p"[..], |_| {
            // parent must be released second
            assert_eq!(ORDER.fetch_add(1, Ordering::SeqCst), 1);
        });
        let view = Blob::share_with_free_fn(&parent, |_| {
            assert_eq!(ORDER.fetch_add(1, Ordering::SeqCst), 0);
        });
        drop(parent);
        drop(view);
        assert_eq!(ORDER.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn crosses_threads() {
        let blob = Blob::new(&b"shared"[..]);
        let clone = blob.clone();
        std::thread::spawn(move || {
            assert_eq!(clone.as_slice(), b"shared");
        })
        .join()
        .unwrap();
        assert_eq!(blob.refcount(), 1);
    }
}
