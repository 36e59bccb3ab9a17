//! Defer list: replays status changes to listeners in FIFO order.
//!
//! Synchronous completions (an event that is already signaled, a regular
//! file read done inline) and kernel completions both go through `post`,
//! and listeners are only ever called from `flush`. That keeps the
//! `submitted -> completed -> concluded` sequence identical no matter
//! which path produced the result.
//!
//! ## Node state
//!
//! Each node carries a `DeferLink`: the newest posted status, the newest
//! status already reported, and an atomic word that decodes to
//! `Enqueued::Not` (off-list) or `Enqueued::NextIs(next)` (on-list, `next`
//! null at the tail). `post` claims the node with a CAS from `Not`, so a
//! node is on at most one list at a time; a node already on the list only
//! has its status advanced.
//!
//! ## Threads
//!
//! Any thread may `post`. Exactly one thread (the multiplexer's driver)
//! may `flush`. Push is a Treiber-stack CAS; `flush` swaps the whole stack
//! out, reverses it to FIFO and walks it, then repeats until the list is
//! empty so posts made by callbacks are drained in the same flush.

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::operation::OperationStatus;

/// Encoded `Enqueued::Not`. Odd, so it never collides with a node address.
const NOT_ENQUEUED: usize = 1;

/// Decoded view of a node's list word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Not,
    /// On a list; null marks the tail.
    NextIs(*const ()),
}

/// Intrusive list state embedded in every deferrable node.
pub struct DeferLink {
    next: AtomicUsize,
    status: AtomicU8,
    reported: AtomicU8,
}

impl DeferLink {
    pub const fn new() -> Self {
        Self {
            next: AtomicUsize::new(NOT_ENQUEUED),
            status: AtomicU8::new(OperationStatus::Constructed as u8),
            reported: AtomicU8::new(OperationStatus::Constructed as u8),
        }
    }

    #[inline]
    pub fn status(&self) -> OperationStatus {
        OperationStatus::from(self.status.load(Ordering::SeqCst))
    }

    /// Highest status already passed to the listener.
    #[inline]
    pub fn reported(&self) -> OperationStatus {
        OperationStatus::from(self.reported.load(Ordering::SeqCst))
    }

    pub fn enqueued(&self) -> Enqueued {
        match self.next.load(Ordering::SeqCst) {
            NOT_ENQUEUED => Enqueued::Not,
            next => Enqueued::NextIs(next as *const ()),
        }
    }

    /// Jump straight to `Concluded` with nothing left to report.
    pub(crate) fn retire(&self) {
        self.status.store(OperationStatus::Concluded as u8, Ordering::SeqCst);
        self.reported.store(OperationStatus::Concluded as u8, Ordering::SeqCst);
    }

    /// Raise the status; never lowers it. Returns the previous status.
    #[inline]
    pub fn advance(&self, status: OperationStatus) -> OperationStatus {
        OperationStatus::from(self.status.fetch_max(status as u8, Ordering::SeqCst))
    }
}

impl Default for DeferLink {
    fn default() -> Self {
        Self::new()
    }
}

/// Implemented by node types that embed a `DeferLink`.
pub trait Deferred: Send + Sync {
    fn defer_link(&self) -> &DeferLink;
}

/// Lock-free MPSC list of nodes with unreported status changes.
///
/// While enqueued, the list owns one strong reference to the node.
pub struct DeferList<T: Deferred> {
    head: AtomicPtr<T>,
    _owns: PhantomData<Arc<T>>,
}

// Safety: nodes are Send + Sync and only moved as Arc references.
unsafe impl<T: Deferred> Send for DeferList<T> {}
unsafe impl<T: Deferred> Sync for DeferList<T> {}

impl<T: Deferred> DeferList<T> {
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            _owns: PhantomData,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Advance `node` to `status` and enqueue it unless it already is.
    ///
    /// Returns true if this call put the node on the list.
    pub fn post(&self, node: &Arc<T>, status: OperationStatus) -> bool {
        let link = node.defer_link();
        let previous = link.advance(status);
        debug_assert!(previous <= status, "status moved backwards");

        // Claim the node; losing means it is already on the list and the
        // flusher will observe the advanced status.
        if link
            .next
            .compare_exchange(NOT_ENQUEUED, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let raw = Arc::into_raw(node.clone()) as *mut T;
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            link.next.store(head as usize, Ordering::Relaxed);
            match self
                .head
                .compare_exchange_weak(head, raw, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(current) => head = current,
            }
        }
    }

    /// Report every unreported status step of every queued node, oldest
    /// post first. `report` sees each step exactly once and in order, so a
    /// node that went straight from `Constructed` to `Completed` yields
    /// `Submitted` then `Completed`. A status raised by `report` itself is
    /// picked up before moving to the next node.
    ///
    /// Must only be called from one thread at a time.
    pub fn flush<F>(&self, mut report: F) -> usize
    where
        F: FnMut(&Arc<T>, OperationStatus),
    {
        let mut steps = 0;
        loop {
            let mut cursor = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
            if cursor.is_null() {
                return steps;
            }

            let mut batch = Vec::new();
            while !cursor.is_null() {
                batch.push(cursor);
                // Safety: the list holds a strong reference to every node.
                let next = unsafe { (*cursor).defer_link().next.load(Ordering::SeqCst) };
                cursor = next as *mut T;
            }

            for raw in batch.into_iter().rev() {
                // Safety: reclaims the reference taken in `post`.
                let node = unsafe { Arc::from_raw(raw as *const T) };
                let link = node.defer_link();
                // Off-list before reading status: a concurrent post either
                // lands before the read or re-enqueues the node.
                link.next.store(NOT_ENQUEUED, Ordering::SeqCst);

                let mut reported = link.reported();
                while reported < link.status() {
                    reported = reported.next();
                    link.reported.store(reported as u8, Ordering::SeqCst);
                    report(&node, reported);
                    steps += 1;
                }
            }
        }
    }
}

impl<T: Deferred> Default for DeferList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Deferred> Drop for DeferList<T> {
    fn drop(&mut self) {
        let mut cursor = *self.head.get_mut();
        while !cursor.is_null() {
            // Safety: see `flush`.
            let node = unsafe { Arc::from_raw(cursor as *const T) };
            let link = node.defer_link();
            cursor = link.next.load(Ordering::SeqCst) as *mut T;
            link.next.store(NOT_ENQUEUED, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Node {
        id: usize,
        link: DeferLink,
    }

    impl Node {
        fn new(id: usize) -> Arc<Node> {
            Arc::new(Node { id, link: DeferLink::new() })
        }
    }

    impl Deferred for Node {
        fn defer_link(&self) -> &DeferLink {
            &self.link
        }
    }

    fn drain(list: &DeferList<Node>) -> Vec<(usize, OperationStatus)> {
        let mut seen = Vec::new();
        list.flush(|n, s| seen.push((n.id, s)));
        seen
    }

    #[test]
    fn test_new_node_is_off_list() {
        let n = Node::new(0);
        assert_eq!(n.link.enqueued(), Enqueued::Not);
        assert_eq!(n.link.status(), OperationStatus::Constructed);
    }

    #[test]
    fn test_jump_reports_every_step() {
        let list = DeferList::new();
        let n = Node::new(7);
        assert!(list.post(&n, OperationStatus::Completed));
        assert_eq!(n.link.enqueued(), Enqueued::NextIs(ptr::null()));
        assert_eq!(
            drain(&list),
            vec![(7, OperationStatus::Submitted), (7, OperationStatus::Completed)]
        );
        assert_eq!(n.link.enqueued(), Enqueued::Not);
        assert_eq!(n.link.reported(), OperationStatus::Completed);
    }

    #[test]
    fn test_fifo_order() {
        let list = DeferList::new();
        let nodes: Vec<_> = (0..4).map(Node::new).collect();
        for n in &nodes {
            list.post(n, OperationStatus::Submitted);
        }
        let ids: Vec<_> = drain(&list).into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_double_post_enqueues_once() {
        let list = DeferList::new();
        let n = Node::new(1);
        assert!(list.post(&n, OperationStatus::Submitted));
        assert!(!list.post(&n, OperationStatus::Completed));
        assert_eq!(Arc::strong_count(&n), 2);
        assert_eq!(drain(&list).len(), 2);
        assert_eq!(Arc::strong_count(&n), 1);
    }

    #[test]
    fn test_steps_are_reported_once() {
        let list = DeferList::new();
        let n = Node::new(1);
        list.post(&n, OperationStatus::Submitted);
        assert_eq!(drain(&list), vec![(1, OperationStatus::Submitted)]);
        list.post(&n, OperationStatus::Submitted);
        assert!(drain(&list).is_empty());
        list.post(&n, OperationStatus::Concluded);
        assert_eq!(
            drain(&list),
            vec![(1, OperationStatus::Completed), (1, OperationStatus::Concluded)]
        );
    }

    #[test]
    fn test_callback_can_advance_and_post() {
        let list = DeferList::new();
        let a = Node::new(1);
        let b = Node::new(2);
        list.post(&a, OperationStatus::Completed);
        let mut seen = Vec::new();
        list.flush(|n, s| {
            seen.push((n.id, s));
            if n.id == 1 && s == OperationStatus::Completed {
                n.link.advance(OperationStatus::Concluded);
                list.post(&b, OperationStatus::Submitted);
            }
        });
        assert_eq!(
            seen,
            vec![
                (1, OperationStatus::Submitted),
                (1, OperationStatus::Completed),
                (1, OperationStatus::Concluded),
                (2, OperationStatus::Submitted),
            ]
        );
        assert!(list.is_empty());
    }

    #[test]
    fn test_concurrent_posters_lose_nothing() {
        let list = Arc::new(DeferList::new());
        let nodes: Arc<Vec<_>> = Arc::new((0..64).map(Node::new).collect());
        let seen = Arc::new(Mutex::new(vec![OperationStatus::Constructed; 64]));

        let posters: Vec<_> = (0..4)
            .map(|t| {
                let list = list.clone();
                let nodes = nodes.clone();
                std::thread::spawn(move || {
                    for n in nodes.iter().skip(t).step_by(4) {
                        list.post(n, OperationStatus::Submitted);
                        list.post(n, OperationStatus::Concluded);
                    }
                })
            })
            .collect();

        let mut done = false;
        while !done {
            done = posters.iter().all(|p| p.is_finished());
            let seen = seen.clone();
            list.flush(move |n, s| {
                let mut seen = seen.lock().unwrap();
                assert_eq!(seen[n.id].next(), s);
                seen[n.id] = s;
            });
        }
        for p in posters {
            p.join().unwrap();
        }
        list.flush(|_, _| {});
        assert!(seen.lock().unwrap().iter().all(|s| *s == OperationStatus::Concluded));
    }

    #[test]
    fn test_drop_releases_queued_nodes() {
        let n = Node::new(3);
        {
            let list = DeferList::new();
            list.post(&n, OperationStatus::Submitted);
            assert_eq!(Arc::strong_count(&n), 2);
        }
        assert_eq!(Arc::strong_count(&n), 1);
        assert_eq!(n.link.enqueued(), Enqueued::Not);
    }
}
