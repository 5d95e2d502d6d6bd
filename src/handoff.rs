//! Lock-free message handoff between a companion thread and the poll loop.
//!
//! The stack is multi-producer/single-consumer: any thread may `push`, only
//! the poll thread pops or grabs. Because nodes are only unlinked by that
//! single consumer, a popped node can never be recycled underneath a
//! concurrent pop, so the head does not need an ABA tag; `grab` detaches the
//! whole list with one atomic swap.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use crate::message::Msg;

struct HandoffNode {
    msg: Msg,
    next: *mut HandoffNode,
}

/// Shared LIFO of messages awaiting the main thread.
pub(crate) struct HandoffStack {
    head: AtomicPtr<HandoffNode>,
}

impl HandoffStack {
    pub fn new() -> Self {
        HandoffStack {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn push(&self, msg: Msg) {
        let node = Box::into_raw(Box::new(HandoffNode {
            msg,
            next: ptr::null_mut(),
        }));
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            // node is not yet shared, plain write is fine
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(cur) => head = cur,
            }
        }
    }

    /// Pop one message. Single-consumer only.
    #[allow(dead_code)]
    pub fn pop(&self) -> Option<Msg> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if head.is_null() {
                return None;
            }
            let next = unsafe { (*head).next };
            match self
                .head
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    let node = unsafe { Box::from_raw(head) };
                    return Some(node.msg);
                }
                Err(cur) => head = cur,
            }
        }
    }

    /// Detach the whole list. Returns messages oldest-first so cross-thread
    /// FIFO ordering is preserved for the caller.
    pub fn grab(&self) -> Vec<Msg> {
        let mut head = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        let mut out = Vec::new();
        while !head.is_null() {
            let node = unsafe { Box::from_raw(head) };
            head = node.next;
            out.push(node.msg);
        }
        out.reverse();
        out
    }
}

impl Drop for HandoffStack {
    fn drop(&mut self) {
        let _ = self.grab();
    }
}

// Nodes are moved across threads only as whole owned messages.
unsafe impl Send for HandoffStack {}
unsafe impl Sync for HandoffStack {}

/// Cloneable, `Send` handle for delivering messages into an ensemble from
/// another thread. Injected messages enter the normal send path on the next
/// [`crate::Ensemble::poll`].
#[derive(Clone)]
pub struct Injector {
    stack: Arc<HandoffStack>,
}

impl Injector {
    pub(crate) fn new(stack: Arc<HandoffStack>) -> Self {
        Injector { stack }
    }

    pub fn inject(&self, msg: Msg) {
        self.stack.push(msg);
    }
}
