//! The path tree: hash nodes keyed by slash-delimited address components,
//! with method handlers at the leaves. Methods registered under a path also
//! land in the flat full-path table so literal addresses resolve with one
//! lookup; when a subtree is replaced or removed its leaves' full paths are
//! purged from that table.

use std::rc::Rc;

use crate::args::ArgReader;
use crate::error::Result;
use crate::key::{Key, KeyTable};
use crate::message::MsgData;

/// Signature of a message handler. Handlers run on the poll thread and may
/// freely send; sends from inside a delivery are queued and drained when
/// the outermost delivery completes.
pub type HandlerFn = dyn Fn(&mut crate::Ensemble, &MsgData, &mut ArgReader<'_>) -> Result<()>;

#[derive(Clone)]
pub(crate) struct MethodEntry {
    pub handler: Rc<HandlerFn>,
    pub typespec: Option<String>,
    pub coerce: bool,
    /// Set for tree leaves; names this method's entry in the full-path
    /// table so it can be purged with the subtree.
    pub full_path: Option<String>,
}

pub(crate) enum TreeEntry {
    Node(PathNode),
    Method(MethodEntry),
}

pub(crate) struct PathNode {
    pub children: KeyTable<TreeEntry>,
}

impl PathNode {
    pub fn new() -> PathNode {
        PathNode {
            children: KeyTable::new(),
        }
    }

    /// Install a method at `remaining` (components after the service name,
    /// no leading slash). Creates interior nodes as needed. Any replaced
    /// entry's leaf full paths are appended to `purged` for removal from
    /// the full-path table.
    pub fn insert_method(&mut self, remaining: &str, method: MethodEntry, purged: &mut Vec<String>) {
        match remaining.split_once('/') {
            Some((head, rest)) => {
                let key = Key::new(head);
                match self.children.get_mut(&key) {
                    Some(TreeEntry::Node(node)) => node.insert_method(rest, method, purged),
                    Some(TreeEntry::Method(_)) => {
                        // a handler occupied this interior position; replace
                        // it with a node and descend
                        if let Some(old) = self.children.remove(&key) {
                            collect_full_paths(&old, purged);
                        }
                        let mut node = PathNode::new();
                        node.insert_method(rest, method, purged);
                        self.children.insert(key, TreeEntry::Node(node));
                    }
                    None => {
                        let mut node = PathNode::new();
                        node.insert_method(rest, method, purged);
                        self.children.insert(key, TreeEntry::Node(node));
                    }
                }
            }
            None => {
                let key = Key::new(remaining);
                if let Some(old) = self.children.remove(&key) {
                    collect_full_paths(&old, purged);
                }
                self.children.insert(key, TreeEntry::Method(method));
            }
        }
    }

    /// Remove the entry at `remaining`, pruning interior nodes that become
    /// empty. Returns whether anything was removed.
    pub fn remove_path(&mut self, remaining: &str, purged: &mut Vec<String>) -> bool {
        match remaining.split_once('/') {
            Some((head, rest)) => {
                let key = Key::new(head);
                let (removed, now_empty) = match self.children.get_mut(&key) {
                    Some(TreeEntry::Node(node)) => {
                        let removed = node.remove_path(rest, purged);
                        (removed, node.children.is_empty())
                    }
                    _ => (false, false),
                };
                if now_empty {
                    self.children.remove(&key);
                }
                removed
            }
            None => match self.children.remove(&Key::new(remaining)) {
                Some(old) => {
                    collect_full_paths(&old, purged);
                    true
                }
                None => false,
            },
        }
    }

    /// Find the methods matching `remaining`. Literal components use one
    /// hash lookup; components holding pattern characters enumerate the
    /// node's children through the glob matcher.
    pub fn collect_matches(&self, remaining: &str, out: &mut Vec<MethodEntry>) {
        let (head, rest) = match remaining.split_once('/') {
            Some((h, r)) => (h, Some(r)),
            None => (remaining, None),
        };
        if crate::pattern::has_pattern_chars(head) {
            for (key, entry) in self.children.iter() {
                if !crate::pattern::component_match(key.as_str(), remaining) {
                    continue;
                }
                match (entry, rest) {
                    (TreeEntry::Node(node), Some(r)) => node.collect_matches(r, out),
                    (TreeEntry::Method(m), None) => out.push(m.clone()),
                    _ => {}
                }
            }
        } else {
            match (self.children.get_str(head), rest) {
                (Some(TreeEntry::Node(node)), Some(r)) => node.collect_matches(r, out),
                (Some(TreeEntry::Method(m)), None) => out.push(m.clone()),
                _ => {}
            }
        }
    }
}

/// Gather the full-path table keys owned by every leaf under `entry`.
pub(crate) fn collect_full_paths(entry: &TreeEntry, out: &mut Vec<String>) {
    match entry {
        TreeEntry::Method(m) => {
            if let Some(p) = &m.full_path {
                out.push(p.clone());
            }
        }
        TreeEntry::Node(node) => {
            for (_, child) in node.children.iter() {
                collect_full_paths(child, out);
            }
        }
    }
}
