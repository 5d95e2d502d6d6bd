//! Remote process records.
//!
//! Processes and service entries reference each other; both sides of the
//! cycle go through generation-checked index handles into this slab so a
//! stale reference after a teardown is detected instead of resolving to a
//! recycled slot.

use std::net::SocketAddr;

use mio::Token;
use smallvec::SmallVec;

use crate::key::Key;
use crate::services::TapMode;

/// Handle to a remote process record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ProcId {
    index: u32,
    gen: u32,
}

/// One service offered by a process, with its property string
/// (`;attr:value;...` or empty).
#[derive(Debug, Clone)]
pub(crate) struct ProcService {
    pub service: String,
    pub properties: String,
}

/// One tap asserted by a process.
#[derive(Debug, Clone)]
pub(crate) struct ProcTap {
    pub tappee: String,
    pub tapper: String,
    pub mode: TapMode,
}

pub(crate) struct ProcEntry {
    /// `pubIP:localIP:port` in 8-hex-digit notation; empty until learned.
    pub name: Key,
    pub sock: Token,
    pub udp_addr: Option<SocketAddr>,
    pub synced: bool,
    pub services: SmallVec<[ProcService; 4]>,
    pub taps: SmallVec<[ProcTap; 1]>,
}

pub(crate) struct Procs {
    slots: Vec<Option<ProcEntry>>,
    gens: Vec<u32>,
}

impl Procs {
    pub fn new() -> Procs {
        Procs {
            slots: Vec::new(),
            gens: Vec::new(),
        }
    }

    pub fn alloc(&mut self, sock: Token) -> ProcId {
        let entry = ProcEntry {
            name: Key::new(""),
            sock,
            udp_addr: None,
            synced: false,
            services: SmallVec::new(),
            taps: SmallVec::new(),
        };
        match self.slots.iter().position(Option::is_none) {
            Some(i) => {
                self.slots[i] = Some(entry);
                ProcId {
                    index: i as u32,
                    gen: self.gens[i],
                }
            }
            None => {
                self.slots.push(Some(entry));
                self.gens.push(0);
                ProcId {
                    index: (self.slots.len() - 1) as u32,
                    gen: 0,
                }
            }
        }
    }

    pub fn get(&self, id: ProcId) -> Option<&ProcEntry> {
        if *self.gens.get(id.index as usize)? != id.gen {
            return None;
        }
        self.slots[id.index as usize].as_ref()
    }

    pub fn get_mut(&mut self, id: ProcId) -> Option<&mut ProcEntry> {
        if *self.gens.get(id.index as usize)? != id.gen {
            return None;
        }
        self.slots[id.index as usize].as_mut()
    }

    pub fn free(&mut self, id: ProcId) -> Option<ProcEntry> {
        if *self.gens.get(id.index as usize)? != id.gen {
            return None;
        }
        let entry = self.slots[id.index as usize].take();
        if entry.is_some() {
            self.gens[id.index as usize] += 1;
        }
        entry
    }

    pub fn iter(&self) -> impl Iterator<Item = (ProcId, &ProcEntry)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.as_ref().map(|e| {
                (
                    ProcId {
                        index: i as u32,
                        gen: self.gens[i],
                    },
                    e,
                )
            })
        })
    }

    pub fn ids(&self) -> Vec<ProcId> {
        self.iter().map(|(id, _)| id).collect()
    }

    pub fn find_by_name(&self, name: &str) -> Option<ProcId> {
        self.iter()
            .find(|(_, e)| e.name.as_str() == name)
            .map(|(id, _)| id)
    }

    pub fn find_by_sock(&self, sock: Token) -> Option<ProcId> {
        self.iter()
            .find(|(_, e)| e.sock == sock)
            .map(|(id, _)| id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_handle_is_rejected_after_reuse() {
        let mut procs = Procs::new();
        let a = procs.alloc(Token(7));
        assert!(procs.get(a).is_some());
        procs.free(a).unwrap();
        assert!(procs.get(a).is_none());
        let b = procs.alloc(Token(8));
        // slot was recycled, old handle must still be dead
        assert!(procs.get(a).is_none());
        assert!(procs.get(b).is_some());
    }

    #[test]
    fn find_by_name_and_sock() {
        let mut procs = Procs::new();
        let a = procs.alloc(Token(1));
        procs.get_mut(a).unwrap().name = Key::new("00000000:7f000001:9999");
        assert_eq!(procs.find_by_name("00000000:7f000001:9999"), Some(a));
        assert_eq!(procs.find_by_sock(Token(1)), Some(a));
        assert_eq!(procs.find_by_name("nope"), None);
    }
}
