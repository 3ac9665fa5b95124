// Copyright 2020 Joyent, Inc.

use crate::balancer::{Arena, Balancer, BalancerInfo, Handle};
use crate::endpoint::Addr;

struct Entry {
    addr: Addr,
    info: BalancerInfo,
    banned: bool,
}

/// Cursor over the live entries in insertion order. Ignores load factors
/// and locality.
pub struct RoundRobin {
    arena: Arena<Entry>,
    // Live slot indices in insertion order.
    order: Vec<usize>,
    cursor: usize,
}

impl RoundRobin {
    pub fn new() -> Self {
        RoundRobin {
            arena: Arena::new(),
            order: Vec::new(),
            cursor: 0,
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl Balancer for RoundRobin {
    fn next(&mut self) -> Option<Addr> {
        let n = self.order.len();
        for _ in 0..n {
            let slot = self.order[self.cursor % n];
            self.cursor = self.cursor.wrapping_add(1);
            if let Some(entry) = self.arena.at(slot) {
                if !entry.banned {
                    return Some(entry.addr.clone());
                }
            }
        }
        None
    }

    fn insert(&mut self, addr: Addr, info: BalancerInfo) -> Handle {
        let handle = self.arena.insert(Entry {
            addr,
            info,
            banned: false,
        });
        self.order.push(handle.slot);
        handle
    }

    fn update(&mut self, handle: Handle, info: BalancerInfo) {
        if let Some(entry) = self.arena.get_mut(handle) {
            entry.info = info;
        }
    }

    fn remove(&mut self, handle: Handle) {
        if self.arena.remove(handle).is_some() {
            self.order.retain(|&slot| slot != handle.slot);
        }
    }

    fn pessimize(&mut self, handle: Handle) -> bool {
        match self.arena.get_mut(handle) {
            Some(entry) => entry.banned = true,
            None => return false,
        }
        self.order
            .iter()
            .all(|&slot| match self.arena.at(slot) {
                Some(entry) => entry.banned,
                None => true,
            })
    }

    fn contains(&self, handle: Handle) -> bool {
        self.arena.contains(handle)
    }

    fn len(&self) -> usize {
        self.arena.len()
    }
}
