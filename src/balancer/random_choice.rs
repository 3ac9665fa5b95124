// Copyright 2020 Joyent, Inc.

use rand::Rng;

use crate::balancer::{Arena, Balancer, BalancerInfo, Handle};
use crate::endpoint::Addr;

struct Entry {
    addr: Addr,
    info: BalancerInfo,
    banned: bool,
}

/// Weighted random selection with locality preference.
///
/// Entries are partitioned into local and remote. With probability
/// `prefer_local` a pick samples from the local partition; when the local
/// partition is empty the remote one is always used, and vice versa. Within
/// a partition an entry is selected with probability proportional to
/// `max_load_factor - load_factor + 1`, ties resolved by the insertion-order
/// walk. A pessimized entry has weight zero and cannot be picked.
pub struct RandomChoice {
    arena: Arena<Entry>,
    // Live slot indices in insertion order.
    order: Vec<usize>,
    prefer_local: f64,
}

impl RandomChoice {
    pub fn new(prefer_local: f64) -> Self {
        let mut prefer_local = prefer_local;
        if !(0.0..=1.0).contains(&prefer_local) {
            prefer_local = crate::config::DEFAULT_PREFER_LOCAL_FACTOR;
        }
        RandomChoice {
            arena: Arena::new(),
            order: Vec::new(),
            prefer_local,
        }
    }

    // Selection with an injected rng so tests can seed it.
    fn pick<R: Rng>(&self, rng: &mut R) -> Option<Addr> {
        let mut local = Vec::new();
        let mut remote = Vec::new();
        for &slot in &self.order {
            if let Some(entry) = self.arena.at(slot) {
                if entry.banned {
                    continue;
                }
                if entry.info.local {
                    local.push(entry);
                } else {
                    remote.push(entry);
                }
            }
        }

        let partition: &[&Entry] = if local.is_empty() {
            &remote
        } else if remote.is_empty() {
            &local
        } else if rng.gen_bool(self.prefer_local) {
            &local
        } else {
            &remote
        };
        if partition.is_empty() {
            return None;
        }

        let max_load = partition
            .iter()
            .map(|entry| entry.info.load_factor)
            .fold(std::f32::MIN, f32::max);
        let weight = |load_factor: f32| f64::from(max_load - load_factor + 1.0);

        let total: f64 = partition
            .iter()
            .map(|entry| weight(entry.info.load_factor))
            .sum();
        let mut point = rng.gen_range(0.0, total);
        for entry in partition.iter() {
            point -= weight(entry.info.load_factor);
            if point <= 0.0 {
                return Some(entry.addr.clone());
            }
        }
        // Floating point slop; fall back to the final entry.
        partition.last().map(|entry| entry.addr.clone())
    }

    fn all_zero_weight(&self) -> bool {
        self.order
            .iter()
            .all(|&slot| match self.arena.at(slot) {
                Some(entry) => entry.banned,
                None => true,
            })
    }
}

impl Balancer for RandomChoice {
    fn next(&mut self) -> Option<Addr> {
        self.pick(&mut rand::thread_rng())
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
        self.all_zero_weight()
    }

    fn contains(&self, handle: Handle) -> bool {
        self.arena.contains(handle)
    }

    fn len(&self) -> usize {
        self.arena.len()
    }
}
