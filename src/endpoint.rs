// Copyright 2020 Joyent, Inc.

use std::cmp::Ordering;

use derive_more::Display;

/// Endpoint identity. Two endpoints with the same `Addr` are the same
/// cluster member regardless of their advisory metadata.
#[derive(Clone, Debug, Display, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[display(fmt = "{}:{}", host, port)]
pub struct Addr {
    pub host: String,
    pub port: u16,
}

impl Addr {
    pub fn new(host: &str, port: u16) -> Self {
        Addr {
            host: String::from(host),
            port,
        }
    }
}

/// A logical database endpoint: identity plus the advisory metadata
/// discovery reports for it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// Load reported by discovery; lower means less loaded.
    pub load_factor: f32,
    /// Whether the endpoint sits in the caller's locality.
    pub local: bool,
}

impl Endpoint {
    pub fn new(host: &str, port: u16) -> Self {
        Endpoint {
            host: String::from(host),
            port,
            load_factor: 0.0,
            local: false,
        }
    }

    pub fn addr(&self) -> Addr {
        Addr::new(&self.host, self.port)
    }
}

fn cmp_identity(a: &Endpoint, b: &Endpoint) -> Ordering {
    a.host.cmp(&b.host).then(a.port.cmp(&b.port))
}

/// Sort endpoints by identity, the order `diff_endpoints` requires.
pub fn sort_endpoints(endpoints: &mut [Endpoint]) {
    endpoints.sort_by(cmp_identity);
}

/// Merge-walk two identity-sorted endpoint lists, firing one callback per
/// step in sorted order: `equal(i, j)` when `curr[i]` and `next[j]` share an
/// identity, `added(_, j)` when `next[j]` is new, `removed(i, _)` when
/// `curr[i]` is gone. Runs in O(|curr| + |next|) with no allocation.
pub fn diff_endpoints<FE, FA, FR>(
    curr: &[Endpoint],
    next: &[Endpoint],
    mut equal: FE,
    mut added: FA,
    mut removed: FR,
) where
    FE: FnMut(usize, usize),
    FA: FnMut(usize, usize),
    FR: FnMut(usize, usize),
{
    let mut i = 0;
    let mut j = 0;
    while i < curr.len() && j < next.len() {
        match cmp_identity(&curr[i], &next[j]) {
            Ordering::Equal => {
                equal(i, j);
                i += 1;
                j += 1;
            }
            Ordering::Less => {
                removed(i, j);
                i += 1;
            }
            Ordering::Greater => {
                added(i, j);
                j += 1;
            }
        }
    }
    while i < curr.len() {
        removed(i, next.len());
        i += 1;
    }
    while j < next.len() {
        added(curr.len(), j);
        j += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(host: &str, port: u16) -> Endpoint {
        Endpoint::new(host, port)
    }

    fn ep_meta(host: &str, port: u16, load_factor: f32, local: bool) -> Endpoint {
        Endpoint {
            host: String::from(host),
            port,
            load_factor,
            local,
        }
    }

    fn counts(curr: &[Endpoint], next: &[Endpoint]) -> (usize, usize, usize) {
        let mut eq = 0;
        let mut add = 0;
        let mut del = 0;
        diff_endpoints(
            curr,
            next,
            |_, _| eq += 1,
            |_, _| add += 1,
            |_, _| del += 1,
        );
        (eq, add, del)
    }

    #[test]
    fn diff_tables() {
        let none: Vec<Endpoint> = vec![];
        let some = vec![ep("0", 0), ep("1", 1)];
        // Same identities, different metadata: still equal.
        let same_some = vec![ep_meta("0", 0, 1.0, true), ep_meta("1", 1, 2.0, true)];
        let another = vec![ep("2", 0), ep("3", 1)];
        let more_overlap = vec![ep_meta("0", 0, 1.0, true), ep("1", 1), ep("1", 2)];

        assert_eq!(counts(&none, &none), (0, 0, 0));
        assert_eq!(counts(&some, &same_some), (2, 0, 0));
        assert_eq!(counts(&none, &some), (0, 2, 0));
        assert_eq!(counts(&some, &none), (0, 0, 2));
        assert_eq!(counts(&some, &more_overlap), (2, 1, 0));
        assert_eq!(counts(&more_overlap, &some), (2, 0, 1));
        assert_eq!(counts(&some, &another), (0, 2, 2));
    }

    #[test]
    fn diff_accounts_for_every_input() {
        let curr = vec![ep("a", 1), ep("b", 1), ep("c", 1)];
        let next = vec![ep("b", 1), ep("c", 1), ep("d", 1), ep("e", 9)];
        let (eq, add, del) = counts(&curr, &next);
        assert_eq!(eq + add, next.len());
        assert_eq!(eq + del, curr.len());
    }

    #[test]
    fn diff_callbacks_fire_in_sorted_order() {
        let curr = vec![ep("a", 1), ep("c", 1)];
        let next = vec![ep("b", 1), ep("c", 1)];
        let events = std::cell::RefCell::new(Vec::new());
        diff_endpoints(
            &curr,
            &next,
            |i, _| events.borrow_mut().push(format!("eq:{}", curr[i].host)),
            |_, j| events.borrow_mut().push(format!("add:{}", next[j].host)),
            |i, _| events.borrow_mut().push(format!("del:{}", curr[i].host)),
        );
        assert_eq!(events.into_inner(), vec!["del:a", "add:b", "eq:c"]);
    }

    #[test]
    fn sort_orders_by_host_then_port() {
        let mut endpoints = vec![ep("b", 1), ep("a", 9), ep("a", 1)];
        sort_endpoints(&mut endpoints);
        assert_eq!(
            endpoints.iter().map(|e| e.addr()).collect::<Vec<_>>(),
            vec![Addr::new("a", 1), Addr::new("a", 9), Addr::new("b", 1)]
        );
    }

    #[test]
    fn addr_displays_as_host_port() {
        assert_eq!(format!("{}", Addr::new("db-1", 2135)), "db-1:2135");
    }
}
