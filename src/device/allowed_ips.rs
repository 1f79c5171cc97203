//! Allowed-IP routing table
//!
//! One compressed binary trie per address family. Each node stores the
//! prefix bits it covers and its length; nodes without a peer exist only
//! to join two subtrees. Nodes live in an arena and refer to each other by
//! index, with freed slots recycled.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use parking_lot::RwLock;

type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Root,
    Child(NodeId, usize),
}

struct Node<T> {
    peer: Option<Arc<T>>,
    children: [Option<NodeId>; 2],
    parent: Link,
    cidr: u8,
    bits: [u8; 16],
}

/// Number of leading bits `a` and `b` share
fn common_bits(a: &[u8], b: &[u8]) -> u8 {
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        let diff = x ^ y;
        if diff != 0 {
            return (i * 8) as u8 + diff.leading_zeros() as u8;
        }
    }
    (a.len().min(b.len()) * 8) as u8
}

fn masked(ip: &[u8], cidr: u8) -> [u8; 16] {
    let mut bits = [0u8; 16];
    for (i, byte) in ip.iter().enumerate().take(16) {
        let start = i * 8;
        let keep = (cidr as usize).saturating_sub(start).min(8);
        bits[i] = if keep == 0 { 0 } else { byte & (0xffu8 << (8 - keep)) };
    }
    bits
}

struct Trie<T> {
    nodes: Vec<Node<T>>,
    free: Vec<NodeId>,
    root: Option<NodeId>,
    width: usize,
}

impl<T> Trie<T> {
    fn new(width: usize) -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            root: None,
            width,
        }
    }

    fn bits(&self, id: NodeId) -> &[u8] {
        &self.nodes[id].bits[..self.width]
    }

    /// Which child of `id` the address `ip` descends into
    fn choose(&self, id: NodeId, ip: &[u8]) -> usize {
        let cidr = self.nodes[id].cidr as usize;
        match ip.get(cidr / 8) {
            Some(byte) => ((byte >> (7 - cidr % 8)) & 1) as usize,
            None => 0,
        }
    }

    fn alloc(&mut self, peer: Option<Arc<T>>, ip: &[u8], cidr: u8) -> NodeId {
        let node = Node {
            peer,
            children: [None, None],
            parent: Link::Root,
            cidr,
            bits: masked(ip, cidr),
        };
        match self.free.pop() {
            Some(id) => {
                self.nodes[id] = node;
                id
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, id: NodeId) {
        let node = &mut self.nodes[id];
        node.peer = None;
        node.children = [None, None];
        node.parent = Link::Root;
        self.free.push(id);
    }

    fn set_link(&mut self, link: Link, child: Option<NodeId>) {
        match link {
            Link::Root => self.root = child,
            Link::Child(parent, bit) => self.nodes[parent].children[bit] = child,
        }
    }

    /// Attach `child` below `parent` (or at the root), on the side its bits pick
    fn attach(&mut self, parent: Option<NodeId>, child: NodeId) {
        let link = match parent {
            None => Link::Root,
            Some(parent) => {
                let child_bits = self.nodes[child].bits;
                Link::Child(parent, self.choose(parent, &child_bits[..self.width]))
            }
        };
        self.nodes[child].parent = link;
        self.set_link(link, Some(child));
    }

    /// Deepest node whose prefix contains `ip/cidr`, and whether it is exactly `ip/cidr`
    fn placement(&self, ip: &[u8], cidr: u8) -> (Option<NodeId>, bool) {
        let mut parent = None;
        let mut node = self.root;
        while let Some(id) = node {
            let n = &self.nodes[id];
            if n.cidr > cidr || common_bits(self.bits(id), ip) < n.cidr {
                break;
            }
            parent = Some(id);
            if n.cidr == cidr {
                return (parent, true);
            }
            node = n.children[self.choose(id, ip)];
        }
        (parent, false)
    }

    fn insert(&mut self, ip: &[u8], cidr: u8, peer: Arc<T>) {
        let Some(root) = self.root else {
            let id = self.alloc(Some(peer), ip, cidr);
            self.root = Some(id);
            return;
        };

        let (node, exact) = self.placement(ip, cidr);
        if exact {
            if let Some(id) = node {
                self.nodes[id].peer = Some(peer);
            }
            return;
        }

        let down = match node {
            None => root,
            Some(id) => match self.nodes[id].children[self.choose(id, ip)] {
                Some(down) => down,
                None => {
                    let new = self.alloc(Some(peer), ip, cidr);
                    self.attach(Some(id), new);
                    return;
                }
            },
        };

        let common = common_bits(self.bits(down), ip).min(cidr);
        let new = self.alloc(Some(peer), ip, cidr);

        if common == cidr {
            // The new prefix sits directly above `down`
            self.attach(Some(new), down);
            self.attach(node, new);
            return;
        }

        // Split with a peerless node covering the shared prefix
        let split = self.alloc(None, ip, common);
        self.attach(Some(split), down);
        self.attach(Some(split), new);
        self.attach(node, split);
    }

    fn lookup(&self, ip: &[u8]) -> Option<Arc<T>> {
        let mut found = None;
        let mut node = self.root;
        while let Some(id) = node {
            let n = &self.nodes[id];
            if common_bits(self.bits(id), ip) < n.cidr {
                break;
            }
            if n.peer.is_some() {
                found = n.peer.as_ref();
            }
            if n.cidr as usize == self.width * 8 {
                break;
            }
            node = n.children[self.choose(id, ip)];
        }
        found.cloned()
    }

    /// Clear the peer of `id` and splice out nodes that no longer join anything
    fn remove_node(&mut self, id: NodeId) {
        self.nodes[id].peer = None;
        let [left, right] = self.nodes[id].children;
        if left.is_some() && right.is_some() {
            return;
        }

        let child = left.or(right);
        let link = self.nodes[id].parent;
        if let Some(child) = child {
            self.nodes[child].parent = link;
        }
        self.set_link(link, child);
        self.release(id);

        if child.is_some() {
            return;
        }
        let Link::Child(parent, bit) = link else {
            return;
        };
        if self.nodes[parent].peer.is_some() {
            return;
        }

        // `parent` was a pure join node and now has a single child
        let sibling = self.nodes[parent].children[bit ^ 1];
        let grand = self.nodes[parent].parent;
        if let Some(sibling) = sibling {
            self.nodes[sibling].parent = grand;
        }
        self.set_link(grand, sibling);
        self.release(parent);
    }

    fn owned_by(&self, peer: &Arc<T>) -> Vec<NodeId> {
        let mut ids = Vec::new();
        let mut stack: Vec<NodeId> = self.root.into_iter().collect();
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id];
            if node.peer.as_ref().is_some_and(|p| Arc::ptr_eq(p, peer)) {
                ids.push(id);
            }
            stack.extend(node.children.iter().flatten());
        }
        ids
    }

    fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.root = None;
    }
}

struct Tables<T> {
    v4: Trie<T>,
    v6: Trie<T>,
}

/// Longest-prefix routing of addresses to peers
pub struct AllowedIps<T> {
    tables: RwLock<Tables<T>>,
}

impl<T> Default for AllowedIps<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> AllowedIps<T> {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables {
                v4: Trie::new(4),
                v6: Trie::new(16),
            }),
        }
    }

    /// Route `net` to `peer`, replacing any previous owner of the same prefix
    pub fn insert(&self, net: IpNet, peer: Arc<T>) {
        let mut tables = self.tables.write();
        match net {
            IpNet::V4(net) => tables.v4.insert(&net.addr().octets(), net.prefix_len(), peer),
            IpNet::V6(net) => tables.v6.insert(&net.addr().octets(), net.prefix_len(), peer),
        }
    }

    /// Peer owning the longest prefix containing `addr`
    pub fn lookup(&self, addr: IpAddr) -> Option<Arc<T>> {
        let tables = self.tables.read();
        match addr {
            IpAddr::V4(addr) => tables.v4.lookup(&addr.octets()),
            IpAddr::V6(addr) => tables.v6.lookup(&addr.octets()),
        }
    }

    /// Remove `net`, but only if it is currently routed to `peer`
    pub fn remove(&self, net: IpNet, peer: &Arc<T>) {
        let mut tables = self.tables.write();
        let (trie, ip, cidr) = match net {
            IpNet::V4(net) => (&mut tables.v4, net.addr().octets().to_vec(), net.prefix_len()),
            IpNet::V6(net) => (&mut tables.v6, net.addr().octets().to_vec(), net.prefix_len()),
        };

        if let (Some(id), true) = trie.placement(&ip, cidr) {
            if trie.nodes[id]
                .peer
                .as_ref()
                .is_some_and(|owner| Arc::ptr_eq(owner, peer))
            {
                trie.remove_node(id);
            }
        }
    }

    /// Remove every prefix routed to `peer`
    pub fn remove_by_peer(&self, peer: &Arc<T>) {
        let mut guard = self.tables.write();
        let tables = &mut *guard;
        for trie in [&mut tables.v4, &mut tables.v6] {
            for id in trie.owned_by(peer) {
                trie.remove_node(id);
            }
        }
    }

    /// Prefixes currently routed to `peer`
    pub fn entries_for_peer(&self, peer: &Arc<T>) -> Vec<IpNet> {
        let tables = self.tables.read();
        let mut entries = Vec::new();

        for id in tables.v4.owned_by(peer) {
            let node = &tables.v4.nodes[id];
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&node.bits[..4]);
            if let Ok(net) = Ipv4Net::new(Ipv4Addr::from(octets), node.cidr) {
                entries.push(IpNet::V4(net));
            }
        }
        for id in tables.v6.owned_by(peer) {
            let node = &tables.v6.nodes[id];
            if let Ok(net) = Ipv6Net::new(Ipv6Addr::from(node.bits), node.cidr) {
                entries.push(IpNet::V6(net));
            }
        }

        entries
    }

    pub fn clear(&self) {
        let mut tables = self.tables.write();
        tables.v4.clear();
        tables.v6.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn owner(table: &AllowedIps<&'static str>, addr: &str) -> Option<&'static str> {
        table.lookup(ip(addr)).map(|p| *p)
    }

    #[test]
    fn test_longest_prefix_match() {
        let table = AllowedIps::new();
        let a = Arc::new("a");
        let b = Arc::new("b");
        let c = Arc::new("c");
        table.insert(net("10.0.0.0/8"), a.clone());
        table.insert(net("10.1.0.0/16"), b.clone());
        table.insert(net("10.1.2.3/32"), c.clone());

        assert_eq!(owner(&table, "10.9.9.9"), Some("a"));
        assert_eq!(owner(&table, "10.1.9.9"), Some("b"));
        assert_eq!(owner(&table, "10.1.2.3"), Some("c"));
        assert_eq!(owner(&table, "11.0.0.1"), None);
    }

    #[test]
    fn test_host_bits_are_masked() {
        let table = AllowedIps::new();
        let a = Arc::new("a");
        table.insert(net("192.168.1.77/24"), a.clone());
        assert_eq!(owner(&table, "192.168.1.1"), Some("a"));
        assert_eq!(table.entries_for_peer(&a), vec![net("192.168.1.0/24")]);
    }

    #[test]
    fn test_duplicate_prefix_replaces_owner() {
        let table = AllowedIps::new();
        let a = Arc::new("a");
        let b = Arc::new("b");
        table.insert(net("10.0.0.0/24"), a.clone());
        table.insert(net("10.0.0.0/24"), b.clone());
        assert_eq!(owner(&table, "10.0.0.5"), Some("b"));
        assert!(table.entries_for_peer(&a).is_empty());
    }

    #[test]
    fn test_remove_only_when_owned() {
        let table = AllowedIps::new();
        let a = Arc::new("a");
        let b = Arc::new("b");
        table.insert(net("10.0.0.0/8"), a.clone());
        table.insert(net("10.1.0.0/16"), b.clone());

        table.remove(net("10.1.0.0/16"), &a);
        assert_eq!(owner(&table, "10.1.0.1"), Some("b"));

        table.remove(net("10.1.0.0/16"), &b);
        assert_eq!(owner(&table, "10.1.0.1"), Some("a"));
    }

    #[test]
    fn test_remove_by_peer() {
        let table = AllowedIps::new();
        let a = Arc::new("a");
        let b = Arc::new("b");
        table.insert(net("10.0.0.0/24"), a.clone());
        table.insert(net("10.0.1.0/24"), b.clone());
        table.insert(net("10.0.2.0/24"), a.clone());
        table.insert(net("fd00::/64"), a.clone());

        let mut entries = table.entries_for_peer(&a);
        entries.sort();
        assert_eq!(
            entries,
            vec![net("10.0.0.0/24"), net("10.0.2.0/24"), net("fd00::/64")]
        );

        table.remove_by_peer(&a);
        assert_eq!(owner(&table, "10.0.0.1"), None);
        assert_eq!(owner(&table, "10.0.2.1"), None);
        assert_eq!(owner(&table, "fd00::1"), None);
        assert_eq!(owner(&table, "10.0.1.1"), Some("b"));
        assert!(table.entries_for_peer(&a).is_empty());
    }

    #[test]
    fn test_default_routes_and_v6() {
        let table = AllowedIps::new();
        let a = Arc::new("a");
        let b = Arc::new("b");
        table.insert(net("0.0.0.0/0"), a.clone());
        table.insert(net("::/0"), a.clone());
        table.insert(net("2001:db8::/32"), b.clone());

        assert_eq!(owner(&table, "8.8.8.8"), Some("a"));
        assert_eq!(owner(&table, "2001:db8::1"), Some("b"));
        assert_eq!(owner(&table, "2001:db9::1"), Some("a"));
    }

    #[test]
    fn test_matches_linear_scan() {
        let peers: Vec<Arc<&'static str>> =
            ["p0", "p1", "p2", "p3", "p4"].iter().map(|p| Arc::new(*p)).collect();
        let table = AllowedIps::new();
        let mut routes: Vec<(Ipv4Net, usize)> = Vec::new();
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..300 {
            let addr = Ipv4Addr::from(rng.gen::<u32>() & 0xff0f_f0ff);
            let prefix = rng.gen_range(4..=32);
            let route = Ipv4Net::new(addr, prefix).unwrap().trunc();
            let peer = rng.gen_range(0..peers.len());
            table.insert(IpNet::V4(route), peers[peer].clone());
            routes.retain(|(r, _)| *r != route);
            routes.push((route, peer));
        }

        // Drop every route of one peer to exercise node splicing
        table.remove_by_peer(&peers[2]);
        routes.retain(|(_, p)| *p != 2);

        for _ in 0..2000 {
            let addr = Ipv4Addr::from(rng.gen::<u32>() & 0xff0f_f0ff);
            let expected = routes
                .iter()
                .filter(|(r, _)| r.contains(&addr))
                .max_by_key(|(r, _)| r.prefix_len())
                .map(|(_, p)| *peers[*p]);
            assert_eq!(table.lookup(IpAddr::V4(addr)).map(|p| *p), expected, "{addr}");
        }
    }

    #[test]
    fn test_common_bits_and_mask() {
        assert_eq!(common_bits(&[10, 0, 0, 0], &[10, 0, 0, 0]), 32);
        assert_eq!(common_bits(&[10, 0, 0, 0], &[11, 0, 0, 0]), 7);
        assert_eq!(common_bits(&[0x80, 0, 0, 0], &[0, 0, 0, 0]), 0);
        assert_eq!(&masked(&[192, 168, 1, 77], 20)[..4], &[192, 168, 0, 0]);
        assert_eq!(&masked(&[255, 255, 255, 255], 0)[..4], &[0, 0, 0, 0]);
    }
}
