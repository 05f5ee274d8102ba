use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::{Context, Result};
use ipnet::IpNet;

/// 路径压缩的二叉前缀树节点 / Path-compressed binary trie node
///
/// `key` holds the prefix bits left-aligned (big-endian address order),
/// `plen` how many of them are significant. Children extend the prefix
/// by at least one bit; `child[b]` starts with bit `b` at position `plen`.
#[derive(Debug)]
struct Node {
    key: u32,
    plen: u8,
    terminal: bool,
    child: [Option<Box<Node>>; 2],
}

impl Node {
    fn new(key: u32, plen: u8, terminal: bool) -> Self {
        Self {
            key: key & prefix_mask(plen),
            plen,
            terminal,
            child: [None, None],
        }
    }
}

/// 国内 IPv4 路由表：启动时从 CIDR 列表构建，此后只读。
/// In-region IPv4 route table, built once at startup and read-only afterwards.
///
/// Membership walks at most one node per prefix bit, so a lookup is O(32)
/// regardless of how many prefixes were loaded.
#[derive(Debug, Default)]
pub struct ChnRoute {
    root: Option<Box<Node>>,
    len: usize,
}

impl ChnRoute {
    /// Loads the route table from a newline-separated CIDR list.
    ///
    /// Blank lines and lines starting with `#` are skipped. IPv6 entries
    /// parse fine but are ignored: classification only ever sees IPv4.
    /// Any other unparseable line aborts the load, naming the line.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read ip database: {}", path.display()))?;

        let mut table = Self::default();
        for (lineno, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let net: IpNet = line.parse().with_context(|| {
                format!("ip database line {}: invalid cidr {:?}", lineno + 1, line)
            })?;
            if let IpNet::V4(v4) = net {
                table.insert(u32::from(v4.network()), v4.prefix_len());
            }
        }
        Ok(table)
    }

    /// Number of IPv4 prefixes inserted.
    pub fn len(&self) -> usize {
        self.len
    }

    fn insert(&mut self, key: u32, plen: u8) {
        self.len += 1;
        insert_at(&mut self.root, key & prefix_mask(plen), plen);
    }

    /// `true` when `addr` falls inside any loaded prefix.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let key = u32::from(addr);
        let mut slot = &self.root;
        while let Some(node) = slot {
            if common_prefix_len(key, node.key) < node.plen {
                return false;
            }
            if node.terminal {
                return true;
            }
            if node.plen == 32 {
                return false;
            }
            slot = &node.child[bit_at(key, node.plen)];
        }
        false
    }
}

fn insert_at(slot: &mut Option<Box<Node>>, key: u32, plen: u8) {
    let Some(node) = slot else {
        *slot = Some(Box::new(Node::new(key, plen, true)));
        return;
    };

    let common = common_prefix_len(key, node.key).min(plen).min(node.plen);
    if common == node.plen {
        // New prefix lives at or below this node.
        if plen == node.plen {
            node.terminal = true;
            return;
        }
        let bit = bit_at(key, node.plen);
        insert_at(&mut node.child[bit], key, plen);
        return;
    }

    // Diverges inside this node's compressed run: split at the fork.
    let mut fork = Box::new(Node::new(key, common, false));
    let existing = slot.take().expect("slot checked non-empty");
    let existing_bit = bit_at(existing.key, common);
    fork.child[existing_bit] = Some(existing);
    if plen == common {
        fork.terminal = true;
    } else {
        fork.child[bit_at(key, common)] = Some(Box::new(Node::new(key, plen, true)));
    }
    *slot = Some(fork);
}

#[inline]
fn common_prefix_len(a: u32, b: u32) -> u8 {
    (a ^ b).leading_zeros() as u8
}

#[inline]
fn bit_at(key: u32, index: u8) -> usize {
    ((key >> (31 - index)) & 1) as usize
}

#[inline]
fn prefix_mask(plen: u8) -> u32 {
    if plen == 0 {
        0
    } else {
        u32::MAX << (32 - plen)
    }
}
