//! Binary trie over address bits for CIDR containment checks. Follows the
//! shortest-prefix idea from routing table implementations: it is enough to
//! know that *some* configured network covers the address, so inserting a
//! shorter prefix prunes everything below it and lookups stop at the first
//! leaf.

#[derive(Default)]
pub struct CidrTrie {
    root: Option<Box<TrieNode>>,
}

#[derive(Default)]
struct TrieNode {
    left: Option<Box<TrieNode>>,
    right: Option<Box<TrieNode>>,
    leaf: bool,
}

fn bit(bytes: &[u8], n: usize) -> u8 {
    (bytes[n / 8] >> (7 - n % 8)) & 1
}

impl CidrTrie {
    pub fn new() -> CidrTrie {
        CidrTrie::default()
    }

    /// Insert a network given as address bytes and prefix length. Stops
    /// early if a shorter prefix already covers it.
    pub fn add(&mut self, addr: &[u8], prefix: usize) {
        let mut node = self.root.get_or_insert_with(Default::default);
        for i in 0..prefix {
            if node.leaf {
                // A shorter prefix already covers this network
                return;
            }
            node = if bit(addr, i) == 1 {
                node.right.get_or_insert_with(Default::default)
            } else {
                node.left.get_or_insert_with(Default::default)
            };
        }

        // Nothing below the leaf matters, the shortest prefix wins
        node.left = None;
        node.right = None;
        node.leaf = true;
    }

    /// Remove a network, pruning branches that become empty.
    pub fn remove(&mut self, addr: &[u8], prefix: usize) {
        self.root = Self::remove_node(self.root.take(), addr, 0, prefix);
    }

    fn remove_node(
        node: Option<Box<TrieNode>>,
        addr: &[u8],
        depth: usize,
        prefix: usize,
    ) -> Option<Box<TrieNode>> {
        let mut node = node?;

        if depth == prefix {
            node.leaf = false;
            if node.left.is_none() && node.right.is_none() {
                return None;
            }
            return Some(node);
        }

        if bit(addr, depth) == 1 {
            node.right = Self::remove_node(node.right.take(), addr, depth + 1, prefix);
        } else {
            node.left = Self::remove_node(node.left.take(), addr, depth + 1, prefix);
        }

        if !node.leaf && node.left.is_none() && node.right.is_none() {
            return None;
        }
        Some(node)
    }

    /// Look up an address. Returns the depth (prefix length) of the covering
    /// network, which is the shortest configured prefix containing it.
    pub fn lookup(&self, addr: &[u8]) -> Option<usize> {
        let size = addr.len() * 8;
        let mut node = self.root.as_deref()?;
        for i in 0..size {
            if node.leaf {
                return Some(i);
            }
            node = match bit(addr, i) {
                1 => node.right.as_deref()?,
                _ => node.left.as_deref()?,
            };
        }
        if node.leaf {
            Some(size)
        } else {
            None
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_shortest_prefix_wins() {
        let mut trie = CidrTrie::new();
        trie.add(&[10, 0, 0, 0], 8);
        trie.add(&[10, 1, 0, 0], 16);

        // Covered by both networks, the /8 must be reported
        assert_eq!(Some(8), trie.lookup(&[10, 1, 2, 3]));
        assert_eq!(None, trie.lookup(&[11, 1, 2, 3]));
    }

    #[test]
    fn test_insert_order_irrelevant() {
        let mut trie = CidrTrie::new();
        trie.add(&[10, 1, 0, 0], 16);
        trie.add(&[10, 0, 0, 0], 8);

        assert_eq!(Some(8), trie.lookup(&[10, 1, 2, 3]));
    }

    #[test]
    fn test_host_route() {
        let mut trie = CidrTrie::new();
        trie.add(&[192, 0, 2, 1], 32);

        assert_eq!(Some(32), trie.lookup(&[192, 0, 2, 1]));
        assert_eq!(None, trie.lookup(&[192, 0, 2, 2]));
    }

    #[test]
    fn test_remove_prunes() {
        let mut trie = CidrTrie::new();
        trie.add(&[10, 0, 0, 0], 8);
        trie.add(&[172, 16, 0, 0], 12);

        trie.remove(&[10, 0, 0, 0], 8);
        assert_eq!(None, trie.lookup(&[10, 1, 2, 3]));
        assert_eq!(Some(12), trie.lookup(&[172, 16, 5, 5]));

        trie.remove(&[172, 16, 0, 0], 12);
        assert!(trie.is_empty());
    }
}
