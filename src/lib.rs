//! In-memory IPv4 longest-prefix-match index with per-prefix tags.
//!
//! The structure is a path-compressed (Patricia) binary trie over a node
//! arena: nodes live in a dense array addressed by small integer indices,
//! deleted slots go onto a free list and are recycled, and tag payloads
//! sit in a side table so node records stay fixed-size. Each stored
//! prefix carries zero or more 16-bit [`Tag`]s.
//!
//! ```
//! use prefixtag::{Ipv4Prefix, PatriciaTree};
//!
//! let mut tree = PatriciaTree::new();
//! tree.add("10.0.0.0/8".parse().unwrap(), 1);
//! tree.add("10.128.0.0/9".parse().unwrap(), 2);
//!
//! let on_path = tree.find_tags("10.129.0.0/16".parse().unwrap());
//! assert_eq!(on_path, vec![1, 2]);
//!
//! assert_eq!(tree.find_deepest_tag("10.1.2.3/32".parse().unwrap()), Some(1));
//!
//! let removed = tree.delete("10.128.0.0/9".parse().unwrap(), |stored, v| stored == v, 2);
//! assert_eq!(removed, 1);
//! ```
//!
//! The tree is single-threaded by design; wrap it in a reader/writer lock
//! if it must be shared.

pub mod address;
pub mod constants;
pub mod errors;
pub mod types;

mod arena;
mod tags;

#[cfg(test)]
mod proptests;

pub use address::{merge_prefixes, Ipv4Prefix};
pub use errors::{PrefixError, Result};
pub use types::{PatriciaTree, Tag};

use std::fmt;

use log::{debug, trace};
use metrics::{counter, gauge};
use once_cell::sync::OnceCell;

use crate::address::mask;
use crate::arena::NodeArena;
use crate::constants::{DEFAULT_CAPACITY, LEFTMOST_32_BIT, ROOT_INDEX, SENTINEL_INDEX};
use crate::tags::TagStore;

impl PatriciaTree {
    // ---- logging bootstrapper ------------------------------------------
    fn ensure_logging() {
        static INIT: OnceCell<()> = OnceCell::new();
        INIT.get_or_init(|| {
            let _ = env_logger::builder()
                .format_timestamp(None)
                .is_test(std::env::var("RUST_TEST_THREADS").is_ok())
                .try_init();
        });
    }

    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a tree whose arena starts with room for `capacity` nodes.
    /// The arena still grows on demand; capacity is a starting size, not
    /// a limit.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::ensure_logging();
        Self {
            arena: NodeArena::with_capacity(capacity),
            tags: TagStore::new(),
        }
    }

    /// Returns the number of node slots available without growing the
    /// arena (unused capacity plus recycled indices).
    pub fn available_capacity(&self) -> usize {
        self.arena.spare()
    }

    /// Emit gauges (caller decides cadence).
    pub fn report_capacity_metrics(&self) {
        gauge!("prefixtag_free_slots").set(self.available_capacity() as f64);
    }

    // ---- tag bookkeeping -----------------------------------------------

    fn add_tag(&mut self, node_index: u32, tag: Tag) {
        let slot = self.arena.node(node_index).tag_count;
        self.tags.put(node_index, slot, tag);
        self.arena.node_mut(node_index).tag_count += 1;
    }

    fn tags_for_node(&self, node_index: u32) -> Vec<Tag> {
        let count = self.arena.node(node_index).tag_count;
        (0..count).map(|slot| self.tags.get(node_index, slot)).collect()
    }

    fn first_tag_for_node(&self, node_index: u32) -> Tag {
        self.tags.first(node_index)
    }

    /// Append all of `from`'s tags onto `to`, preserving order, and leave
    /// `from` empty.
    fn move_tags(&mut self, from: u32, to: u32) {
        let from_count = self.arena.node(from).tag_count;
        let to_count = self.arena.node(to).tag_count;
        for slot in 0..from_count {
            let tag = self.tags.get(from, slot);
            self.tags.put(to, to_count + slot, tag);
            self.tags.remove(from, slot);
        }
        self.arena.node_mut(to).tag_count += from_count;
        self.arena.node_mut(from).tag_count = 0;
    }

    /// Filter-delete: drop every tag for which `matches(tag, match_val)`
    /// is true, keep the rest in their original order. Returns
    /// `(removed, kept)`.
    fn delete_matching_tags<F>(&mut self, node_index: u32, matches: F, match_val: Tag) -> (usize, usize)
    where
        F: Fn(Tag, Tag) -> bool,
    {
        let tags = self.tags_for_node(node_index);
        for slot in 0..self.arena.node(node_index).tag_count {
            self.tags.remove(node_index, slot);
        }
        self.arena.node_mut(node_index).tag_count = 0;

        let mut removed = 0;
        let mut kept = 0;
        for tag in tags {
            if matches(tag, match_val) {
                removed += 1;
            } else {
                self.add_tag(node_index, tag);
                kept += 1;
            }
        }
        (removed, kept)
    }

    // ---- structural helpers --------------------------------------------

    /// Swing the parent's pointer from `old_child` to `new_child`.
    fn replace_child(&mut self, parent_index: u32, old_child: u32, new_child: u32) {
        let parent = self.arena.node_mut(parent_index);
        if parent.left == old_child {
            parent.left = new_child;
        } else if parent.right == old_child {
            parent.right = new_child;
        } else {
            panic!(
                "corrupt trie: node {} is not a child of node {}",
                old_child, parent_index
            );
        }
    }

    // ---- insert --------------------------------------------------------

    /// Add `tag` under `address`. An empty address tags the root.
    /// Adding the same `(address, tag)` twice stores two occurrences.
    pub fn add(&mut self, address: Ipv4Prefix, tag: Tag) {
        counter!("prefixtag_adds_total").increment(1);
        debug!("[ADD] prefix={} tag={}", address, tag);

        // Grow up front so a single add never reallocates mid-operation.
        self.arena.reserve_slack();

        if address.is_empty() {
            self.add_tag(ROOT_INDEX, tag);
            return;
        }
        let mut address = address;

        // The root has no prefix; the first bit picks the starting branch.
        let root = self.arena.node(ROOT_INDEX);
        let (root_left, root_right) = (root.left, root.right);
        let mut node_index;
        if address.bits() < LEFTMOST_32_BIT {
            if root_left == SENTINEL_INDEX {
                let new_index = self.arena.allocate(address.bits(), address.length());
                self.add_tag(new_index, tag);
                self.arena.node_mut(ROOT_INDEX).left = new_index;
                return;
            }
            node_index = root_left;
        } else {
            if root_right == SENTINEL_INDEX {
                let new_index = self.arena.allocate(address.bits(), address.length());
                self.add_tag(new_index, tag);
                self.arena.node_mut(ROOT_INDEX).right = new_index;
                return;
            }
            node_index = root_right;
        }
        let mut parent_index = ROOT_INDEX;

        loop {
            if node_index == SENTINEL_INDEX {
                panic!("corrupt trie: traversed to node index 0");
            }
            let node = *self.arena.node(node_index);
            if node.prefix_length == 0 {
                panic!("corrupt trie: reached a non-root node with no prefix");
            }

            let match_count = node.match_count(&address);
            if match_count == 0 {
                panic!(
                    "corrupt trie: zero-bit match at node {} (node prefix length {}, address length {})",
                    node_index,
                    node.prefix_length,
                    address.length()
                );
            }

            if match_count == address.length() {
                // The address is fully consumed by this node's prefix.
                if match_count == node.prefix_length {
                    trace!("[ADD] exact match at node {}", node_index);
                    self.add_tag(node_index, tag);
                    return;
                }

                // The address is a proper prefix of this node: splice a
                // new tagged parent above it.
                trace!(
                    "[ADD] inserting parent above node {} at {} bits",
                    node_index,
                    match_count
                );
                let new_index = self.arena.allocate(address.bits(), address.length());
                self.add_tag(new_index, tag);

                let child_goes_left = {
                    let child = self.arena.node_mut(node_index);
                    child.shift_prefix(match_count);
                    child.prefix < LEFTMOST_32_BIT
                };
                if child_goes_left {
                    self.arena.node_mut(new_index).left = node_index;
                } else {
                    self.arena.node_mut(new_index).right = node_index;
                }
                self.replace_child(parent_index, node_index, new_index);
                return;
            }

            if match_count == node.prefix_length {
                // The node is fully consumed; keep descending.
                address.shift_left(match_count);

                let goes_left = address.bits() < LEFTMOST_32_BIT;
                let child = if goes_left { node.left } else { node.right };
                if child == SENTINEL_INDEX {
                    // nowhere else to go: a new leaf hangs here
                    let new_index = self.arena.allocate(address.bits(), address.length());
                    self.add_tag(new_index, tag);
                    if goes_left {
                        self.arena.node_mut(node_index).left = new_index;
                    } else {
                        self.arena.node_mut(node_index).right = new_index;
                    }
                    return;
                }
                parent_index = node_index;
                node_index = child;
                continue;
            }

            // Divergence inside both prefixes: split the edge with a
            // tag-free common parent and hang a new leaf off it.
            trace!(
                "[ADD] splitting node {} after {} shared bits",
                node_index,
                match_count
            );
            let common_index = self
                .arena
                .allocate(address.bits() & mask(match_count), match_count);

            address.shift_left(match_count);
            let leaf_index = self.arena.allocate(address.bits(), address.length());
            self.add_tag(leaf_index, tag);

            let node_goes_left = {
                let existing = self.arena.node_mut(node_index);
                existing.shift_prefix(match_count);
                existing.prefix < LEFTMOST_32_BIT
            };
            {
                let common = self.arena.node_mut(common_index);
                if node_goes_left {
                    common.left = node_index;
                    common.right = leaf_index;
                } else {
                    common.right = node_index;
                    common.left = leaf_index;
                }
            }
            self.replace_child(parent_index, node_index, common_index);
            return;
        }
    }

    // ---- delete --------------------------------------------------------

    /// Delete every tag at the node addressed exactly by `address` for
    /// which `matches(stored, match_val)` is true. Returns how many tags
    /// were removed; an absent prefix removes nothing.
    ///
    /// A node left with no tags is structurally compacted so that no
    /// tag-free single-child node survives below the root.
    pub fn delete<F>(&mut self, address: Ipv4Prefix, matches: F, match_val: Tag) -> usize
    where
        F: Fn(Tag, Tag) -> bool,
    {
        counter!("prefixtag_deletes_total").increment(1);
        debug!("[DELETE] prefix={} match_val={}", address, match_val);

        let mut parent_index = ROOT_INDEX;
        let target_index;

        if address.is_empty() {
            target_index = ROOT_INDEX;
        } else {
            let mut address = address;
            let root = self.arena.node(ROOT_INDEX);
            let mut node_index = if address.bits() < LEFTMOST_32_BIT {
                root.left
            } else {
                root.right
            };

            loop {
                if node_index == SENTINEL_INDEX {
                    return 0;
                }
                let node = *self.arena.node(node_index);
                let match_count = node.match_count(&address);
                if match_count < node.prefix_length {
                    // diverged: the prefix is not stored
                    return 0;
                }
                if match_count == address.length() {
                    target_index = node_index;
                    break;
                }

                parent_index = node_index;
                address.shift_left(match_count);
                node_index = if address.bits() < LEFTMOST_32_BIT {
                    node.left
                } else {
                    node.right
                };
            }
        }

        if self.arena.node(target_index).tag_count == 0 {
            return 0;
        }

        let (removed, kept) = self.delete_matching_tags(target_index, matches, match_val);
        if kept > 0 {
            trace!("[DELETE] node {} keeps {} tags", target_index, kept);
            return removed;
        }
        if target_index == ROOT_INDEX {
            // the root is never structurally removed
            return removed;
        }

        trace!("[DELETE] compacting around node {}", target_index);
        self.compact(parent_index, target_index);
        removed
    }

    /// Restore the no-redundant-node invariant after `target_index` lost
    /// its last tag: merge with the parent, lift a single child, or fold
    /// a sibling into the parent, releasing indices to the free list.
    fn compact(&mut self, parent_index: u32, target_index: u32) {
        let target = *self.arena.node(target_index);
        let parent = *self.arena.node(parent_index);

        if target.left != SENTINEL_INDEX && target.right != SENTINEL_INDEX {
            // Target is now a pure splitter. It can only be absorbed when
            // the parent has no other child.
            if parent.left != SENTINEL_INDEX && parent.right != SENTINEL_INDEX {
                return;
            }
            if parent_index == ROOT_INDEX {
                // the root has no prefix to extend
                return;
            }
            let (prefix, prefix_length) = merge_prefixes(
                parent.prefix,
                parent.prefix_length,
                target.prefix,
                target.prefix_length,
            );
            let parent_mut = self.arena.node_mut(parent_index);
            parent_mut.left = target.left;
            parent_mut.right = target.right;
            parent_mut.prefix = prefix;
            parent_mut.prefix_length = prefix_length;
        } else if target.left != SENTINEL_INDEX {
            // Only a left child: lift it into the target's place.
            self.replace_child(parent_index, target_index, target.left);
            let child = *self.arena.node(target.left);
            let (prefix, prefix_length) = merge_prefixes(
                target.prefix,
                target.prefix_length,
                child.prefix,
                child.prefix_length,
            );
            let child_mut = self.arena.node_mut(target.left);
            child_mut.prefix = prefix;
            child_mut.prefix_length = prefix_length;
        } else if target.right != SENTINEL_INDEX {
            // Only a right child: same, mirrored.
            self.replace_child(parent_index, target_index, target.right);
            let child = *self.arena.node(target.right);
            let (prefix, prefix_length) = merge_prefixes(
                target.prefix,
                target.prefix_length,
                child.prefix,
                child.prefix_length,
            );
            let child_mut = self.arena.node_mut(target.right);
            child_mut.prefix = prefix;
            child_mut.prefix_length = prefix_length;
        } else {
            // Leaf: unlink it, then see whether the parent can fold its
            // remaining child into itself.
            if parent.left == target_index {
                self.arena.node_mut(parent_index).left = SENTINEL_INDEX;
                if parent_index != ROOT_INDEX
                    && parent.tag_count == 0
                    && parent.right != SENTINEL_INDEX
                {
                    self.absorb_sibling(parent_index, parent.right);
                }
            } else if parent.right == target_index {
                self.arena.node_mut(parent_index).right = SENTINEL_INDEX;
                if parent_index != ROOT_INDEX
                    && parent.tag_count == 0
                    && parent.left != SENTINEL_INDEX
                {
                    self.absorb_sibling(parent_index, parent.left);
                }
            } else {
                panic!(
                    "corrupt trie: node {} is not a child of node {}",
                    target_index, parent_index
                );
            }
        }

        self.arena.release(target_index);
    }

    /// Fold `sibling_index` into its tag-free parent: the parent takes on
    /// the concatenated prefix, the sibling's tags, and its children.
    fn absorb_sibling(&mut self, parent_index: u32, sibling_index: u32) {
        let parent = *self.arena.node(parent_index);
        let sibling = *self.arena.node(sibling_index);
        let (prefix, prefix_length) = merge_prefixes(
            parent.prefix,
            parent.prefix_length,
            sibling.prefix,
            sibling.prefix_length,
        );
        {
            let parent_mut = self.arena.node_mut(parent_index);
            parent_mut.prefix = prefix;
            parent_mut.prefix_length = prefix_length;
        }
        self.move_tags(sibling_index, parent_index);
        let parent_mut = self.arena.node_mut(parent_index);
        parent_mut.left = sibling.left;
        parent_mut.right = sibling.right;
        self.arena.release(sibling_index);
    }

    // ---- lookups -------------------------------------------------------

    /// All tags stored on prefixes of `address`, outermost first (root
    /// tags lead), preserving per-node insertion order.
    pub fn find_tags(&self, address: Ipv4Prefix) -> Vec<Tag> {
        self.walk_tags(address, |_| true)
    }

    /// Like [`find_tags`](Self::find_tags), keeping only tags for which
    /// `filter` returns true.
    pub fn find_tags_with_filter<F>(&self, address: Ipv4Prefix, filter: F) -> Vec<Tag>
    where
        F: Fn(Tag) -> bool,
    {
        self.walk_tags(address, filter)
    }

    fn walk_tags<F>(&self, mut address: Ipv4Prefix, filter: F) -> Vec<Tag>
    where
        F: Fn(Tag) -> bool,
    {
        let mut found = Vec::new();

        let root = self.arena.node(ROOT_INDEX);
        if root.tag_count > 0 {
            found.extend(
                self.tags_for_node(ROOT_INDEX)
                    .into_iter()
                    .filter(|&tag| filter(tag)),
            );
        }
        if address.is_empty() {
            return found;
        }

        let mut node_index = if address.bits() < LEFTMOST_32_BIT {
            root.left
        } else {
            root.right
        };

        loop {
            if node_index == SENTINEL_INDEX {
                return found;
            }
            let node = self.arena.node(node_index);

            let match_count = node.match_count(&address);
            if match_count < node.prefix_length {
                // didn't cover the whole node - nothing deeper can match
                return found;
            }

            if node.tag_count > 0 {
                found.extend(
                    self.tags_for_node(node_index)
                        .into_iter()
                        .filter(|&tag| filter(tag)),
                );
            }

            if match_count == address.length() {
                return found;
            }

            address.shift_left(match_count);
            node_index = if address.bits() < LEFTMOST_32_BIT {
                node.left
            } else {
                node.right
            };
        }
    }

    /// The first tag of the deepest tagged prefix of `address`, or `None`
    /// when nothing on the path carries a tag.
    pub fn find_deepest_tag(&self, mut address: Ipv4Prefix) -> Option<Tag> {
        let mut deepest = None;

        let root = self.arena.node(ROOT_INDEX);
        if root.tag_count > 0 {
            deepest = Some(self.first_tag_for_node(ROOT_INDEX));
        }
        if address.is_empty() {
            return deepest;
        }

        let mut node_index = if address.bits() < LEFTMOST_32_BIT {
            root.left
        } else {
            root.right
        };

        loop {
            if node_index == SENTINEL_INDEX {
                return deepest;
            }
            let node = self.arena.node(node_index);

            let match_count = node.match_count(&address);
            if match_count < node.prefix_length {
                return deepest;
            }

            if node.tag_count > 0 {
                deepest = Some(self.first_tag_for_node(node_index));
            }

            if match_count == address.length() {
                return deepest;
            }

            address.shift_left(match_count);
            node_index = if address.bits() < LEFTMOST_32_BIT {
                node.left
            } else {
                node.right
            };
        }
    }

    // ---- statistics ----------------------------------------------------

    /// Live nodes in the tree, root included.
    pub fn node_count(&self) -> usize {
        self.count_nodes(ROOT_INDEX)
    }

    fn count_nodes(&self, node_index: u32) -> usize {
        let node = self.arena.node(node_index);
        let mut count = 1;
        if node.left != SENTINEL_INDEX {
            count += self.count_nodes(node.left);
        }
        if node.right != SENTINEL_INDEX {
            count += self.count_nodes(node.right);
        }
        count
    }

    /// Tags stored across the whole tree.
    pub fn tag_count(&self) -> usize {
        self.count_tags(ROOT_INDEX)
    }

    fn count_tags(&self, node_index: u32) -> usize {
        let node = self.arena.node(node_index);
        let mut count = node.tag_count as usize;
        if node.left != SENTINEL_INDEX {
            count += self.count_tags(node.left);
        }
        if node.right != SENTINEL_INDEX {
            count += self.count_tags(node.right);
        }
        count
    }
}

impl Default for PatriciaTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-slot dump of the arena, freed slots included. Heavy; meant for
/// debugging small trees.
impl fmt::Debug for PatriciaTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for index in 0..self.arena.len() as u32 {
            let node = self.arena.node(index);
            writeln!(
                f,
                "{}:\tleft: {}, right: {}, prefix: {:#034b} ({}), tags ({}): {:?}",
                index,
                node.left,
                node.right,
                node.prefix,
                node.prefix_length,
                node.tag_count,
                self.tags_for_node(index)
            )?;
        }
        Ok(())
    }
}
