//! Property tests: structural invariants of the trie checked against a
//! flat model of the inserted `(prefix, tag)` pairs.

use std::collections::HashSet;

use proptest::collection::vec as pvec;
use proptest::prelude::*;

use crate::address::mask;
use crate::constants::{LEFTMOST_32_BIT, ROOT_INDEX, SENTINEL_INDEX};
use crate::{Ipv4Prefix, PatriciaTree, Tag};

/// Walk the arena from the root and assert every structural invariant:
/// root shape, canonical prefixes, no redundant nodes, branch bits,
/// contiguous tag slots, and the live/free partition of arena slots.
fn assert_invariants(tree: &PatriciaTree) {
    assert_eq!(
        tree.arena.node(ROOT_INDEX).prefix_length,
        0,
        "root carries no prefix"
    );

    let mut live = HashSet::new();
    let mut stack = vec![ROOT_INDEX];
    while let Some(index) = stack.pop() {
        assert_ne!(index, SENTINEL_INDEX, "live link points at the sentinel");
        assert!(live.insert(index), "node {index} reachable twice");
        let node = tree.arena.node(index);

        if index != ROOT_INDEX {
            assert!(node.prefix_length >= 1, "non-root node {index} has no prefix");
            assert_eq!(
                node.prefix & !mask(node.prefix_length),
                0,
                "node {index} has stray bits below its prefix"
            );
            assert!(
                node.tag_count > 0
                    || (node.left != SENTINEL_INDEX && node.right != SENTINEL_INDEX),
                "node {index} is redundant: no tags and fewer than two children"
            );
        }

        if node.left != SENTINEL_INDEX {
            assert!(
                tree.arena.node(node.left).prefix < LEFTMOST_32_BIT,
                "left child of node {index} starts with a 1 bit"
            );
            stack.push(node.left);
        }
        if node.right != SENTINEL_INDEX {
            assert!(
                tree.arena.node(node.right).prefix >= LEFTMOST_32_BIT,
                "right child of node {index} starts with a 0 bit"
            );
            stack.push(node.right);
        }
    }

    // tag slots are contiguous from zero and nothing else is stored
    let mut expected_tags = 0;
    for &index in &live {
        let count = tree.arena.node(index).tag_count;
        expected_tags += count as usize;
        for slot in 0..count {
            assert!(
                tree.tags.contains(index, slot),
                "node {index} is missing tag slot {slot}"
            );
        }
    }
    assert_eq!(tree.tags.len(), expected_tags, "orphaned tag-store entries");

    // every allocated slot is exactly one of: live, on the free list
    let free: HashSet<u32> = tree.arena.free_indexes().iter().copied().collect();
    assert_eq!(
        free.len(),
        tree.arena.free_len(),
        "free list holds duplicate indices"
    );
    for index in 2..tree.arena.len() as u32 {
        assert!(
            live.contains(&index) ^ free.contains(&index),
            "slot {index} is neither live nor free (or both)"
        );
    }
}

fn is_prefix_of(p: &Ipv4Prefix, a: &Ipv4Prefix) -> bool {
    p.length() <= a.length() && (p.bits() ^ a.bits()) & mask(p.length()) == 0
}

/// Expected `find_tags` result: tags of stored prefixes of `probe`,
/// outermost first, insertion order within a prefix length.
fn model_find_tags(pairs: &[(Ipv4Prefix, Tag)], probe: &Ipv4Prefix) -> Vec<Tag> {
    let mut matching: Vec<&(Ipv4Prefix, Tag)> =
        pairs.iter().filter(|(p, _)| is_prefix_of(p, probe)).collect();
    matching.sort_by_key(|(p, _)| p.length());
    matching.iter().map(|(_, tag)| *tag).collect()
}

fn model_deepest_tag(pairs: &[(Ipv4Prefix, Tag)], probe: &Ipv4Prefix) -> Option<Tag> {
    let deepest = pairs
        .iter()
        .filter(|(p, _)| is_prefix_of(p, probe))
        .map(|(p, _)| p.length())
        .max()?;
    pairs
        .iter()
        .find(|(p, _)| p.length() == deepest && is_prefix_of(p, probe))
        .map(|(_, tag)| *tag)
}

fn prefix_strategy() -> impl Strategy<Value = Ipv4Prefix> {
    // narrow bit pools force shared prefixes, splits, and duplicates
    let bits = prop_oneof![
        any::<u32>(),
        (0u32..16).prop_map(|v| v << 28),
        (0u32..256).prop_map(|v| v << 24),
    ];
    (bits, 0u8..=32).prop_map(|(bits, length)| Ipv4Prefix::new(bits, length).unwrap())
}

fn build(pairs: &[(Ipv4Prefix, Tag)]) -> PatriciaTree {
    let mut tree = PatriciaTree::with_capacity(pairs.len() * 2 + 2);
    for &(prefix, tag) in pairs {
        tree.add(prefix, tag);
    }
    tree
}

/// Tag each generated prefix with its insertion index so every stored
/// tag is unique and order is observable.
fn enumerate(prefixes: Vec<Ipv4Prefix>) -> Vec<(Ipv4Prefix, Tag)> {
    prefixes
        .into_iter()
        .enumerate()
        .map(|(i, p)| (p, i as Tag))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn find_tags_matches_the_prefix_model(prefixes in pvec(prefix_strategy(), 1..40)) {
        let pairs = enumerate(prefixes);
        let tree = build(&pairs);
        assert_invariants(&tree);

        for (probe, _) in &pairs {
            prop_assert_eq!(tree.find_tags(*probe), model_find_tags(&pairs, probe));
        }
    }

    #[test]
    fn find_deepest_tag_matches_the_prefix_model(prefixes in pvec(prefix_strategy(), 1..40)) {
        let pairs = enumerate(prefixes);
        let tree = build(&pairs);

        for (probe, _) in &pairs {
            prop_assert_eq!(
                tree.find_deepest_tag(*probe),
                model_deepest_tag(&pairs, probe)
            );
        }
    }

    #[test]
    fn filtered_find_is_a_subsequence(prefixes in pvec(prefix_strategy(), 1..30)) {
        let pairs = enumerate(prefixes);
        let tree = build(&pairs);

        for (probe, _) in &pairs {
            let even: Vec<Tag> = model_find_tags(&pairs, probe)
                .into_iter()
                .filter(|tag| tag % 2 == 0)
                .collect();
            prop_assert_eq!(
                tree.find_tags_with_filter(*probe, |tag| tag % 2 == 0),
                even
            );
        }
    }

    #[test]
    fn delete_removes_exactly_the_matching_tags(
        prefixes in pvec(prefix_strategy(), 1..30),
        pick in any::<prop::sample::Index>(),
    ) {
        let pairs = enumerate(prefixes);
        let mut tree = build(&pairs);
        let (victim, tag) = pairs[pick.index(pairs.len())];

        let removed = tree.delete(victim, |stored, v| stored == v, tag);
        prop_assert_eq!(removed, 1, "tags are unique per insertion");
        prop_assert_eq!(tree.tag_count(), pairs.len() - 1);
        prop_assert!(!tree.find_tags(victim).contains(&tag));
        assert_invariants(&tree);
    }

    #[test]
    fn draining_every_prefix_leaves_only_the_root(
        prefixes in pvec(prefix_strategy(), 1..40),
    ) {
        let pairs = enumerate(prefixes);
        let mut tree = build(&pairs);

        // deepest-first: a stored prefix with no stored descendants is
        // always a leaf, so every removal exercises the leaf sub-cases
        // and never strands a shallower tag
        let mut order = pairs.clone();
        order.sort_by_key(|(p, _)| std::cmp::Reverse(p.length()));

        let mut removed_total = 0;
        for (prefix, _) in &order {
            removed_total += tree.delete(*prefix, |_, _| true, 0);
            assert_invariants(&tree);
        }

        prop_assert_eq!(removed_total, pairs.len());
        prop_assert_eq!(tree.node_count(), 1);
        prop_assert_eq!(tree.tag_count(), 0);
        prop_assert_eq!(
            tree.arena.free_len(),
            tree.arena.len() - 2,
            "every non-root slot should be back on the free list"
        );
    }

    #[test]
    fn adds_never_disturb_invariants(prefixes in pvec(prefix_strategy(), 1..60)) {
        let mut tree = PatriciaTree::new();
        for (i, prefix) in prefixes.into_iter().enumerate() {
            tree.add(prefix, i as Tag);
            assert_invariants(&tree);
        }
    }
}
