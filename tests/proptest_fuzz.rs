//! Property-based tests (fuzzing) for tree-sync resilience.
//!
//! Uses proptest to generate random/malformed inputs and delivery orders and
//! verify the codec never panics and the client converges on the same tree.
//!
//! Run with: `cargo test --test proptest_fuzz`

use std::collections::HashSet;

use proptest::prelude::*;
use serde_json::{json, Value};

use tree_sync::protocol::codec;
use tree_sync::{
    ChangeMessage, HandleOutcome, MessageHandler, NodeChange, NodeId, StateTree, SyncConfig,
};

// =============================================================================
// Strategies for generating test data
// =============================================================================

/// Generate arbitrary JSON values (including invalid structures)
fn arbitrary_json_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        ".*".prop_map(Value::String),
    ];

    leaf.prop_recursive(
        4,   // depth
        64,  // max nodes
        10,  // items per collection
        |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..10)
                    .prop_map(Value::Array),
                prop::collection::hash_map(".*", inner, 0..10)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        },
    )
}

/// Local edit on a tracking tree; indices pick among currently attached nodes.
#[derive(Debug, Clone)]
enum Edit {
    Allocate(usize),
    SetText(usize, String),
    SetAttribute(usize, String, i64),
    Detach(usize),
}

fn edit_strategy() -> impl Strategy<Value = Edit> {
    prop_oneof![
        3 => any::<usize>().prop_map(Edit::Allocate),
        3 => (any::<usize>(), "[a-z]{0,6}").prop_map(|(n, t)| Edit::SetText(n, t)),
        2 => (any::<usize>(), "[a-c]", any::<i64>()).prop_map(|(n, k, v)| Edit::SetAttribute(n, k, v)),
        1 => any::<usize>().prop_map(Edit::Detach),
    ]
}

fn apply_edit(tree: &mut StateTree, edit: &Edit) {
    let attached = tree.walk_pre_order();
    let pick = |i: usize| attached[i % attached.len()];
    match edit {
        Edit::Allocate(i) => {
            tree.allocate_node(pick(*i)).unwrap();
        }
        Edit::SetText(i, text) => {
            tree.apply_change(&NodeChange::put(pick(*i), "text", json!(text)))
                .unwrap();
        }
        Edit::SetAttribute(i, key, value) => {
            tree.apply_change(&NodeChange::put_entry(pick(*i), "attributes", key.as_str(), json!(value)))
                .unwrap();
        }
        Edit::Detach(i) => {
            let id = pick(*i);
            if id != NodeId::ROOT {
                tree.detach(id).unwrap();
            }
        }
    }
}

/// Messages 1..=n produced by a tracking tree, one edit batch per message.
fn build_messages(batches: &[Vec<Edit>]) -> (Vec<ChangeMessage>, StateTree) {
    let mut source = StateTree::tracking();
    let mut messages = Vec::new();
    for (i, batch) in batches.iter().enumerate() {
        for edit in batch {
            apply_edit(&mut source, edit);
        }
        messages.push(ChangeMessage::new(i as u64 + 1, source.take_changes()));
        source.purge_detached();
    }
    (messages, source)
}

fn batches_strategy() -> impl Strategy<Value = Vec<Vec<Edit>>> {
    prop::collection::vec(prop::collection::vec(edit_strategy(), 0..6), 1..16)
}

fn lenient_config() -> SyncConfig {
    SyncConfig {
        max_buffered_messages: 1_000,
        max_gap_retries: 1_000,
        ..Default::default()
    }
}

// =============================================================================
// Codec
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn fuzz_decode_request_from_random_bytes(bytes in prop::collection::vec(any::<u8>(), 0..2000)) {
        let text = String::from_utf8_lossy(&bytes);
        let _ = codec::decode_request(&text);
        let _ = codec::decode_response(&text);
    }

    #[test]
    fn fuzz_decode_from_arbitrary_json(json in arbitrary_json_strategy()) {
        let text = json.to_string();
        let _ = codec::decode_request(&text);
        let _ = codec::decode_response(&text);
    }

    #[test]
    fn fuzz_decode_response_with_garbage_changes(
        seq in any::<u64>(),
        changes in prop::collection::vec(arbitrary_json_strategy(), 0..5),
    ) {
        let text = json!({
            "messages": [{ "sequenceId": seq, "changes": changes }]
        })
        .to_string();
        let _ = codec::decode_response(&text);
    }
}

// =============================================================================
// Tree
// =============================================================================

/// Every reachable node is visited once and links back to its parent.
fn check_structure(tree: &StateTree) -> Result<(), TestCaseError> {
    let walk = tree.walk_pre_order();
    let unique: HashSet<_> = walk.iter().copied().collect();
    prop_assert_eq!(unique.len(), walk.len(), "node reachable twice: {:?}", walk);
    for id in walk {
        let node = tree.node(id).unwrap();
        prop_assert!(node.is_attached());
        for child in node.children() {
            prop_assert_eq!(tree.node(*child).and_then(|c| c.parent()), Some(id));
        }
    }
    Ok(())
}

proptest! {
    #[test]
    fn prop_random_changes_never_panic(
        changes in prop::collection::vec(
            (0u32..5, 0u32..5, 0u8..3, ".{0,4}"),
            0..60,
        )
    ) {
        let mut tree = StateTree::new();
        for (node, parent, op, text) in changes {
            let change = match op {
                0 => NodeChange::attach(NodeId(node), NodeId(parent)),
                1 => NodeChange::Detach { node_id: NodeId(node) },
                _ => NodeChange::put(NodeId(node), "text", json!(text)),
            };
            let _ = tree.apply_change(&change);
            check_structure(&tree)?;
        }
        tree.purge_detached();
        check_structure(&tree)?;
    }

    #[test]
    fn prop_moves_out_of_detached_subtrees(
        order in Just(vec![2u32, 3, 4]).prop_shuffle(),
        under_child in any::<bool>(),
    ) {
        // root -> 2 -> 3 -> 4, then detach 2 and re-attach the chain in any order.
        let mut tree = StateTree::new();
        tree.apply_changes(&[
            NodeChange::attach(NodeId(2), NodeId::ROOT),
            NodeChange::attach(NodeId(3), NodeId(2)),
            NodeChange::attach(NodeId(4), NodeId(3)),
            NodeChange::Detach { node_id: NodeId(2) },
        ]).unwrap();

        let mut last = NodeId::ROOT;
        for id in order {
            let parent = if under_child { last } else { NodeId::ROOT };
            let _ = tree.apply_change(&NodeChange::attach(NodeId(id), parent));
            last = NodeId(id);
            check_structure(&tree)?;
        }
        prop_assert_eq!(tree.walk_pre_order().len(), 4);
    }

    #[test]
    fn prop_incremental_equals_snapshot(batches in batches_strategy()) {
        let (messages, source) = build_messages(&batches);

        let mut incremental = StateTree::new();
        for message in &messages {
            incremental.apply_changes(&message.changes).unwrap();
            incremental.purge_detached();
        }

        let mut rebuilt = StateTree::new();
        rebuilt.replace_with_snapshot(&source.snapshot_changes()).unwrap();

        prop_assert_eq!(incremental.debug_dump(), source.debug_dump());
        prop_assert_eq!(rebuilt.debug_dump(), source.debug_dump());
    }
}

// =============================================================================
// Ordering
// =============================================================================

proptest! {
    #[test]
    fn prop_shuffled_delivery_converges(
        (messages, shuffled) in batches_strategy().prop_flat_map(|batches| {
            let (messages, _) = build_messages(&batches);
            (Just(messages.clone()), Just(messages).prop_shuffle())
        })
    ) {
        let config = lenient_config();

        let mut in_order = StateTree::new();
        let mut direct = MessageHandler::new(&config);
        for message in &messages {
            direct.handle(&mut in_order, message.clone());
        }

        let mut tree = StateTree::new();
        let mut handler = MessageHandler::new(&config);
        for message in shuffled {
            let outcome = handler.handle(&mut tree, message);
            prop_assert!(
                !matches!(outcome, HandleOutcome::NeedsFullResync { .. }),
                "unexpected resync: {:?}",
                outcome
            );
        }

        prop_assert_eq!(handler.buffered_len(), 0);
        prop_assert_eq!(handler.next_expected(), messages.len() as u64 + 1);
        prop_assert_eq!(tree.debug_dump(), in_order.debug_dump());
    }

    #[test]
    fn prop_duplicates_are_idempotent(
        batches in batches_strategy(),
        repeats in prop::collection::vec(any::<prop::sample::Index>(), 0..10),
    ) {
        let (messages, source) = build_messages(&batches);
        let config = lenient_config();
        let mut tree = StateTree::new();
        let mut handler = MessageHandler::new(&config);

        for message in &messages {
            handler.handle(&mut tree, message.clone());
        }
        for index in repeats {
            let message = index.get(&messages).clone();
            prop_assert_eq!(handler.handle(&mut tree, message), HandleOutcome::Duplicate);
        }
        prop_assert_eq!(tree.debug_dump(), source.debug_dump());
    }
}
