//! Property tests: the materialized closure must agree with a plain
//! reachability oracle after any sequence of creates and deletes, both for
//! unlabelled reachability and for labels carried along membership chains.

use auth_rebac::*;
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

const NODES: u8 = 6;
const LABELS: [Option<&str>; 3] = [None, Some("member"), Some("owner")];
const MEMBER: usize = 1;

#[derive(Debug, Clone)]
enum Op {
    Create(u8, usize, u8),
    Delete(u8, usize, u8),
}

fn op() -> impl Strategy<Value = Op> {
    (any::<bool>(), 0..NODES, 0..LABELS.len(), 0..NODES).prop_map(|(create, from, label, to)| {
        if create {
            Op::Create(from, label, to)
        } else {
            Op::Delete(from, label, to)
        }
    })
}

fn node(i: u8) -> Object {
    Object::new("node", &i.to_string())
}

type Oracle = BTreeSet<(u8, usize, u8)>;

fn reaches(edges: &Oracle, from: u8, to: u8) -> bool {
    let mut stack = vec![from];
    let mut seen = BTreeSet::new();
    while let Some(current) = stack.pop() {
        for &(a, _, b) in edges.iter() {
            if a == current {
                if b == to {
                    return true;
                }
                if seen.insert(b) {
                    stack.push(b);
                }
            }
        }
    }
    false
}

/// Whether `to` is reachable by membership hops followed by one `label` hop.
fn labelled_reach(edges: &Oracle, from: u8, label: usize, to: u8) -> bool {
    let mut members = BTreeSet::from([from]);
    let mut stack = vec![from];
    while let Some(current) = stack.pop() {
        for &(a, l, b) in edges.iter() {
            if a == current && l == MEMBER && members.insert(b) {
                stack.push(b);
            }
        }
    }
    edges
        .iter()
        .any(|&(a, l, b)| l == label && b == to && members.contains(&a))
}

/// Number of distinct edge paths from `from` to `to`.
fn path_count(edges: &Oracle, from: u8, to: u8, memo: &mut BTreeMap<(u8, u8), usize>) -> usize {
    if let Some(&count) = memo.get(&(from, to)) {
        return count;
    }
    let count = edges
        .iter()
        .filter(|(a, _, _)| *a == from)
        .map(|&(_, _, b)| if b == to { 1 } else { path_count(edges, b, to, memo) })
        .sum();
    memo.insert((from, to), count);
    count
}

fn key(from: u8, label: usize, to: u8) -> EdgeKey {
    EdgeKey::new(node(from), LABELS[label], node(to))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn closure_matches_reachability(ops in prop::collection::vec(op(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async {
            let store = Arc::new(InMemoryRelationStore::new());
            let graph = RelationGraph::new(store.clone());
            let mut oracle = Oracle::new();

            for op in ops {
                match op {
                    Op::Create(from, label, to) => {
                        let outcome = graph.create(key(from, label, to)).await;
                        if from == to {
                            let rejected = matches!(outcome, Err(RebacError::Validation(_)));
                            prop_assert!(rejected, "self-loop accepted: {:?}", outcome);
                        } else if reaches(&oracle, to, from) {
                            let rejected = matches!(outcome, Err(RebacError::Cycle { .. }));
                            prop_assert!(rejected, "cycle accepted: {:?}", outcome);
                        } else {
                            prop_assert!(outcome.is_ok());
                            oracle.insert((from, label, to));
                        }
                    }
                    Op::Delete(from, label, to) => {
                        let outcome = graph.delete(key(from, label, to)).await;
                        if oracle.remove(&(from, label, to)) {
                            prop_assert!(outcome.is_ok());
                        } else {
                            prop_assert!(outcome.is_err());
                        }
                    }
                }
            }

            let mut memo = BTreeMap::new();
            let mut expected_records = 0;
            for from in 0..NODES {
                for to in 0..NODES {
                    let materialized = store.closure_exists(&node(from), &node(to), None).await.unwrap();
                    prop_assert_eq!(materialized, from != to && reaches(&oracle, from, to));
                    if from != to {
                        expected_records += path_count(&oracle, from, to, &mut memo);
                    }
                    for label in 1..LABELS.len() {
                        let named = store.closure_exists(&node(from), &node(to), LABELS[label]).await.unwrap();
                        prop_assert_eq!(named, labelled_reach(&oracle, from, label, to));
                    }
                }
            }
            prop_assert_eq!(store.closure_len().await, expected_records);
            prop_assert_eq!(store.edge_len().await, oracle.len());
            Ok(())
        })?;
    }
}
