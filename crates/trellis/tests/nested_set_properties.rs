//! Property tests for the nested-set hierarchy.

use proptest::prelude::*;
use std::collections::HashMap;
use trellis::domain::{IssueId, OrphanPolicy};
use trellis::hierarchy::Hierarchy;
use trellis::{Error, StructuralError};

const ISSUES: u64 = 10;

fn arb_moves() -> impl Strategy<Value = Vec<(u64, Option<u64>)>> {
    prop::collection::vec((1..=ISSUES, prop::option::of(1..=ISSUES)), 0..40)
}

fn fresh() -> Hierarchy {
    let mut hierarchy = Hierarchy::new();
    for id in 1..=ISSUES {
        hierarchy.insert(IssueId(id)).unwrap();
    }
    hierarchy
}

/// Parent links tracked without a nested set.
fn reaches(parents: &HashMap<u64, Option<u64>>, from: u64, target: u64) -> bool {
    let mut current = Some(from);
    while let Some(id) = current {
        if id == target {
            return true;
        }
        current = parents[&id];
    }
    false
}

/// Everything observable about the shape of the forest.
fn shape(hierarchy: &Hierarchy) -> Vec<(Option<IssueId>, Vec<IssueId>, Vec<IssueId>)> {
    (1..=ISSUES)
        .map(IssueId)
        .map(|id| {
            (
                hierarchy.parent_of(id).unwrap(),
                hierarchy.ancestors(id).unwrap(),
                hierarchy.descendants(id).unwrap(),
            )
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn moves_keep_integrity_and_match_parent_links(moves in arb_moves()) {
        let mut hierarchy = fresh();
        let mut parents: HashMap<u64, Option<u64>> = (1..=ISSUES).map(|id| (id, None)).collect();

        for (child, parent) in moves {
            let cyclic = parent.is_some_and(|parent| reaches(&parents, parent, child));
            let result = hierarchy.set_parent(IssueId(child), parent.map(IssueId));
            if cyclic {
                let is_cyclic_parent = matches!(
                    result,
                    Err(Error::Structural(StructuralError::CyclicParent { .. }))
                );
                prop_assert!(is_cyclic_parent);
            } else {
                prop_assert!(result.is_ok());
                parents.insert(child, parent);
            }
            prop_assert!(hierarchy.check_integrity().is_ok());
        }

        for id in 1..=ISSUES {
            prop_assert_eq!(hierarchy.parent_of(IssueId(id)).unwrap(), parents[&id].map(IssueId));
            for other in 1..=ISSUES {
                let expected = other != id && reaches(&parents, other, id);
                prop_assert_eq!(
                    hierarchy.is_ancestor_of(IssueId(id), IssueId(other)).unwrap(),
                    expected
                );
            }
        }
    }

    #[test]
    fn incremental_moves_match_rebuild(moves in arb_moves()) {
        let mut hierarchy = fresh();
        for (child, parent) in moves {
            let _ = hierarchy.set_parent(IssueId(child), parent.map(IssueId));
        }

        let links: Vec<(IssueId, Option<IssueId>)> = (1..=ISSUES)
            .map(IssueId)
            .map(|id| (id, hierarchy.parent_of(id).unwrap()))
            .collect();
        let rebuilt = Hierarchy::rebuild(links).unwrap();

        for id in (1..=ISSUES).map(IssueId) {
            let root = hierarchy.root_of(id).unwrap();
            prop_assert_eq!(rebuilt.root_of(id).unwrap(), root);
            prop_assert_eq!(rebuilt.tree(root).unwrap(), hierarchy.tree(root).unwrap());
        }
    }

    #[test]
    fn repeated_move_is_a_no_op(
        moves in arb_moves(),
        child in 1..=ISSUES,
        target in prop::option::of(1..=ISSUES),
    ) {
        let mut hierarchy = fresh();
        for (moved, parent) in moves {
            let _ = hierarchy.set_parent(IssueId(moved), parent.map(IssueId));
        }

        if hierarchy.set_parent(IssueId(child), target.map(IssueId)).is_ok() {
            let once = shape(&hierarchy);
            let shift = hierarchy.set_parent(IssueId(child), target.map(IssueId)).unwrap();
            prop_assert!(shift.changed.is_empty());
            prop_assert_eq!(shape(&hierarchy), once);
        }
    }

    #[test]
    fn move_and_move_back_restores_shape(
        moves in arb_moves(),
        child in 1..=ISSUES,
        target in prop::option::of(1..=ISSUES),
    ) {
        let mut hierarchy = fresh();
        for (moved, parent) in moves {
            let _ = hierarchy.set_parent(IssueId(moved), parent.map(IssueId));
        }
        let before = shape(&hierarchy);
        let original = hierarchy.parent_of(IssueId(child)).unwrap();

        if hierarchy.set_parent(IssueId(child), target.map(IssueId)).is_ok() {
            hierarchy.set_parent(IssueId(child), original).unwrap();
        }

        prop_assert_eq!(shape(&hierarchy), before);
    }

    #[test]
    fn removal_keeps_integrity(moves in arb_moves(), victim in 1..=ISSUES, promote in any::<bool>()) {
        let mut hierarchy = fresh();
        for (moved, parent) in moves {
            let _ = hierarchy.set_parent(IssueId(moved), parent.map(IssueId));
        }
        let descendants = hierarchy.descendants(IssueId(victim)).unwrap();
        let children = hierarchy.children(IssueId(victim)).unwrap();

        let policy = if promote { OrphanPolicy::PromoteChildren } else { OrphanPolicy::DeleteSubtree };
        let shift = hierarchy.remove(IssueId(victim), policy).unwrap();

        prop_assert!(hierarchy.check_integrity().is_ok());
        prop_assert!(!hierarchy.contains(IssueId(victim)));
        if promote {
            prop_assert_eq!(shift.removed, vec![IssueId(victim)]);
            for child in children {
                prop_assert_eq!(hierarchy.parent_of(child).unwrap(), None);
            }
        } else {
            prop_assert_eq!(hierarchy.len(), (ISSUES as usize) - 1 - descendants.len());
        }
    }
}
