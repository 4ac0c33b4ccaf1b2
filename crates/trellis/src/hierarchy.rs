//! Nested-set hierarchy of issues.
//!
//! Every disjoint tree is numbered depth-first: each node owns a left and a
//! right bound, and a node's descendants are exactly the nodes of the same
//! tree whose bounds lie strictly inside its own. That turns descendant and
//! ancestor checks into range comparisons.
//!
//! # Index layout
//!
//! Besides the per-node entry, each tree keeps an ordered map from bound
//! value to the node owning it. Within one tree the values `1..=2n` are all
//! distinct, so the map doubles as the depth-first event sequence:
//!
//! - descendant queries are a range scan between a node's bounds,
//! - re-parenting only rewrites the points of the moved subtree and the
//!   points above the splice positions.
//!
//! # Sibling order
//!
//! Children are kept ordered by issue id. Moving an issue back under its
//! previous parent therefore restores exactly the previous bounds, which
//! makes every move reversible and re-applying a parent a no-op.

use crate::domain::{IssueId, IssueNode, NestedBounds, OrphanPolicy};
use crate::error::{Error, Result, StructuralError};
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TreeEntry {
    parent: Option<IssueId>,
    root: IssueId,
    lft: u32,
    rgt: u32,
}

impl TreeEntry {
    fn width(&self) -> u32 {
        self.rgt - self.lft + 1
    }

    fn encloses(&self, other: &TreeEntry) -> bool {
        self.root == other.root && self.lft < other.lft && other.rgt < self.rgt
    }
}

type Points = BTreeMap<u32, (IssueId, Side)>;

/// Nodes touched by a hierarchy mutation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeShift {
    /// Nodes whose bounds, root or parent changed, in id order
    pub changed: Vec<IssueId>,

    /// Nodes removed from the hierarchy
    pub removed: Vec<IssueId>,
}

impl TreeShift {
    /// Returns `true` if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }
}

/// Forest of nested-set trees.
///
/// All mutations validate their input before touching any index, so a
/// failed call leaves the hierarchy unchanged.
#[derive(Debug, Clone, Default)]
pub struct Hierarchy {
    entries: HashMap<IssueId, TreeEntry>,
    points: HashMap<IssueId, Points>,
}

impl Hierarchy {
    /// Create an empty hierarchy
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a hierarchy from persisted nodes, verifying their bounds.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConsistencyViolation` if two nodes share a bound or
    /// the nesting does not match the parent links.
    pub fn from_nodes<'a>(nodes: impl IntoIterator<Item = &'a IssueNode>) -> Result<Self> {
        let mut hierarchy = Self::new();
        for node in nodes {
            let entry = TreeEntry {
                parent: node.parent,
                root: node.root_id,
                lft: node.bounds.lft,
                rgt: node.bounds.rgt,
            };
            if hierarchy.entries.insert(node.id, entry).is_some() {
                return Err(Error::ConsistencyViolation(format!(
                    "issue {} loaded twice",
                    node.id
                )));
            }
            let points = hierarchy.points.entry(node.root_id).or_default();
            for (bound, side) in [(entry.lft, Side::Left), (entry.rgt, Side::Right)] {
                if let Some((owner, _)) = points.insert(bound, (node.id, side)) {
                    return Err(Error::ConsistencyViolation(format!(
                        "issues {} and {} share bound {} in tree {}",
                        owner, node.id, bound, node.root_id
                    )));
                }
            }
        }
        hierarchy.check_integrity()?;
        Ok(hierarchy)
    }

    /// Recompute every bound from parent links.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConsistencyViolation` if a parent is unknown or the
    /// links contain a cycle.
    pub fn rebuild(links: impl IntoIterator<Item = (IssueId, Option<IssueId>)>) -> Result<Self> {
        let links: HashMap<IssueId, Option<IssueId>> = links.into_iter().collect();
        let mut children: HashMap<IssueId, Vec<IssueId>> = HashMap::new();
        let mut roots = Vec::new();
        for (&id, &parent) in &links {
            match parent {
                Some(parent) if !links.contains_key(&parent) => {
                    return Err(Error::ConsistencyViolation(format!(
                        "issue {id} has unknown parent {parent}"
                    )));
                }
                Some(parent) => children.entry(parent).or_default().push(id),
                None => roots.push(id),
            }
        }
        for list in children.values_mut() {
            list.sort_unstable();
        }
        roots.sort_unstable();

        let mut hierarchy = Self::new();
        for root in roots {
            hierarchy.number_tree(root, &children);
        }
        if hierarchy.entries.len() != links.len() {
            return Err(Error::ConsistencyViolation(
                "parent links contain a cycle".to_string(),
            ));
        }
        Ok(hierarchy)
    }

    /// Depth-first numbering of one tree, iterative to bound stack use.
    fn number_tree(&mut self, root: IssueId, children: &HashMap<IssueId, Vec<IssueId>>) {
        let mut points = Points::new();
        let mut counter = 1;
        // (node, index of next child to visit)
        let mut stack: Vec<(IssueId, usize)> = vec![(root, 0)];
        self.entries.insert(
            root,
            TreeEntry {
                parent: None,
                root,
                lft: counter,
                rgt: 0,
            },
        );
        points.insert(counter, (root, Side::Left));

        while let Some((node, next)) = stack.pop() {
            let kids = children.get(&node).map(Vec::as_slice).unwrap_or_default();
            if let Some(&child) = kids.get(next) {
                stack.push((node, next + 1));
                counter += 1;
                self.entries.insert(
                    child,
                    TreeEntry {
                        parent: Some(node),
                        root,
                        lft: counter,
                        rgt: 0,
                    },
                );
                points.insert(counter, (child, Side::Left));
                stack.push((child, 0));
            } else {
                counter += 1;
                if let Some(entry) = self.entries.get_mut(&node) {
                    entry.rgt = counter;
                }
                points.insert(counter, (node, Side::Right));
            }
        }
        self.points.insert(root, points);
    }

    fn entry(&self, id: IssueId) -> Result<&TreeEntry> {
        self.entries.get(&id).ok_or(Error::IssueNotFound(id))
    }

    /// Returns `true` if the issue is part of the hierarchy.
    pub fn contains(&self, id: IssueId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of issues in the hierarchy.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the hierarchy holds no issues.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add an issue as its own single-node tree.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConsistencyViolation` if the issue is already present.
    pub fn insert(&mut self, id: IssueId) -> Result<()> {
        if self.entries.contains_key(&id) {
            return Err(Error::ConsistencyViolation(format!(
                "issue {id} is already in the hierarchy"
            )));
        }
        self.entries.insert(
            id,
            TreeEntry {
                parent: None,
                root: id,
                lft: 1,
                rgt: 2,
            },
        );
        self.points.insert(
            id,
            Points::from([(1, (id, Side::Left)), (2, (id, Side::Right))]),
        );
        Ok(())
    }

    /// Parent of an issue.
    pub fn parent_of(&self, id: IssueId) -> Result<Option<IssueId>> {
        Ok(self.entry(id)?.parent)
    }

    /// Root of the tree containing an issue.
    pub fn root_of(&self, id: IssueId) -> Result<IssueId> {
        Ok(self.entry(id)?.root)
    }

    /// Nested-set coordinates of an issue.
    pub(crate) fn bounds(&self, id: IssueId) -> Result<NestedBounds> {
        let entry = self.entry(id)?;
        Ok(NestedBounds {
            lft: entry.lft,
            rgt: entry.rgt,
        })
    }

    /// Returns `true` if the issue has no children.
    pub fn is_leaf(&self, id: IssueId) -> Result<bool> {
        let entry = self.entry(id)?;
        Ok(entry.rgt - entry.lft == 1)
    }

    /// Returns `true` if `ancestor` is a strict ancestor of `descendant`.
    pub fn is_ancestor_of(&self, ancestor: IssueId, descendant: IssueId) -> Result<bool> {
        Ok(self.entry(ancestor)?.encloses(self.entry(descendant)?))
    }

    /// Returns `true` if one issue is a strict ancestor of the other.
    pub fn is_lineal(&self, a: IssueId, b: IssueId) -> Result<bool> {
        let a = self.entry(a)?;
        let b = self.entry(b)?;
        Ok(a.encloses(b) || b.encloses(a))
    }

    /// All descendants of an issue, in depth-first order.
    pub fn descendants(&self, id: IssueId) -> Result<Vec<IssueId>> {
        let entry = self.entry(id)?;
        let Some(points) = self.points.get(&entry.root) else {
            return Ok(Vec::new());
        };
        Ok(points
            .range(entry.lft + 1..entry.rgt)
            .filter(|(_, (_, side))| *side == Side::Left)
            .map(|(_, (node, _))| *node)
            .collect())
    }

    /// Direct children of an issue, ordered by left bound.
    pub fn children(&self, id: IssueId) -> Result<Vec<IssueId>> {
        let entry = self.entry(id)?;
        let Some(points) = self.points.get(&entry.root) else {
            return Ok(Vec::new());
        };
        let mut children = Vec::new();
        let mut pos = entry.lft + 1;
        while pos < entry.rgt {
            let Some(&(child, Side::Left)) = points.get(&pos) else {
                break;
            };
            let Some(child_entry) = self.entries.get(&child) else {
                break;
            };
            children.push(child);
            if child_entry.rgt < pos {
                break;
            }
            pos = child_entry.rgt + 1;
        }
        Ok(children)
    }

    /// Descendants without children of their own.
    pub fn leaves(&self, id: IssueId) -> Result<Vec<IssueId>> {
        let entry = self.entry(id)?;
        let Some(points) = self.points.get(&entry.root) else {
            return Ok(Vec::new());
        };
        // A leaf's right bound immediately follows its left bound.
        Ok(points
            .range(entry.lft + 1..entry.rgt)
            .filter_map(|(&bound, &(node, side))| {
                (side == Side::Left && points.get(&(bound + 1)) == Some(&(node, Side::Right)))
                    .then_some(node)
            })
            .collect())
    }

    /// Ancestors of an issue, from the root down to the immediate parent.
    pub fn ancestors(&self, id: IssueId) -> Result<Vec<IssueId>> {
        let mut ancestors = Vec::new();
        let mut seen = HashSet::from([id]);
        let mut current = self.entry(id)?.parent;
        while let Some(parent) = current {
            if !seen.insert(parent) {
                return Err(Error::ConsistencyViolation(format!(
                    "parent links of {id} loop through {parent}"
                )));
            }
            ancestors.push(parent);
            current = self.entry(parent)?.parent;
        }
        ancestors.reverse();
        Ok(ancestors)
    }

    /// Issues of the tree rooted at `root`, in depth-first order.
    pub fn tree(&self, root: IssueId) -> Result<Vec<IssueId>> {
        let mut nodes = vec![root];
        nodes.extend(self.descendants(root)?);
        Ok(nodes)
    }

    /// Move an issue and its subtree under `new_parent`, or make it a root.
    ///
    /// The moved subtree is spliced after the last sibling with a smaller
    /// id. Only bound points of the subtree and of the shifted ranges are
    /// rewritten.
    ///
    /// # Errors
    ///
    /// - `Error::IssueNotFound` if either issue is unknown
    /// - `StructuralError::CyclicParent` if `new_parent` is `child` or one of
    ///   its descendants
    /// - `Error::ConsistencyViolation` if the target tree would outgrow the
    ///   bound range
    pub fn set_parent(&mut self, child: IssueId, new_parent: Option<IssueId>) -> Result<TreeShift> {
        let entry = *self.entry(child)?;
        if let Some(parent) = new_parent {
            let parent_entry = self.entry(parent)?;
            if parent == child || entry.encloses(parent_entry) {
                return Err(StructuralError::CyclicParent { child, parent }.into());
            }
            let size = self.points.get(&parent_entry.root).map_or(0, BTreeMap::len) as u64;
            let added = if parent_entry.root == entry.root { 0 } else { u64::from(entry.width()) };
            if size + added > u64::from(u32::MAX) {
                return Err(Error::ConsistencyViolation(format!(
                    "tree {} cannot take {added} more bounds",
                    parent_entry.root
                )));
            }
        }
        if entry.parent == new_parent {
            return Ok(TreeShift::default());
        }

        let mut changed = HashSet::new();
        let subtree = self.detach(child, &mut changed)?;

        let (root, target) = match new_parent {
            None => (child, 1),
            Some(parent) => {
                let parent_entry = *self.entry(parent)?;
                let mut target = parent_entry.lft + 1;
                for sibling in self.children(parent)? {
                    if sibling > child {
                        break;
                    }
                    target = self.entry(sibling)?.rgt + 1;
                }
                self.shift_points(parent_entry.root, target, i64::from(entry.width()), &mut changed)?;
                (parent_entry.root, target)
            }
        };

        let points = self.points.entry(root).or_default();
        for (bound, (node, side)) in subtree {
            let bound = bound - entry.lft + target;
            points.insert(bound, (node, side));
            if let Some(node_entry) = self.entries.get_mut(&node) {
                node_entry.root = root;
                match side {
                    Side::Left => node_entry.lft = bound,
                    Side::Right => node_entry.rgt = bound,
                }
            }
            changed.insert(node);
        }
        if let Some(child_entry) = self.entries.get_mut(&child) {
            child_entry.parent = new_parent;
        }

        let mut changed: Vec<IssueId> = changed.into_iter().collect();
        changed.sort_unstable();
        Ok(TreeShift {
            changed,
            removed: Vec::new(),
        })
    }

    /// Remove a subtree's points from its tree and close the gap.
    ///
    /// Returns the removed points with their original bounds.
    fn detach(&mut self, id: IssueId, changed: &mut HashSet<IssueId>) -> Result<Vec<(u32, (IssueId, Side))>> {
        let Some(entry) = self.entries.get(&id).copied() else {
            return Ok(Vec::new());
        };
        let Some(points) = self.points.get_mut(&entry.root) else {
            return Ok(Vec::new());
        };
        let mut tail = points.split_off(&entry.lft);
        let rest = tail.split_off(&(entry.rgt + 1));
        points.extend(rest);
        let subtree: Vec<_> = tail.into_iter().collect();

        if points.is_empty() {
            self.points.remove(&entry.root);
        } else {
            self.shift_points(entry.root, entry.rgt + 1, -i64::from(entry.width()), changed)?;
        }
        Ok(subtree)
    }

    /// Shift every point at or above `from` in one tree by `delta`.
    ///
    /// Nothing is moved unless every shifted bound stays within `1..=u32::MAX`.
    fn shift_points(
        &mut self,
        root: IssueId,
        from: u32,
        delta: i64,
        changed: &mut HashSet<IssueId>,
    ) -> Result<()> {
        let Some(points) = self.points.get_mut(&root) else {
            return Ok(());
        };
        let shifted = points
            .range(from..)
            .map(|(&bound, &point)| {
                u32::try_from(i64::from(bound) + delta)
                    .ok()
                    .filter(|&moved| moved > 0)
                    .map(|moved| (moved, point))
                    .ok_or_else(|| {
                        Error::ConsistencyViolation(format!(
                            "bound {bound} of tree {root} cannot shift by {delta}"
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        drop(points.split_off(&from));
        for (bound, (node, side)) in shifted {
            points.insert(bound, (node, side));
            if let Some(entry) = self.entries.get_mut(&node) {
                match side {
                    Side::Left => entry.lft = bound,
                    Side::Right => entry.rgt = bound,
                }
            }
            changed.insert(node);
        }
        Ok(())
    }

    /// Remove an issue from the hierarchy.
    ///
    /// With [`OrphanPolicy::PromoteChildren`] the direct children become
    /// roots of their own trees first; with `DeleteSubtree` all descendants
    /// are removed as well.
    pub fn remove(&mut self, id: IssueId, policy: OrphanPolicy) -> Result<TreeShift> {
        self.entry(id)?;
        let mut changed = HashSet::new();
        if policy == OrphanPolicy::PromoteChildren {
            for child in self.children(id)? {
                changed.extend(self.set_parent(child, None)?.changed);
            }
        }

        let removed_points = self.detach(id, &mut changed)?;
        let mut removed: Vec<IssueId> = removed_points
            .into_iter()
            .filter(|(_, (_, side))| *side == Side::Left)
            .map(|(_, (node, _))| node)
            .collect();
        for node in &removed {
            self.entries.remove(node);
            changed.remove(node);
        }
        removed.sort_unstable();

        let mut changed: Vec<IssueId> = changed.into_iter().collect();
        changed.sort_unstable();
        Ok(TreeShift { changed, removed })
    }

    /// Verify every nested-set invariant.
    ///
    /// Walks each tree's points in order and checks that bounds are
    /// contiguous from 1, properly bracketed, and agree with parent links.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConsistencyViolation` describing the first breach.
    pub fn check_integrity(&self) -> Result<()> {
        let violation = |msg: String| -> Result<()> { Err(Error::ConsistencyViolation(msg)) };
        let mut point_count = 0;

        for (&root, points) in &self.points {
            let mut stack: Vec<IssueId> = Vec::new();
            for (expected, (&bound, &(node, side))) in (1u32..).zip(points.iter()) {
                point_count += 1;
                if bound != expected {
                    return violation(format!("tree {root} skips bound {expected}"));
                }
                let Some(entry) = self.entries.get(&node) else {
                    return violation(format!("bound {bound} of tree {root} has unknown owner {node}"));
                };
                if entry.root != root {
                    return violation(format!("issue {node} is indexed under tree {root} but rooted at {}", entry.root));
                }
                match side {
                    Side::Left => {
                        if entry.lft != bound || entry.lft >= entry.rgt {
                            return violation(format!("issue {node} has bounds {}..{}", entry.lft, entry.rgt));
                        }
                        let enclosing = stack.last().copied();
                        if entry.parent != enclosing {
                            return violation(format!(
                                "issue {node} links to parent {:?} but is nested in {:?}",
                                entry.parent, enclosing
                            ));
                        }
                        if enclosing.is_none() && node != root {
                            return violation(format!("tree {root} contains second root {node}"));
                        }
                        stack.push(node);
                    }
                    Side::Right => {
                        if stack.pop() != Some(node) || entry.rgt != bound {
                            return violation(format!("bounds of issue {node} overlap a sibling"));
                        }
                    }
                }
            }
            if !stack.is_empty() {
                return violation(format!("tree {root} has unclosed bounds"));
            }
        }

        if point_count != self.entries.len() * 2 {
            return violation(format!(
                "{} issues but {} indexed bounds",
                self.entries.len(),
                point_count
            ));
        }
        Ok(())
    }
}
