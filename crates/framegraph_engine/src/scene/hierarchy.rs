//! Parent/child transform composition
//!
//! Nodes live in a generational arena. Parenting edits are checked for
//! cycles when they happen, so [`TransformHierarchy::compute_world`] can walk
//! the forest top-down without recursion or revisits.

use slotmap::{new_key_type, SlotMap};
use thiserror::Error;

use crate::foundation::math::{Mat4, Transform, Vec3};

new_key_type! {
    /// Handle to a hierarchy node
    pub struct NodeId;
}

/// Hierarchy edit errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HierarchyError {
    /// The id was removed or never existed
    #[error("Unknown node {0:?}")]
    UnknownNode(NodeId),

    /// The edit would make a node its own ancestor
    #[error("Parenting {child:?} under {parent:?} creates a cycle")]
    Cycle {
        /// Node being re-parented
        child: NodeId,
        /// Requested parent
        parent: NodeId,
    },
}

#[derive(Debug, Clone)]
struct Node {
    local: Transform,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// World-space result for one node
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldTransform {
    /// Object-to-world matrix
    pub matrix: Mat4,
    /// Product of local scales along the parent chain
    pub scale: Vec3,
}

/// Forest of transform nodes
#[derive(Debug, Default)]
pub struct TransformHierarchy {
    nodes: SlotMap<NodeId, Node>,
}

impl TransformHierarchy {
    /// Empty hierarchy
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a root node
    pub fn add_node(&mut self, local: Transform) -> NodeId {
        self.nodes.insert(Node {
            local,
            parent: None,
            children: Vec::new(),
        })
    }

    /// Replace a node's local transform
    pub fn set_local(&mut self, id: NodeId, local: Transform) -> Result<(), HierarchyError> {
        let node = self.nodes.get_mut(id).ok_or(HierarchyError::UnknownNode(id))?;
        node.local = local;
        Ok(())
    }

    /// Local transform of a node
    pub fn local(&self, id: NodeId) -> Option<&Transform> {
        self.nodes.get(id).map(|n| &n.local)
    }

    /// Parent of a node
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(id).and_then(|n| n.parent)
    }

    /// Attach `child` under `parent`, or make it a root with `None`
    pub fn set_parent(&mut self, child: NodeId, parent: Option<NodeId>) -> Result<(), HierarchyError> {
        if !self.nodes.contains_key(child) {
            return Err(HierarchyError::UnknownNode(child));
        }
        if let Some(parent) = parent {
            if !self.nodes.contains_key(parent) {
                return Err(HierarchyError::UnknownNode(parent));
            }
            // Walk up from the new parent; meeting the child means a loop
            let mut cursor = Some(parent);
            while let Some(id) = cursor {
                if id == child {
                    return Err(HierarchyError::Cycle { child, parent });
                }
                cursor = self.nodes[id].parent;
            }
        }

        if let Some(old) = self.nodes[child].parent {
            self.nodes[old].children.retain(|&c| c != child);
        }
        self.nodes[child].parent = parent;
        if let Some(parent) = parent {
            self.nodes[parent].children.push(child);
        }
        Ok(())
    }

    /// Remove a node; its children become roots
    pub fn remove_node(&mut self, id: NodeId) -> Result<(), HierarchyError> {
        let node = self.nodes.remove(id).ok_or(HierarchyError::UnknownNode(id))?;
        if let Some(parent) = node.parent {
            if let Some(p) = self.nodes.get_mut(parent) {
                p.children.retain(|&c| c != id);
            }
        }
        for child in node.children {
            if let Some(c) = self.nodes.get_mut(child) {
                c.parent = None;
            }
        }
        Ok(())
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when there are no nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// World transforms for every node, parents before children
    pub fn compute_world(&self) -> Vec<(NodeId, WorldTransform)> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<(NodeId, Mat4, Vec3)> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.parent.is_none())
            .map(|(id, _)| (id, Mat4::identity(), Vec3::repeat(1.0)))
            .collect();

        while let Some((id, parent_matrix, parent_scale)) = stack.pop() {
            let node = &self.nodes[id];
            let world = WorldTransform {
                matrix: parent_matrix * node.local.to_matrix(),
                scale: parent_scale.component_mul(&node.local.scale),
            };
            out.push((id, world));
            for &child in &node.children {
                stack.push((child, world.matrix, world.scale));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Point3;
    use approx::assert_relative_eq;

    #[test]
    fn test_child_inherits_parent_transform() {
        let mut h = TransformHierarchy::new();
        let root = h.add_node(Transform::from_position(Vec3::new(10.0, 0.0, 0.0)).with_scale(Vec3::repeat(2.0)));
        let child = h.add_node(Transform::from_position(Vec3::new(1.0, 0.0, 0.0)));
        h.set_parent(child, Some(root)).unwrap();

        let world: std::collections::HashMap<_, _> = h.compute_world().into_iter().collect();
        let p = world[&child].matrix.transform_point(&Point3::origin());
        assert_relative_eq!(p, Point3::new(12.0, 0.0, 0.0), epsilon = 1e-5);
        assert_relative_eq!(world[&child].scale, Vec3::repeat(2.0));
    }

    #[test]
    fn test_parents_emitted_before_children() {
        let mut h = TransformHierarchy::new();
        let a = h.add_node(Transform::default());
        let b = h.add_node(Transform::default());
        let c = h.add_node(Transform::default());
        h.set_parent(c, Some(b)).unwrap();
        h.set_parent(b, Some(a)).unwrap();

        let order: Vec<NodeId> = h.compute_world().into_iter().map(|(id, _)| id).collect();
        let pos = |id| order.iter().position(|&x| x == id).unwrap();
        assert!(pos(a) < pos(b));
        assert!(pos(b) < pos(c));
    }

    #[test]
    fn test_cycle_rejected() {
        let mut h = TransformHierarchy::new();
        let a = h.add_node(Transform::default());
        let b = h.add_node(Transform::default());
        h.set_parent(b, Some(a)).unwrap();

        assert_eq!(h.set_parent(a, Some(b)), Err(HierarchyError::Cycle { child: a, parent: b }));
        assert_eq!(h.set_parent(a, Some(a)), Err(HierarchyError::Cycle { child: a, parent: a }));
        assert_eq!(h.parent(a), None);
        assert_eq!(h.compute_world().len(), 2);
    }

    #[test]
    fn test_reparent_and_remove() {
        let mut h = TransformHierarchy::new();
        let a = h.add_node(Transform::default());
        let b = h.add_node(Transform::default());
        let c = h.add_node(Transform::default());
        h.set_parent(c, Some(a)).unwrap();
        h.set_parent(c, Some(b)).unwrap();
        assert_eq!(h.parent(c), Some(b));

        h.remove_node(b).unwrap();
        assert_eq!(h.parent(c), None);
        assert_eq!(h.remove_node(b), Err(HierarchyError::UnknownNode(b)));
        assert_eq!(h.len(), 2);
    }
}
