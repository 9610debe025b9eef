use crate::split::SplitRule;

/// Position of a node in its tree's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct NodeId(usize);

impl NodeId {
    /// The root of every tree.
    pub const ROOT: Self = Self(0);

    /// Id of the node about to be pushed onto `arena`.
    pub(crate) fn next<T>(arena: &[T]) -> Self {
        Self(arena.len())
    }

    /// Position in the arena.
    #[must_use]
    pub fn get(self) -> usize {
        self.0
    }
}

/// A node in a tree arena.
///
/// Children are referenced by [`NodeId`] into the owning tree's node
/// vector; the root is always [`NodeId::ROOT`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Node<O> {
    /// An interior split node.
    Split {
        /// Rule deciding which child a row follows.
        rule: SplitRule,
        /// Index of the left child node.
        left: NodeId,
        /// Index of the right child node.
        right: NodeId,
        /// Probability that a row missing the split covariate goes left.
        probability_na_left: f64,
        /// Score of the chosen split.
        score: f64,
        /// Number of training rows that reached this node.
        n_rows: usize,
    },
    /// A terminal node.
    Terminal {
        /// Combined output of the rows that reached this node.
        value: O,
        /// Number of training rows summarised.
        n_rows: usize,
    },
}

impl<O> Node<O> {
    /// Return the number of training rows that reached this node.
    #[must_use]
    pub fn n_rows(&self) -> usize {
        match self {
            Node::Split { n_rows, .. } | Node::Terminal { n_rows, .. } => *n_rows,
        }
    }

    /// Return `true` if this node is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Node::Terminal { .. })
    }

    /// Left and right children of a split node.
    #[must_use]
    pub fn children(&self) -> Option<(NodeId, NodeId)> {
        match self {
            Node::Split { left, right, .. } => Some((*left, *right)),
            Node::Terminal { .. } => None,
        }
    }
}
