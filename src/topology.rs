use std::fmt::Display;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    utils::{enums::ParticleKind, list_to_name},
    KinfitError, KinfitResult,
};

/// A declarative description of (part of) a decay tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Decay {
    /// A final-state particle which will be bound to a candidate.
    Leaf { name: String, kind: ParticleKind },
    /// An intermediate state decaying into at least two daughters. If `mass` is given, the
    /// invariant mass of the daughters is constrained to it.
    Node {
        name: String,
        mass: Option<f64>,
        daughters: Vec<Decay>,
    },
}

impl Decay {
    pub fn leaf(name: &str, kind: ParticleKind) -> Self {
        Self::Leaf {
            name: name.to_string(),
            kind,
        }
    }
    /// An intermediate state with a mass constraint.
    pub fn resonance(name: &str, mass: f64, daughters: Vec<Decay>) -> Self {
        Self::Node {
            name: name.to_string(),
            mass: Some(mass),
            daughters,
        }
    }
    /// An intermediate state without a mass constraint.
    pub fn unconstrained(name: &str, daughters: Vec<Decay>) -> Self {
        Self::Node {
            name: name.to_string(),
            mass: None,
            daughters,
        }
    }
    pub fn name(&self) -> &str {
        match self {
            Decay::Leaf { name, .. } | Decay::Node { name, .. } => name,
        }
    }
    /// Whether both decays have the same structure, ignoring names.
    pub fn same_shape(&self, other: &Decay) -> bool {
        match (self, other) {
            (Decay::Leaf { kind: a, .. }, Decay::Leaf { kind: b, .. }) => a == b,
            (
                Decay::Node {
                    mass: ma,
                    daughters: da,
                    ..
                },
                Decay::Node {
                    mass: mb,
                    daughters: db,
                    ..
                },
            ) => ma == mb && da.len() == db.len() && da.iter().zip(db).all(|(a, b)| a.same_shape(b)),
            _ => false,
        }
    }
}

/// The full description of a topology: the particles produced by the initial state and the
/// groups of interchangeable leaves.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TopologyDefinition {
    /// Name of the topology, also used as the name of its root node.
    pub name: String,
    /// The direct products of the initial state.
    pub final_state: Vec<Decay>,
    /// Names of leaves whose candidates may be exchanged without changing the hypothesis.
    pub symmetry_groups: Vec<Vec<String>>,
    /// Names of intermediate nodes with identical decays whose whole sub-trees may be exchanged.
    #[serde(default)]
    pub subtree_symmetries: Vec<Vec<String>>,
}

impl TopologyDefinition {
    pub fn new(name: &str, final_state: Vec<Decay>) -> Self {
        Self {
            name: name.to_string(),
            final_state,
            symmetry_groups: Vec::new(),
            subtree_symmetries: Vec::new(),
        }
    }
    pub fn with_symmetry_group<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.symmetry_groups
            .push(names.into_iter().map(|s| s.as_ref().to_string()).collect());
        self
    }
    /// Add a symmetry group for every set of two or more leaves of the same particle kind which
    /// share a parent.
    pub fn with_sibling_symmetries(mut self) -> Self {
        fn siblings(daughters: &[Decay], groups: &mut Vec<Vec<String>>) {
            let mut by_kind: IndexMap<ParticleKind, Vec<String>> = IndexMap::new();
            for daughter in daughters {
                match daughter {
                    Decay::Leaf { name, kind } => {
                        by_kind.entry(*kind).or_default().push(name.clone());
                    }
                    Decay::Node { daughters, .. } => siblings(daughters, groups),
                }
            }
            groups.extend(by_kind.into_values().filter(|g| g.len() > 1));
        }
        let mut groups = Vec::new();
        siblings(&self.final_state, &mut groups);
        self.symmetry_groups.extend(groups);
        self
    }
    pub fn with_subtree_symmetry<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.subtree_symmetries
            .push(names.into_iter().map(|s| s.as_ref().to_string()).collect());
        self
    }
    /// Add a subtree symmetry for every set of two or more intermediate nodes which share a parent
    /// and decay the same way (equal masses, equal daughter kinds, in the same order).
    ///
    /// Combine with [`TopologyDefinition::with_sibling_symmetries`] so that the leaves inside the
    /// exchanged sub-trees are symmetric as well.
    pub fn with_subtree_symmetries(mut self) -> Self {
        fn identical<'a>(groups: &mut Vec<Vec<&'a Decay>>, daughters: &'a [Decay]) {
            let mut shapes: Vec<Vec<&'a Decay>> = Vec::new();
            for daughter in daughters {
                if let Decay::Node { daughters, .. } = daughter {
                    match shapes.iter_mut().find(|s| s[0].same_shape(daughter)) {
                        Some(shape) => shape.push(daughter),
                        None => shapes.push(vec![daughter]),
                    }
                    identical(groups, daughters);
                }
            }
            groups.extend(shapes.into_iter().filter(|s| s.len() > 1));
        }
        let mut groups = Vec::new();
        identical(&mut groups, &self.final_state);
        let groups: Vec<Vec<String>> = groups
            .into_iter()
            .map(|g| g.into_iter().map(|d| d.name().to_string()).collect())
            .collect();
        self.subtree_symmetries.extend(groups);
        self
    }
    /// Validate the definition and compile it into a [`Topology`].
    ///
    /// # Errors
    ///
    /// Returns [`KinfitError::InvalidTopology`] if the root has no products, an intermediate
    /// node has fewer than two daughters, names are empty or repeated, a mass is negative or not
    /// finite, or a symmetry group names unknown or non-leaf nodes, overlaps another group or mixes
    /// particle kinds. Subtree symmetries must name at least two non-overlapping intermediate
    /// nodes with identical decays, and every symmetry group touching one of the exchanged
    /// sub-trees must have a counterpart in each of the others.
    pub fn build(&self) -> KinfitResult<Topology> {
        Topology::new(self)
    }
}

/// Index of a node in a [`Topology`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    /// A final-state particle; `leaf` is its position among the leaves.
    Leaf { particle: ParticleKind, leaf: usize },
    /// An intermediate state or the root.
    Internal {
        mass: Option<f64>,
        children: Vec<NodeId>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
}

impl Node {
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf { .. })
    }
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
    /// The constrained mass of an intermediate node.
    pub fn mass(&self) -> Option<f64> {
        match self.kind {
            NodeKind::Internal { mass, .. } => mass,
            NodeKind::Leaf { .. } => None,
        }
    }
}

/// A validated, immutable decay tree.
///
/// Nodes are stored in post-order (every child before its parent, the root last), so a single
/// forward pass over [`Topology::nodes`] visits the tree bottom-up. Leaves are numbered left to
/// right in the order they were declared.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    name: String,
    nodes: Vec<Node>,
    leaves: Vec<NodeId>,
    leaf_kinds: Vec<ParticleKind>,
    lookup: IndexMap<String, NodeId>,
    symmetry_groups: Vec<Vec<usize>>,
    #[serde(default)]
    subtree_symmetries: Vec<Vec<Vec<usize>>>,
    n_mass_constraints: usize,
}

fn invalid(reason: String) -> KinfitError {
    KinfitError::InvalidTopology { reason }
}

impl Topology {
    fn new(definition: &TopologyDefinition) -> KinfitResult<Self> {
        if definition.final_state.is_empty() {
            return Err(invalid(format!(
                "the root of \"{}\" has no products",
                definition.name
            )));
        }
        let mut topology = Self {
            name: definition.name.clone(),
            nodes: Vec::new(),
            leaves: Vec::new(),
            leaf_kinds: Vec::new(),
            lookup: IndexMap::new(),
            symmetry_groups: Vec::new(),
            subtree_symmetries: Vec::new(),
            n_mass_constraints: 0,
        };
        let children = definition
            .final_state
            .iter()
            .map(|decay| topology.compile(decay))
            .collect::<KinfitResult<Vec<_>>>()?;
        topology.push(
            &definition.name,
            NodeKind::Internal {
                mass: None,
                children,
            },
        )?;
        for group in &definition.symmetry_groups {
            topology.add_symmetry_group(group)?;
        }
        for group in &definition.subtree_symmetries {
            topology.add_subtree_symmetry(group)?;
        }
        topology.check_subtree_correspondence()?;
        tracing::info!(
            topology = %topology.name,
            leaves = topology.n_leaves(),
            equations = topology.n_equations(),
            symmetry_groups = topology.symmetry_groups.len(),
            subtree_symmetries = topology.subtree_symmetries.len(),
            "compiled decay topology"
        );
        Ok(topology)
    }

    fn push(&mut self, name: &str, kind: NodeKind) -> KinfitResult<NodeId> {
        if name.is_empty() {
            return Err(invalid("node names must not be empty".to_string()));
        }
        if self.lookup.contains_key(name) {
            return Err(invalid(format!("duplicate node name \"{}\"", name)));
        }
        let id = NodeId(self.nodes.len());
        if let NodeKind::Internal { children, .. } = &kind {
            for child in children {
                self.nodes[child.0].parent = Some(id);
            }
        }
        self.nodes.push(Node {
            name: name.to_string(),
            kind,
            parent: None,
        });
        self.lookup.insert(name.to_string(), id);
        Ok(id)
    }

    fn compile(&mut self, decay: &Decay) -> KinfitResult<NodeId> {
        match decay {
            Decay::Leaf { name, kind } => {
                let id = self.push(
                    name,
                    NodeKind::Leaf {
                        particle: *kind,
                        leaf: self.leaves.len(),
                    },
                )?;
                self.leaves.push(id);
                self.leaf_kinds.push(*kind);
                Ok(id)
            }
            Decay::Node {
                name,
                mass,
                daughters,
            } => {
                if daughters.len() < 2 {
                    return Err(invalid(format!(
                        "node \"{}\" has {} daughter(s), at least 2 are required",
                        name,
                        daughters.len()
                    )));
                }
                if let Some(m) = mass {
                    if !(m.is_finite() && *m >= 0.0) {
                        return Err(invalid(format!("node \"{}\" has invalid mass {}", name, m)));
                    }
                    self.n_mass_constraints += 1;
                }
                let children = daughters
                    .iter()
                    .map(|d| self.compile(d))
                    .collect::<KinfitResult<Vec<_>>>()?;
                self.push(
                    name,
                    NodeKind::Internal {
                        mass: *mass,
                        children,
                    },
                )
            }
        }
    }

    fn add_symmetry_group(&mut self, names: &[String]) -> KinfitResult<()> {
        let mut group = Vec::with_capacity(names.len());
        let mut kind = None;
        for name in names {
            let id = self.lookup.get(name.as_str()).copied().ok_or_else(|| {
                invalid(format!("symmetry group member \"{}\" is not in the tree", name))
            })?;
            let node = &self.nodes[id.0];
            let (particle, leaf) = match node.kind {
                NodeKind::Leaf { particle, leaf } => (particle, leaf),
                NodeKind::Internal { .. } => {
                    return Err(invalid(format!(
                        "symmetry group member \"{}\" is not a leaf",
                        name
                    )))
                }
            };
            if *kind.get_or_insert(particle) != particle {
                return Err(invalid(format!(
                    "symmetry group [{}] mixes particle kinds",
                    list_to_name(names)
                )));
            }
            if group.contains(&leaf) || self.symmetry_groups.iter().any(|g| g.contains(&leaf)) {
                return Err(invalid(format!(
                    "leaf \"{}\" appears in more than one symmetry group",
                    name
                )));
            }
            group.push(leaf);
        }
        group.sort_unstable();
        self.symmetry_groups.push(group);
        Ok(())
    }

    fn add_subtree_symmetry(&mut self, names: &[String]) -> KinfitResult<()> {
        if names.len() < 2 {
            return Err(invalid(format!(
                "subtree symmetry [{}] needs at least two nodes",
                list_to_name(names)
            )));
        }
        let mut roots: Vec<NodeId> = Vec::with_capacity(names.len());
        for name in names {
            let id = self.lookup.get(name.as_str()).copied().ok_or_else(|| {
                invalid(format!("subtree symmetry member \"{}\" is not in the tree", name))
            })?;
            let node = &self.nodes[id.0];
            if node.is_leaf() || node.is_root() {
                return Err(invalid(format!(
                    "subtree symmetry member \"{}\" is not an intermediate node",
                    name
                )));
            }
            if let Some(first) = roots.first() {
                if !self.same_shape(*first, id) {
                    return Err(invalid(format!(
                        "subtree symmetry [{}] mixes different decays",
                        list_to_name(names)
                    )));
                }
            }
            roots.push(id);
        }
        let mut blocks: Vec<Vec<usize>> = roots.iter().map(|id| self.leaves_under(*id)).collect();
        blocks.sort_unstable_by_key(|block| block[0]);
        for (i, block) in blocks.iter().enumerate() {
            let overlaps = blocks[..i]
                .iter()
                .any(|other| other.iter().any(|leaf| block.contains(leaf)));
            let repeated = self.subtree_symmetries.iter().flatten().any(|b| b == block);
            if overlaps || repeated {
                return Err(invalid(format!(
                    "subtree symmetry [{}] overlaps itself or another subtree symmetry",
                    list_to_name(names)
                )));
            }
        }
        self.subtree_symmetries.push(blocks);
        Ok(())
    }

    fn same_shape(&self, a: NodeId, b: NodeId) -> bool {
        match (&self.nodes[a.0].kind, &self.nodes[b.0].kind) {
            (NodeKind::Leaf { particle: pa, .. }, NodeKind::Leaf { particle: pb, .. }) => pa == pb,
            (
                NodeKind::Internal {
                    mass: ma,
                    children: ca,
                },
                NodeKind::Internal {
                    mass: mb,
                    children: cb,
                },
            ) => {
                ma == mb
                    && ca.len() == cb.len()
                    && ca.iter().zip(cb).all(|(x, y)| self.same_shape(*x, *y))
            }
            _ => false,
        }
    }

    /// Every ordering chain inside one exchanged sub-tree must reappear at the same leaf
    /// positions in each of its partners.
    fn check_subtree_correspondence(&self) -> KinfitResult<()> {
        for (g, group) in self.subtree_symmetries.iter().enumerate() {
            let mut reference: Option<Vec<(bool, Vec<usize>)>> = None;
            for block in group {
                let members = || {
                    list_to_name(block.iter().map(|&leaf| self.leaf_name(leaf)))
                };
                let encloses = |other: &Vec<Vec<usize>>| {
                    other
                        .iter()
                        .any(|b| b.len() > block.len() && block.iter().all(|l| b.contains(l)))
                };
                let chains = self
                    .symmetry_groups
                    .iter()
                    .map(|leaves| (false, leaves.clone()))
                    .chain(
                        self.subtree_symmetries
                            .iter()
                            .enumerate()
                            .filter(|(h, other)| *h != g && !encloses(*other))
                            .map(|(_, other)| (true, other.iter().map(|b| b[0]).collect())),
                    );
                let mut inner = Vec::new();
                for (subtree, anchors) in chains {
                    let positions: Vec<Option<usize>> = anchors
                        .iter()
                        .map(|anchor| block.iter().position(|leaf| leaf == anchor))
                        .collect();
                    if positions.iter().all(Option::is_none) {
                        continue;
                    }
                    match positions.into_iter().collect::<Option<Vec<usize>>>() {
                        Some(positions) => inner.push((subtree, positions)),
                        None => {
                            return Err(invalid(format!(
                                "a symmetry reaches into and out of the sub-tree [{}]",
                                members()
                            )))
                        }
                    }
                }
                inner.sort();
                if let Some(expected) = &reference {
                    if *expected != inner {
                        return Err(invalid(format!(
                            "the sub-tree [{}] is not symmetric in the same way as its partners",
                            members()
                        )));
                    }
                } else {
                    reference = Some(inner);
                }
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    /// All nodes in post-order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }
    /// All nodes with their ids in post-order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter().enumerate().map(|(i, node)| (NodeId(i), node))
    }
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }
    pub fn root(&self) -> NodeId {
        NodeId(self.nodes.len() - 1)
    }
    /// Look up a node by name.
    pub fn find(&self, name: &str) -> KinfitResult<NodeId> {
        self.lookup
            .get(name)
            .copied()
            .ok_or_else(|| KinfitError::NodeNotFound {
                name: name.to_string(),
            })
    }
    /// Node ids of the leaves, by leaf index.
    pub fn leaves(&self) -> &[NodeId] {
        &self.leaves
    }
    pub fn n_leaves(&self) -> usize {
        self.leaves.len()
    }
    pub fn leaf_name(&self, leaf: usize) -> &str {
        &self.nodes[self.leaves[leaf].0].name
    }
    pub fn leaf_kind(&self, leaf: usize) -> ParticleKind {
        self.leaf_kinds[leaf]
    }
    /// Particle kinds of the leaves, by leaf index.
    pub fn leaf_kinds(&self) -> &[ParticleKind] {
        &self.leaf_kinds
    }
    /// Indices of the leaves below (or at) the node `id`.
    pub fn leaves_under(&self, id: NodeId) -> Vec<usize> {
        match &self.nodes[id.0].kind {
            NodeKind::Leaf { leaf, .. } => vec![*leaf],
            NodeKind::Internal { children, .. } => children
                .iter()
                .flat_map(|child| self.leaves_under(*child))
                .collect(),
        }
    }
    /// Groups of interchangeable leaves, as sorted leaf indices.
    pub fn symmetry_groups(&self) -> &[Vec<usize>] {
        &self.symmetry_groups
    }
    /// Groups of interchangeable sub-trees. Each sub-tree is given by the leaf indices below its
    /// root, and the sub-trees of a group are sorted by their first leaf.
    pub fn subtree_symmetries(&self) -> &[Vec<Vec<usize>>] {
        &self.subtree_symmetries
    }
    /// Chains of leaves whose candidate indices must increase for an assignment to be the
    /// canonical one among its exchanges: every symmetry group, plus the first leaf of each
    /// sub-tree of every subtree symmetry.
    pub fn ordering_chains(&self) -> Vec<Vec<usize>> {
        self.symmetry_groups
            .iter()
            .cloned()
            .chain(
                self.subtree_symmetries
                    .iter()
                    .map(|group| group.iter().map(|block| block[0]).collect()),
            )
            .collect()
    }
    /// Number of intermediate nodes with a mass constraint.
    pub fn n_mass_constraints(&self) -> usize {
        self.n_mass_constraints
    }
    /// Number of scalar constraint equations: one per mass constraint and four for the
    /// conservation of four-momentum at the root.
    pub fn n_equations(&self) -> usize {
        self.n_mass_constraints + 4
    }

    fn fmt_node(&self, id: NodeId, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let node = &self.nodes[id.0];
        match &node.kind {
            NodeKind::Leaf { particle, .. } => write!(f, "{}({})", node.name, particle),
            NodeKind::Internal { mass, children } => {
                write!(f, "{}", node.name)?;
                if let Some(m) = mass {
                    write!(f, "[{}]", m)?;
                }
                write!(f, " -> (")?;
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    self.fmt_node(*child, f)?;
                }
                write!(f, ")")
            }
        }
    }
}

impl Display for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.fmt_node(self.root(), f)
    }
}
