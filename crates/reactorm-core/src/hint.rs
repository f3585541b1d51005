//! Load hints and reactive hints.
//!
//! A [`Hint`] describes a traversal through an entity's fields: a single
//! name, a list of names, or a mapping from name to a nested hint. Each step
//! may be marked [`StepMode::ReadOnly`], meaning the data is loaded and read
//! by a reactive computation but changes reachable through that step never
//! trigger a recalculation.
//!
//! For loading, hints normalize into a [`HintTree`]. Trees of several
//! reactive values merge by set union at every node so one combined load can
//! serve all of them.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepMode {
    /// Changes through this step trigger recalculation.
    Reactive,
    /// Load and read, but never recalculate because of this step.
    ReadOnly,
}

/// One named step of a hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Step {
    pub name: &'static str,
    pub mode: StepMode,
}

impl Step {
    pub const fn reactive(name: &'static str) -> Self {
        Self {
            name,
            mode: StepMode::Reactive,
        }
    }

    pub const fn read_only(name: &'static str) -> Self {
        Self {
            name,
            mode: StepMode::ReadOnly,
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.mode == StepMode::ReadOnly
    }
}

impl From<&'static str> for Step {
    fn from(name: &'static str) -> Self {
        Step::reactive(name)
    }
}

/// A traversal description through entity fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hint {
    /// A single field name.
    Leaf(Step),
    /// Several sibling field names.
    List(Vec<Step>),
    /// Field names, each with a nested hint for the entities it reaches.
    Node(Vec<(Step, Hint)>),
}

impl Hint {
    pub fn leaf(step: impl Into<Step>) -> Self {
        Hint::Leaf(step.into())
    }

    pub fn list<S: Into<Step>>(steps: impl IntoIterator<Item = S>) -> Self {
        Hint::List(steps.into_iter().map(Into::into).collect())
    }

    pub fn node<S: Into<Step>>(entries: impl IntoIterator<Item = (S, Hint)>) -> Self {
        Hint::Node(
            entries
                .into_iter()
                .map(|(step, hint)| (step.into(), hint))
                .collect(),
        )
    }

    /// The hint with nothing in it.
    pub fn empty() -> Self {
        Hint::List(Vec::new())
    }

    /// Top-level entries, each with its nested hint if any.
    pub fn entries(&self) -> Vec<(Step, Option<&Hint>)> {
        match self {
            Hint::Leaf(step) => vec![(*step, None)],
            Hint::List(steps) => steps.iter().map(|s| (*s, None)).collect(),
            Hint::Node(entries) => entries.iter().map(|(s, h)| (*s, Some(h))).collect(),
        }
    }

    /// Normalize into a load tree. Read-only steps are kept: their data is
    /// still needed to compute.
    pub fn to_tree(&self) -> HintTree {
        let mut tree = HintTree::new();
        for (step, nested) in self.entries() {
            let child = tree.children.entry(step.name).or_default();
            if let Some(nested) = nested {
                child.merge(&nested.to_tree());
            }
        }
        tree
    }
}

/// A normalized load hint: field name to nested tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HintTree {
    children: BTreeMap<&'static str, HintTree>,
}

impl HintTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Set union with `other`, at every node.
    pub fn merge(&mut self, other: &HintTree) {
        for (name, sub) in &other.children {
            self.children.entry(name).or_default().merge(sub);
        }
    }

    /// Add a path of field names, creating nodes as needed.
    pub fn insert_path(&mut self, path: &[&'static str]) {
        let mut node = self;
        for name in path {
            node = node.children.entry(name).or_default();
        }
    }

    pub fn child(&self, name: &str) -> Option<&HintTree> {
        self.children.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &HintTree)> {
        self.children.iter().map(|(k, v)| (*k, v))
    }

    /// Number of nodes below the root.
    pub fn node_count(&self) -> usize {
        self.children
            .values()
            .map(|c| 1 + c.node_count())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_by_shape() {
        assert_eq!(Hint::leaf("books").entries().len(), 1);
        assert_eq!(Hint::list(["firstName", "lastName"]).entries().len(), 2);
        let node = Hint::node([("books", Hint::leaf("reviews"))]);
        let entries = node.entries();
        assert_eq!(entries[0].0, Step::reactive("books"));
        assert!(entries[0].1.is_some());
    }

    #[test]
    fn test_read_only_flag() {
        let hint = Hint::list([Step::reactive("title"), Step::read_only("author")]);
        let modes: Vec<bool> = hint.entries().iter().map(|(s, _)| s.is_read_only()).collect();
        assert_eq!(modes, vec![false, true]);
        // Read-only steps still appear in the load tree.
        assert!(hint.to_tree().child("author").is_some());
    }

    #[test]
    fn test_merge_is_union_per_node() {
        let a = Hint::node([("books", Hint::leaf("reviews"))]).to_tree();
        let b = Hint::node([
            ("books", Hint::list(["title", "reviews"])),
            ("publisher", Hint::empty()),
        ])
        .to_tree();

        let mut merged = a.clone();
        merged.merge(&b);

        let books = merged.child("books").expect("books");
        assert!(books.child("reviews").is_some());
        assert!(books.child("title").is_some());
        assert!(merged.child("publisher").is_some());
        // books, reviews, title, publisher
        assert_eq!(merged.node_count(), 4);

        let mut twice = merged.clone();
        twice.merge(&a);
        assert_eq!(twice, merged);
    }

    #[test]
    fn test_insert_path() {
        let mut tree = HintTree::new();
        tree.insert_path(&["books", "reviews", "rating"]);
        tree.insert_path(&["books", "title"]);
        let books = tree.child("books").unwrap();
        assert_eq!(books.iter().count(), 2);
        assert!(books.child("reviews").unwrap().child("rating").is_some());
    }
}
