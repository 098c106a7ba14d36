//! Label registry for the verifying emitter.
//!
//! A label is a branch target with a lazily-fixed simulated-stack shape:
//! the first branch or mark that references the label records the shape it
//! observed, and every later reference must observe a structurally equal
//! one. Forward references accumulate patch sites until the label is
//! marked.

use super::StackTag;

/// Handle to a registered label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(pub(crate) u32);

/// Registry state for one label.
#[derive(Debug)]
pub(crate) struct LabelInfo {
    /// Diagnostic name, e.g. `escape#3`.
    pub name: String,
    /// The stack shape fixed at first reference.
    pub shape: Option<Vec<StackTag>>,
    /// Code offset once marked.
    pub target: Option<usize>,
    /// Forward-jump operand offsets awaiting the mark.
    pub patches: Vec<usize>,
}

/// All labels of one unit under emission.
#[derive(Debug, Default)]
pub(crate) struct LabelTable {
    labels: Vec<LabelInfo>,
}

impl LabelTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, prefix: &str) -> Label {
        let id = self.labels.len() as u32;
        self.labels.push(LabelInfo {
            name: format!("{}#{}", prefix, id),
            shape: None,
            target: None,
            patches: Vec::new(),
        });
        Label(id)
    }

    pub fn get(&self, label: Label) -> &LabelInfo {
        &self.labels[label.0 as usize]
    }

    pub fn get_mut(&mut self, label: Label) -> &mut LabelInfo {
        &mut self.labels[label.0 as usize]
    }

    /// First label that was referenced but never marked, if any.
    pub fn first_unmarked(&self) -> Option<&LabelInfo> {
        self.labels
            .iter()
            .find(|info| info.target.is_none() && (info.shape.is_some() || !info.patches.is_empty()))
    }
}
