use serde::{Deserialize, Serialize};

/// A directory node with depth-limited, lazily loaded children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeNode {
    pub path: String,
    pub name: String,
    #[serde(default)]
    pub has_children: bool,
    pub children: Option<Vec<TreeNode>>,
    /// Client-side expansion state; never sent by the server.
    #[serde(default)]
    pub expanded: bool,
}
