//! Inference over an XGBoost JSON model dump (`Booster.save_model("*.json")`).

use crate::error::{Result, SupportError};
use crate::vectorizer::SparseVector;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct ModelDump {
    learner: Learner,
}

#[derive(Debug, Deserialize)]
struct Learner {
    learner_model_param: LearnerParams,
    gradient_booster: GradientBooster,
    #[serde(default)]
    objective: Option<Objective>,
}

#[derive(Debug, Deserialize)]
struct LearnerParams {
    #[serde(default)]
    base_score: Option<String>,
    #[serde(default)]
    num_class: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GradientBooster {
    model: GbTree,
}

#[derive(Debug, Deserialize)]
struct GbTree {
    trees: Vec<Tree>,
    tree_info: Vec<usize>,
}

#[derive(Debug, Deserialize)]
struct Objective {
    name: String,
}

/// `default_left` is written as 0/1 by some versions and as booleans by others.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Flags {
    Ints(Vec<u8>),
    Bools(Vec<bool>),
}

impl Flags {
    fn into_bools(self) -> Vec<bool> {
        match self {
            Flags::Ints(v) => v.into_iter().map(|x| x != 0).collect(),
            Flags::Bools(v) => v,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Tree {
    left_children: Vec<i32>,
    right_children: Vec<i32>,
    split_indices: Vec<usize>,
    split_conditions: Vec<f32>,
    default_left: Flags,
}

#[derive(Debug, Clone)]
struct Node {
    left: i32,
    right: i32,
    feature: usize,
    /// Split threshold, or the leaf value when `left == -1`.
    value: f32,
    default_left: bool,
}

#[derive(Debug, Clone)]
struct CompiledTree {
    nodes: Vec<Node>,
}

impl CompiledTree {
    fn compile(tree: Tree) -> Result<Self> {
        let n = tree.left_children.len();
        let default_left = tree.default_left.into_bools();
        if [
            tree.right_children.len(),
            tree.split_indices.len(),
            tree.split_conditions.len(),
            default_left.len(),
        ]
        .iter()
        .any(|&len| len != n)
            || n == 0
        {
            return Err(SupportError::invalid("tree arrays have inconsistent lengths"));
        }

        let nodes: Vec<Node> = (0..n)
            .map(|i| Node {
                left: tree.left_children[i],
                right: tree.right_children[i],
                feature: tree.split_indices[i],
                value: tree.split_conditions[i],
                default_left: default_left[i],
            })
            .collect();

        for node in &nodes {
            let in_range = |c: i32| c == -1 || (c >= 0 && (c as usize) < n);
            if !in_range(node.left) || !in_range(node.right) {
                return Err(SupportError::invalid("tree child index out of range"));
            }
        }
        Ok(Self { nodes })
    }

    /// Features missing from `row` follow the node's default branch.
    fn leaf_value(&self, row: &SparseVector) -> f32 {
        let mut idx = 0usize;
        // a well-formed tree reaches a leaf within `nodes.len()` steps
        for _ in 0..self.nodes.len() {
            let node = &self.nodes[idx];
            if node.left == -1 {
                return node.value;
            }
            let go_left = match row.binary_search_by_key(&node.feature, |(col, _)| *col) {
                Ok(pos) => row[pos].1 < node.value,
                Err(_) => node.default_left,
            };
            let next = if go_left { node.left } else { node.right };
            idx = next as usize;
        }
        0.0
    }
}

/// Gradient boosted tree ensemble.
#[derive(Debug, Clone)]
pub struct TreeEnsemble {
    trees: Vec<(usize, CompiledTree)>,
    num_class: usize,
    base_margin: f32,
}

impl TreeEnsemble {
    pub fn from_json(raw: &str) -> Result<Self> {
        let dump: ModelDump = serde_json::from_str(raw)?;
        Self::from_dump(dump)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        Self::from_dump(serde_json::from_value(value)?)
    }

    fn from_dump(dump: ModelDump) -> Result<Self> {
        let learner = dump.learner;
        let num_class = parse_param(learner.learner_model_param.num_class.as_deref())?
            .map(|v| v as usize)
            .unwrap_or(0);
        let base_score = parse_param(learner.learner_model_param.base_score.as_deref())?
            .unwrap_or(0.5);
        let logistic = learner
            .objective
            .as_ref()
            .is_some_and(|o| o.name.starts_with("binary:logistic"));
        let base_margin = if logistic && base_score > 0.0 && base_score < 1.0 {
            (base_score / (1.0 - base_score)).ln()
        } else {
            base_score
        };

        let model = learner.gradient_booster.model;
        if model.trees.len() != model.tree_info.len() {
            return Err(SupportError::invalid("tree_info does not match tree count"));
        }
        let groups = num_class.max(1);
        let trees = model
            .tree_info
            .into_iter()
            .zip(model.trees)
            .map(|(group, tree)| {
                if group >= groups {
                    return Err(SupportError::invalid(format!(
                        "tree assigned to class {group} of {groups}"
                    )));
                }
                Ok((group, CompiledTree::compile(tree)?))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            trees,
            num_class,
            base_margin,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.num_class.max(2)
    }

    /// Raw margin per output group.
    pub fn margins(&self, row: &SparseVector) -> Vec<f32> {
        let mut margins = vec![self.base_margin; self.num_class.max(1)];
        for (group, tree) in &self.trees {
            margins[*group] += tree.leaf_value(row);
        }
        margins
    }

    pub fn predict(&self, row: &SparseVector) -> usize {
        let margins = self.margins(row);
        if self.num_class <= 1 {
            return usize::from(margins[0] > 0.0);
        }
        argmax(&margins)
    }
}

/// Scalars in the dump are strings, sometimes wrapped as `"[5E-1]"`.
fn parse_param(raw: Option<&str>) -> Result<Option<f32>> {
    raw.map(|s| {
        let s = s.trim().trim_start_matches('[').trim_end_matches(']');
        s.parse::<f32>()
            .map_err(|_| SupportError::invalid(format!("bad model parameter {s:?}")))
    })
    .transpose()
}

pub(crate) fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &v)| {
            if v > best.1 {
                (i, v)
            } else {
                best
            }
        })
        .0
}

#[cfg(test)]
mod tests {
    use super::*;

    // class 0 tree: feature 0 < 0.5 (missing -> left) ? +1.0 : -1.0
    // class 1 tree: feature 1 < 0.2 (missing -> left) ? -0.5 : 2.0
    // class 2 tree: single leaf 0.25
    const THREE_CLASS: &str = r#"{
      "learner": {
        "learner_model_param": {"base_score": "5E-1", "num_class": "3", "num_feature": "4"},
        "objective": {"name": "multi:softprob"},
        "gradient_booster": {"name": "gbtree", "model": {
          "tree_info": [0, 1, 2],
          "trees": [
            {"left_children": [1, -1, -1], "right_children": [2, -1, -1],
             "split_indices": [0, 0, 0], "split_conditions": [0.5, 1.0, -1.0],
             "default_left": [1, 0, 0]},
            {"left_children": [1, -1, -1], "right_children": [2, -1, -1],
             "split_indices": [1, 0, 0], "split_conditions": [0.2, -0.5, 2.0],
             "default_left": [true, false, false]},
            {"left_children": [-1], "right_children": [-1],
             "split_indices": [0], "split_conditions": [0.25],
             "default_left": [0]}
          ]
        }}
      }
    }"#;

    #[test]
    fn missing_features_take_default_branch() {
        let m = TreeEnsemble::from_json(THREE_CLASS).unwrap();
        // nothing present: class 0 gets +1.0, class 1 -0.5, class 2 0.25
        assert_eq!(m.predict(&vec![]), 0);
    }

    #[test]
    fn present_features_compare_against_threshold() {
        let m = TreeEnsemble::from_json(THREE_CLASS).unwrap();
        let row = vec![(0, 0.9), (1, 0.7)];
        let margins = m.margins(&row);
        assert!((margins[0] - (0.5 - 1.0)).abs() < 1e-6);
        assert!((margins[1] - (0.5 + 2.0)).abs() < 1e-6);
        assert_eq!(m.predict(&row), 1);
        assert_eq!(m.num_classes(), 3);
    }

    #[test]
    fn binary_logistic_uses_zero_margin_cut() {
        let raw = r#"{"learner": {
            "learner_model_param": {"base_score": "[5E-1]", "num_class": "0"},
            "objective": {"name": "binary:logistic"},
            "gradient_booster": {"model": {"tree_info": [0], "trees": [
              {"left_children": [1, -1, -1], "right_children": [2, -1, -1],
               "split_indices": [3, 0, 0], "split_conditions": [0.1, -0.4, 0.6],
               "default_left": [1, 0, 0]}
            ]}}
        }}"#;
        let m = TreeEnsemble::from_json(raw).unwrap();
        assert_eq!(m.predict(&vec![]), 0);
        assert_eq!(m.predict(&vec![(3, 0.3)]), 1);
    }

    #[test]
    fn tree_info_must_name_known_classes() {
        let bad = THREE_CLASS.replace("[0, 1, 2]", "[0, 1, 5]");
        assert!(TreeEnsemble::from_json(&bad).is_err());
    }

    #[test]
    fn argmax_prefers_first_of_ties() {
        assert_eq!(argmax(&[0.1, 0.3, 0.3]), 1);
        assert_eq!(argmax(&[]), 0);
    }
}
