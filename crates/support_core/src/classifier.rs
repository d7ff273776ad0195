use crate::boosted::{argmax, TreeEnsemble};
use crate::error::{require_file, Result, SupportError};
use crate::settings::{ClassifierFiles, Settings};
use crate::vectorizer::{SparseVector, TfidfVectorizer};
use serde::Deserialize;
use std::path::Path;

pub trait TextClassifier {
    fn predict(&self, text: &str) -> Result<String>;
}

/// Keeps ASCII letters and whitespace, lowercased and trimmed.
pub fn clean_text(text: &str) -> String {
    let kept: String = text
        .chars()
        .filter(|c| c.is_ascii_alphabetic() || c.is_whitespace())
        .collect();
    kept.to_lowercase().trim().to_string()
}

/// One-vs-rest linear model (logistic regression weights).
#[derive(Debug, Clone, Deserialize)]
pub struct LinearModel {
    coef: Vec<Vec<f32>>,
    intercept: Vec<f32>,
}

impl LinearModel {
    fn check(&self) -> Result<()> {
        if self.coef.is_empty() || self.coef.len() != self.intercept.len() {
            return Err(SupportError::invalid(format!(
                "linear model has {} coefficient rows and {} intercepts",
                self.coef.len(),
                self.intercept.len()
            )));
        }
        Ok(())
    }

    pub fn decision_function(&self, row: &SparseVector) -> Vec<f32> {
        self.coef
            .iter()
            .zip(&self.intercept)
            .map(|(weights, b)| {
                row.iter()
                    .filter_map(|(col, x)| weights.get(*col).map(|w| w * x))
                    .sum::<f32>()
                    + b
            })
            .collect()
    }

    /// Binary models carry a single row; class 1 wins on a positive score.
    pub fn predict(&self, row: &SparseVector) -> usize {
        let scores = self.decision_function(row);
        if scores.len() == 1 {
            usize::from(scores[0] > 0.0)
        } else {
            argmax(&scores)
        }
    }

    pub fn num_classes(&self) -> usize {
        self.coef.len().max(2)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClassifierModel {
    Linear(LinearModel),
    /// XGBoost JSON dump nested under `model`.
    GradientBoosted { model: serde_json::Value },
}

/// Prepared form of [`ClassifierModel`].
#[derive(Debug, Clone)]
enum Predictor {
    Linear(LinearModel),
    Trees(TreeEnsemble),
}

impl Predictor {
    fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        match serde_json::from_str::<ClassifierModel>(&raw)? {
            ClassifierModel::Linear(m) => {
                m.check()?;
                Ok(Self::Linear(m))
            }
            ClassifierModel::GradientBoosted { model } => {
                Ok(Self::Trees(TreeEnsemble::from_value(model)?))
            }
        }
    }

    fn predict(&self, row: &SparseVector) -> usize {
        match self {
            Self::Linear(m) => m.predict(row),
            Self::Trees(t) => t.predict(row),
        }
    }

    fn num_classes(&self) -> usize {
        match self {
            Self::Linear(m) => m.num_classes(),
            Self::Trees(t) => t.num_classes(),
        }
    }
}

/// Class index to label string, fixed at training time.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct LabelDecoder {
    classes: Vec<String>,
}

impl LabelDecoder {
    pub fn new(classes: Vec<String>) -> Self {
        Self { classes }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let decoder: Self = serde_json::from_str(&raw)?;
        if decoder.classes.is_empty() {
            return Err(SupportError::invalid(format!(
                "{} lists no classes",
                path.display()
            )));
        }
        Ok(decoder)
    }

    pub fn decode(&self, idx: usize) -> Result<&str> {
        self.classes.get(idx).map(String::as_str).ok_or_else(|| {
            SupportError::invalid(format!(
                "class index {idx} outside {} known labels",
                self.classes.len()
            ))
        })
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }
}

/// Vectorizer + model + label decoder loaded from disk. Used for both the
/// sentiment and the intent engine.
#[derive(Debug, Clone)]
pub struct ArtifactClassifier {
    name: &'static str,
    vectorizer: TfidfVectorizer,
    model: Predictor,
    labels: LabelDecoder,
}

impl ArtifactClassifier {
    pub fn load(name: &'static str, files: &ClassifierFiles) -> Result<Self> {
        let model_path = require_file("classifier model", files.model.clone())?;
        let vectorizer_path = require_file("vectorizer", files.vectorizer.clone())?;
        let labels_path = require_file("label encoder", files.labels.clone())?;

        let vectorizer = TfidfVectorizer::from_file(&vectorizer_path)?;
        let model = Predictor::from_file(&model_path)?;
        let labels = LabelDecoder::from_file(&labels_path)?;
        if model.num_classes() > labels.classes().len().max(2) {
            return Err(SupportError::invalid(format!(
                "{name} model predicts {} classes but the label encoder knows {}",
                model.num_classes(),
                labels.classes().len()
            )));
        }

        tracing::debug!(
            classifier = name,
            features = vectorizer.num_features(),
            labels = labels.classes().len(),
            "classifier loaded"
        );
        Ok(Self {
            name,
            vectorizer,
            model,
            labels,
        })
    }

    pub fn sentiment(settings: &Settings) -> Result<Self> {
        Self::load("sentiment", &settings.sentiment_files())
    }

    pub fn intent(settings: &Settings) -> Result<Self> {
        Self::load("intent", &settings.intent_files())
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn labels(&self) -> &LabelDecoder {
        &self.labels
    }
}

impl TextClassifier for ArtifactClassifier {
    fn predict(&self, text: &str) -> Result<String> {
        let row = self.vectorizer.transform(&clean_text(text));
        let idx = self.model.predict(&row);
        Ok(self.labels.decode(idx)?.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const VECTORIZER: &str = r#"{
        "vocabulary": {"package": 0, "refund": 1, "love": 2, "broken": 3},
        "idf": [1.0, 1.0, 1.0, 1.0]
    }"#;

    const INTENT_MODEL: &str = r#"{
        "kind": "linear",
        "coef": [[2.0, 0.0, 0.0, 0.0], [0.0, 2.0, 0.0, 1.0], [0.0, 0.0, 0.5, 0.0]],
        "intercept": [0.0, 0.0, 0.1]
    }"#;

    const SENTIMENT_MODEL: &str = r#"{
        "kind": "gradient_boosted",
        "model": {"learner": {
            "learner_model_param": {"base_score": "5E-1", "num_class": "3"},
            "objective": {"name": "multi:softprob"},
            "gradient_booster": {"model": {"tree_info": [0, 2], "trees": [
                {"left_children": [1, -1, -1], "right_children": [2, -1, -1],
                 "split_indices": [3, 0, 0], "split_conditions": [0.1, 0.0, 1.0],
                 "default_left": [1, 0, 0]},
                {"left_children": [1, -1, -1], "right_children": [2, -1, -1],
                 "split_indices": [2, 0, 0], "split_conditions": [0.1, 0.0, 1.0],
                 "default_left": [1, 0, 0]}
            ]}}
        }}
    }"#;

    fn write_artifacts(model: &str, labels: &str) -> (TempDir, ClassifierFiles) {
        let dir = tempfile::tempdir().expect("tempdir");
        let files = ClassifierFiles {
            model: dir.path().join("model.json"),
            vectorizer: dir.path().join("vectorizer.json"),
            labels: dir.path().join("labels.json"),
        };
        fs::write(&files.model, model).unwrap();
        fs::write(&files.vectorizer, VECTORIZER).unwrap();
        fs::write(&files.labels, labels).unwrap();
        (dir, files)
    }

    #[test]
    fn clean_text_strips_non_letters() {
        assert_eq!(clean_text("  Where's my PACKAGE #123?! "), "wheres my package");
        assert_eq!(clean_text("café"), "caf");
        assert_eq!(clean_text("42"), "");
    }

    #[test]
    fn intent_linear_model_predicts_known_labels() {
        let (_dir, files) =
            write_artifacts(INTENT_MODEL, r#"["shipping", "refund", "general"]"#);
        let clf = ArtifactClassifier::load("intent", &files).expect("load");

        assert_eq!(clf.predict("Where is my package?").unwrap(), "shipping");
        assert_eq!(clf.predict("I want a REFUND, it's broken").unwrap(), "refund");
        assert_eq!(clf.predict("hello there").unwrap(), "general");
    }

    #[test]
    fn sentiment_tree_model_predicts_known_labels() {
        let (_dir, files) =
            write_artifacts(SENTIMENT_MODEL, r#"["negative", "neutral", "positive"]"#);
        let clf = ArtifactClassifier::load("sentiment", &files).expect("load");
        let labels = clf.labels().classes().to_vec();

        assert_eq!(clf.predict("It arrived broken").unwrap(), "negative");
        assert_eq!(clf.predict("I love it").unwrap(), "positive");
        for text in ["", "???", "package refund", "love broken"] {
            let label = clf.predict(text).unwrap();
            assert!(labels.contains(&label), "{label} not a trained label");
        }
    }

    #[test]
    fn binary_linear_model_uses_sign() {
        let model = LinearModel {
            coef: vec![vec![1.0, -1.0]],
            intercept: vec![0.0],
        };
        assert_eq!(model.predict(&vec![(0, 0.8)]), 1);
        assert_eq!(model.predict(&vec![(1, 0.8)]), 0);
    }

    #[test]
    fn missing_artifact_is_fatal() {
        let (_dir, mut files) = write_artifacts(INTENT_MODEL, r#"["a", "b", "c"]"#);
        files.vectorizer = files.vectorizer.with_file_name("absent.json");
        match ArtifactClassifier::load("intent", &files) {
            Err(SupportError::ArtifactMissing { what, .. }) => assert_eq!(what, "vectorizer"),
            other => panic!("unexpected: {:?}", other.map(|c| c.name().to_string())),
        }
    }

    #[test]
    fn label_encoder_smaller_than_model_is_rejected() {
        let (_dir, files) = write_artifacts(INTENT_MODEL, r#"["a", "b"]"#);
        assert!(ArtifactClassifier::load("intent", &files).is_err());
    }

    #[test]
    fn decode_out_of_range_errors() {
        let d = LabelDecoder::new(vec!["a".into()]);
        assert_eq!(d.decode(0).unwrap(), "a");
        assert!(d.decode(1).is_err());
    }
}
