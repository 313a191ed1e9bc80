//! External classifier collaborator.
//!
//! The pipeline treats classification as an opaque function from an image
//! to a label drawn from a closed vocabulary: the 52 card labels (rank x
//! suit) plus auxiliary categories. The production implementation shells
//! out to a configured binary; tests use a fixed stub.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

const RANKS: [&str; 13] = [
    "2", "3", "4", "5", "6", "7", "8", "9", "10", "J", "Q", "K", "A",
];
const SUITS: [&str; 4] = ["C", "D", "H", "S"];

/// Auxiliary categories alongside the 52 cards
pub const AUX_LABELS: [&str; 4] = [
    "cartes_combinees",
    "cartes_combinees_retournees",
    "cartes_retournees",
    "non_cartes",
];

/// The closed label vocabulary (56 labels)
pub fn class_labels() -> Vec<String> {
    let mut labels: Vec<String> = RANKS
        .iter()
        .flat_map(|rank| SUITS.iter().map(move |suit| format!("{}{}", rank, suit)))
        .collect();
    labels.extend(AUX_LABELS.iter().map(|l| l.to_string()));
    labels
}

pub fn is_known_label(label: &str) -> bool {
    AUX_LABELS.contains(&label)
        || (label.len() >= 2
            && SUITS.iter().any(|s| label.ends_with(s))
            && RANKS.contains(&&label[..label.len() - 1]))
}

#[derive(Error, Debug)]
pub enum ClassifyError {
    #[error("classifier binary not found at {0}")]
    BinaryNotFound(PathBuf),

    #[error("classification failed: {0}")]
    Failed(String),

    #[error("classifier returned a label outside the vocabulary: {0}")]
    UnknownLabel(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opaque image-to-label contract
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, image: &Path) -> Result<String, ClassifyError>;
}

/// Classifier backed by an external binary.
///
/// The binary receives the image path as its argument and prints
/// `{"label": "..."}` on stdout.
pub struct CommandClassifier {
    binary_path: PathBuf,
}

impl CommandClassifier {
    pub fn new(binary_path: PathBuf) -> Self {
        Self { binary_path }
    }

    pub fn is_available(&self) -> bool {
        self.binary_path.exists()
    }
}

#[async_trait]
impl Classifier for CommandClassifier {
    async fn classify(&self, image: &Path) -> Result<String, ClassifyError> {
        if !self.is_available() {
            return Err(ClassifyError::BinaryNotFound(self.binary_path.clone()));
        }

        let output = Command::new(&self.binary_path)
            .arg(image)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ClassifyError::Failed(stderr.to_string()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let result: serde_json::Value = serde_json::from_str(stdout.trim())
            .map_err(|e| ClassifyError::Failed(format!("Failed to parse output: {}", e)))?;

        let label = result["label"]
            .as_str()
            .ok_or_else(|| ClassifyError::Failed("missing 'label' field".to_string()))?
            .to_string();

        if !is_known_label(&label) {
            return Err(ClassifyError::UnknownLabel(label));
        }

        debug!("Classified {:?} as '{}'", image, label);
        Ok(label)
    }
}

/// Always returns the same label; for tests and dry runs
pub struct FixedClassifier {
    label: String,
}

impl FixedClassifier {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

#[async_trait]
impl Classifier for FixedClassifier {
    async fn classify(&self, _image: &Path) -> Result<String, ClassifyError> {
        Ok(self.label.clone())
    }
}
