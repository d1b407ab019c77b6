use std::collections::VecDeque;
use std::path::Path;
use anyhow::{Context, Result};
use super::{Detection, DetectionSource};

/// Replays recorded scan cycles. The file holds a JSON array of cycles, each an
/// array of detections; once exhausted every cycle comes back empty, which lets
/// the tracker time out whatever is still tracked.
pub struct ReplaySource {
    cycles: VecDeque<Vec<Detection>>,
}

impl ReplaySource {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read replay file: {}", path.display()))?;

        let cycles: Vec<Vec<Detection>> = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse replay file: {}", path.display()))?;

        tracing::info!("Loaded {} scan cycles from {}", cycles.len(), path.display());
        Ok(Self::from_cycles(cycles))
    }

    pub fn from_cycles(cycles: Vec<Vec<Detection>>) -> Self {
        Self {
            cycles: cycles.into(),
        }
    }

    #[cfg(test)]
    pub fn remaining(&self) -> usize {
        self.cycles.len()
    }
}

impl DetectionSource for ReplaySource {
    async fn next_batch(&mut self) -> Result<Vec<Detection>> {
        Ok(self.cycles.pop_front().unwrap_or_default())
    }
}
