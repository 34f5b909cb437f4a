//! Window descriptors and title truncation

use serde::{Deserialize, Serialize};

/// Which end of the window title is cut off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Truncation {
    Start,
    End,
    #[default]
    None,
}

/// Identifies the player window and how to turn its title into a track name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowDescriptor {
    partial_title: String,
    truncation: Truncation,
    count: usize,
}

impl WindowDescriptor {
    pub fn new(partial_title: impl Into<String>, truncation: Truncation, count: usize) -> Self {
        Self {
            partial_title: partial_title.into(),
            truncation,
            count,
        }
    }

    pub fn partial_title(&self) -> &str {
        &self.partial_title
    }

    pub fn truncation(&self) -> Truncation {
        self.truncation
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Whether a window title belongs to this player
    pub fn matches(&self, title: &str) -> bool {
        title.contains(&self.partial_title)
    }

    /// Cut the player decoration off a window title.
    ///
    /// `Start` skips `count - 1` characters and keeps `len - count` of the
    /// rest, `End` drops the last `count` characters. Counts past the title
    /// length clamp to an empty result. Works on characters, not bytes.
    pub fn truncate(&self, title: &str) -> String {
        let len = title.chars().count();
        let kept: String = match self.truncation {
            Truncation::None => return title.to_string(),
            Truncation::Start => title
                .chars()
                .skip(self.count.saturating_sub(1))
                .take(len.saturating_sub(self.count))
                .collect(),
            Truncation::End => title.chars().take(len.saturating_sub(self.count)).collect(),
        };
        kept.trim().to_string()
    }
}
