//! Persisted UI preferences (`preferences.json`)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    #[default]
    Dark,
}

impl Theme {
    pub fn toggled(self) -> Self {
        match self {
            Theme::Light => Theme::Dark,
            Theme::Dark => Theme::Light,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Theme::Light => "light",
            Theme::Dark => "dark",
        }
    }
}

impl fmt::Display for Theme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct PreferencesFile {
    #[serde(default)]
    theme: Theme,
}

/// Theme choice, read at startup and written on every toggle.
#[derive(Debug, Clone)]
pub struct Preferences {
    path: PathBuf,
    file: PreferencesFile,
}

impl Preferences {
    /// Loads from `path`. A missing or unreadable file yields the defaults.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let file = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "ignoring unreadable preferences");
                PreferencesFile::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PreferencesFile::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read preferences");
                PreferencesFile::default()
            }
        };
        Self { path, file }
    }

    pub fn theme(&self) -> Theme {
        self.file.theme
    }

    pub fn set_theme(&mut self, theme: Theme) -> Result<()> {
        self.file.theme = theme;
        self.save()
    }

    /// Flips the theme and writes the file. Returns the new theme.
    pub fn toggle_theme(&mut self) -> Result<Theme> {
        let next = self.file.theme.toggled();
        self.set_theme(next)?;
        Ok(next)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&self.file)?)?;
        debug!(theme = %self.file.theme, "preferences saved");
        Ok(())
    }
}
