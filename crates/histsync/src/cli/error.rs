//! Startup errors with suggestions for the operator.

use histsync::ConfigError;
use std::fmt;

#[derive(Debug)]
pub struct HelpfulError {
    pub message: String,
    pub context: Option<String>,
    pub suggestions: Vec<String>,
}

impl HelpfulError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            context: None,
            suggestions: Vec::new(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    /// Describe a configuration failure.
    pub fn from_config(err: &ConfigError) -> Self {
        match err {
            ConfigError::MissingRemoteDir => Self::new("No remote directory configured")
                .with_context("A run needs the historian export directory to fetch from")
                .with_suggestion("TRY: histsync run --remote-dir /mnt/historian/export")
                .with_suggestion("TRY: Add remote_dir = \"...\" to the config file"),
            ConfigError::Read { path, .. } => Self::new(err.to_string())
                .with_context("The config file could not be opened")
                .with_suggestion(format!("TRY: Check that {} exists", path.display()))
                .with_suggestion("TRY: Unset HISTSYNC_CONFIG to use defaults"),
            ConfigError::Parse { .. } => Self::new(err.to_string())
                .with_context("The config file is not valid TOML for histsync")
                .with_suggestion("TRY: histsync config to see the accepted keys"),
            ConfigError::Invalid(_) => Self::new(err.to_string())
                .with_suggestion("TRY: Fix the value in the config file or unset it to use the default"),
        }
    }
}

impl fmt::Display for HelpfulError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ERROR: {}", self.message)?;

        if let Some(ctx) = &self.context {
            writeln!(f, "CONTEXT: {}", ctx)?;
        }

        if !self.suggestions.is_empty() {
            writeln!(f)?;
            for suggestion in &self.suggestions {
                writeln!(f, "  {}", suggestion)?;
            }
        }

        Ok(())
    }
}

impl std::error::Error for HelpfulError {}
