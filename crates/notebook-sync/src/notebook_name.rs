//! Notebook file-name rules.

/// Extension every notebook name ends with.
pub const NOTEBOOK_EXTENSION: &str = ".py";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("Notebook name is empty")]
    Empty,

    #[error("Notebook name must not contain path separators: {0}")]
    PathSeparator(String),
}

/// Trim `name` and append the notebook extension if it is missing.
pub fn normalize(name: &str) -> Result<String, NameError> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed == NOTEBOOK_EXTENSION {
        return Err(NameError::Empty);
    }
    if trimmed.contains('/') || trimmed.contains('\\') {
        return Err(NameError::PathSeparator(trimmed.to_string()));
    }
    if trimmed.ends_with(NOTEBOOK_EXTENSION) {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("{}{}", trimmed, NOTEBOOK_EXTENSION))
    }
}

/// Display name without the extension.
pub fn stem(name: &str) -> &str {
    name.strip_suffix(NOTEBOOK_EXTENSION).unwrap_or(name)
}
