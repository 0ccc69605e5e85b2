use std::path::{Component, Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum PathPolicyError {
    #[error("{0} cannot be empty")]
    Empty(&'static str),
    #[error("Path traversal detected: {file_name}")]
    OutsideBase { file_name: String },
    #[error("Path cannot be resolved: {0}")]
    Unresolvable(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PathPolicyError {
    pub fn name(&self) -> &'static str {
        match self {
            PathPolicyError::Empty(_) => "Empty",
            PathPolicyError::OutsideBase { .. } => "OutsideBase",
            PathPolicyError::Unresolvable(_) => "Unresolvable",
            PathPolicyError::Io(_) => "Io",
        }
    }
}

/// Create `path` and any missing parents. Calling it on an existing directory
/// is a no-op.
pub fn ensure_directory_exists(path: &Path) -> Result<(), PathPolicyError> {
    if path.as_os_str().is_empty() || path.to_string_lossy().trim().is_empty() {
        return Err(PathPolicyError::Empty("Path"));
    }
    if !path.is_dir() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Resolve `base/file_name` to an absolute path and verify it stays strictly
/// inside `base`. Absolute file names and `..` segments that climb out of the
/// base are rejected with [`PathPolicyError::OutsideBase`].
pub fn validate_and_get_safe_path(base: &Path, file_name: &str) -> Result<PathBuf, PathPolicyError> {
    if base.as_os_str().is_empty() || base.to_string_lossy().trim().is_empty() {
        return Err(PathPolicyError::Empty("Base path"));
    }
    if file_name.trim().is_empty() {
        return Err(PathPolicyError::Empty("File name"));
    }

    let full_base = resolve_lexically(base)?;
    let full_candidate = resolve_lexically(&base.join(file_name))?;

    if !is_descendant(&full_base, &full_candidate) {
        return Err(PathPolicyError::OutsideBase {
            file_name: file_name.to_string(),
        });
    }
    Ok(full_candidate)
}

/// Non-failing variant of the descendant check for advisory use.
pub fn is_path_safe(base: &Path, test_path: &Path) -> bool {
    match (resolve_lexically(base), resolve_lexically(test_path)) {
        (Ok(full_base), Ok(full_test)) => is_descendant(&full_base, &full_test),
        _ => false,
    }
}

/// Make `path` absolute against the current directory and fold `.`/`..`
/// segments without touching the filesystem, so not-yet-created targets resolve.
pub(crate) fn resolve_lexically(path: &Path) -> Result<PathBuf, PathPolicyError> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut resolved = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::Prefix(prefix) => resolved.push(prefix.as_os_str()),
            Component::RootDir => resolved.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                // `..` at the root stays at the root.
                resolved.pop();
            }
            Component::Normal(segment) => resolved.push(segment),
        }
    }

    if resolved.as_os_str().is_empty() {
        return Err(PathPolicyError::Unresolvable(path.display().to_string()));
    }
    Ok(resolved)
}

/// Characters that cannot appear in a file name on any supported platform.
pub fn is_invalid_file_name_char(c: char) -> bool {
    c.is_control() || matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*')
}

fn comparable(path: &Path) -> String {
    let mut text = path.to_string_lossy().replace('\\', "/").to_lowercase();
    if !text.ends_with('/') {
        text.push('/');
    }
    text
}

fn is_descendant(base: &Path, candidate: &Path) -> bool {
    let base = comparable(base);
    let candidate = comparable(candidate);
    candidate.len() > base.len() && candidate.starts_with(&base)
}
