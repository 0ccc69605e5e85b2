pub mod fs_policy;

pub use fs_policy::{
    ensure_directory_exists, is_path_safe, validate_and_get_safe_path, PathPolicyError,
};
