//! Temporary directory bases for working folders.
//!
//! Neither function ever returns a relative path, so working folders are never created under
//! the current working directory (e.g. when TMPDIR=tmp).

use std::env;
use std::path::PathBuf;

/// Per-user temporary directory.
pub fn user_temp_dir() -> PathBuf {
    let t = env::temp_dir();
    if t.is_absolute() {
        t
    } else {
        system_temp_dir()
    }
}

/// Machine-wide temporary directory, used when running elevated.
pub fn system_temp_dir() -> PathBuf {
    #[cfg(windows)]
    {
        env::var("SystemRoot")
            .map(|root| PathBuf::from(root).join("Temp"))
            .unwrap_or_else(|_| PathBuf::from("C:\\Windows\\Temp"))
    }
    #[cfg(not(windows))]
    {
        PathBuf::from("/tmp")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_dirs_are_absolute() {
        assert!(user_temp_dir().is_absolute());
        assert!(system_temp_dir().is_absolute());
    }
}
