use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// Provides a custom error type to be used for failures
/// in locating the site-packages directory of a virtual environment.
#[derive(Debug)]
pub enum VenvError {
    NotFound(PathBuf),
    Io(io::Error),
}

impl fmt::Display for VenvError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VenvError::NotFound(venv_dir) => write!(
                f,
                "venv error: no site-packages directory found under {}",
                venv_dir.display()
            ),
            VenvError::Io(io_error) => write!(f, "venv error: {io_error}"),
        }
    }
}

impl From<io::Error> for VenvError {
    fn from(error: io::Error) -> Self {
        VenvError::Io(error)
    }
}

/// Resolves the site-packages directory of a virtual environment root.
///
/// On POSIX systems this is `<venv>/lib/python3.*/site-packages`
/// (the minor version directory is discovered by scanning `<venv>/lib`);
/// on Windows it is `<venv>\Lib\site-packages`.
pub fn site_packages_dir(venv_dir: &Path) -> Result<PathBuf, VenvError> {
    if cfg!(windows) {
        let candidate = venv_dir.join("Lib").join("site-packages");
        if candidate.is_dir() {
            return Ok(candidate);
        }
        return Err(VenvError::NotFound(venv_dir.to_path_buf()));
    }

    let lib_dir = venv_dir.join("lib");
    let entries = match lib_dir.read_dir() {
        Ok(entries) => entries,
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            return Err(VenvError::NotFound(venv_dir.to_path_buf()));
        }
        Err(error) => return Err(VenvError::Io(error)),
    };

    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.starts_with("python3") {
            let candidate = entry.path().join("site-packages");
            if candidate.is_dir() {
                return Ok(candidate);
            }
        }
    }
    Err(VenvError::NotFound(venv_dir.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;

    #[cfg(unix)]
    #[test]
    fn test_finds_posix_site_packages() {
        let venv_dir = tempfile::tempdir().unwrap();
        let site_packages = venv_dir.path().join("lib/python3.12/site-packages");
        fs::create_dir_all(&site_packages).unwrap();

        let resolved = site_packages_dir(venv_dir.path()).unwrap();
        assert_eq!(resolved, site_packages);
    }

    #[test]
    fn test_missing_site_packages_is_an_error() {
        let venv_dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(venv_dir.path().join("lib")).unwrap();

        let result = site_packages_dir(venv_dir.path());
        assert!(matches!(result, Err(VenvError::NotFound(_))));
    }

    #[test]
    fn test_missing_venv_is_an_error() {
        let venv_dir = tempfile::tempdir().unwrap();
        let missing = venv_dir.path().join("does-not-exist");

        let result = site_packages_dir(&missing);
        assert!(matches!(result, Err(VenvError::NotFound(_))));
    }
}
