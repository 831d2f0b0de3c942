use std::fs::{self, File, create_dir_all};
use std::io::Error;
use std::path::Path;

use walkdir::WalkDir;

pub const TEMPLATE_SUFFIX: &str = ".jinja";

/// Copies the contents of `from` into `to`, keeping the directory layout.
/// Template sources (`*.jinja`) are left out when `exclude_template_files`
/// is set; the rendered version is written separately.
pub fn copy_dir_contents(from: &Path, to: &Path, exclude_template_files: bool) -> Result<(), Error> {
    if !from.exists() {
        return Err(Error::other(format!("source directory {} does not exist", from.display())));
    }

    create_dir_all(to)?;

    for entry in WalkDir::new(from).follow_links(true).into_iter().filter_map(|e| e.ok()) {
        let relative_path = match entry.path().strip_prefix(from) {
            Ok(p) if p.as_os_str().is_empty() => continue,
            Ok(p) => p,
            Err(_) => continue,
        };

        if exclude_template_files
            && entry
                .file_name()
                .to_str()
                .map(|s| s.ends_with(TEMPLATE_SUFFIX))
                .unwrap_or(false)
        {
            continue;
        }

        let dest = to.join(relative_path);
        if entry.file_type().is_dir() {
            create_dir_all(&dest)?;
        } else {
            if let Some(parent) = dest.parent() {
                create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &dest)?;
        }
    }

    Ok(())
}

/// Creates the file at `path`, creating missing parent directories first.
pub fn create_and_open(path: &Path) -> Result<File, Error> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            create_dir_all(parent)?;
        }
    }

    File::create(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{create_dir_all, read_to_string, write};
    use tempfile::TempDir;

    #[test]
    fn test_copy_dir_contents() {
        let src = TempDir::new().expect("error creating temporary dir");
        let dst = TempDir::new().expect("error creating temporary dir");

        create_dir_all(src.path().join("nested/deeper")).unwrap();
        write(src.path().join("jest.config.ts"), "config").unwrap();
        write(src.path().join("nested/deeper/workflow.ts"), "workflow").unwrap();
        write(src.path().join("nested/settings.json.jinja"), "{{ value }}").unwrap();

        copy_dir_contents(src.path(), dst.path(), true).expect("copy must succeed");

        assert_eq!(read_to_string(dst.path().join("jest.config.ts")).unwrap(), "config");
        assert_eq!(
            read_to_string(dst.path().join("nested/deeper/workflow.ts")).unwrap(),
            "workflow"
        );
        assert!(!dst.path().join("nested/settings.json.jinja").exists());

        copy_dir_contents(src.path(), dst.path(), false).expect("copy must succeed");
        assert!(dst.path().join("nested/settings.json.jinja").exists());
    }

    #[test]
    fn test_copy_dir_contents_missing_source() {
        let dst = TempDir::new().expect("error creating temporary dir");
        let result = copy_dir_contents(Path::new("/definitely/not/there"), dst.path(), false);
        assert!(result.is_err());
    }

    #[test]
    fn test_create_and_open_creates_parents() {
        let dir = TempDir::new().expect("error creating temporary dir");
        let path = dir.path().join("a/b/c.json");
        let file = create_and_open(&path);
        assert!(file.is_ok());
        assert!(path.exists());
    }
}
