//! Reading local text to index: a single file, or every markdown/text file under a
//! directory.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

const EXTENSIONS: [&str; 3] = ["md", "markdown", "txt"];

/// A file we read: path and text, with any YAML frontmatter removed.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDocument {
    pub path: PathBuf,
    pub text: String,
}

/// Load `path`. A file is read whatever its extension; a directory is walked for
/// `.md`, `.markdown` and `.txt` files, skipping hidden entries and not following
/// symlinks. Results are sorted by path.
pub fn load_sources(path: &Path) -> Result<Vec<SourceDocument>, SourceError> {
    if path.is_file() {
        return Ok(vec![read_source(path)?]);
    }
    if !path.is_dir() {
        return Err(SourceError::NotFound(path.to_path_buf()));
    }

    let mut docs = Vec::new();
    for entry in WalkDir::new(path)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e))
    {
        let entry = entry.map_err(|e| SourceError::Walk(e.to_string()))?;
        if entry.file_type().is_file() && has_text_extension(entry.path()) {
            docs.push(read_source(entry.path())?);
        }
    }
    tracing::debug!(root = %path.display(), files = docs.len(), "loaded sources");
    Ok(docs)
}

fn read_source(path: &Path) -> Result<SourceDocument, SourceError> {
    let raw = std::fs::read_to_string(path).map_err(|e| SourceError::Read(path.to_path_buf(), e))?;
    let text = if is_markdown(path) { strip_frontmatter(&raw) } else { raw };
    Ok(SourceDocument {
        path: path.to_path_buf(),
        text,
    })
}

fn has_text_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)))
}

fn is_markdown(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("md") || e.eq_ignore_ascii_case("markdown"))
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry.file_name().to_string_lossy().starts_with('.')
}

/// Drops a leading `---` fenced YAML block. Text without a closing fence is kept whole.
fn strip_frontmatter(raw: &str) -> String {
    let Some(fenced) = raw.trim_start().strip_prefix("---") else {
        return raw.to_string();
    };
    match fenced.split_once("\n---") {
        Some((_, body)) => body.trim_start().to_string(),
        None => raw.to_string(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("no such file or directory: {0}")]
    NotFound(PathBuf),
    #[error("walk error: {0}")]
    Walk(String),
    #[error("read error for {0}: {1}")]
    Read(PathBuf, std::io::Error),
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn text_without_fence_is_unchanged() {
        let s = "Chunks are embedded before indexing.";
        assert_eq!(strip_frontmatter(s), s);
    }

    #[test]
    fn yaml_block_is_dropped() {
        let s = "---\nurl: https://example.org/rag\ntags: [retrieval]\n---\n\nRetrieval starts with a query.";
        assert_eq!(strip_frontmatter(s), "Retrieval starts with a query.");
        assert_eq!(strip_frontmatter("---\nunterminated"), "---\nunterminated");
    }

    #[test]
    fn walks_text_files_and_skips_hidden() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::create_dir_all(root.join(".git")).unwrap();
        fs::write(root.join("a.md"), "---\ntitle: A\n---\nAlpha body.").unwrap();
        fs::write(root.join("sub").join("b.txt"), "---\nkept as is").unwrap();
        fs::write(root.join("c.rs"), "fn main() {}").unwrap();
        fs::write(root.join(".hidden.md"), "secret").unwrap();
        fs::write(root.join(".git").join("d.md"), "internal").unwrap();

        let docs = load_sources(root).unwrap();
        let names: Vec<_> = docs
            .iter()
            .map(|d| d.path.strip_prefix(root).unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2);
        assert_eq!(docs[0].text, "Alpha body.");
        assert_eq!(docs[1].text, "---\nkept as is");
    }

    #[test]
    fn single_file_and_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("page.html");
        fs::write(&file, "<p>hi</p>").unwrap();
        let docs = load_sources(&file).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].text, "<p>hi</p>");

        assert!(matches!(
            load_sources(&dir.path().join("nope")),
            Err(SourceError::NotFound(_))
        ));
    }
}
