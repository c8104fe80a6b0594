#![forbid(unsafe_code)]

use tracing::debug;
use trackpage_contracts::activity::ArtifactName;
use trackpage_storage::{OutputLocation, StorageError};

const INDEX_STYLE: &str = "body { text-align: center; margin: 0 auto; padding: 6em; max-width: 600px; } img { width: 100%; height: auto; margin-bottom: 6em; }";

#[derive(Debug)]
pub enum IndexError {
    Storage(StorageError),
}

impl std::fmt::Display for IndexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage(err) => write!(f, "index rebuild failed: {err}"),
        }
    }
}

impl std::error::Error for IndexError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(err) => Some(err),
        }
    }
}

impl From<StorageError> for IndexError {
    fn from(value: StorageError) -> Self {
        Self::Storage(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub artifact_name: ArtifactName,
    pub display_label: String,
}

/// Newest-first listing of every artifact on disk.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IndexDocument {
    entries: Vec<IndexEntry>,
}

impl IndexDocument {
    pub fn from_names(mut names: Vec<ArtifactName>) -> Self {
        names.sort_unstable_by(|a, b| b.cmp(a));
        names.dedup();
        let entries = names
            .into_iter()
            .map(|artifact_name| IndexEntry {
                display_label: artifact_name.display_label(),
                artifact_name,
            })
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn render_html(&self) -> String {
        let mut html = format!(
            "<html><head><style type='text/css'>{INDEX_STYLE}</style></head><body>\n"
        );
        for entry in &self.entries {
            html.push_str(&format!(
                "<img src=\"{}\" alt=\"{}\">\n",
                escape_attr(entry.artifact_name.as_str()),
                escape_attr(&entry.display_label)
            ));
        }
        html.push_str("</body></html>");
        html
    }
}

fn escape_attr(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

/// Rebuilds `index.html` from the artifact files currently on disk. Never merges with
/// a previous index.
pub fn rebuild_index(output: &OutputLocation, extension: &str) -> Result<IndexDocument, IndexError> {
    let names = output.list_artifact_names(extension)?;
    let document = IndexDocument::from_names(names);
    let path = output.write_index(&document.render_html())?;
    debug!(entries = document.len(), path = %path.display(), "index rebuilt");
    Ok(document)
}
