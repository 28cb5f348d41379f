//! Durable tier: one markdown file per item under a type-specific directory

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::SecondsFormat;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::memory::{slugify, ContentItem, Scope};

const HEADING_CHARS: usize = 80;

/// File tree holding durable items
#[derive(Debug, Clone)]
pub struct DurableStorage {
    root: PathBuf,
    type_dirs: BTreeMap<String, String>,
}

impl DurableStorage {
    pub fn new(config: &Config) -> Self {
        Self {
            root: config.durable_root(),
            type_dirs: config.promotion.type_dirs.clone(),
        }
    }

    /// Directory for a type; unmapped types fall back to their plural
    pub fn type_dir(&self, item_type: &str) -> PathBuf {
        let dir = self
            .type_dirs
            .get(item_type)
            .cloned()
            .unwrap_or_else(|| format!("{}s", item_type));
        self.root.join(dir)
    }

    /// Where an item's file lives. Project-scoped items are nested under
    /// `projects/<project>/` inside their type directory.
    pub fn path_for(&self, item: &ContentItem) -> PathBuf {
        let mut dir = self.type_dir(item.metadata.item_type.as_str());

        if item.metadata.scope == Some(Scope::Project) {
            if let Some(project) = item
                .metadata
                .project
                .project_dir
                .as_deref()
                .and_then(|p| Path::new(p).file_name())
                .map(|name| slugify(&name.to_string_lossy()))
                .filter(|slug| !slug.is_empty())
            {
                dir = dir.join("projects").join(project);
            }
        }

        let mut stem = slugify(item.slug());
        if stem.is_empty() {
            stem = "item".to_string();
        }
        dir.join(format!("{}.md", stem))
    }

    /// Write the rendered item atomically
    pub fn write(&self, item: &ContentItem, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| Error::storage(format!("No parent directory for {}", path.display())))?;
        fs::create_dir_all(parent)?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(render(item).as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Remove a durable file; an already-missing file is fine
    pub fn remove(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Path relative to the durable root, for display
    pub fn display_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }
}

/// First meaningful line of the content, without markdown heading marks
pub fn heading(content: &str) -> String {
    let line = content
        .lines()
        .map(|l| l.trim().trim_start_matches('#').trim())
        .find(|l| !l.is_empty())
        .unwrap_or("");
    truncate_chars(line, HEADING_CHARS)
}

/// Truncate on a char boundary, marking the cut with an ellipsis
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    if max == 0 {
        return String::new();
    }
    let mut out: String = text.chars().take(max - 1).collect();
    out.push('…');
    out
}

fn yaml_list(values: impl IntoIterator<Item = impl AsRef<str>>) -> String {
    let quoted: Vec<String> = values
        .into_iter()
        .map(|v| format!("\"{}\"", v.as_ref().replace('"', "\\\"")))
        .collect();
    format!("[{}]", quoted.join(", "))
}

/// Markdown with a front-matter block of enrichment metadata
pub fn render(item: &ContentItem) -> String {
    let meta = &item.metadata;
    let mut out = String::from("---\n");
    let _ = writeln!(out, "id: {}", item.id);
    let _ = writeln!(out, "type: {}", meta.item_type);
    if let Some(scope) = meta.scope {
        let _ = writeln!(out, "scope: {}", scope);
    }
    if let Some(project) = &meta.project.project_dir {
        let _ = writeln!(out, "project: \"{}\"", project.replace('"', "\\\""));
    }
    if let Some(branch) = &meta.project.branch {
        let _ = writeln!(out, "branch: {}", branch);
    }
    if !meta.relevant_files.is_empty() {
        let _ = writeln!(out, "files: {}", yaml_list(&meta.relevant_files));
    }
    if !meta.tags.is_empty() {
        let _ = writeln!(out, "tags: {}", yaml_list(&meta.tags));
    }
    let _ = writeln!(out, "importance: {:.2}", meta.importance);
    let _ = writeln!(
        out,
        "created: {}",
        meta.created_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    );
    if let Some(from) = &item.promoted_from {
        let _ = writeln!(out, "promoted_from: {}", from);
    }
    if let Some(at) = item.promoted_at {
        let _ = writeln!(
            out,
            "promoted_at: {}",
            at.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
    }
    out.push_str("---\n\n");

    let body = item.content.trim();
    if !body.starts_with('#') {
        let _ = writeln!(out, "# {}\n", heading(body));
    }
    out.push_str(body);
    out.push('\n');
    out
}
