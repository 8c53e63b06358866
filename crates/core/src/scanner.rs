//! Finds image files to submit under a set of roots.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Walks `roots` and returns the image files matching `include` and not
/// matching `exclude`, sorted. A root that is itself a file is kept when it
/// is an image, regardless of the globs.
pub fn discover(
    roots: &[PathBuf],
    include: &[String],
    exclude: &[String],
) -> anyhow::Result<Vec<PathBuf>> {
    let include_set = build_globset(include)?;
    let exclude_set = build_globset(exclude)?;

    let mut found = Vec::new();
    for root in roots {
        if root.is_file() {
            if is_image(root) {
                found.push(root.clone());
            } else {
                debug!(path = %root.display(), "skipping non-image file");
            }
            continue;
        }
        for entry in WalkDir::new(root)
            .follow_links(true)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || should_descend(e.path(), &exclude_set))
        {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let path = entry.path();
            if !entry.file_type().is_file() || is_hidden(path) || exclude_set.is_match(path) {
                continue;
            }
            if !include.is_empty() && !include_set.is_match(path) {
                continue;
            }
            if !is_image(path) {
                debug!(path = %path.display(), "skipping non-image file");
                continue;
            }
            found.push(path.to_path_buf());
        }
    }
    found.sort();
    found.dedup();
    Ok(found)
}

fn build_globset(patterns: &[String]) -> anyhow::Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pat in patterns {
        let glob = GlobBuilder::new(pat).case_insensitive(true).build()?;
        builder.add(glob);
    }
    Ok(builder.build()?)
}

fn should_descend(path: &Path, excludes: &GlobSet) -> bool {
    !excludes.is_match(path) && !is_hidden(path)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|s| s.starts_with('.'))
        .unwrap_or(false)
}

fn is_image(path: &Path) -> bool {
    matches!(
        infer::get_from_path(path),
        Ok(Some(kind)) if kind.matcher_type() == infer::MatcherType::Image
    )
}
