//! Resolves the union of default and app-declared persistence directories
//! into a minimal, non-overlapping set. A directory is redundant when some
//! other directory in the set already covers it (is an ancestor of it or is
//! the same path); redundant entries are dropped and recorded, never errored.

use std::fmt;
use std::path::Path;

/// Which input list a directory came from. Order matters: defaults are
/// processed first and win exact-path ties against application directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirSource {
    Default,
    Application,
}

impl fmt::Display for DirSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirSource::Default => write!(f, "default"),
            DirSource::Application => write!(f, "application"),
        }
    }
}

/// Record of a directory dropped from the resolved set, kept so the caller
/// can log what was skipped and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedDir {
    pub dir: String,
    pub covered_by: String,
    pub source: DirSource,
}

#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Surviving directories: defaults first, then application directories,
    /// each in original relative order.
    pub dirs: Vec<String>,
    pub dropped: Vec<DroppedDir>,
}

/// Merges the platform default directory list with the app-declared list.
/// Pure function; tie-breaking rules, in priority order, per directory:
/// 1. dropped if another directory in the same list is a proper ancestor, or
///    is the same path at an earlier position;
/// 2. dropped if any directory in the other list is a proper ancestor;
/// 3. dropped if the same path appears in the other list, but only while
///    processing the application list (defaults win exact-path ties).
pub fn resolve_persist_dirs(defaults: &[&str], app_dirs: Option<&[String]>) -> Resolution {
    let defaults: Vec<String> = defaults.iter().map(|d| normalize_dir(d)).collect();
    let app: Vec<String> = app_dirs
        .map(|dirs| dirs.iter().map(|d| normalize_dir(d)).collect())
        .unwrap_or_default();

    let mut resolution = Resolution::default();
    merge_uncovered(&defaults, &app, false, DirSource::Default, &mut resolution);
    merge_uncovered(&app, &defaults, true, DirSource::Application, &mut resolution);
    resolution
}

/// Appends every directory from `source` that survives the coverage checks
/// against its own list and against `other`.
fn merge_uncovered(
    source: &[String],
    other: &[String],
    drop_other_dups: bool,
    source_kind: DirSource,
    out: &mut Resolution,
) {
    for (index, dir) in source.iter().enumerate() {
        let mut covering = source.iter().enumerate().find_map(|(other_index, cand)| {
            if is_path_ancestor(cand, dir) {
                Some(cand)
            } else if cand == dir && other_index < index {
                // dup within one list: first occurrence wins
                Some(cand)
            } else {
                None
            }
        });
        if covering.is_none() {
            covering = other.iter().find(|cand| {
                is_path_ancestor(cand, dir) || (drop_other_dups && *cand == dir)
            });
        }
        match covering {
            Some(covered_by) => out.dropped.push(DroppedDir {
                dir: dir.clone(),
                covered_by: covered_by.clone(),
                source: source_kind,
            }),
            None => out.dirs.push(dir.clone()),
        }
    }
}

/// True if `ancestor` is a proper path ancestor of `dir` (component-wise,
/// so "/a" covers "/a/b" but not "/ab").
fn is_path_ancestor(ancestor: &str, dir: &str) -> bool {
    ancestor != dir && Path::new(dir).strip_prefix(ancestor).is_ok()
}

/// Directories are absolute by contract; this only strips trailing
/// separators so string comparisons line up with component comparisons.
fn normalize_dir(dir: &str) -> String {
    let trimmed = dir.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}
