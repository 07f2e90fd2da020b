use std::{
    collections::HashMap,
    path::{Component, Path, PathBuf},
};

/// Maximum number of symlinks followed while resolving a single path.
const MAX_SYMLINK_HOPS: usize = 40;

pub fn logical_path(path: &Path) -> PathBuf {
    let mut components = vec![];
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::Normal(_) => {
                components.push(component);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                components.pop();
            }
        }
    }

    PathBuf::from_iter(components)
}

/// Returns the normal components of a relative path, or `None` if the path
/// is absolute, empty, or climbs above its starting point.
pub fn subpath_components(path: &str) -> Option<Vec<String>> {
    if path.contains('\0') {
        return None;
    }

    let path = Path::new(path);
    let mut components = vec![];
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => return None,
            Component::CurDir => {}
            Component::ParentDir => {
                components.pop()?;
            }
            Component::Normal(component) => {
                components.push(component.to_str()?.to_string());
            }
        }
    }

    if components.is_empty() {
        None
    } else {
        Some(components)
    }
}

/// Returns true if the archive entry name contains no `..` segments and is
/// not absolute.
pub fn is_safe_entry_name(name: &str) -> bool {
    if name.is_empty() || name.contains('\0') || name.starts_with('/') || name.starts_with('\\')
    {
        return false;
    }

    !name
        .split(['/', '\\'])
        .any(|segment| segment == ".." || segment.ends_with(':'))
}

/// Resolves where a symlink stored in an archive would point once the
/// archive is extracted, following other symlinks from the same archive.
/// Returns the resolved path relative to the extraction root, or `None` if
/// the link (or any link it passes through) leaves the root.
///
/// `links` maps entry names (without a trailing separator) to their link
/// targets.
pub fn resolve_archive_symlink(
    entry_name: &str,
    target: &str,
    links: &HashMap<String, String>,
) -> Option<Vec<String>> {
    let entry_components = entry_name
        .trim_end_matches('/')
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>();
    let (_, parent) = entry_components.split_last()?;
    let parent = parent.iter().map(|s| (*s).to_string()).collect();

    let mut hops = 0;
    resolve_from(parent, target, links, &mut hops)
}

fn resolve_from(
    mut resolved: Vec<String>,
    target: &str,
    links: &HashMap<String, String>,
    hops: &mut usize,
) -> Option<Vec<String>> {
    if target.is_empty() || target.starts_with('/') || target.contains('\0') {
        return None;
    }

    for segment in target.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                resolved.pop()?;
            }
            segment => {
                resolved.push(segment.to_string());

                let joined = resolved.join("/");
                if let Some(next_target) = links.get(&joined) {
                    *hops += 1;
                    if *hops > MAX_SYMLINK_HOPS {
                        return None;
                    }

                    resolved.pop();
                    resolved = resolve_from(resolved, next_target, links, hops)?;
                }
            }
        }
    }

    Some(resolved)
}

/// Returns true when `path`, after lexical normalization, is `root` or lies
/// beneath it. Both paths should already be canonicalized.
pub fn is_within(root: &Path, path: &Path) -> bool {
    logical_path(path).starts_with(logical_path(root))
}

pub async fn is_empty_dir(path: &Path) -> std::io::Result<bool> {
    let mut entries = tokio::fs::read_dir(path).await?;
    Ok(entries.next_entry().await?.is_none())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn link_map(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(name, target)| ((*name).to_string(), (*target).to_string()))
            .collect()
    }

    #[test]
    fn test_subpath_components() {
        assert_eq!(
            subpath_components("a/b/c.txt"),
            Some(vec!["a".into(), "b".into(), "c.txt".into()])
        );
        assert_eq!(
            subpath_components("./a/../b"),
            Some(vec!["b".to_string()])
        );
        assert_eq!(subpath_components("../a"), None);
        assert_eq!(subpath_components("a/../../b"), None);
        assert_eq!(subpath_components("/etc/passwd"), None);
        assert_eq!(subpath_components(""), None);
        assert_eq!(subpath_components("."), None);
    }

    #[test]
    fn test_is_safe_entry_name() {
        assert!(is_safe_entry_name("hi"));
        assert!(is_safe_entry_name("subdir/greeting"));
        assert!(is_safe_entry_name("subdir/"));
        assert!(is_safe_entry_name("a..b/file"));
        assert!(!is_safe_entry_name("../evil"));
        assert!(!is_safe_entry_name("subdir/../../evil"));
        assert!(!is_safe_entry_name("/etc/passwd"));
        assert!(!is_safe_entry_name("..\\evil"));
        assert!(!is_safe_entry_name("C:/evil"));
    }

    #[test]
    fn test_resolve_archive_symlink_inside() {
        let links = link_map(&[]);
        assert_eq!(
            resolve_archive_symlink("what", "subdir/greeting", &links),
            Some(vec!["subdir".into(), "greeting".into()])
        );
        assert_eq!(
            resolve_archive_symlink("subdir/link", "../hi", &links),
            Some(vec!["hi".into()])
        );
        assert_eq!(
            resolve_archive_symlink("subdir/link", ".", &links),
            Some(vec!["subdir".into()])
        );
    }

    #[test]
    fn test_resolve_archive_symlink_outside() {
        let links = link_map(&[]);
        assert_eq!(resolve_archive_symlink("link", "..", &links), None);
        assert_eq!(resolve_archive_symlink("link", "../../etc", &links), None);
        assert_eq!(resolve_archive_symlink("a/b/link", "../../../x", &links), None);
        assert_eq!(resolve_archive_symlink("link", "/etc/passwd", &links), None);
    }

    #[test]
    fn test_resolve_archive_symlink_chain() {
        // `deep/up` points at the root, so `deep/escape` climbs out through it
        let links = link_map(&[("deep/up", ".."), ("deep/escape", "up/..")]);
        assert_eq!(
            resolve_archive_symlink("deep/up", "..", &links),
            Some(vec![])
        );
        assert_eq!(resolve_archive_symlink("deep/escape", "up/..", &links), None);

        let links = link_map(&[("a", "b"), ("b", "subdir")]);
        assert_eq!(
            resolve_archive_symlink("a", "b", &links),
            Some(vec!["subdir".into()])
        );
    }

    #[test]
    fn test_resolve_archive_symlink_loop() {
        let links = link_map(&[("a", "b"), ("b", "a")]);
        assert_eq!(resolve_archive_symlink("a", "b", &links), None);
    }

    #[test]
    fn test_is_within() {
        assert!(is_within(Path::new("/tmp/root"), Path::new("/tmp/root/a")));
        assert!(is_within(Path::new("/tmp/root"), Path::new("/tmp/root")));
        assert!(!is_within(Path::new("/tmp/root"), Path::new("/tmp/root/../x")));
        assert!(!is_within(Path::new("/tmp/root"), Path::new("/tmp/rootless")));
    }
}
