//! Globbing and recursive search over the filesystem interface.
//!
//! Patterns support `*` and `?` within a segment and `**` as a whole
//! segment matching any number of directories, bounded by a depth cap.
//! The walker consumes [`FileOps`] only, so it behaves identically against
//! the client engine and the server filesystem.

use crate::error::SftpResult;
use crate::fs::FileOps;
use crate::protocol::Item;
use crate::util::path::{join_path, normalize_path};
use std::collections::{HashSet, VecDeque};

/// Directory descent bound for `**` patterns.
pub const MAX_SEARCH_DEPTH: usize = 32;

/// One search hit: the full virtual path and its directory entry.
#[derive(Debug, Clone)]
pub struct Match {
    pub path: String,
    pub item: Item,
}

/// Match one pattern segment (`*`, `?`, literals) against a name.
pub fn match_segment(pattern: &str, name: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = name.chars().collect();
    let (mut p, mut t) = (0usize, 0usize);
    let (mut star, mut star_t) = (None::<usize>, 0usize);
    while t < txt.len() {
        if p < pat.len() && (pat[p] == '?' || pat[p] == txt[t]) {
            p += 1;
            t += 1;
        } else if p < pat.len() && pat[p] == '*' {
            star = Some(p);
            star_t = t;
            p += 1;
        } else if let Some(sp) = star {
            p = sp + 1;
            star_t += 1;
            t = star_t;
        } else {
            return false;
        }
    }
    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}

/// List one directory through the filesystem interface.
async fn list_dir(fs: &dyn FileOps, path: &str) -> SftpResult<Vec<Item>> {
    let handle = fs.opendir(path).await?;
    let mut items = Vec::new();
    loop {
        let batch = fs.readdir(handle).await;
        match batch {
            Ok(batch) if batch.is_empty() => break,
            Ok(batch) => items.extend(batch),
            Err(err) => {
                let _ = fs.close(handle).await;
                return Err(err);
            }
        }
    }
    fs.close(handle).await?;
    Ok(items)
}

/// Recursively search `base` for entries matching `pattern`.
///
/// Results are sorted by path and deduplicated (`**` can reach the same
/// entry along several routes).
pub async fn search(fs: &dyn FileOps, base: &str, pattern: &str) -> SftpResult<Vec<Match>> {
    let normalized = normalize_path(pattern);
    let segments: Vec<String> = normalized
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .map(str::to_string)
        .collect();
    if segments.is_empty() {
        return Ok(Vec::new());
    }

    let mut results = Vec::new();
    let mut seen = HashSet::new();
    // (directory, segment index, depth)
    let mut queue = VecDeque::new();
    queue.push_back((normalize_path(base), 0usize, 0usize));

    while let Some((dir, idx, depth)) = queue.pop_front() {
        if depth > MAX_SEARCH_DEPTH || idx >= segments.len() {
            continue;
        }
        let segment = &segments[idx];
        let last = idx + 1 == segments.len();

        if segment == "**" {
            if !last {
                queue.push_back((dir.clone(), idx + 1, depth));
            }
            for item in list_dir(fs, &dir).await? {
                if item.filename == "." || item.filename == ".." {
                    continue;
                }
                let full = join_path(&dir, &item.filename);
                if last && seen.insert(full.clone()) {
                    results.push(Match {
                        path: full.clone(),
                        item: item.clone(),
                    });
                }
                if item.attrs.is_dir() {
                    queue.push_back((full, idx, depth + 1));
                }
            }
            continue;
        }

        for item in list_dir(fs, &dir).await? {
            if item.filename == "." || item.filename == ".." {
                continue;
            }
            if !match_segment(segment, &item.filename) {
                continue;
            }
            let full = join_path(&dir, &item.filename);
            if last {
                if seen.insert(full.clone()) {
                    results.push(Match { path: full, item });
                }
            } else if item.attrs.is_dir() {
                queue.push_back((full, idx + 1, depth + 1));
            }
        }
    }

    results.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::SafeFs;

    #[test]
    fn segment_matching() {
        assert!(match_segment("*", "anything"));
        assert!(match_segment("*.rs", "main.rs"));
        assert!(!match_segment("*.rs", "main.rc"));
        assert!(match_segment("a?c", "abc"));
        assert!(!match_segment("a?c", "ac"));
        assert!(match_segment("*b*", "abc"));
        assert!(match_segment("", ""));
        assert!(!match_segment("", "x"));
        assert!(match_segment("**a", "xyza"));
    }

    #[tokio::test]
    async fn search_walks_tree() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src/deep")).unwrap();
        std::fs::write(dir.path().join("main.rs"), "x").unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "x").unwrap();
        std::fs::write(dir.path().join("src/deep/core.rs"), "x").unwrap();
        std::fs::write(dir.path().join("src/notes.txt"), "x").unwrap();

        let fs = SafeFs::new(dir.path(), false, false);

        let hits = search(&fs, "/", "*.rs").await.unwrap();
        assert_eq!(
            hits.iter().map(|m| m.path.as_str()).collect::<Vec<_>>(),
            vec!["/main.rs"]
        );

        let hits = search(&fs, "/", "**/*.rs").await.unwrap();
        assert_eq!(
            hits.iter().map(|m| m.path.as_str()).collect::<Vec<_>>(),
            vec!["/main.rs", "/src/deep/core.rs", "/src/lib.rs"]
        );

        let hits = search(&fs, "/", "src/*").await.unwrap();
        assert_eq!(hits.len(), 3);

        let hits = search(&fs, "/", "src/**").await.unwrap();
        assert_eq!(hits.len(), 4);
    }
}
