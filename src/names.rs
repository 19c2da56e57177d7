//! Mapping of image filenames (UTF-16LE) onto host-legal path components.

use std::collections::{HashMap, HashSet};

use tracing::warn;

use crate::backend::BackendCaps;
use crate::features::FeatureFlags;
use crate::flags::ExtractFlags;
use crate::tree::{DentryIndex, Image};

/// Replacement for forbidden code units: U+FFFD where the target filesystem
/// speaks Unicode natively, `?` on byte-oriented POSIX filesystems.
fn replacement_char(windows_rules: bool) -> u16 {
    if windows_rules {
        0xfffd
    } else {
        b'?' as u16
    }
}

pub(crate) fn is_dot_or_dotdot(name: &[u16]) -> bool {
    let dot = '.' as u16;
    matches!(name, [d] if *d == dot) || matches!(name, [d, d2] if *d == dot && *d2 == dot)
}

/// Case-insensitive comparison of two UTF-16 names.
pub(crate) fn eq_ignore_case(a: &[u16], b: &[u16]) -> bool {
    fold_name(a) == fold_name(b)
}

fn fold_name(name: &[u16]) -> String {
    String::from_utf16_lossy(name)
        .chars()
        .flat_map(char::to_lowercase)
        .collect()
}

/// Check a filename against the target platform's rules, optionally fixing
/// it in place. Returns whether the (possibly fixed) name is acceptable.
fn file_name_valid(name: &mut [u16], windows_rules: bool, fix: bool) -> bool {
    if name.is_empty() {
        return true;
    }
    let replacement = replacement_char(windows_rules);
    for unit in name.iter_mut() {
        let forbidden = match *unit {
            0 => true,
            u if u == '/' as u16 => true,
            u if windows_rules => matches!(
                u as u8 as char,
                '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'
            ) && u < 0x80,
            _ => false,
        };
        if forbidden {
            if fix {
                *unit = replacement;
            } else {
                return false;
            }
        }
    }
    if windows_rules {
        let last = name.len() - 1;
        if name[last] == ' ' as u16 || name[last] == '.' as u16 {
            if fix {
                name[last] = replacement;
            } else {
                return false;
            }
        }
    }
    true
}

fn mark_subtree_skipped(image: &mut Image, from: DentryIndex) {
    let subtree: Vec<DentryIndex> = image.preorder(from).collect();
    for dentry in subtree {
        image.dentry_mut(dentry).skipped = true;
    }
}

/// Whether a dentry's file type can exist on the target at all. Reparse
/// points a backend cannot represent (even as symlinks) skip the subtree.
fn dentry_is_supported(image: &Image, dentry: DentryIndex, supported: FeatureFlags) -> bool {
    let inode = image.inode_of(dentry);
    if inode.is_reparse_point() {
        if supported.contains(FeatureFlags::REPARSE_POINTS) {
            return true;
        }
        if supported.contains(FeatureFlags::SYMLINK_REPARSE_POINTS) && inode.is_symlink() {
            return true;
        }
        return false;
    }
    true
}

/// Compute `extraction_name` for every dentry under `root`, marking dentries
/// (and their descendants) as skipped where no legal name exists.
///
/// `invalid_sequence` is the per-extraction counter behind the
/// ` (invalid filename #N)` suffixes.
pub(crate) fn compute_extraction_names(
    image: &mut Image,
    root: DentryIndex,
    caps: &BackendCaps,
    flags: ExtractFlags,
    invalid_sequence: &mut u64,
) {
    let order: Vec<DentryIndex> = image.preorder(root).collect();
    // Names already claimed per parent directory, case-folded. Only used on
    // case-insensitive targets.
    let mut claimed: HashMap<DentryIndex, HashSet<String>> = HashMap::new();

    for dentry in order {
        // The extraction root keeps the caller-provided target name.
        if dentry == root || image.dentry(dentry).skipped {
            continue;
        }

        if !dentry_is_supported(image, dentry, caps.supported) {
            warn!(
                path = %image.full_path(dentry),
                "file type not supported by this extraction mode; not extracting"
            );
            mark_subtree_skipped(image, dentry);
            continue;
        }

        if is_dot_or_dotdot(&image.dentry(dentry).file_name) {
            // Images should never contain these, but damaged metadata can.
            warn!(
                path = %image.full_path(dentry),
                "skipping unexpected . or .. entry"
            );
            mark_subtree_skipped(image, dentry);
            continue;
        }

        let parent = image.dentry(dentry).parent;
        let folded = fold_name(&image.dentry(dentry).file_name);
        let mut conflict = false;
        if !caps.supports_case_sensitive_filenames {
            conflict = claimed
                .get(&parent)
                .is_some_and(|names| names.contains(&folded));
            if conflict && !flags.contains(ExtractFlags::ALL_CASE_CONFLICTS) {
                warn!(
                    path = %image.full_path(dentry),
                    "not extracting: has the same case-insensitive name as a sibling"
                );
                mark_subtree_skipped(image, dentry);
                continue;
            }
        }

        let mut name = image.dentry(dentry).file_name.clone();
        let valid = !conflict
            && file_name_valid(&mut name, caps.windows_rules, false)
            && String::from_utf16(&name).is_ok();

        let extraction_name = if valid {
            // file_name_valid(fix = false) leaves the name untouched.
            String::from_utf16_lossy(&name)
        } else if conflict || flags.contains(ExtractFlags::REPLACE_INVALID_FILENAMES) {
            file_name_valid(&mut name, caps.windows_rules, true);
            *invalid_sequence += 1;
            let fixed = format!(
                "{} (invalid filename #{})",
                String::from_utf16_lossy(&name),
                invalid_sequence
            );
            warn!(
                path = %image.full_path(dentry),
                replacement = %fixed,
                "filename not representable on this platform; extracting dummy name"
            );
            fixed
        } else {
            warn!(
                path = %image.full_path(dentry),
                "not extracting: invalid filename on this platform"
            );
            mark_subtree_skipped(image, dentry);
            continue;
        };

        if !caps.supports_case_sensitive_filenames {
            claimed
                .entry(parent)
                .or_default()
                .insert(fold_name(&extraction_name.encode_utf16().collect::<Vec<u16>>()));
        }
        image.dentry_mut(dentry).extraction_name = Some(extraction_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendCaps;
    use crate::tree::Inode;

    fn utf16(s: &str) -> Vec<u16> {
        s.encode_utf16().collect()
    }

    fn posix_caps() -> BackendCaps {
        BackendCaps {
            supported: FeatureFlags::SYMLINK_REPARSE_POINTS | FeatureFlags::HARD_LINKS,
            ..BackendCaps::posix_defaults("test")
        }
    }

    fn windows_caps() -> BackendCaps {
        BackendCaps {
            windows_rules: true,
            supports_case_sensitive_filenames: false,
            supported: FeatureFlags::REPARSE_POINTS,
            ..BackendCaps::posix_defaults("test-win")
        }
    }

    #[test]
    fn dot_entries_detected() {
        assert!(is_dot_or_dotdot(&utf16(".")));
        assert!(is_dot_or_dotdot(&utf16("..")));
        assert!(!is_dot_or_dotdot(&utf16("...")));
        assert!(!is_dot_or_dotdot(&utf16(".x")));
    }

    #[test]
    fn posix_forbids_only_slash_and_nul() {
        let mut name = utf16("a:b*c");
        assert!(file_name_valid(&mut name, false, false));
        let mut name = utf16("a/b");
        assert!(!file_name_valid(&mut name, false, false));
        file_name_valid(&mut name, false, true);
        assert_eq!(name, utf16("a?b"));
    }

    #[test]
    fn windows_rules_forbid_reserved_chars_and_trailing_dot() {
        for bad in ["a\\b", "a:b", "a*b", "a?b", "a\"b", "a<b", "a>b", "a|b", "dir."] {
            let mut name = utf16(bad);
            assert!(!file_name_valid(&mut name, true, false), "{bad}");
        }
        let mut name = utf16("trailing ");
        assert!(!file_name_valid(&mut name, true, false));
        file_name_valid(&mut name, true, true);
        assert_eq!(name[name.len() - 1], 0xfffd);
    }

    #[test]
    fn invalid_name_skips_subtree_without_replace_flag() {
        let mut image = Image::new(1, "test");
        let root = image.root();
        let bad = image.add_child(root, "bad/name", Inode::directory());
        let child = image.add_child(bad, "inner.txt", Inode::file(None));

        let mut seq = 0;
        compute_extraction_names(
            &mut image,
            root,
            &posix_caps(),
            ExtractFlags::empty(),
            &mut seq,
        );
        assert!(image.dentry(bad).skipped);
        assert!(image.dentry(child).skipped);
        assert_eq!(seq, 0);
    }

    #[test]
    fn invalid_name_replaced_with_counter() {
        let mut image = Image::new(1, "test");
        let root = image.root();
        let bad = image.add_child(root, "bad/name", Inode::file(None));

        let mut seq = 0;
        compute_extraction_names(
            &mut image,
            root,
            &posix_caps(),
            ExtractFlags::REPLACE_INVALID_FILENAMES,
            &mut seq,
        );
        assert_eq!(
            image.dentry(bad).extraction_name.as_deref(),
            Some("bad?name (invalid filename #1)")
        );
    }

    #[test]
    fn case_conflict_keeps_first_sibling() {
        let mut image = Image::new(1, "test");
        let root = image.root();
        let first = image.add_child(root, "Foo", Inode::file(None));
        let second = image.add_child(root, "foo", Inode::file(None));

        let mut seq = 0;
        compute_extraction_names(
            &mut image,
            root,
            &windows_caps(),
            ExtractFlags::ALL_CASE_CONFLICTS,
            &mut seq,
        );
        assert_eq!(image.dentry(first).extraction_name.as_deref(), Some("Foo"));
        assert_eq!(
            image.dentry(second).extraction_name.as_deref(),
            Some("foo (invalid filename #1)")
        );
    }

    #[test]
    fn case_conflict_skips_without_flag() {
        let mut image = Image::new(1, "test");
        let root = image.root();
        image.add_child(root, "Foo", Inode::file(None));
        let second = image.add_child(root, "foo", Inode::file(None));

        let mut seq = 0;
        compute_extraction_names(
            &mut image,
            root,
            &windows_caps(),
            ExtractFlags::empty(),
            &mut seq,
        );
        assert!(image.dentry(second).skipped);
    }

    #[test]
    fn unsupported_reparse_point_skipped_on_posix() {
        let mut image = Image::new(1, "test");
        let root = image.root();
        let mut junction = Inode::symlink();
        junction.reparse_tag = 0xa000_0123; // not a link the host can express
        let dentry = image.add_child(root, "junction", junction);

        let mut seq = 0;
        compute_extraction_names(
            &mut image,
            root,
            &posix_caps(),
            ExtractFlags::empty(),
            &mut seq,
        );
        assert!(image.dentry(dentry).skipped);
    }
}
