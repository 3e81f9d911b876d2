//! Bidirectional mapping between `(identifier, version)` and the on-disk
//! versioned filename.
//!
//! `core/name.exe` at `1.2.3-beta` is stored as `core/name_v1-2-3-beta.exe`:
//! the final path segment is split at its first dot and `_v` plus the version
//! (dots mapped to dashes) is inserted before the extension. The mapping is
//! lossless for identifiers with at most one extension dot in the final
//! segment.

use std::sync::LazyLock;

use regex::Regex;

use crate::version;

/// Version marker inside a versioned filename: `_vM-N-P` with an optional
/// lowercase tag.
static VERSION_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_v\d+-\d+-\d+(-[a-z]+)?").unwrap());

/// Encode an identifier and version into the on-disk versioned path.
pub fn versioned_path(identifier: &str, version: &str) -> String {
    let (dir, name) = split_final_segment(identifier);
    let encoded = version.replace('.', "-");
    let versioned_name = match name.find('.') {
        Some(dot) => format!("{}_v{}{}", &name[..dot], encoded, &name[dot..]),
        None => format!("{name}_v{encoded}"),
    };
    join_segments(dir, &versioned_name)
}

/// Decode a versioned path back into `(identifier, version)`.
///
/// Returns `None` when the final segment carries no well-formed version
/// marker or the excised version does not parse.
pub fn parse_versioned_path(path: &str) -> Option<(String, String)> {
    let (dir, name) = split_final_segment(path);
    let marker = VERSION_MARKER.find(name)?;

    let mut bare_name = String::with_capacity(name.len());
    bare_name.push_str(&name[..marker.start()]);
    bare_name.push_str(&name[marker.end()..]);

    // Strip the "_v" prefix, then map the first three dashes back to dots;
    // a fourth dash starts the pre-release tag and is kept.
    let encoded = &name[marker.start() + 2..marker.end()];
    let mut parts = encoded.splitn(4, '-');
    let mut decoded = format!(
        "{}.{}.{}",
        parts.next()?,
        parts.next()?,
        parts.next()?
    );
    if let Some(tag) = parts.next() {
        decoded.push('-');
        decoded.push_str(tag);
    }

    let normalized = version::normalize(&decoded).ok()?;
    Some((join_segments(dir, &bare_name), normalized))
}

fn split_final_segment(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(slash) => (&path[..slash], &path[slash + 1..]),
        None => ("", path),
    }
}

fn join_segments(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_owned()
    } else {
        format!("{dir}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_with_extension() {
        assert_eq!(
            versioned_path("dir/name.exe", "1.2.3-beta"),
            "dir/name_v1-2-3-beta.exe"
        );
    }

    #[test]
    fn encodes_without_extension() {
        assert_eq!(versioned_path("core/name", "0.1.0"), "core/name_v0-1-0");
    }

    #[test]
    fn encodes_at_first_dot_only() {
        assert_eq!(
            versioned_path("ui/app.tar.gz", "2.0.0"),
            "ui/app_v2-0-0.tar.gz"
        );
    }

    #[test]
    fn dots_in_directory_components_are_preserved() {
        assert_eq!(
            versioned_path("all/ui.related/app.zip", "1.0.0"),
            "all/ui.related/app_v1-0-0.zip"
        );
    }

    #[test]
    fn decodes_with_pre_release_tag() {
        assert_eq!(
            parse_versioned_path("dir/name_v1-2-3-beta.exe"),
            Some(("dir/name.exe".to_owned(), "1.2.3-beta".to_owned()))
        );
    }

    #[test]
    fn decodes_without_extension() {
        assert_eq!(
            parse_versioned_path("core/name_v0-1-0"),
            Some(("core/name".to_owned(), "0.1.0".to_owned()))
        );
    }

    #[test]
    fn rejects_unversioned_paths() {
        assert_eq!(parse_versioned_path("core/name.exe"), None);
        assert_eq!(parse_versioned_path("stable.json"), None);
    }

    #[test]
    fn rejects_malformed_markers() {
        assert_eq!(parse_versioned_path("core/name_v1-2.exe"), None);
        assert_eq!(parse_versioned_path("core/name_vX-0-0.exe"), None);
    }

    #[test]
    fn round_trips() {
        for (id, v) in [
            ("dir/name.exe", "1.2.3-beta"),
            ("core/name", "0.0.0"),
            ("linux_amd64/core/portd", "1.0.12"),
            ("intel/geoip.mmdb", "4.1.2-staging"),
        ] {
            let encoded = versioned_path(id, v);
            assert_eq!(
                parse_versioned_path(&encoded),
                Some((id.to_owned(), v.to_owned())),
                "round trip failed for {id} {v}"
            );
        }
    }
}
