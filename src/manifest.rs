//! Package manifest parsing.
//!
//! A manifest is plain text: a `v0` header line followed by package file names
//! interleaved with checksum and size lines that are ignored here.

use serde::Serialize;

const MANIFEST_HEADER: &str = "v0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Manifest {
    pub is_valid: bool,
    pub packages: Vec<String>,
}

impl Manifest {
    pub fn invalid() -> Self {
        Self {
            is_valid: false,
            packages: Vec::new(),
        }
    }

    pub fn contains(&self, package: &str) -> bool {
        self.is_valid && self.packages.iter().any(|name| name == package)
    }
}

/// Never fails; malformed text yields `is_valid == false`. Only truly empty
/// lines are dropped, so a whitespace-only first line is not skipped.
pub fn parse(text: &str) -> Manifest {
    let mut lines = text
        .split(|c| c == '\r' || c == '\n')
        .filter(|line| !line.is_empty());

    let Some(header) = lines.next() else {
        return Manifest::invalid();
    };
    if !header.trim().eq_ignore_ascii_case(MANIFEST_HEADER) {
        return Manifest::invalid();
    }

    let packages = lines
        .map(str::trim)
        .filter(|line| is_package_line(line))
        .map(str::to_string)
        .collect();
    Manifest {
        is_valid: true,
        packages,
    }
}

fn is_package_line(line: &str) -> bool {
    line.contains('.') && line.to_ascii_lowercase().ends_with(".zip")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_packages_in_order() {
        let manifest = parse(
            "v0\r\nRobloxApp.zip\r\na1b2c3\r\n1234\r\n5678\r\nshaders.zip\r\nd4e5f6\r\n10\r\n20\r\n",
        );
        assert!(manifest.is_valid);
        assert_eq!(manifest.packages, vec!["RobloxApp.zip", "shaders.zip"]);
    }

    #[test]
    fn header_is_case_insensitive_and_trimmed() {
        assert!(parse("  V0  \nRobloxApp.zip\n").is_valid);
    }

    #[test]
    fn leading_blank_lines_are_skipped() {
        let manifest = parse("\n\r\n\nv0\nRobloxApp.zip");
        assert!(manifest.is_valid);
        assert_eq!(manifest.packages, vec!["RobloxApp.zip"]);
    }

    #[test]
    fn whitespace_only_first_line_is_the_header() {
        assert!(!parse("   \nv0\nRobloxApp.zip\n").is_valid);
        assert!(!parse("\t\r\nv0\r\nRobloxApp.zip\r\n").is_valid);
        let manifest = parse("v0\n   \n  RobloxApp.zip  \n");
        assert!(manifest.is_valid);
        assert_eq!(manifest.packages, vec!["RobloxApp.zip"]);
    }

    #[test]
    fn wrong_header_is_invalid() {
        for text in ["v1\nRobloxApp.zip\n", "RobloxApp.zip\nv0\n", "<html>", "", "\r\n\r\n"] {
            let manifest = parse(text);
            assert!(!manifest.is_valid, "{text:?} should be invalid");
            assert!(!manifest.contains("RobloxApp.zip"));
        }
    }

    #[test]
    fn only_zip_lines_with_a_dot_are_packages() {
        let manifest = parse("v0\nRobloxApp.ZIP\nzip\nnotes.txt\nWebView2RuntimeInstaller.zip\n.zip\n");
        assert_eq!(
            manifest.packages,
            vec!["RobloxApp.ZIP", "WebView2RuntimeInstaller.zip", ".zip"]
        );
    }

    #[test]
    fn contains_checks_exact_name() {
        let manifest = parse("v0\nRobloxStudio.zip\n");
        assert!(manifest.contains("RobloxStudio.zip"));
        assert!(!manifest.contains("RobloxApp.zip"));
    }
}
