//! Line-oriented pattern extraction.
//!
//! None of these functions parse PHP or wikitext. Each one recognizes a single
//! textual shape on a single line (or page body) and reports what it captured.
//! Calls split across lines, string concatenation, variables and heredocs are
//! invisible to them.

use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::name::{ExtensionKind, ExtensionName};

const SINGLE_QUOTED: &str = r#"'((?:[^'\\]|\\.)*)'"#;
const DOUBLE_QUOTED: &str = r#""((?:[^"\\]|\\.)*)""#;

static COMMENT_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:#|//)").expect("valid comment regex"));

static EXTENSION_PAGE_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*https?://[^/\s]+/(?:wiki/|w/index\.php\?title=)(?:Special:MyLanguage/)?(?:Extension|Skin):([^?#&\s]+)",
    )
    .expect("valid extension page regex")
});

static LOAD_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\bwfLoad(Extension|Skin)\s*\(\s*(?:{SINGLE_QUOTED}|{DOUBLE_QUOTED})"
    ))
    .expect("valid load call regex")
});

static LOAD_ARRAY_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bwfLoad(Extension|Skin)s\s*\(\s*(?:\[|array\s*\()([^\])]*)")
        .expect("valid load array regex")
});

static QUOTED_STRING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("{SINGLE_QUOTED}|{DOUBLE_QUOTED}")).expect("valid quoted string regex")
});

static INCLUDE_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r#"(?i)\b(?:require|include)_once\b[^'";]*?(?:{SINGLE_QUOTED}|{DOUBLE_QUOTED})"#
    ))
    .expect("valid include regex")
});

static PACKAGE_PATH_SEGMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:^|[/\\])(extensions|skins)[/\\]([^/\\]+)[/\\]")
        .expect("valid package path regex")
});

static SITE_NAME_ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"\$wgSitename\s*=\s*(?:{SINGLE_QUOTED}|{DOUBLE_QUOTED})"
    ))
    .expect("valid site name regex")
});

static VERSION_ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"\$wgVersion\s*=\s*(?:{SINGLE_QUOTED}|{DOUBLE_QUOTED})"
    ))
    .expect("valid version regex")
});

static VERSION_DEFINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r#"(?i)\bdefine\s*\(\s*['"]MW_VERSION['"]\s*,\s*(?:{SINGLE_QUOTED}|{DOUBLE_QUOTED})"#
    ))
    .expect("valid version define regex")
});

static DOWNLOAD_EXTENSION_TEMPLATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\{\{\s*WikimediaDownload\s*\|\s*([^|}]+?)\s*(?:\||\}\})")
        .expect("valid download template regex")
});

static DOWNLOAD_SKIN_TEMPLATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\{\{\s*WikimediaDownloadSkin\s*\|\s*([^|}]+?)\s*(?:\||\}\})")
        .expect("valid download skin template regex")
});

/// `#` or `//` as the first non-whitespace token. Trailing comments after
/// code are not recognized.
pub fn is_comment_line(line: &str) -> bool {
    COMMENT_LINE.is_match(line)
}

/// Package name from a manifest `url` pointing at its documentation page,
/// e.g. `https://www.mediawiki.org/wiki/Extension:Syntax_Highlight` gives
/// `Syntax Highlight`. Query strings and fragments end the name.
pub fn extension_page_name(url: &str) -> Option<String> {
    let captures = EXTENSION_PAGE_URL.captures(url)?;
    let name = captures.get(1)?.as_str().replace('_', " ");
    let name = name.trim();
    (!name.is_empty()).then(|| name.to_string())
}

/// `wfLoadExtension('X')` / `wfLoadSkin("X")` calls on one line, plus the
/// single-line array forms `wfLoadExtensions([ 'A', 'B' ])`. Only literal
/// string arguments are seen.
pub fn load_calls(line: &str) -> Vec<(ExtensionKind, String)> {
    let mut found = Vec::new();
    for captures in LOAD_CALL.captures_iter(line) {
        let Some(kind) = captures.get(1).and_then(|m| ExtensionKind::parse(m.as_str())) else {
            continue;
        };
        if let Some(value) = quoted_value(&captures, 2) {
            push_non_empty(&mut found, kind, value);
        }
    }
    for captures in LOAD_ARRAY_CALL.captures_iter(line) {
        let Some(kind) = captures.get(1).and_then(|m| ExtensionKind::parse(m.as_str())) else {
            continue;
        };
        let Some(items) = captures.get(2) else {
            continue;
        };
        for item in QUOTED_STRING.captures_iter(items.as_str()) {
            if let Some(value) = quoted_value(&item, 1) {
                push_non_empty(&mut found, kind, value);
            }
        }
    }
    found
}

/// `require_once` / `include_once` whose first quoted argument contains an
/// `extensions/<X>/` or `skins/<X>/` segment. Paths built from variables
/// (`"$IP/extensions/X/X.php"`) match because only the literal text counts.
pub fn include_references(line: &str) -> Vec<(ExtensionKind, String)> {
    let mut found = Vec::new();
    for captures in INCLUDE_CALL.captures_iter(line) {
        let Some(path) = quoted_value(&captures, 1) else {
            continue;
        };
        let Some(segment) = PACKAGE_PATH_SEGMENT.captures(&path) else {
            continue;
        };
        let kind = match segment.get(1).map(|m| m.as_str().to_ascii_lowercase()) {
            Some(folder) if folder == "extensions" => ExtensionKind::Extension,
            Some(folder) if folder == "skins" => ExtensionKind::Skin,
            _ => continue,
        };
        if let Some(name) = segment.get(2) {
            push_non_empty(&mut found, kind, name.as_str().to_string());
        }
    }
    found
}

/// Value of `$wgSitename = '...'` on this line. With several assignments on
/// one line the last one is returned.
pub fn site_name_assignment(line: &str) -> Option<String> {
    last_quoted_match(&SITE_NAME_ASSIGNMENT, line)
}

/// Value of `$wgVersion = '...'` on this line.
pub fn version_assignment(line: &str) -> Option<String> {
    last_quoted_match(&VERSION_ASSIGNMENT, line)
}

/// Value of `define( 'MW_VERSION', '...' )` on this line.
pub fn version_define(line: &str) -> Option<String> {
    last_quoted_match(&VERSION_DEFINE, line)
}

/// Download-template markers on a package documentation page:
/// `{{WikimediaDownload|X}}` names extension `X`,
/// `{{WikimediaDownloadSkin|X}}` names skin `X`. Only the first template
/// parameter is taken, and only the first occurrence of each template.
/// A named first parameter such as `phabricator=x` names nothing.
pub fn download_redirect_targets(content: &str) -> Vec<ExtensionName> {
    let mut targets = Vec::new();
    for (pattern, kind) in [
        (&DOWNLOAD_EXTENSION_TEMPLATE, ExtensionKind::Extension),
        (&DOWNLOAD_SKIN_TEMPLATE, ExtensionKind::Skin),
    ] {
        let target = pattern
            .captures(content)
            .and_then(|captures| captures.get(1))
            .map(|m| m.as_str().trim())
            .filter(|value| !value.contains('='))
            .and_then(|value| ExtensionName::new(value, kind).ok());
        if let Some(target) = target {
            targets.push(target);
        }
    }
    targets
}

fn last_quoted_match(pattern: &Regex, line: &str) -> Option<String> {
    pattern
        .captures_iter(line)
        .filter_map(|captures| quoted_value(&captures, 1))
        .last()
}

/// Reads the single- or double-quoted alternative starting at `group`.
fn quoted_value(captures: &Captures<'_>, group: usize) -> Option<String> {
    if let Some(single) = captures.get(group) {
        return Some(unescape_php(single.as_str(), '\''));
    }
    captures
        .get(group + 1)
        .map(|double| unescape_php(double.as_str(), '"'))
}

fn push_non_empty(found: &mut Vec<(ExtensionKind, String)>, kind: ExtensionKind, value: String) {
    let value = value.trim();
    if !value.is_empty() {
        found.push((kind, value.to_string()));
    }
}

fn unescape_php(raw: &str, quote: char) -> String {
    let mut output = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            output.push(ch);
            continue;
        }
        match chars.next() {
            Some(next) if next == quote || next == '\\' => output.push(next),
            Some('n') if quote == '"' => output.push('\n'),
            Some('t') if quote == '"' => output.push('\t'),
            Some('r') if quote == '"' => output.push('\r'),
            Some('$') if quote == '"' => output.push('$'),
            Some(next) => {
                output.push('\\');
                output.push(next);
            }
            None => output.push('\\'),
        }
    }
    output
}
