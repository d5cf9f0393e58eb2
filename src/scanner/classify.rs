use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Build category a tag belongs to, derived from its name prefix.
/// Every tag lands in exactly one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Release,
    Weekly,
    Daily,
    Experimental,
    Latest,
    Other,
}

impl Category {
    /// Order categories appear in the flat tag list shown to users.
    pub const DISPLAY_ORDER: [Category; 6] = [
        Category::Latest,
        Category::Experimental,
        Category::Daily,
        Category::Weekly,
        Category::Release,
        Category::Other,
    ];

    pub fn from_tag_name(name: &str) -> Category {
        // "latest" and "exp" are checked before the single-letter prefixes;
        // neither collides with r/w/d but the intent reads better this way.
        if name.starts_with("latest") {
            Category::Latest
        } else if name.starts_with("exp") {
            Category::Experimental
        } else if name.starts_with('r') {
            Category::Release
        } else if name.starts_with('w') {
            Category::Weekly
        } else if name.starts_with('d') {
            Category::Daily
        } else {
            Category::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Release => "release",
            Category::Weekly => "weekly",
            Category::Daily => "daily",
            Category::Experimental => "experimental",
            Category::Latest => "latest",
            Category::Other => "other",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `_`-separated component of a new-format tag version.
/// Declaration order matters: a numeric component outranks a textual one
/// in the derived ordering.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum VersionPart {
    Text(String),
    Number(u64),
}

impl VersionPart {
    fn parse(s: &str) -> VersionPart {
        match s.parse::<u64>() {
            Ok(n) => VersionPart::Number(n),
            Err(_) => VersionPart::Text(s.to_string()),
        }
    }
}

/// Whether a tag uses the underscore-delimited new format. `latest_*`
/// aliases carry underscores but are not version tags.
pub fn is_new_style(name: &str) -> bool {
    name.contains('_') && !name.starts_with("latest_")
}

/// Version key of a new-format tag: everything after the leading type
/// letters, split on `_`, numeric where possible. `r21_0_3` → [21, 0, 3];
/// `w_2023_05` → [2023, 5]; `exp_random` → ["random"].
fn version_key(name: &str) -> Vec<VersionPart> {
    let rest = name.trim_start_matches(|c: char| c.is_ascii_alphabetic());
    rest.split('_')
        .filter(|c| !c.is_empty())
        .map(VersionPart::parse)
        .collect()
}

/// Version comparison with pre-release semantics: keys compare
/// componentwise; when one key is a prefix of the other, a trailing
/// numeric component counts as a later build (`r21_0_3_1` > `r21_0_3`)
/// while a trailing textual component counts as a pre-release
/// (`r21_0_3_rc1` < `r21_0_3`).
fn compare_version_keys(a: &[VersionPart], b: &[VersionPart]) -> Ordering {
    let shared = a.len().min(b.len());
    for i in 0..shared {
        match a[i].cmp(&b[i]) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    match a.len().cmp(&b.len()) {
        Ordering::Equal => Ordering::Equal,
        Ordering::Greater => match a[shared] {
            VersionPart::Number(_) => Ordering::Greater,
            VersionPart::Text(_) => Ordering::Less,
        },
        Ordering::Less => match b[shared] {
            VersionPart::Number(_) => Ordering::Less,
            VersionPart::Text(_) => Ordering::Greater,
        },
    }
}

/// Legacy tags compare as plain strings, except that a bare 4-character
/// release tag (`r170` = 17.0 final) is decorated so it outranks its own
/// release candidates (`r170rc2`).
fn legacy_sort_key(name: &str) -> String {
    if name.len() == 4 && name.starts_with('r') {
        return format!("{}zzz", name);
    }
    name.to_string()
}

/// Two-tier tag-name ordering. `Greater` means `a` ranks above `b`.
///
/// New-format tags always outrank legacy-format tags regardless of any
/// numeric content: this is the format-migration cutover, not a version
/// comparison. Within a tier, new-format tags compare as version keys and
/// legacy tags as decorated strings.
pub fn compare_tag_names(a: &str, b: &str) -> Ordering {
    match (is_new_style(a), is_new_style(b)) {
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (true, true) => compare_version_keys(&version_key(a), &version_key(b)),
        (false, false) => legacy_sort_key(a).cmp(&legacy_sort_key(b)),
    }
}

/// Human-readable description for a daily/weekly/release tag, from either
/// tag shape. Unrecognized shapes yield no description.
pub fn describe_tag(name: &str) -> Option<String> {
    if is_new_style(name) {
        describe_new_style(name)
    } else {
        describe_legacy(name)
    }
}

fn describe_new_style(name: &str) -> Option<String> {
    let mut components = name.split('_');
    let first = components.next()?;
    let type_letter = first.chars().next()?;
    if !type_letter.is_ascii_alphabetic() {
        return None;
    }
    // The first component may carry the major version ("r21_0_3") or be
    // the bare type letter ("w_2023_05").
    let mut parts: Vec<&str> = Vec::new();
    if first.len() > 1 {
        parts.push(&first[1..]);
    }
    parts.extend(components);

    match type_letter {
        'r' => {
            let major = parts.first()?;
            let minor = parts.get(1)?;
            let mut desc = format!("Release {}.{}", major, minor);
            if let Some(patch) = parts.get(2) {
                desc.push('.');
                desc.push_str(patch);
            }
            if parts.len() > 3 {
                desc.push('.');
                desc.push_str(&parts[3..].join("_"));
            }
            Some(desc)
        }
        'w' => {
            let year = parts.first()?;
            let week = parts.get(1)?;
            Some(format!("Weekly {}_{}", year, week))
        }
        'd' => {
            let year = parts.first()?;
            let month = parts.get(1)?;
            let day = parts.get(2)?;
            Some(format!("Daily {}_{}_{}", year, month, day))
        }
        _ => None,
    }
}

fn describe_legacy(name: &str) -> Option<String> {
    let type_letter = name.chars().next()?;
    if !type_letter.is_ascii_alphabetic() {
        return None;
    }
    let rest = &name[1..];
    if rest.is_empty() || !rest.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    match type_letter {
        'r' if rest.len() >= 2 => {
            let major = &rest[..2];
            let minor = &rest[2..];
            if minor.is_empty() {
                Some(format!("Release {}", major))
            } else {
                Some(format!("Release {}.{}", major, minor))
            }
        }
        'w' if rest.len() >= 5 => {
            Some(format!("Weekly {}_{}", &rest[..4], &rest[4..]))
        }
        'd' if rest.len() >= 7 => Some(format!(
            "Daily {}_{}_{}",
            &rest[..4],
            &rest[4..6],
            &rest[6..]
        )),
        _ => None,
    }
}
