use once_cell::sync::Lazy;
use regex::Regex;

/// `(major, minor, patch)` with absent components filled with zeros, so that
/// tuple ordering matches upstream's version ordering
pub type Version = (u32, u32, u32);

// Build-stage images and windows variants are never shippable artifacts
static EXCLUDE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:-builder$)|(?:windowsservercore)").expect("to create a regex from pattern")
});
static VARIANT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").expect("to create a regex from pattern"));

/// Decides which upstream tags are candidates for mirroring
///
/// The decision is a pure function of the tag string: the watched
/// major-version family, optionally carrying a variant suffix such as
/// `-alpine`, minus build-stage (`-builder`) and windows tags. An optional
/// minimum version cuts off releases older than what the plugin set
/// supports.
#[derive(Debug, Clone)]
pub struct TagFilter {
    family: u32,
    min_version: Option<Version>,
}

impl TagFilter {
    pub fn new(family: u32, min_version: Option<Version>) -> Self {
        Self {
            family,
            min_version,
        }
    }

    pub fn matches(&self, tag: &str) -> bool {
        if EXCLUDE_RE.is_match(tag) {
            return false;
        }

        let Some(version) = parse_version(tag) else {
            return false;
        };

        version.0 == self.family && self.min_version.map_or(true, |min| version >= min)
    }

    /// Filters the raw upstream listing down to the candidate set, sorted and
    /// deduplicated for a stable evaluation order across cycles
    pub fn candidates(&self, tags: &[String], only: Option<&str>) -> Vec<String> {
        let mut candidates: Vec<String> = tags
            .iter()
            .filter(|tag| self.matches(tag))
            .filter(|tag| only.map_or(true, |only| only == tag.as_str()))
            .cloned()
            .collect();
        candidates.sort();
        candidates.dedup();
        candidates
    }
}

/// Parses a version tag like `2`, `2.7` or `2.7.6-alpine`, filling absent
/// components with zeros. Returns `None` for anything that is not a version
/// tag (`latest`, `builder`, ...).
pub fn parse_version(tag: &str) -> Option<Version> {
    let (base, variant) = match tag.split_once('-') {
        Some((base, variant)) => (base, Some(variant)),
        None => (tag, None),
    };

    if let Some(variant) = variant {
        if !VARIANT_RE.is_match(variant) {
            return None;
        }
    }

    let mut parts = base.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = match parts.next() {
        Some(part) => part.parse().ok()?,
        None => 0,
    };
    let patch = match parts.next() {
        Some(part) => part.parse().ok()?,
        None => 0,
    };
    if parts.next().is_some() {
        return None;
    }

    Some((major, minor, patch))
}
