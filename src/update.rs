//! Release feed and version comparison
//!
//! On every successful connection the session asks a [`ReleaseFeed`] for the
//! latest node release and compares it with what the node reports.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Latest-release lookup
#[async_trait]
pub trait ReleaseFeed: Send + Sync {
    /// Latest released version string, e.g. `"v3.6.1"`
    async fn latest_version(&self) -> Result<String, String>;
}

/// Information about an available node update
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInfo {
    /// Whether an update is available
    pub available: bool,
    /// Version the node reports
    pub current_version: String,
    /// Latest version from the release feed
    pub latest_version: String,
}

/// GitHub release response structure
#[derive(Debug, Deserialize)]
struct GitHubRelease {
    tag_name: String,
}

/// Reads the latest release of a GitHub repository
#[derive(Debug, Clone)]
pub struct GitHubReleaseFeed {
    url: String,
}

impl Default for GitHubReleaseFeed {
    fn default() -> Self {
        Self::new("MyHush/hush3")
    }
}

impl GitHubReleaseFeed {
    /// `repo` is `owner/name`
    pub fn new(repo: &str) -> Self {
        Self {
            url: format!("https://api.github.com/repos/{}/releases/latest", repo),
        }
    }
}

#[async_trait]
impl ReleaseFeed for GitHubReleaseFeed {
    async fn latest_version(&self) -> Result<String, String> {
        let client = reqwest::Client::builder()
            .user_agent("Hush-Wallet")
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {}", e))?;

        let response = client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| format!("Failed to fetch release info: {}", e))?;

        if !response.status().is_success() {
            return Err(format!("GitHub API returned status: {}", response.status()));
        }

        let release: GitHubRelease = response
            .json()
            .await
            .map_err(|e| format!("Failed to parse release info: {}", e))?;

        Ok(release.tag_name)
    }
}

/// Compare the node's version against the feed
pub async fn check_for_update(feed: &dyn ReleaseFeed, node_version: &str) -> Result<UpdateInfo, String> {
    let latest = feed.latest_version().await?;
    let current = normalize_version(node_version);
    let latest_version = normalize_version(&latest);

    Ok(UpdateInfo {
        available: is_newer_version(&latest_version, &current),
        current_version: current,
        latest_version,
    })
}

/// Strip a leading `v` and turn a packed numeric client version
/// (`3060050` = 3.6.0 build 50) into dotted form
pub fn normalize_version(version: &str) -> String {
    let version = version.trim().trim_start_matches('v');
    if version.len() >= 5 && version.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(packed) = version.parse::<u64>() {
            return format!(
                "{}.{}.{}",
                packed / 1_000_000,
                (packed / 10_000) % 100,
                (packed / 100) % 100
            );
        }
    }
    version.to_string()
}

/// Parsed semantic version with optional pre-release tag
#[derive(Debug, Clone)]
struct SemVer {
    major: u32,
    minor: u32,
    patch: u32,
    /// Pre-release tag (e.g., "rc7", "beta1", "alpha"). None means final release.
    prerelease: Option<String>,
}

impl SemVer {
    fn parse(version: &str) -> Option<Self> {
        let (version_part, prerelease) = match version.split_once('-') {
            Some((v, pre)) => (v, Some(pre.to_string())),
            None => (version, None),
        };

        let parts: Vec<&str> = version_part.split('.').collect();
        if parts.len() < 2 {
            return None;
        }

        Some(SemVer {
            major: parts.first()?.parse().ok()?,
            minor: parts.get(1)?.parse().ok()?,
            patch: parts.get(2).and_then(|p| p.parse().ok()).unwrap_or(0),
            prerelease,
        })
    }

    fn numbers(&self) -> (u32, u32, u32) {
        (self.major, self.minor, self.patch)
    }

    /// None (final release) sorts after any pre-release. Tags with the same
    /// alphabetic prefix compare by their numeric suffix (rc10 > rc9).
    fn compare_prerelease(a: &Option<String>, b: &Option<String>) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        match (a, b) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => {
                let split = |s: &str| {
                    let prefix = s.trim_end_matches(|c: char| c.is_ascii_digit()).to_string();
                    let num: u32 = s[prefix.len()..].parse().unwrap_or(0);
                    (prefix, num)
                };
                let (a_prefix, a_num) = split(a);
                let (b_prefix, b_num) = split(b);

                if a_prefix == b_prefix {
                    a_num.cmp(&b_num)
                } else {
                    a.cmp(b)
                }
            }
        }
    }
}

/// Returns true if `latest` is newer than `current`
pub fn is_newer_version(latest: &str, current: &str) -> bool {
    let Some(latest_ver) = SemVer::parse(latest) else {
        return false;
    };
    let Some(current_ver) = SemVer::parse(current) else {
        // Unparseable current version, assume an update is available
        return true;
    };

    match latest_ver.numbers().cmp(&current_ver.numbers()) {
        std::cmp::Ordering::Equal => {
            SemVer::compare_prerelease(&latest_ver.prerelease, &current_ver.prerelease)
                == std::cmp::Ordering::Greater
        }
        ordering => ordering == std::cmp::Ordering::Greater,
    }
}
