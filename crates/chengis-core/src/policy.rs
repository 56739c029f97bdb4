//! Policy types and the pure matching logic behind them.
//!
//! Storage and evaluation order live in the persistence layer and the
//! runner's policy gate; everything here is side-effect free so it can be
//! tested without a database.

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::{ResourceId, Result};

/// Outcome of a policy rule match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyAction {
    Allow,
    Deny,
}

/// A typed policy rule. Org scoping, priority and identity are carried by
/// the surrounding policy row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PolicyRule {
    /// Allow or deny builds on matching branches.
    BranchRestriction {
        branches: Vec<String>,
        action: PolicyAction,
    },
    /// Deny builds whose start time falls inside the window.
    /// The window is expressed in minutes-from-midnight at a fixed UTC
    /// offset; windows may wrap past midnight.
    TimeWindow {
        deny_start_minutes: u32,
        deny_end_minutes: u32,
        utc_offset_minutes: i32,
    },
    /// Per-org allow/deny list of image glob patterns.
    DockerImage { patterns: Vec<ImagePattern> },
    /// Only plugins explicitly marked allowed may load.
    PluginTrust { plugin: String, allowed: bool },
}

/// One entry in a docker-image policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagePattern {
    /// Glob over the image reference, e.g. `registry.corp/*` or `alpine:*`.
    pub pattern: String,
    pub action: PolicyAction,
}

/// Why a policy denied a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDenial {
    pub policy_id: ResourceId,
    pub reason: String,
}

/// Check whether `branch` matches any of the given patterns.
/// Supports a single `*` wildcard per pattern.
pub fn branch_matches(branch: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| {
        if let Some(idx) = pattern.find('*') {
            let (prefix, rest) = pattern.split_at(idx);
            let suffix = &rest[1..];
            if suffix.contains('*') {
                // More than one wildcard falls back to exact match.
                branch == pattern
            } else {
                branch.len() >= prefix.len() + suffix.len()
                    && branch.starts_with(prefix)
                    && branch.ends_with(suffix)
            }
        } else {
            branch == pattern
        }
    })
}

/// Check whether an image reference matches a policy glob.
/// `registry/*` matches any image under that registry path and
/// `name:*` matches any tag of `name`; a bare `*` matches everything.
pub fn image_matches(image: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(idx) = pattern.find('*') {
        let (prefix, rest) = pattern.split_at(idx);
        let suffix = &rest[1..];
        image.len() >= prefix.len() + suffix.len()
            && image.starts_with(prefix)
            && image.ends_with(suffix)
    } else {
        image == pattern
    }
}

/// Evaluate a docker-image pattern list against one image.
///
/// Any matching deny blocks; otherwise the first matching allow permits;
/// otherwise the image is blocked. Callers apply the allowed-by-default
/// rule when no docker-image policy exists for the org at all.
pub fn evaluate_image_patterns(image: &str, patterns: &[ImagePattern]) -> PolicyAction {
    if patterns
        .iter()
        .any(|p| p.action == PolicyAction::Deny && image_matches(image, &p.pattern))
    {
        return PolicyAction::Deny;
    }
    if patterns
        .iter()
        .any(|p| p.action == PolicyAction::Allow && image_matches(image, &p.pattern))
    {
        return PolicyAction::Allow;
    }
    PolicyAction::Deny
}

/// True when `now` falls inside the denied window.
pub fn in_time_window(
    now: DateTime<Utc>,
    deny_start_minutes: u32,
    deny_end_minutes: u32,
    utc_offset_minutes: i32,
) -> bool {
    let local = now + chrono::Duration::minutes(utc_offset_minutes as i64);
    let minute_of_day = local.hour() * 60 + local.minute();
    if deny_start_minutes <= deny_end_minutes {
        (deny_start_minutes..deny_end_minutes).contains(&minute_of_day)
    } else {
        // Window wraps past midnight.
        minute_of_day >= deny_start_minutes || minute_of_day < deny_end_minutes
    }
}

/// Consulted by containerised executors before pulling an image.
#[async_trait]
pub trait ImagePolicyCheck: Send + Sync {
    /// Returns `Err(Error::PolicyDenied {..})` when the image is blocked
    /// for the org.
    async fn allow_image(&self, org_id: ResourceId, image: &str) -> Result<()>;
}

/// Permissive check used when no policy store is wired up.
pub struct AllowAllImages;

#[async_trait]
impl ImagePolicyCheck for AllowAllImages {
    async fn allow_image(&self, _org_id: ResourceId, _image: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn branch_glob_prefix_and_suffix() {
        let patterns = vec!["release/*".to_string(), "*-hotfix".to_string()];
        assert!(branch_matches("release/1.0", &patterns));
        assert!(branch_matches("urgent-hotfix", &patterns));
        assert!(!branch_matches("main", &patterns));
    }

    #[test]
    fn branch_exact_match() {
        assert!(branch_matches("main", &["main".to_string()]));
        assert!(!branch_matches("maintenance", &["main".to_string()]));
    }

    #[test]
    fn image_registry_glob() {
        assert!(image_matches("registry.corp/team/app:1.0", "registry.corp/*"));
        assert!(image_matches("alpine:3.19", "alpine:*"));
        assert!(!image_matches("docker.io/alpine:3.19", "registry.corp/*"));
    }

    #[test]
    fn deny_wins_over_allow() {
        let patterns = vec![
            ImagePattern {
                pattern: "registry.corp/*".into(),
                action: PolicyAction::Allow,
            },
            ImagePattern {
                pattern: "registry.corp/banned/*".into(),
                action: PolicyAction::Deny,
            },
        ];
        assert_eq!(
            evaluate_image_patterns("registry.corp/banned/thing:1", &patterns),
            PolicyAction::Deny
        );
        assert_eq!(
            evaluate_image_patterns("registry.corp/team/app:1", &patterns),
            PolicyAction::Allow
        );
    }

    #[test]
    fn unmatched_image_is_denied_when_policy_exists() {
        let patterns = vec![ImagePattern {
            pattern: "alpine:*".into(),
            action: PolicyAction::Allow,
        }];
        assert_eq!(
            evaluate_image_patterns("debian:12", &patterns),
            PolicyAction::Deny
        );
    }

    #[test]
    fn time_window_plain_and_wrapping() {
        let at = |h: u32, m: u32| Utc.with_ymd_and_hms(2026, 3, 1, h, m, 0).unwrap();
        // 09:00-17:00 UTC window.
        assert!(in_time_window(at(12, 0), 540, 1020, 0));
        assert!(!in_time_window(at(18, 0), 540, 1020, 0));
        // 22:00-06:00 wraps midnight.
        assert!(in_time_window(at(23, 30), 1320, 360, 0));
        assert!(in_time_window(at(3, 0), 1320, 360, 0));
        assert!(!in_time_window(at(12, 0), 1320, 360, 0));
    }

    #[test]
    fn time_window_respects_offset() {
        let noon_utc = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        // 13:00-14:00 at UTC+1 covers 12:00 UTC.
        assert!(in_time_window(noon_utc, 780, 840, 60));
        assert!(!in_time_window(noon_utc, 780, 840, 0));
    }
}
