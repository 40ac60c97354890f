//! Typed candidate filters.
//!
//! A `FilterSet` decides whether a profile is an acceptable target for
//! a follow strategy. Filters only ever *exclude*: a candidate with no
//! cached profile passes, because excluding unknowns would starve
//! strategies on accounts the profile cache has never seen.

use serde::{Deserialize, Serialize};

use crate::store::CachedProfile;

/// Profile-based exclusion criteria for follow candidates.
///
/// All bounds are inclusive. Empty/None criteria never exclude.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSet {
    pub min_followers: Option<i64>,
    pub max_followers: Option<i64>,
    pub min_following: Option<i64>,
    pub max_following: Option<i64>,
    pub min_posts: Option<i64>,
    /// Only accept verified accounts.
    pub require_verified: bool,
    /// Reject verified accounts.
    pub skip_verified: bool,
    /// Reject profiles whose bio contains any of these, case
    /// insensitively.
    pub bio_blocklist: Vec<String>,
}

impl FilterSet {
    /// Whether a candidate passes. `None` profile always passes.
    pub fn accepts(&self, profile: Option<&CachedProfile>) -> bool {
        let Some(profile) = profile else {
            return true;
        };

        if let (Some(min), Some(count)) = (self.min_followers, profile.followers_count) {
            if count < min {
                return false;
            }
        }
        if let (Some(max), Some(count)) = (self.max_followers, profile.followers_count) {
            if count > max {
                return false;
            }
        }
        if let (Some(min), Some(count)) = (self.min_following, profile.following_count) {
            if count < min {
                return false;
            }
        }
        if let (Some(max), Some(count)) = (self.max_following, profile.following_count) {
            if count > max {
                return false;
            }
        }
        if let (Some(min), Some(count)) = (self.min_posts, profile.post_count) {
            if count < min {
                return false;
            }
        }

        if self.require_verified && !profile.verified {
            return false;
        }
        if self.skip_verified && profile.verified {
            return false;
        }

        if !self.bio_blocklist.is_empty() {
            if let Some(bio) = &profile.bio {
                let bio = bio.to_lowercase();
                if self
                    .bio_blocklist
                    .iter()
                    .any(|word| bio.contains(&word.to_lowercase()))
                {
                    return false;
                }
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn profile(followers: i64, following: i64, posts: i64) -> CachedProfile {
        CachedProfile {
            username: "candidate".into(),
            display_name: None,
            bio: None,
            followers_count: Some(followers),
            following_count: Some(following),
            post_count: Some(posts),
            verified: false,
            avatar_url: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_empty_filter_accepts_everything() {
        let filters = FilterSet::default();
        assert!(filters.accepts(None));
        assert!(filters.accepts(Some(&profile(0, 0, 0))));
    }

    #[test]
    fn test_unknown_profile_passes() {
        let filters = FilterSet {
            min_followers: Some(1000),
            ..Default::default()
        };
        assert!(filters.accepts(None));
    }

    #[test]
    fn test_follower_bounds() {
        let filters = FilterSet {
            min_followers: Some(10),
            max_followers: Some(100),
            ..Default::default()
        };
        assert!(!filters.accepts(Some(&profile(5, 0, 0))));
        assert!(filters.accepts(Some(&profile(10, 0, 0))));
        assert!(filters.accepts(Some(&profile(100, 0, 0))));
        assert!(!filters.accepts(Some(&profile(500, 0, 0))));
    }

    #[test]
    fn test_missing_count_never_excludes() {
        let filters = FilterSet {
            min_followers: Some(10),
            ..Default::default()
        };
        let mut p = profile(0, 0, 0);
        p.followers_count = None;
        assert!(filters.accepts(Some(&p)));
    }

    #[test]
    fn test_verified_gates() {
        let mut p = profile(50, 50, 50);
        p.verified = true;

        let require = FilterSet {
            require_verified: true,
            ..Default::default()
        };
        assert!(require.accepts(Some(&p)));
        assert!(!require.accepts(Some(&profile(50, 50, 50))));

        let skip = FilterSet {
            skip_verified: true,
            ..Default::default()
        };
        assert!(!skip.accepts(Some(&p)));
        assert!(skip.accepts(Some(&profile(50, 50, 50))));
    }

    #[test]
    fn test_bio_blocklist_case_insensitive() {
        let filters = FilterSet {
            bio_blocklist: vec!["crypto".into()],
            ..Default::default()
        };

        let mut p = profile(50, 50, 50);
        p.bio = Some("All about CRYPTO trading".into());
        assert!(!filters.accepts(Some(&p)));

        p.bio = Some("photography and hiking".into());
        assert!(filters.accepts(Some(&p)));

        // No bio, nothing to match
        p.bio = None;
        assert!(filters.accepts(Some(&p)));
    }
}
