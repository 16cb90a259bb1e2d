use chrono::{DateTime, Utc};
use strum::{Display, EnumString};

/// Outcome of a tag's most recent build attempt
#[derive(sqlx::Type, Debug, Display, Clone, Copy, Default, EnumString, PartialEq, Eq)]
pub enum BuildStatus {
    /// Tag has been observed upstream but no build has completed yet
    #[default]
    NeverBuilt,

    /// Last attempt built and was confirmed pushed to every destination
    Success,

    /// Last attempt failed; the stale digest keeps the tag due for retry
    Failed,
}

/// One row per upstream tag ever observed; never deleted by normal operation
#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct TagRecord {
    pub name: String,
    /// Digest of the most recently *built* state; may lag `last_seen_digest`
    /// while a build is owed
    pub last_digest: Option<String>,
    pub last_seen_digest: Option<String>,
    pub last_build_status: BuildStatus,
    pub last_build_time: Option<DateTime<Utc>>,
}
