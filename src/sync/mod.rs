use async_trait::async_trait;
use chrono::Utc;
use tokio::time::sleep;
use tracing::{error, info, trace, warn};

use crate::args::Config;
use crate::builder::{select_builder_tag, Build, BuildOutcome, ImageBuilder};
use crate::error::{Error, Result};
use crate::persistence::{BuildStatus, Persistence};
use crate::registry::{self, Digest, RegistryClient};

/// Lists the upstream repository's published tags
#[async_trait]
pub trait TagSource: Send + Sync {
    async fn list_tags(&self) -> registry::Result<Vec<String>>;
}

/// Resolves the content digest a tag currently points at
#[async_trait]
pub trait DigestResolver: Send + Sync {
    async fn resolve_digest(&self, tag: &str) -> registry::Result<Digest>;
}

#[async_trait]
impl TagSource for RegistryClient {
    async fn list_tags(&self) -> registry::Result<Vec<String>> {
        RegistryClient::list_tags(self).await
    }
}

#[async_trait]
impl DigestResolver for RegistryClient {
    async fn resolve_digest(&self, tag: &str) -> registry::Result<Digest> {
        RegistryClient::resolve_digest(self, tag).await
    }
}

/// What one pass over the candidate tags did
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CycleSummary {
    /// Tags built, pushed, verified and committed this cycle
    pub built: Vec<String>,
    /// Tags whose build attempt failed; retried next cycle
    pub failed: Vec<String>,
    /// Tags already up to date
    pub skipped: usize,
    /// Tags whose digest could not be resolved this cycle
    pub unresolved: usize,
}

impl CycleSummary {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// One full cycle: list, evaluate every candidate tag, build what is stale,
/// and commit each terminal outcome before taking the next tag
///
/// ```no-test
/// LISTING      the raw upstream listing; candidates filtered and sorted
///    |
///    v
/// EVALUATING   per tag: resolve digest (failure skips the tag, not the
///    |         cycle), compare with the stored record
///    v
/// DECIDING     unchanged + Success => skip; otherwise mark for build
///    |
///    v
/// BUILDING     select builder variant, build+push, commit the outcome
///              (success or failure) before the next tag
/// ```
///
/// Errors returned from here are cycle-level: the tag source being
/// unreachable, or the state store refusing a commit.
pub async fn run_cycle<S, B>(
    config: &Config,
    source: &S,
    builder: &B,
    persistence: &Persistence,
) -> Result<CycleSummary>
where
    S: TagSource + DigestResolver,
    B: ImageBuilder,
{
    let all_tags = source.list_tags().await.map_err(Error::SourceUnavailable)?;
    let candidates = config
        .filter
        .candidates(&all_tags, config.only_tag.as_deref());
    info!(
        upstream = %config.upstream,
        candidates = candidates.len(),
        "evaluating candidate tags"
    );

    let mut summary = CycleSummary::default();

    for tag in candidates {
        if config.max_builds != 0
            && summary.built.len() + summary.failed.len() >= config.max_builds
        {
            info!(cap = config.max_builds, "build cap reached for this cycle");
            break;
        }

        let digest = match source.resolve_digest(&tag).await {
            Ok(digest) => digest,
            Err(error) => {
                warn!(%tag, %error, "failed to resolve digest, skipping tag this cycle");
                summary.unresolved += 1;
                continue;
            }
        };

        let record = persistence.get(&tag).await?;
        persistence.upsert_seen(&tag, &digest).await?;

        let up_to_date = record.as_ref().map_or(false, |record| {
            record.last_build_status == BuildStatus::Success
                && record.last_digest.as_deref() == Some(digest.to_string().as_str())
        });
        if up_to_date {
            trace!(%tag, %digest, "digest unchanged");
            summary.skipped += 1;
            continue;
        }

        let previous = record.and_then(|record| record.last_digest);
        info!(
            %tag,
            previous = previous.as_deref().unwrap_or("none"),
            digest = %digest,
            "change detected"
        );

        // The raw listing, not the candidate set: the filter strips the
        // builder tags this has to see
        let builder_tag = select_builder_tag(&tag, &all_tags, &config.builder_tag);
        let build = Build {
            tag: tag.clone(),
            builder_image: config.upstream.image(&builder_tag),
            platforms: config.platforms.clone(),
            destinations: config.destinations.clone(),
        };

        match builder.build_and_push(&build).await {
            BuildOutcome::Success => {
                persistence
                    .commit_build(&tag, &digest, BuildStatus::Success, Utc::now())
                    .await?;
                info!(%tag, %digest, "build succeeded and committed");
                summary.built.push(tag);
            }
            BuildOutcome::Failed { reason } => {
                error!(%tag, %reason, "build failed, tag will be retried next cycle");
                persistence
                    .commit_build(&tag, &digest, BuildStatus::Failed, Utc::now())
                    .await?;
                summary.failed.push(tag);
            }
        }

        if config.build_delay > 0 {
            sleep(std::time::Duration::from_secs(config.build_delay)).await;
        }
    }

    Ok(summary)
}

/// Continuous mode: run cycles until shutdown, sleeping `poll_interval`
/// between them
///
/// Shutdown is raced against both the cycle and the interval sleep, so it is
/// honored at every suspension point; a cancelled in-flight build commits
/// nothing and its tag is retried on the next start.
pub async fn run<S, B>(config: &Config, source: &S, builder: &B, persistence: &Persistence)
where
    S: TagSource + DigestResolver,
    B: ImageBuilder,
{
    info!(
        interval = config.poll_interval.as_secs(),
        "starting watch loop"
    );

    loop {
        tokio::select! {
            _ = shutdown_signal() => {
                info!("shutdown requested, exiting watch loop");
                break;
            }
            result = run_cycle(config, source, builder, persistence) => match result {
                Ok(summary) => info!(
                    built = summary.built.len(),
                    failed = summary.failed.len(),
                    skipped = summary.skipped,
                    unresolved = summary.unresolved,
                    "cycle complete"
                ),
                Err(error) => error!(
                    error = &error as &dyn std::error::Error,
                    "cycle failed, retrying next interval"
                ),
            }
        }

        tokio::select! {
            _ = shutdown_signal() => {
                info!("shutdown requested, exiting watch loop");
                break;
            }
            _ = sleep(config.poll_interval) => {}
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("to install the SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;

    use url::Url;

    use super::*;
    use crate::registry::{Repository, TagFilter};

    struct FakeUpstream {
        tags: Vec<String>,
        digests: HashMap<String, Digest>,
        unavailable: bool,
    }

    impl FakeUpstream {
        fn new(tags: &[&str], digests: &[(&str, &str)]) -> Self {
            Self {
                tags: tags.iter().map(|tag| tag.to_string()).collect(),
                digests: digests
                    .iter()
                    .map(|(tag, digest)| {
                        (
                            tag.to_string(),
                            Digest::new(&format!("sha256:{digest}")).unwrap(),
                        )
                    })
                    .collect(),
                unavailable: false,
            }
        }
    }

    #[async_trait]
    impl TagSource for FakeUpstream {
        async fn list_tags(&self) -> registry::Result<Vec<String>> {
            if self.unavailable {
                return Err(registry::Error::Registry("listing down".to_string()));
            }
            Ok(self.tags.clone())
        }
    }

    #[async_trait]
    impl DigestResolver for FakeUpstream {
        async fn resolve_digest(&self, tag: &str) -> registry::Result<Digest> {
            self.digests
                .get(tag)
                .cloned()
                .ok_or_else(|| registry::Error::ManifestNotFound(tag.to_string()))
        }
    }

    /// Records every build it is asked for and answers with a canned outcome
    struct RecordingBuilder {
        builds: Mutex<Vec<Build>>,
        outcome: BuildOutcome,
    }

    impl RecordingBuilder {
        fn succeeding() -> Self {
            Self {
                builds: Mutex::new(Vec::new()),
                outcome: BuildOutcome::Success,
            }
        }

        fn failing(reason: &str) -> Self {
            Self {
                builds: Mutex::new(Vec::new()),
                outcome: BuildOutcome::Failed {
                    reason: reason.to_string(),
                },
            }
        }

        fn builds(&self) -> Vec<Build> {
            self.builds.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ImageBuilder for RecordingBuilder {
        async fn build_and_push(&self, build: &Build) -> BuildOutcome {
            self.builds.lock().unwrap().push(build.clone());
            self.outcome.clone()
        }
    }

    fn test_config() -> Config {
        Config {
            state: "sqlite::memory:".to_string(),
            upstream: Repository::parse("library/caddy").unwrap(),
            upstream_registry: Url::parse("https://registry-1.docker.io").unwrap(),
            destinations: vec![
                Repository::parse("melonsmasher/caddy-cloudflare-cache").unwrap(),
                Repository::parse("ghcr.io/melonsmasher/caddy-cloudflare-cache").unwrap(),
            ],
            platforms: vec!["linux/amd64".to_string(), "linux/arm64".to_string()],
            poll_interval: Duration::from_secs(600),
            filter: TagFilter::new(2, None),
            builder_tag: "builder".to_string(),
            dockerfile: PathBuf::from("./Dockerfile"),
            context: PathBuf::from("."),
            pull: true,
            max_builds: 0,
            build_delay: 0,
            only_tag: None,
        }
    }

    fn digest(encoded: &str) -> Digest {
        Digest::new(&format!("sha256:{encoded}")).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn new_tag_triggers_exactly_one_build() {
        let config = test_config();
        let upstream = FakeUpstream::new(&["2.7.6-alpine", "builder"], &[("2.7.6-alpine", "aa")]);
        let builder = RecordingBuilder::succeeding();
        let persistence = Persistence::new_in_memory().await.unwrap();

        let summary = run_cycle(&config, &upstream, &builder, &persistence)
            .await
            .unwrap();

        assert_eq!(summary.built, vec!["2.7.6-alpine"]);
        assert!(summary.is_clean());
        assert_eq!(builder.builds().len(), 1);

        let record = persistence.get("2.7.6-alpine").await.unwrap().unwrap();
        assert_eq!(record.last_digest, Some("sha256:aa".to_string()));
        assert_eq!(record.last_build_status, BuildStatus::Success);
        assert!(record.last_build_time.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unchanged_tag_is_skipped() {
        let config = test_config();
        let upstream = FakeUpstream::new(&["2.7.6-alpine", "builder"], &[("2.7.6-alpine", "aa")]);
        let builder = RecordingBuilder::succeeding();
        let persistence = Persistence::new_in_memory().await.unwrap();

        run_cycle(&config, &upstream, &builder, &persistence)
            .await
            .unwrap();
        let summary = run_cycle(&config, &upstream, &builder, &persistence)
            .await
            .unwrap();

        assert!(summary.built.is_empty());
        assert_eq!(summary.skipped, 1);
        assert_eq!(builder.builds().len(), 1, "second cycle must not rebuild");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn digest_change_triggers_rebuild() {
        let config = test_config();
        let builder = RecordingBuilder::succeeding();
        let persistence = Persistence::new_in_memory().await.unwrap();

        let upstream = FakeUpstream::new(&["2.7.6-alpine"], &[("2.7.6-alpine", "aa")]);
        run_cycle(&config, &upstream, &builder, &persistence)
            .await
            .unwrap();

        // Upstream repointed the tag
        let upstream = FakeUpstream::new(&["2.7.6-alpine"], &[("2.7.6-alpine", "bb")]);
        let summary = run_cycle(&config, &upstream, &builder, &persistence)
            .await
            .unwrap();

        assert_eq!(summary.built, vec!["2.7.6-alpine"]);
        assert_eq!(builder.builds().len(), 2);

        let record = persistence.get("2.7.6-alpine").await.unwrap().unwrap();
        assert_eq!(record.last_digest, Some("sha256:bb".to_string()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_build_keeps_digest_and_retries() {
        let config = test_config();
        let persistence = Persistence::new_in_memory().await.unwrap();

        let upstream = FakeUpstream::new(&["2.7.6-alpine"], &[("2.7.6-alpine", "aa")]);
        run_cycle(
            &config,
            &upstream,
            &RecordingBuilder::succeeding(),
            &persistence,
        )
        .await
        .unwrap();

        // The tag moved but every build of it fails
        let upstream = FakeUpstream::new(&["2.7.6-alpine"], &[("2.7.6-alpine", "bb")]);
        let failing = RecordingBuilder::failing("push refused");
        let summary = run_cycle(&config, &upstream, &failing, &persistence)
            .await
            .unwrap();

        assert_eq!(summary.failed, vec!["2.7.6-alpine"]);
        assert!(!summary.is_clean());
        let record = persistence.get("2.7.6-alpine").await.unwrap().unwrap();
        assert_eq!(
            record.last_digest,
            Some("sha256:aa".to_string()),
            "failure must not advance the built digest"
        );
        assert_eq!(record.last_seen_digest, Some("sha256:bb".to_string()));
        assert_eq!(record.last_build_status, BuildStatus::Failed);

        // Next cycle retries and the tag recovers
        let recovering = RecordingBuilder::succeeding();
        run_cycle(&config, &upstream, &recovering, &persistence)
            .await
            .unwrap();
        assert_eq!(recovering.builds().len(), 1);
        let record = persistence.get("2.7.6-alpine").await.unwrap().unwrap();
        assert_eq!(record.last_digest, Some("sha256:bb".to_string()));
        assert_eq!(record.last_build_status, BuildStatus::Success);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn digest_failure_is_isolated_to_its_tag() {
        let config = test_config();
        // "2" resolves, "2.7.6" does not
        let upstream = FakeUpstream::new(&["2", "2.7.6"], &[("2", "aa")]);
        let builder = RecordingBuilder::succeeding();
        let persistence = Persistence::new_in_memory().await.unwrap();

        let summary = run_cycle(&config, &upstream, &builder, &persistence)
            .await
            .unwrap();

        assert_eq!(summary.built, vec!["2"]);
        assert_eq!(summary.unresolved, 1);
        assert!(persistence.get("2.7.6").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn builder_variant_is_selected_from_raw_listing() {
        let config = test_config();
        let upstream = FakeUpstream::new(
            &["2.7.6-alpine", "2.7.6-alpine-builder", "builder"],
            &[("2.7.6-alpine", "aa")],
        );
        let builder = RecordingBuilder::succeeding();
        let persistence = Persistence::new_in_memory().await.unwrap();

        run_cycle(&config, &upstream, &builder, &persistence)
            .await
            .unwrap();

        let builds = builder.builds();
        assert_eq!(builds.len(), 1, "the builder tag itself is not a candidate");
        assert_eq!(builds[0].builder_image, "library/caddy:2.7.6-alpine-builder");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn generic_builder_fallback() {
        let config = test_config();
        let upstream = FakeUpstream::new(&["2.7.6-alpine", "builder"], &[("2.7.6-alpine", "aa")]);
        let builder = RecordingBuilder::succeeding();
        let persistence = Persistence::new_in_memory().await.unwrap();

        run_cycle(&config, &upstream, &builder, &persistence)
            .await
            .unwrap();

        assert_eq!(builder.builds()[0].builder_image, "library/caddy:builder");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unreachable_source_fails_the_cycle() {
        let config = test_config();
        let mut upstream = FakeUpstream::new(&["2"], &[("2", "aa")]);
        upstream.unavailable = true;
        let builder = RecordingBuilder::succeeding();
        let persistence = Persistence::new_in_memory().await.unwrap();

        let result = run_cycle(&config, &upstream, &builder, &persistence).await;

        assert!(matches!(result, Err(Error::SourceUnavailable(_))));
        assert!(builder.builds().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn build_cap_bounds_attempts_per_cycle() {
        let mut config = test_config();
        config.max_builds = 1;
        let upstream = FakeUpstream::new(
            &["2", "2-alpine", "2.7.6"],
            &[("2", "aa"), ("2-alpine", "bb"), ("2.7.6", "cc")],
        );
        let builder = RecordingBuilder::succeeding();
        let persistence = Persistence::new_in_memory().await.unwrap();

        let summary = run_cycle(&config, &upstream, &builder, &persistence)
            .await
            .unwrap();

        assert_eq!(summary.built.len(), 1);
        assert_eq!(builder.builds().len(), 1);
        // Uncapped follow-up cycle picks up the rest
        config.max_builds = 0;
        let summary = run_cycle(&config, &upstream, &builder, &persistence)
            .await
            .unwrap();
        assert_eq!(summary.built.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn single_tag_restriction() {
        let mut config = test_config();
        config.only_tag = Some("2.7.6".to_string());
        let upstream = FakeUpstream::new(&["2", "2.7.6"], &[("2", "aa"), ("2.7.6", "bb")]);
        let builder = RecordingBuilder::succeeding();
        let persistence = Persistence::new_in_memory().await.unwrap();

        let summary = run_cycle(&config, &upstream, &builder, &persistence)
            .await
            .unwrap();

        assert_eq!(summary.built, vec!["2.7.6"]);
        assert_eq!(builder.builds().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn commits_follow_candidate_order() {
        let config = test_config();
        let upstream = FakeUpstream::new(
            &["2.7.6", "2", "2-alpine"],
            &[("2", "aa"), ("2-alpine", "bb"), ("2.7.6", "cc")],
        );
        let builder = RecordingBuilder::succeeding();
        let persistence = Persistence::new_in_memory().await.unwrap();

        let summary = run_cycle(&config, &upstream, &builder, &persistence)
            .await
            .unwrap();

        assert_eq!(summary.built, vec!["2", "2-alpine", "2.7.6"]);
        let built_tags: Vec<String> = builder
            .builds()
            .into_iter()
            .map(|build| build.tag)
            .collect();
        assert_eq!(built_tags, vec!["2", "2-alpine", "2.7.6"]);
    }
}
