use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::registry::{Digest, RegistryClient, Repository};

/// Lines of child stderr kept around as the failure reason
const STDERR_TAIL: usize = 20;

/// One build invocation: mirror `tag`, compiling with `builder_image`, for
/// every platform, pushed to every destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Build {
    pub tag: String,
    pub builder_image: String,
    pub platforms: Vec<String>,
    pub destinations: Vec<Repository>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Success,
    Failed { reason: String },
}

impl BuildOutcome {
    fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }
}

/// Capability to build the derived image and push it everywhere it belongs
///
/// Implementations must be all-or-nothing across the full platform ×
/// destination matrix: partial success is reported as `Failed`, never
/// silently as `Success`. This is the only component with side effects
/// beyond the state store.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn build_and_push(&self, build: &Build) -> BuildOutcome;
}

/// Picks the builder image tag for an upstream tag
///
/// Upstream may publish a tag-specific builder (`2.7.6-alpine-builder`) at
/// any point after the main tag first appears, so this is re-evaluated from
/// the raw listing every cycle rather than cached. Falls back to the generic
/// builder tag.
pub fn select_builder_tag(tag: &str, available: &[String], generic: &str) -> String {
    let specific = format!("{tag}-builder");
    if available.iter().any(|candidate| *candidate == specific) {
        specific
    } else {
        generic.to_string()
    }
}

/// Builds and pushes through `docker buildx build --push`
///
/// buildx alone cannot promise that a multi-destination push either fully
/// lands or fully fails, so a zero exit is not trusted: the pushed tag is
/// re-resolved at every destination registry afterwards and all of them must
/// agree on one digest before the outcome is `Success`.
pub struct BuildxBuilder {
    dockerfile: PathBuf,
    context: PathBuf,
    pull: bool,
}

impl BuildxBuilder {
    pub fn new(dockerfile: PathBuf, context: PathBuf, pull: bool) -> Self {
        Self {
            dockerfile,
            context,
            pull,
        }
    }

    fn args(&self, build: &Build) -> Vec<String> {
        let mut args = vec!["buildx".to_string(), "build".to_string()];
        if self.pull {
            args.push("--pull".to_string());
        }
        args.push("--platform".to_string());
        args.push(build.platforms.join(","));
        // Provenance attestations would give each destination its own index
        // digest, breaking the post-push verification
        args.push("--provenance=false".to_string());
        for destination in &build.destinations {
            args.push("-t".to_string());
            args.push(destination.image(&build.tag));
        }
        args.push("--build-arg".to_string());
        args.push(format!("UPSTREAM_TAG={}", build.tag));
        args.push("--build-arg".to_string());
        args.push(format!("BUILDER_IMAGE={}", build.builder_image));
        args.push("-f".to_string());
        args.push(self.dockerfile.display().to_string());
        args.push("--push".to_string());
        args.push(self.context.display().to_string());
        args
    }

    /// Confirm the push actually landed everywhere
    async fn verify(&self, build: &Build) -> Result<(), String> {
        let mut digests: Vec<(&Repository, Digest)> = Vec::new();

        for destination in &build.destinations {
            let client = RegistryClient::for_repository(destination)
                .map_err(|err| format!("cannot reach destination {destination}: {err}"))?;
            match client.resolve_digest(&build.tag).await {
                Ok(digest) => digests.push((destination, digest)),
                Err(err) => {
                    return Err(format!(
                        "pushed manifest missing at {destination}:{}: {err}",
                        build.tag
                    ));
                }
            }
        }

        if let Some(((first, expected), rest)) = digests.split_first() {
            for (destination, digest) in rest {
                if digest != expected {
                    return Err(format!(
                        "destinations disagree after push: {first} has {expected}, {destination} has {digest}"
                    ));
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl ImageBuilder for BuildxBuilder {
    async fn build_and_push(&self, build: &Build) -> BuildOutcome {
        info!(
            tag = %build.tag,
            builder_image = %build.builder_image,
            "starting buildx build"
        );

        let mut child = match Command::new("docker")
            .args(self.args(build))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(err) => return BuildOutcome::failed(format!("failed to spawn docker: {err}")),
        };

        // buildx reports progress on stderr; stream it through and keep a
        // tail for the failure reason
        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL);
        if let Some(stderr) = child.stderr.take() {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(tag = %build.tag, "buildx: {line}");
                if tail.len() == STDERR_TAIL {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }

        let status = match child.wait().await {
            Ok(status) => status,
            Err(err) => return BuildOutcome::failed(format!("failed to wait on docker: {err}")),
        };
        if !status.success() {
            let tail: Vec<String> = tail.into_iter().collect();
            return BuildOutcome::failed(format!(
                "buildx exited with {status}: {}",
                tail.join(" | ")
            ));
        }

        if let Err(reason) = self.verify(build).await {
            return BuildOutcome::Failed { reason };
        }

        BuildOutcome::Success
    }
}
