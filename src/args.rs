use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use url::Url;

use crate::error::{Error, Result};
use crate::registry::filter::{parse_version, TagFilter};
use crate::registry::Repository;

/// Program to keep a derived image in lockstep with its upstream's releases.
/// Watches the upstream repository's tags and rebuilds/pushes the derived
/// image for every tag that is new or whose content changed.
#[derive(Debug, Parser)]
#[clap(author, version, about)]
pub struct Args {
    /// Path to the `.sqlite` file used to store tag state
    #[clap(long, env = "STATE_DB", default_value = "./tag-watcher.sqlite")]
    pub state: String,

    /// Upstream repository whose tags are watched
    #[clap(long, env = "UPSTREAM_REPO", default_value = "library/caddy")]
    pub upstream: String,

    /// Registry API endpoint serving the upstream repository
    #[clap(
        long,
        env = "UPSTREAM_REGISTRY",
        default_value = "https://registry-1.docker.io"
    )]
    pub upstream_registry: Url,

    /// Destination repository to push built images to (repeatable; also read
    /// from `TARGET_REPO_<n>` environment variables)
    #[clap(long = "target-repo", env = "TARGET_REPOS", value_delimiter = ',')]
    pub target_repos: Vec<String>,

    /// Platforms to build for
    #[clap(
        long,
        env = "PLATFORMS",
        default_value = "linux/amd64,linux/arm64",
        value_delimiter = ','
    )]
    pub platforms: Vec<String>,

    /// Seconds to sleep between cycles in continuous mode
    #[clap(long, env = "POLL_INTERVAL", default_value_t = 600)]
    pub poll_interval: u64,

    /// Major version family of upstream tags to mirror
    #[clap(long, env = "TAG_FAMILY", default_value_t = 2)]
    pub family: u32,

    /// Oldest upstream version the plugin set supports (e.g. 2.7.5)
    #[clap(long, env = "MIN_VERSION")]
    pub min_version: Option<String>,

    /// Generic builder tag used when upstream has no tag-specific builder
    #[clap(long, env = "BUILDER_TAG", default_value = "builder")]
    pub builder_tag: String,

    /// Dockerfile describing the derived image
    #[clap(long, default_value = "./Dockerfile")]
    pub dockerfile: PathBuf,

    /// Build context directory
    #[clap(long, default_value = ".")]
    pub context: PathBuf,

    /// Build from cached base images instead of pulling fresh ones
    #[clap(long, env = "NO_PULL")]
    pub no_pull: bool,

    /// Cap on build attempts per cycle (0 = uncapped)
    #[clap(long, env = "MAX_BUILDS_PER_CYCLE", default_value_t = 0)]
    pub max_builds: usize,

    /// Seconds to wait between consecutive builds
    #[clap(long, env = "BUILD_DELAY_SEC", default_value_t = 0)]
    pub build_delay: u64,

    /// Run a single cycle and exit
    #[clap(long)]
    pub once: bool,

    /// List the filtered candidate tags and exit without building
    #[clap(long)]
    pub list_only: bool,

    /// Print the stored tag records and exit
    #[clap(long)]
    pub status: bool,

    /// Restrict the cycle to this single tag
    #[clap(long)]
    pub tag: Option<String>,
}

/// Everything the components need, validated once at startup and passed in.
/// Nothing reads the process environment past this point.
#[derive(Debug, Clone)]
pub struct Config {
    pub state: String,
    pub upstream: Repository,
    pub upstream_registry: Url,
    pub destinations: Vec<Repository>,
    pub platforms: Vec<String>,
    pub poll_interval: Duration,
    pub filter: TagFilter,
    pub builder_tag: String,
    pub dockerfile: PathBuf,
    pub context: PathBuf,
    pub pull: bool,
    pub max_builds: usize,
    pub build_delay: u64,
    pub only_tag: Option<String>,
}

impl Config {
    pub fn from_args(args: &Args) -> Result<Self> {
        let upstream = Repository::parse(&args.upstream)
            .map_err(|err| Error::Config(format!("--upstream: {err}")))?;

        let mut targets = args.target_repos.clone();
        targets.extend(env_target_repos());
        let destinations = targets
            .iter()
            .map(|target| {
                Repository::parse(target)
                    .map_err(|err| Error::Config(format!("--target-repo {target}: {err}")))
            })
            .collect::<Result<Vec<_>>>()?;
        if destinations.is_empty() {
            return Err(Error::Config(
                "at least one --target-repo (or TARGET_REPO_<n> variable) is required".to_string(),
            ));
        }

        if args.platforms.iter().any(|platform| platform.is_empty()) || args.platforms.is_empty() {
            return Err(Error::Config("--platforms must not be empty".to_string()));
        }

        let min_version = args
            .min_version
            .as_deref()
            .map(|raw| {
                parse_version(raw)
                    .ok_or_else(|| Error::Config(format!("--min-version is not a version: {raw}")))
            })
            .transpose()?;

        Ok(Self {
            state: args.state.clone(),
            upstream,
            upstream_registry: args.upstream_registry.clone(),
            destinations,
            platforms: args.platforms.clone(),
            poll_interval: Duration::from_secs(args.poll_interval),
            filter: TagFilter::new(args.family, min_version),
            builder_tag: args.builder_tag.clone(),
            dockerfile: args.dockerfile.clone(),
            context: args.context.clone(),
            pull: !args.no_pull,
            max_builds: args.max_builds,
            build_delay: args.build_delay,
            only_tag: args.tag.clone(),
        })
    }
}

/// `TARGET_REPO_<n>` environment variables in variable-name order, so
/// destination ordering is stable across restarts
fn env_target_repos() -> Vec<String> {
    let mut vars: Vec<(String, String)> = std::env::vars()
        .filter(|(key, _)| key.starts_with("TARGET_REPO_"))
        .collect();
    vars.sort();
    vars.into_iter()
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
        .collect()
}
