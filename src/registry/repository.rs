use std::fmt;

use url::Url;

use super::error::*;
use super::name::Name;

/// A `[host/]namespace` pair identifying one repository in one registry
///
/// References without a host component (`library/caddy`) belong to Docker
/// Hub, whose registry API is served from `registry-1.docker.io` rather than
/// `docker.io` itself. Hosts are recognised by containing a `.` or a `:`, or
/// being `localhost`, the same heuristic the docker CLI applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    host: Option<String>,
    name: Name,
}

const DOCKER_HUB_REGISTRY: &str = "https://registry-1.docker.io";

impl Repository {
    pub fn parse(reference: &str) -> Result<Self> {
        let (host, name) = match reference.split_once('/') {
            Some((head, rest))
                if head.contains('.') || head.contains(':') || head == "localhost" =>
            {
                (Some(head.to_string()), rest)
            }
            _ => (None, reference),
        };

        if name.is_empty() {
            return Err(Error::InvalidRepository(reference.to_string()));
        }

        Ok(Self {
            host,
            name: Name::new(name)?,
        })
    }

    pub fn name(&self) -> &Name {
        &self.name
    }

    /// Base URL of the registry API serving this repository
    pub fn registry_url(&self) -> Result<Url> {
        let url = match self.host.as_deref() {
            None | Some("docker.io") | Some("index.docker.io") => {
                DOCKER_HUB_REGISTRY.to_string()
            }
            // Local registries do not terminate TLS
            Some(host) if host.starts_with("localhost") || host.starts_with("127.") => {
                format!("http://{host}")
            }
            Some(host) => format!("https://{host}"),
        };

        Ok(Url::parse(&url)?)
    }

    /// Full image reference for this repository at the given tag, as passed
    /// to `docker buildx build -t`
    pub fn image(&self, tag: &str) -> String {
        match &self.host {
            Some(host) => format!("{}/{}:{}", host, self.name, tag),
            None => format!("{}:{}", self.name, tag),
        }
    }
}

impl fmt::Display for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Some(host) => write!(f, "{}/{}", host, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}
