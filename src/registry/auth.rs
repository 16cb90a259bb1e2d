use std::{collections::HashMap, fs, io, path::*};

use serde::{Deserialize, Serialize};
use url::Url;

use super::error::*;

/// Registry credentials loaded from the filesystem
///
/// Both docker and podman keep `{"auths": {"<registry>": {"auth": "<basic>"}}}`
/// style config files; anything found there is offered as Basic auth to the
/// token endpoint, raising rate limits and unlocking private destinations.
/// An empty set is fine since token endpoints hand out anonymous pull tokens.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoredAuth {
    auths: HashMap<String, Auth>,
}

impl StoredAuth {
    /// Load authentication info with docker and podman setting
    pub fn load_all() -> Self {
        let mut auth = StoredAuth::default();
        if let Some(path) = docker_auth_path() {
            if let Ok(new) = Self::from_path(&path) {
                auth.append(new);
            }
        }
        if let Some(path) = podman_auth_path() {
            if let Ok(new) = Self::from_path(&path) {
                auth.append(new);
            }
        }
        auth
    }

    /// Get a token based on a WWW-Authenticate challenge
    pub async fn challenge(
        &self,
        http: &reqwest::Client,
        challenge: &AuthChallenge,
    ) -> Result<String> {
        let token_url = Url::parse(&challenge.url)?;
        let host = token_url
            .host_str()
            .ok_or_else(|| Error::UnsupportedAuthHeader(challenge.url.clone()))?
            .to_string();

        let mut req = http
            .get(token_url.clone())
            .header(reqwest::header::ACCEPT, "application/json")
            .query(&[
                ("scope", challenge.scope.as_str()),
                ("service", challenge.service.as_str()),
            ]);
        if let Some(auth) = self.auths.get(&host) {
            req = req.header(
                reqwest::header::AUTHORIZATION,
                format!("Basic {}", auth.auth),
            );
        }

        let res = req.send().await?;
        if !res.status().is_success() {
            return Err(Error::AuthorizationFailed(token_url.to_string()));
        }

        let token = res.json::<Token>().await?;
        Ok(token.token)
    }

    fn append(&mut self, other: Self) {
        for (key, value) in other.auths.into_iter() {
            self.auths.insert(key, value);
        }
    }

    fn from_path(path: &Path) -> Result<Self> {
        if path.is_file() {
            let f = fs::File::open(path)?;
            Ok(serde_json::from_reader(io::BufReader::new(f))?)
        } else {
            Ok(Self::default())
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Auth {
    auth: String,
}

/// WWW-Authenticate challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub url: String,
    pub service: String,
    pub scope: String,
}

impl AuthChallenge {
    pub fn from_header(header: &str) -> Result<Self> {
        let err = || Error::UnsupportedAuthHeader(header.to_string());
        let (ty, realm) = header.split_once(' ').ok_or_else(err)?;
        if ty != "Bearer" {
            return Err(err());
        }

        let mut url = None;
        let mut service = None;
        let mut scope = None;
        for param in realm.split(',') {
            let (key, value) = param.split_once('=').ok_or_else(err)?;
            let value = value.trim_matches('"').to_string();
            match key.trim() {
                "realm" => url = Some(value),
                "service" => service = Some(value),
                "scope" => scope = Some(value),
                _ => continue,
            }
        }
        Ok(Self {
            url: url.ok_or_else(err)?,
            service: service.ok_or_else(err)?,
            scope: scope.ok_or_else(err)?,
        })
    }
}

#[derive(Deserialize)]
struct Token {
    token: String,
}

fn docker_auth_path() -> Option<PathBuf> {
    Some(dirs::home_dir()?.join(".docker/config.json"))
}

fn podman_auth_path() -> Option<PathBuf> {
    Some(dirs::runtime_dir()?.join("containers/auth.json"))
}
