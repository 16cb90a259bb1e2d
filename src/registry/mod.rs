mod auth;
mod digest;
mod error;
pub mod filter;
mod name;
mod repository;

use std::time::Duration;

use reqwest::{header, Method, StatusCode};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

pub use self::auth::{AuthChallenge, StoredAuth};
pub use self::digest::Digest;
pub use self::error::{Error, Result};
pub use self::filter::TagFilter;
pub use self::name::Name;
pub use self::repository::Repository;

/// Media types accepted when resolving a manifest. The manifest *list* types
/// come first: change detection must key on the multi-arch index digest, not
/// on whichever per-platform manifest the registry would serve by default.
const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.oci.image.manifest.v1+json";

const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";
const PAGE_SIZE: usize = 100;

/// A client for one repository on one registry's `/v2/` API
///
/// Serves both the tag listing and the manifest digest resolution, answering
/// token challenges with whatever credentials `StoredAuth` found (anonymous
/// otherwise) and caching the token across calls.
pub struct RegistryClient {
    http: reqwest::Client,
    /// URL to registry server
    url: Url,
    /// Name of repository
    name: Name,
    /// Loaded authentication info from filesystem
    auth: StoredAuth,
    /// Cached token
    token: Mutex<Option<String>>,
}

impl RegistryClient {
    pub fn new(url: Url, name: Name) -> Result<Self> {
        Self::with_auth(url, name, StoredAuth::load_all())
    }

    pub fn with_auth(url: Url, name: Name, auth: StoredAuth) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            url,
            name,
            auth,
            token: Mutex::new(None),
        })
    }

    pub fn for_repository(repository: &Repository) -> Result<Self> {
        Self::new(repository.registry_url()?, repository.name().clone())
    }

    /// List every tag the repository currently publishes
    ///
    /// ```text
    /// GET /v2/<name>/tags/list?n=<page>
    /// ```
    ///
    /// following `Link: <..>; rel="next"` headers until the listing is
    /// exhausted.
    pub async fn list_tags(&self) -> Result<Vec<String>> {
        let mut url = self
            .url
            .join(&format!("/v2/{}/tags/list?n={}", self.name, PAGE_SIZE))?;
        let mut tags = Vec::new();

        loop {
            let res = self.execute(Method::GET, url.clone(), None).await?;
            if !res.status().is_success() {
                return Err(Error::Registry(format!(
                    "tag listing for {} returned {}",
                    self.name,
                    res.status()
                )));
            }

            let next = res
                .headers()
                .get(header::LINK)
                .and_then(|value| value.to_str().ok())
                .and_then(next_link);
            let page: TagList = res.json().await?;
            tags.extend(page.tags);

            match next {
                Some(link) => url = self.url.join(&link)?,
                None => break,
            }
        }

        debug!(repository = %self.name, count = tags.len(), "listed upstream tags");
        Ok(tags)
    }

    /// Resolve the content digest a tag currently points at
    ///
    /// ```text
    /// HEAD /v2/<name>/manifests/<tag>
    /// ```
    ///
    /// reading `Docker-Content-Digest`, with a GET fallback for registries
    /// that leave the header off HEAD responses.
    pub async fn resolve_digest(&self, tag: &str) -> Result<Digest> {
        let url = self.url.join(&format!("/v2/{}/manifests/{}", self.name, tag))?;

        for method in [Method::HEAD, Method::GET] {
            let res = self
                .execute(method, url.clone(), Some(MANIFEST_ACCEPT))
                .await?;

            if res.status() == StatusCode::NOT_FOUND {
                return Err(Error::ManifestNotFound(tag.to_string()));
            }
            if !res.status().is_success() {
                return Err(Error::Registry(format!(
                    "manifest request for {}:{} returned {}",
                    self.name,
                    tag,
                    res.status()
                )));
            }
            if let Some(digest) = res
                .headers()
                .get(DOCKER_CONTENT_DIGEST)
                .and_then(|value| value.to_str().ok())
            {
                return Digest::new(digest);
            }
        }

        Err(Error::MissingDigest(tag.to_string()))
    }

    /// Perform a request, answering a token challenge once if the registry
    /// asks for one
    async fn execute(
        &self,
        method: Method,
        url: Url,
        accept: Option<&str>,
    ) -> Result<reqwest::Response> {
        let request = |token: Option<&str>| {
            let mut req = self.http.request(method.clone(), url.clone());
            if let Some(accept) = accept {
                req = req.header(header::ACCEPT, accept);
            }
            if let Some(token) = token {
                req = req.bearer_auth(token);
            }
            req
        };

        let token = self.token.lock().await.clone();
        let res = request(token.as_deref()).send().await?;
        if res.status() != StatusCode::UNAUTHORIZED {
            return Ok(res);
        }

        let challenge = res
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .map(AuthChallenge::from_header)
            .transpose()?
            .ok_or_else(|| Error::Registry("unauthorized without a challenge".to_string()))?;

        let token = self.auth.challenge(&self.http, &challenge).await?;
        let res = request(Some(&token)).send().await?;
        *self.token.lock().await = Some(token);

        Ok(res)
    }
}

#[derive(Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Vec<String>,
}

/// Extract the `rel="next"` target from an RFC 5988 Link header
fn next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|link| {
        let (target, params) = link.split_once(';')?;
        if !params.contains(r#"rel="next""#) {
            return None;
        }
        Some(
            target
                .trim()
                .trim_start_matches('<')
                .trim_end_matches('>')
                .to_string(),
        )
    })
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{header, method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    use super::*;

    fn test_client(server: &MockServer) -> RegistryClient {
        RegistryClient::with_auth(
            Url::parse(&server.uri()).unwrap(),
            Name::new("library/caddy").unwrap(),
            StoredAuth::default(),
        )
        .unwrap()
    }

    #[test]
    fn next_link_extraction() {
        assert_eq!(
            next_link(r#"</v2/library/caddy/tags/list?last=2.6&n=100>; rel="next""#),
            Some("/v2/library/caddy/tags/list?last=2.6&n=100".to_string())
        );
        assert_eq!(next_link(r#"</v2/x/tags/list>; rel="prev""#), None);
        assert_eq!(next_link("garbage"), None);
    }

    #[tokio::test]
    async fn lists_tags_across_pages() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v2/library/caddy/tags/list"))
            .and(query_param_is_missing("last"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({
                        "name": "library/caddy",
                        "tags": ["2.7.5", "2.7.6"],
                    }))
                    .insert_header(
                        "link",
                        r#"</v2/library/caddy/tags/list?n=100&last=2.7.6>; rel="next""#,
                    ),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/library/caddy/tags/list"))
            .and(query_param("last", "2.7.6"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "library/caddy",
                "tags": ["2.7.6-alpine", "builder"],
            })))
            .expect(1)
            .mount(&server)
            .await;

        let tags = test_client(&server).list_tags().await.unwrap();

        assert_eq!(tags, vec!["2.7.5", "2.7.6", "2.7.6-alpine", "builder"]);
    }

    #[tokio::test]
    async fn resolves_manifest_list_digest() {
        let server = MockServer::start().await;

        // Only serve the digest when the client asks for the multi-arch index
        Mock::given(method("HEAD"))
            .and(path("/v2/library/caddy/manifests/2.7.6"))
            .respond_with(|req: &Request| {
                let accept = req
                    .headers
                    .get("accept")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or_default();
                if accept.contains("manifest.list.v2+json") {
                    ResponseTemplate::new(200)
                        .insert_header("docker-content-digest", "sha256:4d414e")
                } else {
                    ResponseTemplate::new(406)
                }
            })
            .mount(&server)
            .await;

        let digest = test_client(&server).resolve_digest("2.7.6").await.unwrap();

        assert_eq!(digest, Digest::new("sha256:4d414e").unwrap());
    }

    #[tokio::test]
    async fn falls_back_to_get_when_head_has_no_digest() {
        let server = MockServer::start().await;

        Mock::given(method("HEAD"))
            .and(path("/v2/library/caddy/manifests/2.7.6"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/library/caddy/manifests/2.7.6"))
            .respond_with(
                ResponseTemplate::new(200).insert_header("docker-content-digest", "sha256:c0ffee"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let digest = test_client(&server).resolve_digest("2.7.6").await.unwrap();

        assert_eq!(digest, Digest::new("sha256:c0ffee").unwrap());
    }

    #[tokio::test]
    async fn missing_manifest_is_an_error() {
        let server = MockServer::start().await;

        Mock::given(method("HEAD"))
            .and(path("/v2/library/caddy/manifests/9.9.9"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let error = test_client(&server)
            .resolve_digest("9.9.9")
            .await
            .unwrap_err();

        assert!(matches!(error, Error::ManifestNotFound(tag) if tag == "9.9.9"));
    }

    #[tokio::test]
    async fn answers_token_challenge_and_retries() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v2/library/caddy/tags/list"))
            .respond_with(ResponseTemplate::new(401).insert_header(
                "www-authenticate",
                format!(
                    r#"Bearer realm="{}/token",service="registry.test",scope="repository:library/caddy:pull""#,
                    server.uri()
                )
                .as_str(),
            ))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .and(query_param("service", "registry.test"))
            .and(query_param("scope", "repository:library/caddy:pull"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": "abc123"})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/library/caddy/tags/list"))
            .and(header("authorization", "Bearer abc123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "library/caddy",
                "tags": ["2.7.6"],
            })))
            .expect(1)
            .mount(&server)
            .await;

        let tags = test_client(&server).list_tags().await.unwrap();

        assert_eq!(tags, vec!["2.7.6"]);
    }
}
