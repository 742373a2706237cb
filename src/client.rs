use std::path::PathBuf;
use std::sync::OnceLock;

use bytes::Bytes;
use regex::Regex;
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use snafu::ResultExt;
use tokio::sync::Mutex;
use tokio_util::io::ReaderStream;
use url::Url;

use crate::models::{DockerConfig, TokenResponse};
use crate::{error, Result};

const COMMON_AUTH_FILES: &[&str] = &[".finch/config.json", ".docker/config.json"];

fn challenge_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"Bearer realm="([^"]*)",service="([^"]*)""#).unwrap())
}

/// The access scope a client asks the token service for.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Scope {
    Pull,
    PullPush,
}

impl Scope {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Pull => "pull",
            Self::PullPush => "pull,push",
        }
    }
}

/// Body of a registry request. File bodies are reopened per attempt so the
/// request can be replayed after the token dance.
pub(crate) enum BodySource {
    None,
    Bytes(Bytes),
    File(PathBuf),
}

/// Look for credentials for `host` in the common container config files.
async fn discover_auth(host: &str) -> Option<(String, String)> {
    let base = home::home_dir()?;
    for file in COMMON_AUTH_FILES {
        let path = base.join(file);
        let Ok(raw) = tokio::fs::read_to_string(&path).await else {
            continue;
        };
        let Ok(config) = serde_json::from_str::<DockerConfig>(&raw) else {
            debug!("ignoring malformed auth config at {}", path.display());
            continue;
        };
        if let Some(entry) = config.auths.get(host) {
            if let Some(credentials) = entry.credentials() {
                debug!("using credentials for {host} from {}", path.display());
                return Some(credentials);
            }
        }
    }
    None
}

/// An authenticated connection to one repository on one registry.
///
/// The first request goes out unauthenticated; a 401 triggers the bearer
/// token dance against the realm the registry advertises, and the token is
/// cached behind a mutex for reuse by every worker sharing this client.
#[derive(Debug)]
pub(crate) struct RegistryHttp {
    client: reqwest::Client,
    base: Url,
    repository: String,
    scope: Scope,
    credentials: Option<(String, String)>,
    token: Mutex<Option<String>>,
}

impl RegistryHttp {
    pub async fn connect(
        host: &str,
        repository: &str,
        secure: bool,
        scope: Scope,
        username: Option<String>,
        password: Option<String>,
    ) -> Result<Self> {
        let moniker = if secure { "https" } else { "http" };
        let base = Url::parse(&format!("{moniker}://{host}")).context(error::UrlSnafu)?;
        let credentials = match (username, password) {
            (Some(username), Some(password)) => Some((username, password)),
            _ => discover_auth(host).await,
        };
        Ok(Self {
            client: reqwest::Client::new(),
            base,
            repository: repository.to_string(),
            scope,
            credentials,
            token: Mutex::new(None),
        })
    }

    fn v2_url(&self, suffix: &str) -> Result<Url> {
        self.base
            .join(&format!("/v2/{}/{}", self.repository, suffix))
            .context(error::UrlSnafu)
    }

    pub fn manifest_url(&self, reference: &str) -> Result<Url> {
        self.v2_url(&format!("manifests/{reference}"))
    }

    pub fn blob_url(&self, digest: &str) -> Result<Url> {
        self.v2_url(&format!("blobs/{digest}"))
    }

    pub fn upload_url(&self) -> Result<Url> {
        self.v2_url("blobs/uploads/")
    }

    /// Resolve a Location header value against the registry base; registries
    /// are free to return relative upload locations.
    pub fn location_url(&self, location: &str) -> Result<Url> {
        if location.starts_with("http://") || location.starts_with("https://") {
            Url::parse(location).context(error::UrlSnafu)
        } else {
            self.base.join(location).context(error::UrlSnafu)
        }
    }

    async fn build(
        &self,
        method: &Method,
        url: &Url,
        accept: Option<&str>,
        content_type: Option<&str>,
        body: &BodySource,
    ) -> Result<RequestBuilder> {
        let mut request = self.client.request(method.clone(), url.clone());
        if let Some(accept) = accept {
            request = request.header(ACCEPT, accept);
        }
        if let Some(content_type) = content_type {
            request = request.header(CONTENT_TYPE, content_type);
        }
        request = match body {
            BodySource::None => request,
            BodySource::Bytes(bytes) => request
                .header(CONTENT_LENGTH, bytes.len())
                .body(bytes.clone()),
            BodySource::File(path) => {
                let file = tokio::fs::File::open(path).await.context(error::FileSnafu)?;
                let size = file.metadata().await.context(error::FileSnafu)?.len();
                request
                    .header(CONTENT_LENGTH, size)
                    .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            }
        };
        if let Some(token) = self.token.lock().await.as_ref() {
            request = request.bearer_auth(token);
        }
        Ok(request)
    }

    /// Execute a request, transparently performing the bearer token dance on
    /// a 401 and replaying the request once with the fresh token.
    pub async fn execute(
        &self,
        method: Method,
        url: Url,
        accept: Option<&str>,
        content_type: Option<&str>,
        body: BodySource,
    ) -> Result<Response> {
        let response = self
            .build(&method, &url, accept, content_type, &body)
            .await?
            .send()
            .await
            .context(error::RequestSnafu)?;
        trace!("{} {} -> {}", method, url, response.status());
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        self.refresh_token(&response).await?;
        let response = self
            .build(&method, &url, accept, content_type, &body)
            .await?
            .send()
            .await
            .context(error::RequestSnafu)?;
        trace!("{} {} (authorized) -> {}", method, url, response.status());
        if response.status() == StatusCode::UNAUTHORIZED {
            return error::TokenRejectedSnafu {
                repository: self.repository.clone(),
            }
            .fail();
        }
        Ok(response)
    }

    /// Parse the Www-Authenticate challenge off a 401 and fetch a bearer
    /// token from the advertised realm, using HTTP basic auth when
    /// credentials are configured.
    async fn refresh_token(&self, response: &Response) -> Result<()> {
        let challenge = response
            .headers()
            .get("Www-Authenticate")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        let Some(captures) = challenge_re().captures(challenge) else {
            return error::TokenRejectedSnafu {
                repository: self.repository.clone(),
            }
            .fail();
        };
        let realm = captures.get(1).unwrap().as_str();
        let service = captures.get(2).unwrap().as_str();

        let mut auth_url = Url::parse(realm).context(error::UrlSnafu)?;
        auth_url
            .query_pairs_mut()
            .append_pair("service", service)
            .append_pair(
                "scope",
                &format!("repository:{}:{}", self.repository, self.scope.as_str()),
            );
        debug!("fetching bearer token from {realm}");

        let mut request = self.client.get(auth_url);
        if let Some((username, password)) = self.credentials.as_ref() {
            request = request.basic_auth(username, Some(password));
        }
        let token_response = request.send().await.context(error::RequestSnafu)?;
        if !token_response.status().is_success() {
            return error::TokenRejectedSnafu {
                repository: self.repository.clone(),
            }
            .fail();
        }
        let token = token_response
            .json::<TokenResponse>()
            .await
            .context(error::RequestSnafu)?
            .into_token();
        match token {
            Some(token) => {
                *self.token.lock().await = Some(token);
                Ok(())
            }
            None => error::TokenRejectedSnafu {
                repository: self.repository.clone(),
            }
            .fail(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_challenge_parse() {
        let header = r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io""#;
        let captures = challenge_re().captures(header).unwrap();
        assert_eq!(&captures[1], "https://auth.docker.io/token");
        assert_eq!(&captures[2], "registry.docker.io");
    }

    #[test]
    fn test_challenge_parse_rejects_basic() {
        assert!(challenge_re().captures(r#"Basic realm="registry""#).is_none());
    }

    #[tokio::test]
    async fn test_url_construction() {
        let http = RegistryHttp::connect(
            "registry.example.com",
            "library/busybox",
            true,
            Scope::Pull,
            None,
            None,
        )
        .await
        .unwrap();
        assert_eq!(
            http.manifest_url("latest").unwrap().as_str(),
            "https://registry.example.com/v2/library/busybox/manifests/latest"
        );
        assert_eq!(
            http.blob_url("sha256:abc").unwrap().as_str(),
            "https://registry.example.com/v2/library/busybox/blobs/sha256:abc"
        );
        assert_eq!(
            http.upload_url().unwrap().as_str(),
            "https://registry.example.com/v2/library/busybox/blobs/uploads/"
        );
    }

    #[tokio::test]
    async fn test_insecure_moniker_and_relative_location() {
        let http = RegistryHttp::connect(
            "localhost:5000",
            "test/image",
            false,
            Scope::PullPush,
            None,
            None,
        )
        .await
        .unwrap();
        assert_eq!(
            http.location_url("/v2/test/image/blobs/uploads/uuid-1")
                .unwrap()
                .as_str(),
            "http://localhost:5000/v2/test/image/blobs/uploads/uuid-1"
        );
        assert_eq!(
            http.location_url("https://other.example.com/upload")
                .unwrap()
                .as_str(),
            "https://other.example.com/upload"
        );
    }
}
