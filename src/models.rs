use std::collections::HashMap;
use std::fmt;

use base64::Engine;
use derive_builder::Builder;
use serde::de::Error;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Handles all the manifest and blob media types this tool understands.
/// Since the OCI specification allows custom types anything unrecognised is
/// rejected at deserialization time rather than silently mishandled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaType {
    ImageIndex,
    Manifest,
    Config,
    Layer(Compression),
    DockerManifestList,
    DockerManifest,
    DockerContainerImage,
    DockerImageRootfs(Compression),
}

impl MediaType {
    /// The compression implied by this media type. A bare Docker rootfs type
    /// predates the explicit compression suffixes and means gzip.
    pub fn compression(&self) -> Compression {
        match self {
            Self::DockerImageRootfs(compression) => {
                if *compression == Compression::None {
                    Compression::Gzip
                } else {
                    *compression
                }
            }
            Self::Layer(compression) => *compression,
            _ => Compression::None,
        }
    }

    /// The layer media type to publish for a given wire compression.
    pub fn for_layer(compression: Compression, oci: bool) -> Self {
        if oci {
            Self::Layer(compression)
        } else {
            Self::DockerImageRootfs(compression)
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let string: String = match self {
            Self::ImageIndex => "application/vnd.oci.image.index.v1+json".into(),
            Self::Manifest => "application/vnd.oci.image.manifest.v1+json".into(),
            Self::Config => "application/vnd.oci.image.config.v1+json".into(),
            Self::Layer(compression) => format!(
                "application/vnd.oci.image.layer.v1.tar{}",
                compression.to_oci_ext()
            ),
            Self::DockerManifestList => {
                "application/vnd.docker.distribution.manifest.list.v2+json".into()
            }
            Self::DockerManifest => "application/vnd.docker.distribution.manifest.v2+json".into(),
            Self::DockerContainerImage => "application/vnd.docker.container.image.v1+json".into(),
            Self::DockerImageRootfs(compression) => format!(
                "application/vnd.docker.image.rootfs.diff.tar{}",
                compression.to_docker_ext()
            ),
        };
        f.write_str(string.as_str())
    }
}

impl Serialize for MediaType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

impl<'de> Deserialize<'de> for MediaType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(deserializer)?;
        if string.starts_with("application/vnd.docker.image.rootfs.diff.tar") {
            Ok(MediaType::DockerImageRootfs(Compression::from_media_suffix(
                string.as_str(),
            )))
        } else if string.starts_with("application/vnd.oci.image.layer.v1.tar") {
            Ok(MediaType::Layer(Compression::from_media_suffix(
                string.as_str(),
            )))
        } else {
            match string.as_ref() {
                "application/vnd.docker.distribution.manifest.list.v2+json" => {
                    Ok(MediaType::DockerManifestList)
                }
                "application/vnd.docker.distribution.manifest.v2+json" => {
                    Ok(MediaType::DockerManifest)
                }
                "application/vnd.docker.container.image.v1+json" => {
                    Ok(MediaType::DockerContainerImage)
                }
                "application/vnd.oci.image.manifest.v1+json" => Ok(MediaType::Manifest),
                "application/vnd.oci.image.index.v1+json" => Ok(MediaType::ImageIndex),
                "application/vnd.oci.image.config.v1+json" => Ok(MediaType::Config),
                variant => Err(D::Error::unknown_variant(
                    variant,
                    &[
                        "application/vnd.docker.image.rootfs.diff.tar.*",
                        "application/vnd.docker.container.image.v1+json",
                        "application/vnd.docker.distribution.manifest.list.v2+json",
                        "application/vnd.docker.distribution.manifest.v2+json",
                        "application/vnd.oci.image.index.v1+json",
                        "application/vnd.oci.image.manifest.v1+json",
                        "application/vnd.oci.image.config.v1+json",
                        "application/vnd.oci.image.layer.v1.tar*",
                    ],
                )),
            }
        }
    }
}

/// The Accept value sent when resolving a manifest, covering both Docker and
/// OCI manifest and index types.
pub const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json,\
application/vnd.docker.distribution.manifest.list.v2+json,\
application/vnd.oci.image.manifest.v1+json,\
application/vnd.oci.image.index.v1+json";

/// Compression applied to a layer on the wire or inside an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Zstd,
    None,
}

impl Compression {
    /// Compression implied by a layer media type's suffix. `+gzip` / `.gzip`
    /// and `+zstd` / `.zstd` suffixes are the fallback for registries that
    /// publish custom prefixes.
    pub fn from_media_suffix(media_type: &str) -> Self {
        if media_type.ends_with("+gzip") || media_type.ends_with(".gzip") {
            Compression::Gzip
        } else if media_type.ends_with("+zstd") || media_type.ends_with(".zstd") {
            Compression::Zstd
        } else {
            Compression::None
        }
    }

    pub fn to_oci_ext(&self) -> &str {
        match self {
            Self::Gzip => "+gzip",
            Self::Zstd => "+zstd",
            Self::None => "",
        }
    }

    pub fn to_docker_ext(&self) -> &str {
        match self {
            Self::Gzip => ".gzip",
            Self::Zstd => ".zstd",
            Self::None => "",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Gzip => "gzip",
            Self::Zstd => "zstd",
            Self::None => "none",
        })
    }
}

/// A content-addressed reference to a blob in a registry manifest: the
/// media type, size of the stored bytes and their digest.
#[derive(Builder, Debug, Clone, Serialize, Deserialize)]
#[builder(setter(into))]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: MediaType,
    pub size: u64,
    pub digest: String,
}

impl Descriptor {
    /// The bare hex portion of the digest.
    pub fn hex(&self) -> &str {
        self.digest
            .split_once(':')
            .map(|(_, hex)| hex)
            .unwrap_or(self.digest.as_str())
    }
}

/// An image manifest as served by a registry. Docker v2 and OCI manifests
/// share this shape and differ only in media type strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryManifest {
    pub schema_version: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<MediaType>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

/// One entry of a manifest list / image index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    pub media_type: Option<MediaType>,
    pub digest: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub platform: Option<Platform>,
}

/// A manifest list (Docker) or image index (OCI).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestIndex {
    pub manifests: Vec<IndexEntry>,
}

/// Platform selector. Matching is exact equality on all three fields; an
/// absent variant matches only an absent or empty variant.
#[derive(Builder, Debug, Clone, Serialize, Deserialize)]
#[builder(setter(into))]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    pub fn new(os: &str, architecture: &str, variant: &str) -> Self {
        Self {
            os: os.to_string(),
            architecture: architecture.to_string(),
            variant: if variant.is_empty() {
                None
            } else {
                Some(variant.to_string())
            },
        }
    }

    pub fn matches(&self, other: &Platform) -> bool {
        self.os == other.os
            && self.architecture == other.architecture
            && self.variant.as_deref().unwrap_or("") == other.variant.as_deref().unwrap_or("")
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::new("linux", "amd64", "")
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.variant.as_deref() {
            Some(variant) if !variant.is_empty() => f.write_fmt(format_args!(
                "{}/{}/{}",
                self.os, self.architecture, variant
            )),
            _ => f.write_fmt(format_args!("{}/{}", self.os, self.architecture)),
        }
    }
}

/// A history log entry in an image configuration. `created` stays a string
/// here; consumers that need a timestamp parse it leniently.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct History {
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub empty_layer: bool,
}

/// The `config` block of an image configuration, limited to the fields a
/// runnable bundle needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProcessConfig {
    #[serde(default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
    #[serde(default)]
    pub env: Option<Vec<String>>,
    #[serde(default)]
    pub working_dir: Option<String>,
}

/// The shape of an image configuration blob, as far as this tool reads it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub architecture: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub history: Vec<History>,
    #[serde(default)]
    pub config: ProcessConfig,
}

/// The manifest.json document at the top of a `docker save` style tarball.
/// The legacy v1.2 layout points `Layers` at `<hex>/layer.tar` members; the
/// OCI-in-tar layout points both `Config` and `Layers` at `blobs/sha256/`.
#[derive(Builder, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
#[builder(setter(into))]
pub struct TarballManifest {
    pub config: String,
    pub repo_tags: Vec<String>,
    pub layers: Vec<String>,
}

impl TarballManifest {
    /// Layer digest as carried by an element: the dirname for the legacy
    /// `<hex>/layer.tar` form, the basename for `blobs/sha256/<hex>`.
    pub fn layer_digest(path: &str) -> String {
        if let Some(rest) = path.strip_prefix("blobs/") {
            rest.rsplit('/').next().unwrap_or(rest).to_string()
        } else {
            path.split('/').next().unwrap_or(path).to_string()
        }
    }

    /// Bare hex of the Config entry, for either layout.
    pub fn config_hex(&self) -> String {
        let name = self
            .config
            .rsplit('/')
            .next()
            .unwrap_or(self.config.as_str());
        name.strip_suffix(".json").unwrap_or(name).to_string()
    }
}

/// Where an image lives on a registry and how to authenticate to it.
#[derive(Builder, Debug, Clone)]
#[builder(setter(into))]
pub struct RegistryEndpoint {
    pub host: String,
    pub image: String,
    pub tag: String,
    #[builder(default = "true")]
    pub secure: bool,
    #[builder(default)]
    pub username: Option<String>,
    #[builder(default)]
    pub password: Option<String>,
}

/// A token response from a registry authorization service.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
}

impl TokenResponse {
    pub fn into_token(self) -> Option<String> {
        self.token.or(self.access_token)
    }
}

/// View model for the common docker/podman config for finding authorizations.
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct DockerConfig {
    #[serde(default)]
    pub auths: HashMap<String, DockerAuth>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct DockerAuth {
    pub auth: Option<String>,
    pub identitytoken: Option<String>,
}

impl DockerAuth {
    /// Decode the base64 `user:pass` auth entry, if present and well formed.
    pub fn credentials(&self) -> Option<(String, String)> {
        let auth = self.auth.as_ref()?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(auth)
            .ok()?;
        let decoded = String::from_utf8_lossy(&decoded).to_string();
        let (username, password) = decoded.split_once(':')?;
        Some((username.to_string(), password.to_string()))
    }
}
