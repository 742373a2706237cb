//! Writes a runnable OCI bundle: the merged rootfs plus a runtime
//! `config.json` derived from the image configuration.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use snafu::ResultExt;

use super::directory::DirectorySink;
use crate::element::{Element, ElementSink};
use crate::models::ImageConfig;
use crate::{error, Result};

/// Baseline runtime specification the bundle's `config.json` is derived
/// from. Process arguments, working directory and hostname are filled in
/// from the image configuration.
const RUNTIME_SPEC_TEMPLATE: &str = r#"{
    "ociVersion": "1.0.2-dev",
    "process": {
        "terminal": false,
        "user": {
            "uid": 0,
            "gid": 0
        },
        "args": [
            "sh"
        ],
        "env": [
            "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
            "TERM=xterm"
        ],
        "cwd": "/",
        "capabilities": {
            "bounding": [
                "CAP_AUDIT_WRITE",
                "CAP_KILL",
                "CAP_NET_BIND_SERVICE"
            ],
            "effective": [
                "CAP_AUDIT_WRITE",
                "CAP_KILL",
                "CAP_NET_BIND_SERVICE"
            ],
            "inheritable": [
                "CAP_AUDIT_WRITE",
                "CAP_KILL",
                "CAP_NET_BIND_SERVICE"
            ],
            "permitted": [
                "CAP_AUDIT_WRITE",
                "CAP_KILL",
                "CAP_NET_BIND_SERVICE"
            ],
            "ambient": [
                "CAP_AUDIT_WRITE",
                "CAP_KILL",
                "CAP_NET_BIND_SERVICE"
            ]
        },
        "rlimits": [
            {
                "type": "RLIMIT_NOFILE",
                "hard": 1024,
                "soft": 1024
            }
        ],
        "noNewPrivileges": true
    },
    "root": {
        "path": "rootfs",
        "readonly": true
    },
    "hostname": "runc",
    "mounts": [
        {
            "destination": "/proc",
            "type": "proc",
            "source": "proc"
        },
        {
            "destination": "/dev",
            "type": "tmpfs",
            "source": "tmpfs",
            "options": [
                "nosuid",
                "strictatime",
                "mode=755",
                "size=65536k"
            ]
        },
        {
            "destination": "/dev/pts",
            "type": "devpts",
            "source": "devpts",
            "options": [
                "nosuid",
                "noexec",
                "newinstance",
                "ptmxmode=0666",
                "mode=0620",
                "gid=5"
            ]
        },
        {
            "destination": "/dev/shm",
            "type": "tmpfs",
            "source": "shm",
            "options": [
                "nosuid",
                "noexec",
                "nodev",
                "mode=1777",
                "size=65536k"
            ]
        },
        {
            "destination": "/dev/mqueue",
            "type": "mqueue",
            "source": "mqueue",
            "options": [
                "nosuid",
                "noexec",
                "nodev"
            ]
        },
        {
            "destination": "/sys",
            "type": "sysfs",
            "source": "sysfs",
            "options": [
                "nosuid",
                "noexec",
                "nodev",
                "ro"
            ]
        },
        {
            "destination": "/sys/fs/cgroup",
            "type": "cgroup",
            "source": "cgroup",
            "options": [
                "nosuid",
                "noexec",
                "nodev",
                "relatime",
                "ro"
            ]
        }
    ],
    "linux": {
        "resources": {
            "devices": [
                {
                    "allow": false,
                    "access": "rwm"
                }
            ]
        },
        "namespaces": [
            {
                "type": "pid"
            },
            {
                "type": "network"
            },
            {
                "type": "ipc"
            },
            {
                "type": "uts"
            },
            {
                "type": "mount"
            },
            {
                "type": "cgroup"
            }
        ],
        "maskedPaths": [
            "/proc/acpi",
            "/proc/asound",
            "/proc/kcore",
            "/proc/keys",
            "/proc/latency_stats",
            "/proc/timer_list",
            "/proc/timer_stats",
            "/proc/sched_debug",
            "/sys/firmware",
            "/proc/scsi"
        ],
        "readonlyPaths": [
            "/proc/bus",
            "/proc/fs",
            "/proc/irq",
            "/proc/sys",
            "/proc/sysrq-trigger"
        ]
    }
}"#;

/// Fill the runtime spec template from an image configuration and write it
/// to `dest`. Entrypoint and Cmd concatenate into the process arguments.
pub(crate) async fn write_runtime_config(
    config_raw: &[u8],
    dest: &Path,
    hostname: &str,
) -> Result<()> {
    let image_config: ImageConfig =
        serde_json::from_slice(config_raw).context(error::ConfigDeserializeSnafu)?;
    let mut spec: serde_json::Value =
        serde_json::from_str(RUNTIME_SPEC_TEMPLATE).expect("template is valid json");

    let mut args = image_config.config.entrypoint.clone().unwrap_or_default();
    args.extend(image_config.config.cmd.clone().unwrap_or_default());
    if !args.is_empty() {
        spec["process"]["args"] = serde_json::json!(args);
    }
    let cwd = image_config
        .config
        .working_dir
        .as_deref()
        .filter(|cwd| !cwd.is_empty())
        .unwrap_or("/");
    spec["process"]["cwd"] = serde_json::Value::String(cwd.to_string());
    if let Some(env) = image_config.config.env.as_ref() {
        if !env.is_empty() {
            spec["process"]["env"] = serde_json::json!(env);
        }
    }
    spec["hostname"] = serde_json::Value::String(hostname.to_string());

    let pretty = serde_json::to_vec_pretty(&spec).context(error::SerializeSnafu)?;
    tokio::fs::write(dest, pretty)
        .await
        .context(error::FileSnafu)?;
    Ok(())
}

/// A directory sink specialized into a runnable bundle: layers land on disk
/// long enough to merge a `rootfs/`, then the blob directories are removed
/// and a runtime `config.json` is written next to it.
pub struct BundleSink {
    dir: DirectorySink,
    path: PathBuf,
    config_name: Option<String>,
    config_data: Option<Bytes>,
}

impl BundleSink {
    pub async fn create(path: impl Into<PathBuf>, image: &str, tag: &str) -> Result<Self> {
        let path = path.into();
        let dir = DirectorySink::create(&path, image, tag, false, true, false).await?;
        Ok(Self {
            dir,
            path,
            config_name: None,
            config_data: None,
        })
    }
}

#[async_trait]
impl ElementSink for BundleSink {
    fn should_fetch(&self, digest: &str) -> bool {
        self.dir.should_fetch(digest)
    }

    async fn process(&mut self, element: Element) -> Result<()> {
        if let Element::Config { name, data } = &element {
            self.config_name = Some(name.clone());
            self.config_data = Some(data.clone());
        }
        self.dir.process(element).await
    }

    async fn finalize(&mut self) -> Result<()> {
        let rootfs = self.path.join("rootfs");
        info!("writing image bundle to {}", rootfs.display());
        self.dir
            .bundle
            .extract_merged(self.dir.root(), &rootfs)
            .await?;

        // The blob directories only existed to feed the merge.
        for layer in &self.dir.manifest.layers {
            if let Some((layer_dir, _)) = layer.split_once('/') {
                tokio::fs::remove_dir_all(self.path.join(layer_dir))
                    .await
                    .context(error::DirectorySnafu)?;
            }
        }

        let config_name = self.config_name.clone().ok_or(error::Error::ConfigMissing)?;
        let config_data = self.config_data.clone().ok_or(error::Error::ConfigMissing)?;
        tokio::fs::rename(
            self.path.join(config_name.as_str()),
            self.path.join("container-config.json"),
        )
        .await
        .context(error::FileSnafu)?;
        write_runtime_config(
            config_data.as_ref(),
            &self.path.join("config.json"),
            "ocistream",
        )
        .await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::element::Blob;
    use crate::testutil::{build_tar, TarEntry};

    const CONFIG: &str = r#"{
        "architecture": "amd64",
        "os": "linux",
        "config": {
            "Entrypoint": ["/docker-entrypoint.sh"],
            "Cmd": ["nginx", "-g", "daemon off;"],
            "WorkingDir": "",
            "Env": ["PATH=/usr/sbin:/usr/bin", "NGINX_VERSION=1.25"]
        },
        "history": []
    }"#;

    #[tokio::test]
    async fn test_bundle_layout() {
        let dir = tempfile::tempdir().unwrap();
        let layer = build_tar(&[
            TarEntry::dir("etc"),
            TarEntry::file("etc/nginx.conf", b"server {}"),
        ])
        .await;

        let mut sink = BundleSink::create(dir.path(), "library/nginx", "latest")
            .await
            .unwrap();
        sink.process(Element::config("abc.json", CONFIG.as_bytes().to_vec()))
            .await
            .unwrap();
        sink.process(Element::layer("aaa", Some(Blob::from_bytes(layer))))
            .await
            .unwrap();
        sink.finalize().await.unwrap();

        // Merged rootfs present, blob directory gone, config renamed.
        assert_eq!(
            tokio::fs::read(dir.path().join("rootfs/etc/nginx.conf"))
                .await
                .unwrap(),
            b"server {}"
        );
        assert!(!dir.path().join("aaa").exists());
        assert!(dir.path().join("container-config.json").exists());

        let spec: serde_json::Value = serde_json::from_slice(
            tokio::fs::read(dir.path().join("config.json"))
                .await
                .unwrap()
                .as_slice(),
        )
        .unwrap();
        assert_eq!(
            spec["process"]["args"],
            serde_json::json!(["/docker-entrypoint.sh", "nginx", "-g", "daemon off;"])
        );
        assert_eq!(spec["process"]["cwd"], "/");
        assert_eq!(spec["hostname"], "ocistream");
        assert_eq!(spec["root"]["path"], "rootfs");
    }

    #[tokio::test]
    async fn test_runtime_config_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("config.json");
        write_runtime_config(b"{\"config\": {}}", &dest, "box").await.unwrap();
        let spec: serde_json::Value =
            serde_json::from_slice(tokio::fs::read(&dest).await.unwrap().as_slice()).unwrap();
        assert_eq!(spec["process"]["args"], serde_json::json!(["sh"]));
        assert_eq!(spec["hostname"], "box");
    }
}
