use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{IoResultExt, Result};

/// deployment configuration, read from an optional toml file
///
/// every field has a default, so an empty file is a valid config.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// os name used for `ostree/deploy/<osname>`
    pub osname: String,
    /// refspec recorded in the origin of new deployments
    pub refspec: String,
    /// reference deployed when none is given
    pub default_ref: String,
    pub server: ServerConfig,
    pub remote: RemoteConfig,
    pub image: ImageConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            osname: "torizon".to_string(),
            refspec: "torizon".to_string(),
            default_ref: crate::resolve::BASE_REF.to_string(),
            server: ServerConfig::default(),
            remote: RemoteConfig::default(),
            image: ImageConfig::default(),
        }
    }
}

/// content server bind address
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// 0 picks an ephemeral port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub username: String,
    /// name the device registers the tunneled store under
    pub update_source: String,
    /// device-side loopback port of the reverse tunnel
    pub remote_port: u16,
    /// accept host keys not in known_hosts
    pub trust_unknown_host_keys: bool,
    pub ssh_program: String,
    pub device: DeviceConfig,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            username: "torizon".to_string(),
            update_source: "tcbuilder".to_string(),
            remote_port: 8080,
            trust_unknown_host_keys: true,
            ssh_program: "ssh".to_string(),
            device: DeviceConfig::default(),
        }
    }
}

/// commands run on the device, before sudo wrapping
///
/// placeholders: `{source}` update source name, `{url}` tunneled store url,
/// `{sysroot}`, `{os}` and `{checksum}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// sysroot of the running device
    pub sysroot: String,
    pub add_remote: String,
    pub pull: String,
    pub deploy: String,
    pub reboot: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            sysroot: "/".to_string(),
            add_remote: "rootdeploy remote add --sysroot {sysroot} --force {source} {url}"
                .to_string(),
            pull: "rootdeploy pull --sysroot {sysroot} {source} {checksum}".to_string(),
            deploy: "rootdeploy admin deploy --sysroot {sysroot} --os {os} \
                     --origin {source}:{checksum} {checksum}"
                .to_string(),
            // detached so the session can still report back
            reboot: "sh -c 'reboot &'".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// xz preset passed through XZ_OPT
    pub xz_level: u32,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self { xz_level: 1 }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_path(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        crate::fs::write_atomic(path, content.as_bytes())
    }

    /// load `path` when given, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let config = Self::load(path)?;
                tracing::debug!(path = %path.display(), "loaded config");
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }
}
