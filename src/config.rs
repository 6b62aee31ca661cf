use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub listen: ListenConfig,
    pub tls: TlsConfig,
    pub identity: IdentityConfig,
    pub control: ControlConfig,
    pub registry: RegistryConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ListenConfig {
    /// TCP port the NBD gateway listens on
    pub port: u16,

    /// Address to bind (default: all interfaces)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub address: Option<IpAddr>,
}

/// TLS configuration for client connections.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    /// Disable TLS and serve plaintext. Insecure; never the default.
    #[serde(default)]
    pub no_tls: bool,

    /// Path to a PEM file holding the certificate chain and private key.
    /// The gateway waits for this file to appear at startup.
    #[serde(
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_optional_expandable_path",
        default
    )]
    pub certfile: Option<PathBuf>,

    /// Colon-separated cipher suite names (e.g. "TLS13_AES_256_GCM_SHA384").
    /// Empty or absent keeps the provider defaults.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ciphersuites: Option<String>,

    /// How long to wait for the certificate file before giving up
    #[serde(default = "default_cert_wait_secs")]
    pub cert_wait_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct IdentityConfig {
    /// Base URL of the identity service used to validate sessions
    #[serde(deserialize_with = "deserialize_expandable_string")]
    pub url: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ControlConfig {
    /// Base URL of the storage control plane
    #[serde(deserialize_with = "deserialize_expandable_string")]
    pub url: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    /// Directory holding one record file per in-flight lease
    #[serde(deserialize_with = "deserialize_expandable_path")]
    pub dir: PathBuf,
}

fn default_cert_wait_secs() -> u64 {
    90
}

fn deserialize_expandable_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    match shellexpand::env(&s) {
        Ok(expanded) => Ok(expanded.into_owned()),
        Err(e) => Err(serde::de::Error::custom(format!(
            "Failed to expand environment variable: {}",
            e
        ))),
    }
}

fn deserialize_expandable_path<'de, D>(deserializer: D) -> Result<PathBuf, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    match shellexpand::env(&s) {
        Ok(expanded) => Ok(PathBuf::from(expanded.into_owned())),
        Err(e) => Err(serde::de::Error::custom(format!(
            "Failed to expand environment variable: {}",
            e
        ))),
    }
}

fn deserialize_optional_expandable_path<'de, D>(
    deserializer: D,
) -> Result<Option<PathBuf>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt = Option::<String>::deserialize(deserializer)?;
    opt.map(|s| match shellexpand::env(&s) {
        Ok(expanded) => Ok(PathBuf::from(expanded.into_owned())),
        Err(e) => Err(serde::de::Error::custom(format!(
            "Failed to expand environment variable: {}",
            e
        ))),
    })
    .transpose()
}

impl Settings {
    pub fn from_file(config_path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = config_path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let settings: Settings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Cross-field checks that toml parsing cannot express.
    fn validate(&self) -> Result<()> {
        if !self.tls.no_tls && self.tls.certfile.is_none() {
            anyhow::bail!("tls.certfile is required unless tls.no_tls is set");
        }
        if self.identity.url.is_empty() {
            anyhow::bail!("identity.url must not be empty");
        }
        if self.control.url.is_empty() {
            anyhow::bail!("control.url must not be empty");
        }
        Ok(())
    }

    pub fn generate_default() -> Self {
        Settings {
            listen: ListenConfig {
                port: 10809,
                address: None,
            },
            tls: TlsConfig {
                no_tls: false,
                certfile: Some(PathBuf::from("/etc/volnbd/server.pem")),
                ciphersuites: None,
                cert_wait_secs: default_cert_wait_secs(),
            },
            identity: IdentityConfig {
                url: "http://127.0.0.1:8443".to_string(),
            },
            control: ControlConfig {
                url: "http://127.0.0.1:8080".to_string(),
            },
            registry: RegistryConfig {
                dir: PathBuf::from("/var/lib/volnbd/leases"),
            },
        }
    }

    pub fn write_default_config(path: impl AsRef<std::path::Path>) -> Result<()> {
        let default = Self::generate_default();
        let toml_string = toml::to_string_pretty(&default)?;

        let commented = format!(
            "# volnbd Configuration File\n\
             # Generated by volnbd v{}\n\
             #\n\
             # Authenticated NBD gateway for control-plane attached volumes\n\
             #\n\
             # Environment variables are supported: ${{VAR}} or $VAR\n\
             #\n\
             # Clients request a volume with an export name of the form\n\
             #   /<volume_id>?session_id=<token>\n\
             # The session token is validated against identity.url before any\n\
             # attach is attempted. Lease records live under registry.dir, one\n\
             # JSON file per in-flight attachment; they can be inspected and\n\
             # removed individually for operational debugging.\n\
             #\n\
             \n{}",
            env!("CARGO_PKG_VERSION"),
            toml_string
        );

        fs::write(path, commented)?;
        Ok(())
    }
}
