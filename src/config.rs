//! Configuration management
//!
//! # Example YAML
//!
//! ```yaml
//! cert_file: /etc/node-bootstrapper/tls/node.crt
//! key_file:  /etc/node-bootstrapper/tls/node.key
//! ca_cert_file: /etc/node-bootstrapper/tls/ca.crt
//! allowed_names:
//!   - "CN=ops-controller,O=Example"
//!   - "CN=update-server,O=Example"
//! listen_port: 4443
//! update_url: https://updates.example.com/agent.tgz
//! installer:
//!   command: /usr/local/bin/install-package
//!   args: ["--from-stdin"]
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::bootstrapper::BootstrapperConfig;
use crate::installer::{CommandInstaller, DEFAULT_MALFORMED_EXIT_CODE};
use crate::{Error, Result};

/// Environment variable prefix; `__` separates nested keys.
pub const ENV_PREFIX: &str = "NODE_BOOTSTRAPPER_";

/// Default self-update listener port.
pub const DEFAULT_LISTEN_PORT: u16 = 4443;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// PEM certificate this node presents.
    pub cert_file: PathBuf,
    /// PEM private key for `cert_file`.
    pub key_file: PathBuf,
    /// Inline CA PEM text. Takes precedence over `ca_cert_file`.
    pub ca_cert_pem: Option<String>,
    /// Path to the CA PEM file.
    pub ca_cert_file: Option<PathBuf>,
    /// Distinguished names allowed as controller or update source.
    pub allowed_names: Vec<String>,
    /// Port for the self-update listener.
    pub listen_port: u16,
    /// Default package URL for `download`.
    pub update_url: Option<String>,
    /// Package installer settings.
    pub installer: InstallerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cert_file: PathBuf::new(),
            key_file: PathBuf::new(),
            ca_cert_pem: None,
            ca_cert_file: None,
            allowed_names: Vec::new(),
            listen_port: DEFAULT_LISTEN_PORT,
            update_url: None,
            installer: InstallerConfig::default(),
        }
    }
}

/// External installer program settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerConfig {
    /// Program that receives the package on stdin.
    pub command: String,
    /// Arguments passed to `command`.
    pub args: Vec<String>,
    /// Exit status meaning "payload rejected".
    pub malformed_exit_code: i32,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            malformed_exit_code: DEFAULT_MALFORMED_EXIT_CODE,
        }
    }
}

impl InstallerConfig {
    /// Build the command-backed installer.
    ///
    /// # Errors
    ///
    /// Returns an error if no command is configured.
    pub fn build(&self) -> Result<CommandInstaller> {
        if self.command.trim().is_empty() {
            return Err(Error::Config("installer.command must be specified".to_string()));
        }
        Ok(CommandInstaller::new(self.command.clone(), self.args.clone())
            .with_malformed_exit_code(self.malformed_exit_code))
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Resolve the CA PEM text: inline first, then file.
    ///
    /// # Errors
    ///
    /// Returns an error if neither is set or the file cannot be read.
    pub fn ca_pem(&self) -> Result<String> {
        if let Some(pem) = &self.ca_cert_pem {
            return Ok(pem.clone());
        }
        let path = self
            .ca_cert_file
            .as_ref()
            .ok_or_else(|| Error::Config("ca_cert_pem or ca_cert_file must be specified".to_string()))?;
        fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Cannot read '{}': {e}", path.display())))
    }

    /// Snapshot handed to [`crate::Bootstrapper::new`].
    ///
    /// # Errors
    ///
    /// Returns an error if the CA PEM cannot be resolved.
    pub fn bootstrapper_config(&self) -> Result<BootstrapperConfig> {
        Ok(BootstrapperConfig {
            cert_file: self.cert_file.clone(),
            key_file: self.key_file.clone(),
            ca_cert_pem: self.ca_pem()?,
            allowed_names: self.allowed_names.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.listen_port, DEFAULT_LISTEN_PORT);
        assert!(cfg.allowed_names.is_empty());
        assert_eq!(cfg.installer.malformed_exit_code, 65);
    }

    #[test]
    fn full_config_deserialises_from_yaml() {
        // GIVEN: a complete YAML document
        let yaml = r#"
cert_file: /tls/node.crt
key_file: /tls/node.key
ca_cert_pem: "-----BEGIN CERTIFICATE-----"
allowed_names:
  - "CN=ops-controller"
  - "CN=update-server,O=Example"
listen_port: 6868
update_url: https://updates.example.com/agent.tgz
installer:
  command: /bin/install
  args: ["--stdin"]
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        // THEN: fields parsed, unspecified ones defaulted
        assert_eq!(cfg.allowed_names.len(), 2);
        assert_eq!(cfg.listen_port, 6868);
        assert_eq!(cfg.installer.args, vec!["--stdin"]);
        assert_eq!(cfg.installer.malformed_exit_code, 65);
    }

    #[test]
    fn inline_ca_wins_over_file() {
        let cfg = Config {
            ca_cert_pem: Some("inline".to_string()),
            ca_cert_file: Some(PathBuf::from("/nonexistent/ca.crt")),
            ..Config::default()
        };
        assert_eq!(cfg.ca_pem().unwrap(), "inline");
    }

    #[test]
    fn ca_file_is_read_when_no_inline_pem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ca.crt");
        fs::write(&path, "from-file").unwrap();

        let cfg = Config {
            ca_cert_file: Some(path),
            ..Config::default()
        };
        assert_eq!(cfg.ca_pem().unwrap(), "from-file");
    }

    #[test]
    fn missing_ca_is_config_error() {
        assert!(Config::default().ca_pem().unwrap_err().is_config());
    }

    #[test]
    fn load_rejects_missing_file() {
        let err = Config::load(Some(Path::new("/nonexistent/bootstrapper.yaml"))).unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }

    #[test]
    fn load_reads_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bootstrapper.yaml");
        fs::write(&path, "allowed_names: [\"CN=a\"]\nlisten_port: 7000\n").unwrap();

        let cfg = Config::load(Some(&path)).unwrap();
        assert_eq!(cfg.allowed_names, vec!["CN=a"]);
        assert_eq!(cfg.listen_port, 7000);
    }

    #[test]
    fn installer_requires_command() {
        assert!(InstallerConfig::default().build().is_err());
        let cfg = InstallerConfig {
            command: "/bin/true".to_string(),
            ..InstallerConfig::default()
        };
        assert!(cfg.build().is_ok());
    }

    #[test]
    fn bootstrapper_config_copies_fields() {
        let cfg = Config {
            cert_file: PathBuf::from("/tls/node.crt"),
            key_file: PathBuf::from("/tls/node.key"),
            ca_cert_pem: Some("pem".to_string()),
            allowed_names: vec!["CN=x".to_string()],
            ..Config::default()
        };
        let snapshot = cfg.bootstrapper_config().unwrap();
        assert_eq!(snapshot.cert_file, PathBuf::from("/tls/node.crt"));
        assert_eq!(snapshot.ca_cert_pem, "pem");
        assert_eq!(snapshot.allowed_names, vec!["CN=x"]);
    }
}
