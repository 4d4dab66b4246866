//! Node configuration (`gridnode.toml`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{TypesError, TypesResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node: NodeSection,
    pub registry: RegistrySection,
    pub services: ServicesSection,
    pub janitor: Option<JanitorSection>,
    pub expiry: Option<ExpirySection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Identity of this node in the registry.
    pub id: String,
    /// Root of deployments, shared index and reservation cache.
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySection {
    pub url: String,
    pub poll_interval_secs: Option<u64>,
    pub report_interval_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
}

/// Endpoints of the sibling daemons that own the real resources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesSection {
    pub containers: String,
    pub vms: String,
    pub networks: String,
    pub storage: String,
    pub flists: String,
    pub zdb: String,
    pub identity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JanitorSection {
    pub interval_secs: Option<u64>,
    pub storage_pool_prefix: Option<String>,
    pub legacy_names: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpirySection {
    pub interval_secs: Option<u64>,
}

impl NodeConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::parse(&content)?;
        Ok(config)
    }

    pub fn parse(content: &str) -> TypesResult<Self> {
        let config: NodeConfig =
            toml::from_str(content).map_err(|e| TypesError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn validate(&self) -> TypesResult<()> {
        if self.node.id.trim().is_empty() {
            return Err(TypesError::Config("node.id must not be empty".into()));
        }
        if !self.registry.url.starts_with("http://") && !self.registry.url.starts_with("https://") {
            return Err(TypesError::Config(format!(
                "registry.url must be http(s): {}",
                self.registry.url
            )));
        }
        Ok(())
    }

    pub fn deployments_dir(&self) -> PathBuf {
        self.node.data_dir.join("deployments")
    }

    pub fn cache_path(&self) -> PathBuf {
        self.node.data_dir.join("reservations.redb")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.registry.poll_interval_secs.unwrap_or(10))
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.registry.report_interval_secs.unwrap_or(60))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.registry.request_timeout_secs.unwrap_or(30))
    }

    pub fn janitor_interval(&self) -> Duration {
        let secs = self.janitor.as_ref().and_then(|j| j.interval_secs);
        Duration::from_secs(secs.unwrap_or(60 * 60))
    }

    pub fn expiry_interval(&self) -> Duration {
        let secs = self.expiry.as_ref().and_then(|e| e.interval_secs);
        Duration::from_secs(secs.unwrap_or(5 * 60))
    }

    /// Scaffold a config pointing every service at localhost.
    pub fn scaffold(node_id: &str, data_dir: &Path) -> Self {
        let local = |port: u16| format!("http://127.0.0.1:{port}");
        NodeConfig {
            node: NodeSection {
                id: node_id.to_string(),
                data_dir: data_dir.to_path_buf(),
            },
            registry: RegistrySection {
                url: "https://registry.example.com".to_string(),
                poll_interval_secs: Some(10),
                report_interval_secs: Some(60),
                request_timeout_secs: Some(30),
            },
            services: ServicesSection {
                containers: local(7001),
                vms: local(7002),
                networks: local(7003),
                storage: local(7004),
                flists: local(7005),
                zdb: local(7006),
                identity: local(7007),
            },
            janitor: None,
            expiry: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaffold_round_trip() {
        let config = NodeConfig::scaffold("node-a", Path::new("/var/lib/gridnode"));
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("node-a"));
        let parsed = NodeConfig::parse(&toml_str).unwrap();
        assert_eq!(parsed.node.id, "node-a");
        assert_eq!(parsed.services.storage, "http://127.0.0.1:7004");
    }

    #[test]
    fn test_defaults() {
        let toml_str = r#"
[node]
id = "n1"
data_dir = "/tmp/n1"

[registry]
url = "http://localhost:8080"

[services]
containers = "http://c"
vms = "http://v"
networks = "http://n"
storage = "http://s"
flists = "http://f"
zdb = "http://z"
identity = "http://i"
"#;
        let config = NodeConfig::parse(toml_str).unwrap();
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.janitor_interval(), Duration::from_secs(3600));
        assert_eq!(config.cache_path(), PathBuf::from("/tmp/n1/reservations.redb"));
    }

    #[test]
    fn test_rejects_empty_node_id() {
        let mut config = NodeConfig::scaffold("x", Path::new("/tmp"));
        config.node.id = " ".into();
        let toml_str = config.to_toml_string().unwrap();
        assert!(matches!(NodeConfig::parse(&toml_str), Err(TypesError::Config(_))));
    }
}
