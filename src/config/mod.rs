//! Layered configuration (spec §6.3, §10.3).
//!
//! Three layers, lowest to highest precedence: built-in defaults, a TOML
//! config file (`--config`), then CLI flags / `RUNTIME_`-prefixed
//! environment variables (the latter two share one precedence level, same
//! as `clap`'s own `env` fallback).

use crate::error::{RuntimeError, RuntimeResult};
use crate::machine::MachineClass;
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Every field the CLI layer can supply. `None` means "not passed on the
/// command line or via environment" — left for the file layer or defaults.
#[derive(Debug, Parser)]
#[command(name = "machine-runtimed", version, about = "Node-local machine runtime")]
pub struct CliArgs {
    /// Path to a TOML config file merged beneath CLI flags/env.
    #[arg(long, env = "RUNTIME_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "RUNTIME_LISTEN")]
    pub listen: Option<PathBuf>,

    #[arg(long, env = "RUNTIME_ROOT")]
    pub root: Option<PathBuf>,

    #[arg(long, env = "RUNTIME_HYPERVISOR_URI")]
    pub hypervisor_uri: Option<String>,

    #[arg(long, env = "RUNTIME_PREFERRED_DOMAIN_TYPE")]
    pub preferred_domain_type: Option<String>,

    #[arg(long, env = "RUNTIME_PREFERRED_MACHINE_TYPE")]
    pub preferred_machine_type: Option<String>,

    #[arg(long, env = "RUNTIME_QCOW2_IMPL")]
    pub qcow2_impl: Option<String>,

    #[arg(long, env = "RUNTIME_BASE_URL")]
    pub base_url: Option<String>,

    #[arg(long, env = "RUNTIME_CLASS_CATALOGUE")]
    pub class_catalogue: Option<PathBuf>,

    #[arg(long, env = "RUNTIME_NETWORK_INTERFACE_PLUGIN")]
    pub network_interface_plugin: Option<String>,

    #[arg(long, env = "RUNTIME_OVERCOMMIT_FACTOR")]
    pub overcommit_factor: Option<f64>,

    #[arg(long, env = "RUNTIME_RESERVED_MEMORY_BYTES")]
    pub reserved_memory_bytes: Option<i64>,

    #[arg(long, env = "RUNTIME_BLOCKED_HUGEPAGES")]
    pub blocked_hugepages: Option<i64>,

    /// Backs guest memory with preallocated hugepages instead of the plain
    /// `memory` source. The two are alternate accountants for the same
    /// `memory` resource name and are never registered together (spec §4.3
    /// "Incompatibility").
    #[arg(long, env = "RUNTIME_HUGEPAGES_BACKED")]
    pub hugepages_backed: Option<bool>,

    /// Comma-separated CPU ids excluded from NUMA placement.
    #[arg(long, env = "RUNTIME_BLOCKED_CPUS", value_delimiter = ',')]
    pub blocked_cpus: Option<Vec<u32>>,

    #[arg(long, env = "RUNTIME_LEADER_ELECTION")]
    pub leader_election: Option<bool>,
}

/// Mirror of [`CliArgs`] loaded from the optional TOML file, every field
/// optional so a partial file only overrides what it names.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    listen: Option<PathBuf>,
    root: Option<PathBuf>,
    hypervisor_uri: Option<String>,
    preferred_domain_type: Option<String>,
    preferred_machine_type: Option<String>,
    qcow2_impl: Option<String>,
    base_url: Option<String>,
    class_catalogue: Option<PathBuf>,
    network_interface_plugin: Option<String>,
    overcommit_factor: Option<f64>,
    reserved_memory_bytes: Option<i64>,
    blocked_hugepages: Option<i64>,
    hugepages_backed: Option<bool>,
    blocked_cpus: Option<Vec<u32>>,
    leader_election: Option<bool>,
}

/// The fully resolved configuration the binary wires up services from.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: PathBuf,
    pub root: PathBuf,
    pub hypervisor_uri: String,
    pub preferred_domain_type: String,
    pub preferred_machine_type: String,
    pub qcow2_impl: String,
    pub base_url: String,
    pub class_catalogue: PathBuf,
    pub network_interface_plugin: String,
    pub overcommit_factor: f64,
    pub reserved_memory_bytes: i64,
    pub blocked_hugepages: i64,
    pub hugepages_backed: bool,
    pub blocked_cpus: Vec<u32>,
    pub leader_election: bool,
}

impl Config {
    fn defaults() -> Self {
        Self {
            listen: PathBuf::from("/run/nexa/machine-runtime.sock"),
            root: PathBuf::from("/var/lib/nexa/machine-runtime"),
            hypervisor_uri: "qemu:///system".to_string(),
            preferred_domain_type: "kvm".to_string(),
            preferred_machine_type: "q35".to_string(),
            qcow2_impl: "qemu-img".to_string(),
            base_url: "http://localhost:8080".to_string(),
            class_catalogue: PathBuf::from("/etc/nexa/machine-classes.toml"),
            network_interface_plugin: "bridge".to_string(),
            overcommit_factor: 1.0,
            reserved_memory_bytes: 0,
            blocked_hugepages: 0,
            hugepages_backed: false,
            blocked_cpus: Vec::new(),
            leader_election: false,
        }
    }

    /// Builds the merged configuration: CLI/env atop an optional TOML file
    /// atop built-in defaults, then validates it (spec §10.3).
    pub fn load(cli: CliArgs) -> RuntimeResult<Self> {
        let file = match &cli.config {
            Some(path) => load_file_config(path)?,
            None => FileConfig::default(),
        };

        let mut cfg = Self::defaults();
        macro_rules! layer {
            ($field:ident) => {
                if let Some(v) = file.$field {
                    cfg.$field = v;
                }
                if let Some(v) = cli.$field {
                    cfg.$field = v;
                }
            };
        }
        layer!(listen);
        layer!(root);
        layer!(hypervisor_uri);
        layer!(preferred_domain_type);
        layer!(preferred_machine_type);
        layer!(qcow2_impl);
        layer!(base_url);
        layer!(class_catalogue);
        layer!(network_interface_plugin);
        layer!(overcommit_factor);
        layer!(reserved_memory_bytes);
        layer!(blocked_hugepages);
        layer!(hugepages_backed);
        layer!(blocked_cpus);
        layer!(leader_election);

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> RuntimeResult<()> {
        if self.overcommit_factor <= 0.0 {
            return Err(RuntimeError::InvalidArgument(
                "overcommit factor must be > 0".into(),
            ));
        }
        if self.reserved_memory_bytes < 0 {
            return Err(RuntimeError::InvalidArgument(
                "reserved memory must not be negative".into(),
            ));
        }
        if self.blocked_hugepages < 0 {
            return Err(RuntimeError::InvalidArgument(
                "blocked hugepage count must not be negative".into(),
            ));
        }
        Ok(())
    }

    /// Loads and validates the machine-class catalogue named by
    /// `class_catalogue` (spec §10.3: "must parse and be non-empty").
    pub fn load_classes(&self) -> RuntimeResult<Vec<MachineClass>> {
        load_class_catalogue(&self.class_catalogue)
    }
}

fn load_file_config(path: &Path) -> RuntimeResult<FileConfig> {
    config::Config::builder()
        .add_source(config::File::from(path.to_path_buf()))
        .build()
        .and_then(|c| c.try_deserialize())
        .map_err(|e| RuntimeError::InvalidArgument(format!("loading config file {path:?}: {e}")))
}

#[derive(Debug, Deserialize)]
struct ClassCatalogueFile {
    #[serde(default)]
    classes: Vec<ClassCatalogueEntry>,
}

#[derive(Debug, Deserialize)]
struct ClassCatalogueEntry {
    name: String,
    cpu_millis: i64,
    memory_bytes: i64,
    #[serde(default)]
    other: crate::quantity::ResourceVector,
}

fn load_class_catalogue(path: &Path) -> RuntimeResult<Vec<MachineClass>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| RuntimeError::InvalidArgument(format!("reading class catalogue {path:?}: {e}")))?;
    let parsed: ClassCatalogueFile =
        toml::from_str(&text).map_err(|e| RuntimeError::InvalidArgument(format!("parsing class catalogue {path:?}: {e}")))?;
    if parsed.classes.is_empty() {
        return Err(RuntimeError::InvalidArgument(format!(
            "class catalogue {path:?} declares no classes"
        )));
    }
    Ok(parsed
        .classes
        .into_iter()
        .map(|c| {
            MachineClass::new(
                c.name,
                crate::machine::MachineClassCapabilities {
                    cpu_millis: c.cpu_millis,
                    memory_bytes: c.memory_bytes,
                    other: c.other,
                },
            )
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_cli() -> CliArgs {
        CliArgs {
            config: None,
            listen: None,
            root: None,
            hypervisor_uri: None,
            preferred_domain_type: None,
            preferred_machine_type: None,
            qcow2_impl: None,
            base_url: None,
            class_catalogue: None,
            network_interface_plugin: None,
            overcommit_factor: None,
            reserved_memory_bytes: None,
            blocked_hugepages: None,
            hugepages_backed: None,
            blocked_cpus: None,
            leader_election: None,
        }
    }

    #[test]
    fn defaults_are_used_when_nothing_supplied() {
        let cfg = Config::load(empty_cli()).unwrap();
        assert_eq!(cfg.overcommit_factor, 1.0);
        assert_eq!(cfg.preferred_domain_type, "kvm");
    }

    #[test]
    fn cli_overrides_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "overcommit_factor = 2.0\nroot = \"/file/root\"\n").unwrap();

        let mut cli = empty_cli();
        cli.config = Some(path);
        cli.root = Some(PathBuf::from("/cli/root"));

        let cfg = Config::load(cli).unwrap();
        assert_eq!(cfg.overcommit_factor, 2.0); // from file, cli silent on it
        assert_eq!(cfg.root, PathBuf::from("/cli/root")); // cli wins over file
    }

    #[test]
    fn zero_overcommit_factor_is_rejected() {
        let mut cli = empty_cli();
        cli.overcommit_factor = Some(0.0);
        assert!(Config::load(cli).is_err());
    }

    #[test]
    fn empty_class_catalogue_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("classes.toml");
        std::fs::write(&path, "classes = []\n").unwrap();
        let err = load_class_catalogue(&path).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidArgument(_)));
    }

    #[test]
    fn class_catalogue_parses_named_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("classes.toml");
        std::fs::write(
            &path,
            r#"
            [[classes]]
            name = "x3-xlarge"
            cpu_millis = 4000
            memory_bytes = 8589934592
            "#,
        )
        .unwrap();
        let classes = load_class_catalogue(&path).unwrap();
        assert_eq!(classes.len(), 1);
        assert_eq!(classes[0].name, "x3-xlarge");
    }
}
