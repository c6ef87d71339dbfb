//! The machine record and machine classes (spec §3.2, §3.4).

mod class;

pub use class::{MachineClass, MachineClassCapabilities};

use crate::metadata::{Object, ObjectMeta};
use crate::quantity::ResourceVector;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Power {
    On,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuestAgent {
    None,
    QemuAgent,
}

impl Default for GuestAgent {
    fn default() -> Self {
        GuestAgent::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineState {
    Pending,
    Running,
    Suspended,
    Terminating,
    Terminated,
}

/// A volume's backing: exactly one of an ephemeral empty disk or a
/// connection to an externally plumbed volume (spec §3.2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VolumeSource {
    EmptyDisk {
        size_bytes: i64,
    },
    Connection {
        driver: String,
        handle: String,
        #[serde(default)]
        attributes: std::collections::BTreeMap<String, String>,
        #[serde(default)]
        secret_data: std::collections::BTreeMap<String, Vec<u8>>,
        #[serde(default)]
        encryption: Option<VolumeEncryption>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeEncryption {
    pub passphrase_secret_ref: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    pub device: String,
    pub source: VolumeSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NetworkInterface {
    pub name: String,
    pub network_id: String,
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default)]
    pub attributes: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MachineSpec {
    pub class: String,
    pub power: PowerOrDefault,
    #[serde(default)]
    pub image: Option<Vec<u8>>,
    #[serde(default)]
    pub ignition: Option<Vec<u8>>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
    /// Populated by the resource manager on successful `Allocate`; never
    /// set directly by an RPC caller (spec §3.5).
    #[serde(default)]
    pub resources: ResourceVector,
    #[serde(default)]
    pub guest_agent: GuestAgent,
}

/// Wraps [`Power`] so `MachineSpec` can `#[derive(Default)]` without
/// picking an arbitrary default for a type that has no natural zero value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PowerOrDefault(pub Power);

impl Default for PowerOrDefault {
    fn default() -> Self {
        PowerOrDefault(Power::Off)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MachineStatus {
    pub state: Option<MachineState>,
    #[serde(default)]
    pub image_ref: Option<String>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub metadata: ObjectMeta,
    pub spec: MachineSpec,
    pub status: MachineStatus,
}

impl Machine {
    pub fn new(id: impl Into<String>, spec: MachineSpec) -> Self {
        Self {
            metadata: ObjectMeta::new(id),
            spec,
            status: MachineStatus::default(),
        }
    }
}

impl Object for Machine {
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn spec_changed(&self, previous: &Self) -> bool {
        self.spec != previous.spec
    }
}

/// Sets `status.state = Pending` on first persist, per spec §4.1's
/// `CreateStrategy` hook.
pub fn machine_create_strategy(m: &mut Machine) {
    if m.status.state.is_none() {
        m.status.state = Some(MachineState::Pending);
    }
}
