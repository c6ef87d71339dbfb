//! Wire ↔ domain conversions for the machine runtime RPC surface (spec §6.1).
//!
//! Kept separate from [`super`]'s service dispatch so the procedure bodies
//! read as "validate, translate, call the core, translate back" without the
//! field-by-field plumbing in the way.

use crate::error::{RuntimeError, RuntimeResult};
use crate::machine as domain;
use crate::metadata::ObjectMeta;
use crate::pb;
use crate::quantity::{Quantity, ResourceVector, Unit};
use std::collections::BTreeMap;

pub fn meta_to_pb(m: &ObjectMeta) -> pb::ObjectMeta {
    pb::ObjectMeta {
        id: m.id.clone(),
        labels: m.labels.clone().into_iter().collect(),
        annotations: m.annotations.clone().into_iter().collect(),
        created_at: m.created_at,
        deleted_at: m.deleted_at,
        generation: m.generation,
        resource_version: m.resource_version,
        finalizers: m.finalizers.clone(),
    }
}

fn unit_to_str(unit: Unit) -> &'static str {
    match unit {
        Unit::MilliCpu => "milliCpu",
        Unit::Bytes => "bytes",
        Unit::Count => "count",
    }
}

fn unit_from_str(s: &str) -> RuntimeResult<Unit> {
    match s {
        "milliCpu" => Ok(Unit::MilliCpu),
        "bytes" => Ok(Unit::Bytes),
        "count" => Ok(Unit::Count),
        other => Err(RuntimeError::InvalidArgument(format!("unknown resource quantity unit {other:?}"))),
    }
}

pub fn quantity_to_pb(q: &Quantity) -> pb::ResourceQuantity {
    pb::ResourceQuantity { amount: q.amount, unit: unit_to_str(q.unit).to_string() }
}

fn quantity_from_pb(q: pb::ResourceQuantity) -> RuntimeResult<Quantity> {
    Ok(Quantity::new(q.amount, unit_from_str(&q.unit)?))
}

pub fn resources_to_pb(v: &ResourceVector) -> BTreeMap<String, pb::ResourceQuantity> {
    v.iter().map(|(k, q)| (k.clone(), quantity_to_pb(q))).collect()
}

fn power_to_pb(p: domain::Power) -> i32 {
    match p {
        domain::Power::On => pb::Power::On as i32,
        domain::Power::Off => pb::Power::Off as i32,
    }
}

pub fn power_from_pb(p: i32) -> RuntimeResult<domain::Power> {
    match pb::Power::try_from(p).unwrap_or(pb::Power::Unspecified) {
        pb::Power::On => Ok(domain::Power::On),
        pb::Power::Off => Ok(domain::Power::Off),
        pb::Power::Unspecified => Err(RuntimeError::InvalidArgument("power must be ON or OFF".into())),
    }
}

fn guest_agent_to_pb(g: domain::GuestAgent) -> i32 {
    match g {
        domain::GuestAgent::None => pb::GuestAgent::None as i32,
        domain::GuestAgent::QemuAgent => pb::GuestAgent::Qemu as i32,
    }
}

fn guest_agent_from_pb(g: i32) -> domain::GuestAgent {
    match pb::GuestAgent::try_from(g).unwrap_or(pb::GuestAgent::None) {
        pb::GuestAgent::Qemu => domain::GuestAgent::QemuAgent,
        _ => domain::GuestAgent::None,
    }
}

fn state_to_pb(s: Option<domain::MachineState>) -> i32 {
    let Some(s) = s else { return pb::MachineState::Unspecified as i32 };
    (match s {
        domain::MachineState::Pending => pb::MachineState::Pending,
        domain::MachineState::Running => pb::MachineState::Running,
        domain::MachineState::Suspended => pb::MachineState::Suspended,
        domain::MachineState::Terminating => pb::MachineState::Terminating,
        domain::MachineState::Terminated => pb::MachineState::Terminated,
    }) as i32
}

pub fn volume_to_pb(v: &domain::Volume) -> pb::Volume {
    let source = Some(match &v.source {
        domain::VolumeSource::EmptyDisk { size_bytes } => {
            pb::volume::Source::EmptyDisk(pb::EmptyDiskSource { size_bytes: *size_bytes })
        }
        domain::VolumeSource::Connection { driver, handle, attributes, secret_data, encryption } => {
            pb::volume::Source::Connection(pb::ConnectionSource {
                driver: driver.clone(),
                handle: handle.clone(),
                attributes: attributes.clone().into_iter().collect(),
                secret_data: secret_data.clone().into_iter().collect(),
                encryption: encryption
                    .as_ref()
                    .map(|e| pb::VolumeEncryption { passphrase_secret_ref: e.passphrase_secret_ref.clone() }),
            })
        }
    });
    pb::Volume { name: v.name.clone(), device: v.device.clone(), source }
}

pub fn volume_from_pb(v: pb::Volume) -> RuntimeResult<domain::Volume> {
    let source = match v.source.ok_or_else(|| RuntimeError::InvalidArgument("volume requires a source".into()))? {
        pb::volume::Source::EmptyDisk(e) => domain::VolumeSource::EmptyDisk { size_bytes: e.size_bytes },
        pb::volume::Source::Connection(c) => domain::VolumeSource::Connection {
            driver: c.driver,
            handle: c.handle,
            attributes: c.attributes.into_iter().collect(),
            secret_data: c.secret_data.into_iter().collect(),
            encryption: c.encryption.map(|e| domain::VolumeEncryption { passphrase_secret_ref: e.passphrase_secret_ref }),
        },
    };
    Ok(domain::Volume { name: v.name, device: v.device, source })
}

pub fn nic_to_pb(n: &domain::NetworkInterface) -> pb::NetworkInterface {
    pb::NetworkInterface {
        name: n.name.clone(),
        network_id: n.network_id.clone(),
        ips: n.ips.clone(),
        attributes: n.attributes.clone().into_iter().collect(),
    }
}

pub fn nic_from_pb(n: pb::NetworkInterface) -> domain::NetworkInterface {
    domain::NetworkInterface {
        name: n.name,
        network_id: n.network_id,
        ips: n.ips,
        attributes: n.attributes.into_iter().collect(),
    }
}

/// Translates the caller-supplied portion of a `MachineSpec`. `resources` is
/// always dropped on the floor: it is populated exclusively by the resource
/// manager (spec §3.5), never accepted from a caller.
pub fn spec_from_pb(s: pb::MachineSpec) -> RuntimeResult<domain::MachineSpec> {
    Ok(domain::MachineSpec {
        class: s.class,
        power: domain::PowerOrDefault(power_from_pb(s.power)?),
        image: s.image,
        ignition: s.ignition,
        volumes: s.volumes.into_iter().map(volume_from_pb).collect::<RuntimeResult<Vec<_>>>()?,
        network_interfaces: s.network_interfaces.into_iter().map(nic_from_pb).collect(),
        resources: ResourceVector::new(),
        guest_agent: guest_agent_from_pb(s.guest_agent),
    })
}

pub fn spec_to_pb(s: &domain::MachineSpec) -> pb::MachineSpec {
    pb::MachineSpec {
        class: s.class.clone(),
        power: power_to_pb(s.power.0),
        image: s.image.clone(),
        ignition: s.ignition.clone(),
        volumes: s.volumes.iter().map(volume_to_pb).collect(),
        network_interfaces: s.network_interfaces.iter().map(nic_to_pb).collect(),
        resources: resources_to_pb(&s.resources),
        guest_agent: guest_agent_to_pb(s.guest_agent),
    }
}

pub fn status_to_pb(s: &domain::MachineStatus) -> pb::MachineStatus {
    pb::MachineStatus {
        state: state_to_pb(s.state),
        image_ref: s.image_ref.clone(),
        volumes: s.volumes.iter().map(volume_to_pb).collect(),
        network_interfaces: s.network_interfaces.iter().map(nic_to_pb).collect(),
    }
}

pub fn machine_to_pb(m: &domain::Machine) -> pb::Machine {
    pb::Machine {
        metadata: Some(meta_to_pb(&m.metadata)),
        spec: Some(spec_to_pb(&m.spec)),
        status: Some(status_to_pb(&m.status)),
    }
}
