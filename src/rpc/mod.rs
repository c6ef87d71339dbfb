//! The gRPC façade bound to a UNIX domain socket (spec §6.1).
//!
//! Translates external requests to [`crate::store::Store`] and
//! [`crate::resources::ResourceManager`] operations and converts records to
//! wire form; nothing downstream of this module knows `tonic` exists.

mod convert;

use crate::error::{RuntimeError, RuntimeResult};
use crate::exec::ExecTokens;
use crate::machine::Machine;
use crate::pb;
use crate::pb::machine_runtime_server::MachineRuntime;
use crate::resources::ResourceManager;
use crate::store::Store;
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{info, instrument};

/// Every dependency the RPC façade mediates between (spec §2 data flow).
pub struct MachineRuntimeService {
    store: Arc<Store<Machine>>,
    resource_manager: Arc<ResourceManager>,
    exec_tokens: ExecTokens,
    base_url: String,
}

impl MachineRuntimeService {
    pub fn new(
        store: Arc<Store<Machine>>,
        resource_manager: Arc<ResourceManager>,
        exec_tokens: ExecTokens,
        base_url: impl Into<String>,
    ) -> Self {
        Self { store, resource_manager, exec_tokens, base_url: base_url.into() }
    }

    pub fn into_server(self) -> pb::machine_runtime_server::MachineRuntimeServer<Self> {
        pb::machine_runtime_server::MachineRuntimeServer::new(self)
    }

    /// Re-reads, mutates, and writes back a machine, retrying on
    /// [`RuntimeError::ResourceVersionConflict`] — the façade's procedures
    /// take plain fields, not a caller-observed `resourceVersion`, so the
    /// read-modify-write/retry discipline spec §9 asks of callers is carried
    /// out here instead (spec §7: "callers that read-modify-write must
    /// tolerate conflict and retry").
    async fn update_with_retry(
        &self,
        id: &str,
        mut mutate: impl FnMut(&mut Machine) -> RuntimeResult<()>,
    ) -> RuntimeResult<Machine> {
        loop {
            let mut machine = self.store.get(id).await?;
            mutate(&mut machine)?;
            match self.store.update(machine).await {
                Ok(updated) => return Ok(updated),
                Err(RuntimeError::ResourceVersionConflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

#[tonic::async_trait]
impl MachineRuntime for MachineRuntimeService {
    #[instrument(skip_all)]
    async fn version(&self, _req: Request<pb::VersionRequest>) -> Result<Response<pb::VersionResponse>, Status> {
        Ok(Response::new(pb::VersionResponse {
            runtime_name: env!("CARGO_PKG_NAME").to_string(),
            semver: env!("CARGO_PKG_VERSION").to_string(),
        }))
    }

    #[instrument(skip_all)]
    async fn status(&self, _req: Request<pb::StatusRequest>) -> Result<Response<pb::StatusResponse>, Status> {
        let classes = self
            .resource_manager
            .status()
            .into_iter()
            .map(|c| pb::ClassStatus { class: c.name, fit_count: c.fit_count })
            .collect();
        Ok(Response::new(pb::StatusResponse { classes }))
    }

    #[instrument(skip(self, req))]
    async fn create_machine(&self, req: Request<pb::CreateMachineRequest>) -> Result<Response<pb::Machine>, Status> {
        let req = req.into_inner();
        let spec_pb = req
            .spec
            .ok_or_else(|| Status::from(RuntimeError::InvalidArgument("spec is required".into())))?;

        let class = self
            .resource_manager
            .class(&spec_pb.class)
            .ok_or_else(|| Status::from(RuntimeError::not_found("MachineClass", spec_pb.class.clone())))?;

        let spec = convert::spec_from_pb(spec_pb)?;
        // A fresh id is always assigned server-side; a caller-supplied `id`
        // is accepted on the wire for symmetry but ignored (spec §9 iii).
        let id = uuid::Uuid::new_v4().to_string();
        let mut machine = Machine::new(id, spec);
        machine.metadata.labels = req.labels.into_iter().collect();
        machine.metadata.annotations = req.annotations.into_iter().collect();
        machine.metadata.finalizers = req.finalizers;

        self.resource_manager.allocate(&mut machine, &class.resources)?;

        let store = self.store.clone();
        let persisted = store.create(machine.clone()).await;
        let created = match persisted {
            Ok(m) => m,
            Err(e) => {
                // The reservation has no home to live in; refund it so the
                // sum invariant (spec §8) holds even on a failed create.
                let to_free = machine.spec.resources.clone();
                let _ = self.resource_manager.deallocate(&mut machine, &to_free);
                return Err(e.into());
            }
        };
        info!(machine = %created.metadata.id, class = %created.spec.class, "machine created");
        Ok(Response::new(convert::machine_to_pb(&created)))
    }

    #[instrument(skip(self, req))]
    async fn list_machines(
        &self,
        req: Request<pb::ListMachinesRequest>,
    ) -> Result<Response<pb::ListMachinesResponse>, Status> {
        let req = req.into_inner();
        let machines = if let Some(id) = req.id {
            match self.store.get(&id).await {
                Ok(m) => vec![m],
                Err(RuntimeError::NotFound { .. }) => Vec::new(),
                Err(e) => return Err(e.into()),
            }
        } else {
            let selector = req.label_selector.into_iter().collect();
            self.store.list_matching(&selector).await?
        };
        Ok(Response::new(pb::ListMachinesResponse {
            machines: machines.iter().map(convert::machine_to_pb).collect(),
        }))
    }

    #[instrument(skip(self, req))]
    async fn delete_machine(&self, req: Request<pb::DeleteMachineRequest>) -> Result<Response<pb::Empty>, Status> {
        let id = req.into_inner().id;
        let current = self.store.get(&id).await?;

        // If this call will hard-delete the record outright (no finalizers,
        // not already soft-deleted), refund its reservation now; otherwise
        // the reconciler refunds it once it clears its own finalizer.
        if current.metadata.can_hard_delete() && !current.metadata.is_deleted() {
            if !current.spec.resources.is_empty() {
                let mut m = current.clone();
                let to_free = m.spec.resources.clone();
                self.resource_manager.deallocate(&mut m, &to_free)?;
            }
        }

        self.store.delete(&id).await?;
        Ok(Response::new(pb::Empty {}))
    }

    #[instrument(skip(self, req))]
    async fn update_machine_power(
        &self,
        req: Request<pb::UpdateMachinePowerRequest>,
    ) -> Result<Response<pb::Empty>, Status> {
        let req = req.into_inner();
        let power = convert::power_from_pb(req.power)?;
        self.update_with_retry(&req.id, |m| {
            m.spec.power = crate::machine::PowerOrDefault(power);
            Ok(())
        })
        .await?;
        Ok(Response::new(pb::Empty {}))
    }

    #[instrument(skip(self, req))]
    async fn update_machine_annotations(
        &self,
        req: Request<pb::UpdateMachineAnnotationsRequest>,
    ) -> Result<Response<pb::Empty>, Status> {
        let req = req.into_inner();
        let annotations: std::collections::BTreeMap<String, String> = req.annotations.into_iter().collect();
        self.update_with_retry(&req.id, |m| {
            m.metadata.annotations = annotations.clone();
            Ok(())
        })
        .await?;
        Ok(Response::new(pb::Empty {}))
    }

    #[instrument(skip(self, req))]
    async fn attach_volume(&self, req: Request<pb::AttachVolumeRequest>) -> Result<Response<pb::Empty>, Status> {
        let req = req.into_inner();
        let volume_pb = req
            .volume
            .ok_or_else(|| Status::from(RuntimeError::InvalidArgument("volume is required".into())))?;
        let volume = convert::volume_from_pb(volume_pb)?;
        self.update_with_retry(&req.id, |m| {
            if m.spec.volumes.iter().any(|v| v.name == volume.name) {
                return Err(RuntimeError::InvalidArgument(format!("volume {:?} already attached", volume.name)));
            }
            m.spec.volumes.push(volume.clone());
            Ok(())
        })
        .await?;
        Ok(Response::new(pb::Empty {}))
    }

    #[instrument(skip(self, req))]
    async fn detach_volume(&self, req: Request<pb::DetachVolumeRequest>) -> Result<Response<pb::Empty>, Status> {
        let req = req.into_inner();
        self.update_with_retry(&req.id, |m| {
            let before = m.spec.volumes.len();
            m.spec.volumes.retain(|v| v.name != req.name);
            if m.spec.volumes.len() == before {
                return Err(RuntimeError::not_found("Volume", req.name.clone()));
            }
            Ok(())
        })
        .await?;
        Ok(Response::new(pb::Empty {}))
    }

    #[instrument(skip(self, req))]
    async fn attach_network_interface(
        &self,
        req: Request<pb::AttachNetworkInterfaceRequest>,
    ) -> Result<Response<pb::Empty>, Status> {
        let req = req.into_inner();
        let nic_pb = req
            .network_interface
            .ok_or_else(|| Status::from(RuntimeError::InvalidArgument("network_interface is required".into())))?;
        let nic = convert::nic_from_pb(nic_pb);
        self.update_with_retry(&req.id, |m| {
            if m.spec.network_interfaces.iter().any(|n| n.name == nic.name) {
                return Err(RuntimeError::InvalidArgument(format!(
                    "network interface {:?} already attached",
                    nic.name
                )));
            }
            m.spec.network_interfaces.push(nic.clone());
            Ok(())
        })
        .await?;
        Ok(Response::new(pb::Empty {}))
    }

    #[instrument(skip(self, req))]
    async fn detach_network_interface(
        &self,
        req: Request<pb::DetachNetworkInterfaceRequest>,
    ) -> Result<Response<pb::Empty>, Status> {
        let req = req.into_inner();
        self.update_with_retry(&req.id, |m| {
            let before = m.spec.network_interfaces.len();
            m.spec.network_interfaces.retain(|n| n.name != req.name);
            if m.spec.network_interfaces.len() == before {
                return Err(RuntimeError::not_found("NetworkInterface", req.name.clone()));
            }
            Ok(())
        })
        .await?;
        Ok(Response::new(pb::Empty {}))
    }

    #[instrument(skip(self, req))]
    async fn exec(&self, req: Request<pb::ExecRequest>) -> Result<Response<pb::ExecResponse>, Status> {
        let id = req.into_inner().id;
        self.store.get(&id).await?;
        let token = self.exec_tokens.issue(id).await;
        Ok(Response::new(pb::ExecResponse { streaming_url: format!("{}/exec/{}", self.base_url, token) }))
    }
}
