//! Nexa Machine Runtime — a node-local virtual machine runtime
//!
//! This crate is the per-host agent a cluster-level pool controller talks to
//! over a UNIX domain socket in order to create, inspect, mutate, and
//! destroy virtual machines on one host. It owns three tightly coupled
//! subsystems:
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         Pool controller (remote)                      │
//! └───────────────────────────────┬──────────────────────────────────────┘
//!                                  │ gRPC over UNIX socket
//! ┌───────────────────────────────▼──────────────────────────────────────┐
//! │                       rpc:: façade (MachineRuntime)                   │
//! └───────────────┬───────────────────────────────────┬──────────────────┘
//!                 │                                    │
//!   ┌─────────────▼─────────────┐        ┌─────────────▼─────────────┐
//!   │     store::Store<Machine> │        │   resources::ResourceMgr  │
//!   │  per-key lock, optimistic │        │  cpu / memory / hugepages │
//!   │  concurrency, watch fan-  │        │  / sgx-per-numa sources   │
//!   │  out, soft delete         │        └─────────────┬─────────────┘
//!   └─────────────┬─────────────┘                      │
//!                 │ Created/Updated/Deleted             │ Pin/Unpin
//!   ┌─────────────▼─────────────┐        ┌─────────────▼─────────────┐
//!   │   reconciler (async loop) │◄───────┤     numa::Planner          │
//!   │  drives hypervisor::Driver│        │  NUMA cell + hugepage      │
//!   └────────────────────────────┘        │  placement                │
//!                                          └────────────────────────────┘
//! ```
//!
//! # Module map
//!
//! - [`metadata`] — the object envelope shared by every persisted entity.
//! - [`quantity`] — exact, unit-tagged resource quantities.
//! - [`machine`] — the machine record (spec/status) and machine classes.
//! - [`lockmap`] — the striped per-key mutex map used by the store.
//! - [`store`] — crash-safe, watchable, per-key-locked CRUD over a directory.
//! - [`resources`] — pluggable resource sources and the resource manager.
//! - [`numa`] — NUMA cell and hugepage placement planning.
//! - [`hypervisor`] — the driver trait the reconciler realises domains through.
//! - [`reconciler`] — the async loop that turns store events into domains.
//! - [`rpc`] — the gRPC façade bound to a UNIX domain socket.
//! - [`exec`] — the HTTP streaming surface for console/exec.
//! - [`config`] — layered CLI flag / env / file configuration.
//! - [`error`] — the runtime's typed error taxonomy.

pub mod config;
pub mod error;
pub mod exec;
pub mod hypervisor;
pub mod lockmap;
pub mod machine;
pub mod metadata;
pub mod numa;
pub mod quantity;
pub mod reconciler;
pub mod resources;
pub mod rpc;
pub mod store;

pub mod pb {
    //! Generated protobuf/gRPC types for the machine runtime wire protocol.
    tonic::include_proto!("nexa.machineruntime.v1");
}

pub use error::{RuntimeError, RuntimeResult};
