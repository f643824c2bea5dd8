//! ironcore-net API definitions
//!
//! Types shared by the apinet controllers:
//! - `internal`: internal records consumed by the datapath fleet
//!   (`core.apinet.ironcore.dev/v1alpha1`)
//! - `upstream`: workload-facing records translated by the apinetlet
//!   (`networking.ironcore.dev/v1alpha1`, `ipam.ironcore.dev/v1alpha1`)
//! - codecs for VNIs, provider IDs, dashed addresses and source labels

pub mod common;
pub mod internal;
pub mod labels;
pub mod provider_id;
pub mod selector;
pub mod upstream;
pub mod vni;

pub use common::*;
pub use labels::SourceRef;
pub use provider_id::{NetworkId, NetworkInterfaceId, ProviderIdError};
pub use selector::{LabelSelector, LabelSelectorOperator, LabelSelectorRequirement};
pub use vni::{VniError, VniRange};

/// API group of the internal store.
pub const CORE_GROUP: &str = "core.apinet.ironcore.dev";

/// API group of the upstream networking records.
pub const NETWORKING_GROUP: &str = "networking.ironcore.dev";

/// API group of the upstream IPAM records.
pub const IPAM_GROUP: &str = "ipam.ironcore.dev";
