//! Declarative store client
//!
//! Every controller talks to the upstream and internal stores through
//! [`ResourceClient`], a small typed surface over get/list/create/replace,
//! merge patches, server-side apply and delete.
//!
//! - [`KubeClient`] implements it against the Kubernetes API
//! - [`ClaimManager`] adopts and releases objects for a claimer
//! - `MockClient` (feature `test-util`) implements the same contract in
//!   memory for unit tests: resource versions, uids, finalizers and
//!   deletion timestamps behave like the API server's
//!
//! # Example
//!
//! ```no_run
//! use apinet_client::{KubeClient, ListSelector, ResourceClient};
//! use k8s_openapi::api::core::v1::ConfigMap;
//!
//! # async fn example(client: kube::Client) -> Result<(), apinet_client::ClientError> {
//! let configmaps = KubeClient::<ConfigMap>::namespaced(client);
//! let selected = configmaps
//!     .list(Some("default"), &ListSelector::new().with_label("app", "nat"))
//!     .await?;
//! # let _ = selected;
//! # Ok(())
//! # }
//! ```

pub mod claim;
pub mod error;
pub mod finalizer;
pub mod kube_client;
#[path = "trait.rs"]
pub mod resource_trait;
pub mod selector;
#[cfg(feature = "test-util")]
pub mod mock;

pub use claim::{ClaimManager, ClaimState, ClaimStrategy, SourceLabelStrategy, TargetRefStrategy};
pub use error::ClientError;
pub use finalizer::{add_finalizer, has_finalizer, remove_finalizer};
pub use kube_client::KubeClient;
pub use resource_trait::{ResourceClient, ResourceObject};
pub use selector::ListSelector;
#[cfg(feature = "test-util")]
pub use mock::MockClient;
