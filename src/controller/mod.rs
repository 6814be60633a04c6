//! HotStandbyDeployment controller
//!
//! [`reconcile`] implements the control loop; [`child`] builds and diffs the
//! child Deployment the loop converges.

pub mod child;
pub mod reconcile;

pub use reconcile::{error_policy, reconcile, Context, KubeWorkloadClient, WorkloadClient};
