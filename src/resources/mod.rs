pub mod backrest;
pub mod common;
pub mod events;
pub mod exec;
pub mod patroni;
pub mod pvc;
pub mod secret;
pub mod store;

pub use common::{FIELD_MANAGER, InstanceRole, ResourceMeta, Selector};
pub use events::{EventKind, EventPublisher, KubeEventPublisher, OrchestrationEvent};
pub use exec::{ExecOutput, KubePodExecutor, PodExecutor};
pub use store::{ClusterStore, KubeStore};
