//! Data model shared across the control plane: machines, containers,
//! compose deployments, metrics and alerts.

pub mod alert;
pub mod compose;
pub mod container;
pub mod machine;
pub mod metric;

pub use alert::{
    Alert, AlertCondition, AlertNotification, AlertRule, AlertSeverity, AlertState,
    NotificationSinkConfig, NotificationStatus, Operator, SinkType,
};
pub use compose::{ComposeConfig, ComposeDeployment, ComposeService};
pub use container::{
    BlockIoStats, Container, ContainerConfig, ContainerState, ContainerStats, CpuStats,
    MemoryStats, NetworkMode, NetworkStats, PortMapping, ResourceLimits, RestartPolicy,
    VolumeMount,
};
pub use machine::{Machine, MachineStatus, SystemMetrics};
pub use metric::{Metric, MetricType};
