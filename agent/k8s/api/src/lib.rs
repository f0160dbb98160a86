#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod labels;

pub use k8s_openapi::{
    api::{
        self,
        core::v1::{
            ContainerStatus, Namespace, Node, NodeAddress, NodeStatus, Pod, PodIP, PodSpec,
            PodStatus, Service, ServiceSpec, ServiceStatus,
        },
    },
    apimachinery::pkg::apis::meta::v1::{OwnerReference, Time},
};
pub use kube::api::{ObjectMeta, ResourceExt};
