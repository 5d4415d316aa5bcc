pub mod aws;
pub mod container;
pub mod controller;
pub mod gcp;
pub mod kubernetes;
pub mod registry;

pub use aws::AwsController;
pub use container::Container;
pub use controller::{Controller, ControllerBase};
pub use gcp::GcpController;
pub use kubernetes::KubernetesController;
pub use registry::ControllerRegistry;
