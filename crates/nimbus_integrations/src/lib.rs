pub mod cloud;
pub mod driver;
pub mod kubernetes;
pub mod login;
pub mod provider;
pub mod registry;

pub use cloud::aws::{AwsDriver, CallerIdentity, Ec2Instance, LambdaFunction, S3Bucket};
pub use cloud::gcp::{ComputeInstance, GcloudInfo, GcpDriver, GcpProjectInfo, GkeCluster};
pub use driver::{Driver, requires_login};
pub use kubernetes::{Deployment, KubernetesDriver, Pod};
pub use login::LoginGate;
pub use provider::{Provider, ProviderSettings};
pub use registry::{ProviderRegistry, STATUS_TIMEOUT, collect_statuses};
