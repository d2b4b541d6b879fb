pub mod baremetal;
pub mod cache;
pub mod error;
pub mod fake;
pub mod kubevirt;
pub mod openstack;
pub mod poll;
pub mod provider;
pub mod registry;

pub use baremetal::BaremetalProvider;
pub use cache::{ValidationCache, Verdict};
pub use error::{classify_http, ProviderError};
pub use fake::FakeProvider;
pub use kubevirt::KubevirtProvider;
pub use openstack::{
    OpenstackConfig, OpenstackProvider, ReleaseFloatingIp, FLOATING_IP_FINALIZER,
};
pub use poll::poll_until;
pub use provider::{CloudConfig, CloudProvider, FinalizerHook, ProviderData};
pub use registry::ProviderRegistry;
