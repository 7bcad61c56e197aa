//! Service instances and their blueprints

pub mod blueprint;
pub mod configuration;
pub mod snapshot;

pub use blueprint::{
    build_configuration, GroupConfigurationProvider, ServiceTaskProvider, StaticBlueprints,
};
pub use configuration::{
    GroupConfiguration, ProcessConfiguration, ServiceConfiguration, ServiceDeployment,
    ServiceEnvironmentType, ServiceRemoteInclusion, ServiceTask, ServiceTemplate,
};
pub use snapshot::{ProcessSnapshot, ServiceId, ServiceInfoSnapshot, ServiceLifeCycle};
