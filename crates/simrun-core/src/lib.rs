pub mod config;
pub mod descriptor;
pub mod events;
pub mod ssh_config;
pub mod tail;
pub mod types;

pub use config::Config;
pub use descriptor::{
    ExecutableSpec, NotificationChannel, NotificationPreference, RemoteTarget, RunDescriptor,
    Target, TriggerPolicy, ValidationError,
};
pub use events::RunEvent;
pub use tail::OutputTail;
pub use types::*;
