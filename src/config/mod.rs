//! Client configuration and local persistence

mod schema;
mod store;

pub use schema::{
    ClientConfig, ControlConfig, HealthConfig, MediaConfig, ReconnectConfig, RoomsConfig,
    ServerConfig, TimingConfig,
};
pub use store::ConfigStore;
