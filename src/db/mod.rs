pub mod entities;
pub mod enums;
pub mod memory;
pub mod models;
pub mod repository;
pub mod schema;
pub mod services;
pub mod store;

pub use memory::MemoryStore;
pub use repository::{
    AssignmentRepository, AuthFailureRepository, GroupRepository, HealthCheckRepository,
    NodeRepository, ProxyConfigRepository, Store, StoreError, StoreResult, TrafficRepository,
};
pub use store::SeaOrmStore;
