pub mod health;
pub mod routes;
pub mod timings;

pub use health::HealthState;
pub use timings::CycleTimings;
