//! Business logic services (use cases).
//!
//! Services orchestrate the registry, the intent matcher and the execution
//! engine. They depend on traits (ports) -- never on concrete infrastructure
//! implementations.

pub mod skill;

pub use skill::SkillService;
