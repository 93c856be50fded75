pub mod event;
pub mod supervisor;

pub use supervisor::ClaudeSupervisor;
