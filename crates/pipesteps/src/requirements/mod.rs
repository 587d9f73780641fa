//! Requirements steps can declare on their environment.

mod container;
mod executable;

pub use container::{ContainerImageRequirement, PullProgress};
pub use executable::ExecutableRequirement;
