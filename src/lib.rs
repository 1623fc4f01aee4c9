//! See README.md for more

mod command;
mod file_options;
mod paths;

/// The build trigger: fixed build parameters and the single `docker build`
/// invocation that executes a rendered recipe.
pub mod build;
/// The closed set of sandbox configuration profiles.
pub mod profile;
/// The declarative image recipe: base image, ordered provisioning steps,
/// rendering, and ordering validation.
pub mod recipe;

pub use build::*;
pub use command::*;
pub use file_options::*;
pub use paths::*;
pub use profile::*;
pub use recipe::*;
/// This reexport helps with dependency wrangling
pub use stacked_errors;
