//! Launch closure builder and runtime loader for Mach-O dynamic linking.
//!
//! The work between `execve` and `main` splits into three parts here:
//! [`builder`] turns a main executable plus its environment into a
//! serialized *launch closure* (dependency graph, segment layout, every
//! fixup pre-resolved), [`mach_o`] is the binary-format engine under it,
//! and [`loader`] replays a closure: map, verify, fix up, initialize.
//!
//! All kernel interaction goes through the [`host::Host`] trait, so the
//! whole pipeline runs against synthetic images in tests.

pub mod builder;
pub mod closure;
pub mod diagnostics;
pub mod env;
pub mod host;
pub mod loader;
pub mod mach_o;
pub mod shared_cache;

pub use builder::{ClosureBuilder, ClosureBuilderOptions};
pub use diagnostics::{Diagnostics, LaunchErrorInfo, LoadError};
pub use loader::Loader;
