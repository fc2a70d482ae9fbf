mod pattern;
mod registry;

pub use pattern::PackagePattern;
pub use registry::PackageRegistry;
