pub mod cancel;
pub mod config;
pub mod error;
pub mod extract;
pub mod installation;
pub mod local_settings;
pub mod manifest;
pub mod name;
pub mod registry;
pub mod resolver;
pub mod runtime;

pub use cancel::CancellationToken;
pub use error::MwError;
pub use name::{ExtensionKind, ExtensionName};
