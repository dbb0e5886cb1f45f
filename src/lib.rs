mod archive;
mod builder;
mod config;
mod docker;
mod flow;
mod layout;
mod legacy;
mod machine;
mod metadata;
mod path;
mod resolve;
mod runner;
mod settings;
mod simpoint;
mod sweep;
mod trace;
mod utils;

pub use archive::*;
pub use builder::*;
pub use config::*;
pub use docker::*;
pub use flow::*;
pub use layout::*;
pub use legacy::*;
pub use machine::*;
pub use metadata::*;
pub use path::*;
pub use resolve::*;
pub use runner::*;
pub use settings::*;
pub use simpoint::*;
pub use sweep::*;
pub use trace::*;
pub use utils::*;
