pub mod archive;
pub mod cache;
pub mod context;
pub mod fetch;
pub mod image_builder;
pub mod installer;
pub mod layer;
pub mod parser;
pub mod runtimes;
pub mod service;
pub mod stager;
pub mod store;

pub use archive::*;
pub use cache::*;
pub use context::*;
pub use fetch::*;
pub use image_builder::*;
pub use installer::*;
pub use layer::*;
pub use parser::*;
pub use runtimes::*;
pub use service::*;
pub use stager::*;
pub use store::*;
