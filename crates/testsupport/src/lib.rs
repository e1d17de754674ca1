pub mod context;
pub mod helpers;
pub mod installer;
pub mod process;

pub use context::*;
pub use helpers::*;
pub use installer::*;
pub use process::*;
