pub mod container;
pub mod launcher;
pub mod signals;

pub use container::*;
pub use launcher::*;
pub use signals::*;
