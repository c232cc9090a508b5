pub mod event;
pub mod order;
pub mod position;

pub use event::*;
pub use order::*;
pub use position::*;
