pub mod health;
pub mod diagnostics;
pub mod room_state;

pub use health::*;
pub use diagnostics::*;
pub use room_state::*;
