pub mod content;
pub mod diagnostics;
pub mod error;
pub mod health;
pub mod messages;
pub mod presence;
pub mod room;
pub mod status;

pub use content::*;
pub use diagnostics::*;
pub use error::*;
pub use health::*;
pub use messages::*;
pub use presence::*;
pub use room::*;
pub use status::*;
