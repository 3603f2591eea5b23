//! Live collaboration core: presence, content reconciliation and the
//! editor bridge, wired together per participant by [`session::Session`].

pub mod bridge;
pub mod participant;
pub mod presence;
pub mod reconciler;
pub mod session;

pub use participant::ParticipantId;
pub use session::{Session, SessionEvent, SessionOptions};
