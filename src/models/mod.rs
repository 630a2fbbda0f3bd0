//! Domain models for rollcall.
//!
//! # Core Concepts
//!
//! ## Stored Entities
//!
//! - [`ClassSession`]: One sitting of a class. Open until explicitly closed;
//!   events are only accepted while open.
//! - [`AttendanceEvent`]: Append-only record of a single observation, either an
//!   RFID tag scan tied to a subject or a headcount snapshot of the room.
//! - [`Student`]: Roster entry mapping an RFID tag to a person.
//!
//! ## Derived Values
//!
//! These are never stored. They are recomputed from the event log on every query:
//!
//! - [`Window`]: Per-bucket RFID and headcount figures for a session.
//! - [`Verdict`]: Classification of a window (`green`, `red` or `insufficient`).

mod caller;
mod event;
mod session;
mod student;
mod verdict;
mod window;

pub use caller::*;
pub use event::*;
pub use session::*;
pub use student::*;
pub use verdict::*;
pub use window::*;
