pub mod appointment;
pub mod events;
pub mod scope;
pub mod wire;

pub use appointment::{Appointment, ClientRef, StaffMember};
pub use events::EventType;
pub use scope::{Branch, Scope};
pub use wire::{decode_frame, encode_frame, FrameError, InboundEvent, DEFAULT_MAX_FRAME_BYTES};
