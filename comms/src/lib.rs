mod channel;
pub mod msg;
pub mod specs;
mod wire;

pub use channel::{OnoReceiver, OnoSender, channel};
pub use wire::{Align1, Align4, Deserialize, Serialize};
