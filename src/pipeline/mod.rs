pub mod backpressure;
pub mod channel;

pub use backpressure::{IntakeOutcome, IntakeSender};
pub use channel::{create_channel, Receiver, Sender};
