//! Command dispatch: RPC seam and the command reconcile steps

pub mod channel;
pub mod step;

pub use channel::{CommandChannel, DispatchRequest, DispatchResponse, MqttCommandChannel};
pub use step::{DispatchStep, TimeoutStep};
