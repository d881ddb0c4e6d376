/// Radio and clock traits implemented by the application
pub mod traits;

pub use traits::{Capabilities, Clock, PacketParams, Radio, RadioEvent};
