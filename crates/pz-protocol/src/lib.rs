pub mod device;
pub mod discovery;
pub mod error;
pub mod relay;
pub mod telemetry;
pub mod topics;

pub use device::*;
pub use discovery::*;
pub use error::*;
pub use relay::*;
pub use telemetry::*;
pub use topics::TopicSet;
