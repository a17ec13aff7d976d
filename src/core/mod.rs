pub mod circular_buffer;
pub mod config;
pub mod error;
pub mod frame;
pub mod health;
pub mod heartbeat;
pub mod message;
pub mod queue;
pub mod reconnect;
pub mod recovery;
pub mod state;
pub mod subscription;

pub use circular_buffer::*;
pub use config::*;
pub use error::*;
pub use frame::*;
pub use health::*;
pub use heartbeat::*;
pub use message::*;
pub use queue::*;
pub use reconnect::*;
pub use recovery::*;
pub use state::*;
pub use subscription::*;
