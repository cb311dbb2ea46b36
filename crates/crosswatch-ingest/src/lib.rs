pub mod fanin;
pub mod filter;
pub mod transport;

pub use fanin::{partition_round_robin, FanIn, WatchedChannel};
pub use filter::MessageFilter;
pub use transport::{ChatTransport, RemoteMessage, TransportError};
