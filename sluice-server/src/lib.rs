//! UDP ingestion in front of a sluice pipeline.
//!
//! Every datagram becomes one raw message tagged with the sender's address.

mod output;
mod receiver;
mod server;
mod settings;

pub use output::LoggingOutput;
pub use receiver::UdpReceiver;
pub use server::Server;
pub use settings::ServerSettings;
