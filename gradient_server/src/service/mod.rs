mod builder;
mod gserver;
mod pserver;
mod server;

pub use builder::ServerBuilder;
pub use gserver::{GradientServer, Reply, SERVER_RANK};
pub use pserver::ParameterServer;
pub use server::Server;
