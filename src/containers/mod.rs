//! Container Engine (C6): Docker lifecycle control over a tunneled
//! connection to each machine's daemon socket.

mod engine;
mod tunnel;

pub use engine::Containers;
pub use tunnel::DockerTunnel;
