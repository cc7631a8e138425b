pub mod engine;
pub mod protocol;

pub use engine::{EngineOutcome, ExternalEngine, ImageEngine};
pub use protocol::{
    ClientConfig, ClientSession, ImageServer, Request, Response, ServerConfig, SharedState,
};
