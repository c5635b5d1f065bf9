pub mod backend;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod session;
pub mod tls;

pub use config::Config;
pub use errors::{AdmissionError, BackendError, PoolError, SessionEnd, SessionError};
pub use gateway::{ConnectionPool, Gateway, SlotManager};
pub use session::{Session, SessionSettings};
