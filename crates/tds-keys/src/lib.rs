//! tds-keys: server-aided key generation
//!
//! Clients send masked short hashes of their chunks in batches. The key server
//! counts each hash in a count-min sketch and answers with one key per hash: a
//! deterministic key derived from its secret when the estimated count reaches
//! the popularity threshold, a fresh random key otherwise. A background solver
//! periodically re-tunes the threshold from the counts it has seen.
//!
//! - `channel`: framed message transport both ends speak
//! - `wire`: batch encodings for requests and responses
//! - `sketch`: count-min popularity sketch
//! - `solver`: threshold state and the solver task
//! - `server`: per-connection key server sessions
//! - `client`: the key client pipeline stage and key generation simulator

pub mod channel;
pub mod client;
pub mod server;
pub mod sketch;
pub mod solver;
pub mod wire;

pub use channel::{FramedChannel, SecureChannel};
pub use client::{derive_and_encrypt, KeyClient, KeyClientStats};
pub use server::{KeyServer, Popularity, SessionStats};
pub use sketch::CountMinSketch;
pub use solver::{SolverSettings, ThresholdSolver};
