//! Test fixtures: an in-process relay and token helpers.

pub mod relay;
pub mod tokens;

pub use relay::{FakeRelay, RelayControl};
pub use tokens::{SECRET, client_server_token, mesh_token, token, validator};
