pub mod fake;
pub mod ort;
pub mod remote;

pub use fake::{BatchTrace, FakeBackend};
pub use ort::{OrtBackend, Precision};
pub use remote::RemoteBackend;
