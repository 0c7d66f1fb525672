pub mod fs;
pub mod rng;
pub mod serde_base64;
