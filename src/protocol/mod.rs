pub mod astm;
pub mod error;

pub use error::{ProtocolError, Result};
