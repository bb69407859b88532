pub mod types;
pub mod transport;

pub use types::*;
pub use transport::{CrmTransport, HttpTransport, MockTransport};
