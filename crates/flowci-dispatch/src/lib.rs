pub mod dispatcher;
pub mod http;
pub mod webhook;

pub use dispatcher::{CommandDispatcher, DispatchOutcome, OUTPUT_ENV_FILTER};
pub use http::HttpTransport;
pub use webhook::NodeHookIdentifier;
