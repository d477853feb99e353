pub mod crypto;
pub mod logging;
pub mod redirect;
pub mod responses;

pub use logging::LoggingHelper;
pub use responses::ResponseBuilder;
