pub mod api;
pub mod parser;
pub mod router;
pub mod tls;

pub use api::{ApiError, IngestState};
pub use parser::JsonParser;
pub use router::{build_router, serve, serve_tls};
pub use tls::{load_server_tls, ServerTlsError};
