pub mod http;
pub mod presign;
pub mod progress_stream;

pub use http::HttpTransfer;
pub use presign::HttpAuthorizationProvider;
pub use progress_stream::ProgressStream;
