pub mod network_errors;
pub mod upstream_errors;

pub use network_errors::classify_network_error;
pub use upstream_errors::{
    classify_upstream_error, MARKER_CONTENT_LENGTH, MARKER_MONTHLY_REQUEST_COUNT,
};
