//! Request decorators that attach feed credentials.

mod headers;
mod query;

pub use headers::StaticHeaders;
pub use query::QueryParams;
