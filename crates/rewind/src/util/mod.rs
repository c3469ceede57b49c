mod http;
mod mix;
mod range;
pub(crate) mod template;
pub(crate) mod url;

pub use http::HttpClient;
pub use mix::VecMix;
pub use range::ByteRange;
