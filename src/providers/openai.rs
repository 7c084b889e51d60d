mod model;
mod provider;
mod stream;

pub use model::*;
pub use provider::OpenAIProvider;
pub use stream::OpenAIStreamDecoder;
