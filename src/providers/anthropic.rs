mod model;
mod provider;
mod stream;

pub use model::*;
pub use provider::AnthropicProvider;
pub use stream::AnthropicStreamDecoder;
