pub mod codec;
pub mod descriptor;
pub mod errors;

pub use codec::{Codec, JsonCodec};
pub use descriptor::{DescriptorRegistry, QueueDescriptor, ReplyDescriptor};
pub use errors::BrokerError;
