use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BrokerError {
    #[error("failure to connect")]
    ConnectionError,

    #[error("failure to create a channel")]
    ChannelError,

    #[error("precondition failed: {0}")]
    PreconditionError(String),

    #[error("no descriptor registered for `{0}`")]
    UnknownDescriptor(String),

    #[error("failure to encode or decode payload")]
    SerializationError,

    #[error("no reply within the configured timeout")]
    TimeoutError,

    #[error("connection closed while the call was pending")]
    ConnectionClosedError,

    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    #[error("failure to bind queue `{0}` to exchange `{1}`")]
    BindQueueError(String, String),

    #[error("failure to create a consumer for queue `{0}`")]
    ConsumerError(String),

    #[error("failure to publish")]
    PublishingError,

    #[error("failure to ack message")]
    AckMessageError,

    #[error("failure to nack message")]
    NackMessageError,

    #[error("failure to reject message")]
    RejectMessageError,
}
