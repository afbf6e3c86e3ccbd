//! Wire-level types for the beanstalk protocol.
pub mod message;
pub mod protocol;
pub mod serialisable;
pub mod states;
