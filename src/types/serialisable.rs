/// Types implementing BeanstalkSerialisable can be sent over the Beanstalk
/// TCP connection in the client -> server direction.
pub trait BeanstalkSerialisable {
    /// Converts the value in question to the bytes of a Beanstalk command,
    /// including the trailing CRLF and any data block.
    fn serialise_beanstalk(&self) -> Vec<u8>;
}
