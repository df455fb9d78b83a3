/// AMQP plumbing: queue topology and the consumer loop
pub mod topology;
pub mod worker;

pub use topology::Topology;
