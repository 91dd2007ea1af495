mod pg_cluster;
mod pg_replica;
mod pg_task;

pub use pg_cluster::*;
pub use pg_replica::*;
pub use pg_task::*;
