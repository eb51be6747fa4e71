pub mod error;
pub mod idcounter;
pub mod rpc;
