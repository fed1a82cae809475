pub mod describe;
pub mod send;
pub mod serve;
