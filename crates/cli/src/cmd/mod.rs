pub mod digest;
pub mod tree;
pub mod verify;
