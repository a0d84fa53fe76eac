pub mod auth;
pub mod codec;
pub mod constant;
pub mod packet;
