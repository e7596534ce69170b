pub mod auth;
pub mod codec;
pub mod db;
pub mod disk;
pub mod keys;
pub mod stats;
