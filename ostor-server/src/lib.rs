// build.rs 生成到 OUT_DIR 的 protobuf 类型与 tonic stub
pub mod pb {
    include!(concat!(env!("OUT_DIR"), "/ostor.rs"));
}

pub mod api;
pub mod config;
pub mod error;
pub mod logging;
pub mod middleware;
pub mod profile;
pub mod server;

#[cfg(test)]
mod test;
