#![forbid(unsafe_code)]

pub mod activity_source;
pub mod connect_client;
pub mod connect_session;
pub mod credentials;
pub mod session_vault;
pub mod track_render;

#[cfg(test)]
mod test_fixture;
