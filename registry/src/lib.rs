mod server;
mod store;

pub use self::{
    server::RegistryServer,
    store::{BeatPolicy, RegistryError, Store},
};
