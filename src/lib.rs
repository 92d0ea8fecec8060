pub mod models {
    pub mod field;
    pub mod notice;
    pub mod reading;
    pub mod wire;
}

pub mod client;
pub mod config;
pub mod utils;
pub mod services {
    pub mod chat;
    pub mod fanout;
    pub mod normalizer;
    pub mod responder;
    pub mod router;
    pub mod store;
    pub mod subscription;
    pub mod transport;
}
