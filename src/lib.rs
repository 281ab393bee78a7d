pub mod aspect;
pub mod background;
pub mod config;
pub mod constants;
pub mod embed;
pub mod engine;
pub mod error;
pub mod library;
pub mod media_cache;
pub mod preloader;
pub mod spotify;
pub mod video;
