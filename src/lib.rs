pub mod config;
pub mod error;
pub mod events;
pub mod pool;
pub mod remote;
pub mod retention;
pub mod selection;
pub mod tasks {
    pub mod rotator;
}
